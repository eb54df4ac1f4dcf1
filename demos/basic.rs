//! Basic example: two accounts on an in-memory server exchange messages.
//!
//! Run with: `cargo run --example basic`

use omemo_core::transport::MemoryDirectory;
use omemo_core::{Event, Jid, KeyStore, OmemoConfig, OmemoCoordinator};
use std::sync::Arc;

async fn open(dir: &Arc<MemoryDirectory>, jid: &Jid) -> anyhow::Result<OmemoCoordinator> {
    let omemo = OmemoCoordinator::open(
        jid.clone(),
        Arc::new(KeyStore::new()),
        Arc::new(dir.connect(jid.clone())),
        OmemoConfig::default(),
    )
    .await?;

    let name = jid.to_string();
    omemo
        .add_event_handler(move |evt| match evt {
            Event::Message(msg) => {
                println!(
                    "[{}] message from {}: {}",
                    name,
                    msg.from,
                    String::from_utf8_lossy(&msg.plaintext)
                );
            }
            Event::TrustViolation { address } => {
                println!("[{}] identity key of {} changed", name, address);
            }
            Event::DeviceSkipped { address, reason } => {
                println!("[{}] skipped {}: {}", name, address, reason);
            }
            Event::DevicePublished { device_id } => {
                println!("[{}] device {} published", name, device_id);
            }
            _ => {}
        })
        .await;

    omemo.announce().await?;
    println!("{} device {} fingerprint {}", jid, omemo.device_id(), omemo.fingerprint()?);
    Ok(omemo)
}

async fn deliver(dir: &Arc<MemoryDirectory>, to: &OmemoCoordinator) {
    for (from, node) in dir.take_inbox(to.jid()).await {
        to.handle_node(&from, &node).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let dir = MemoryDirectory::new();
    let alice_jid = Jid::new("alice", "example.org");
    let bob_jid = Jid::new("bob", "example.org");
    let alice = open(&dir, &alice_jid).await?;
    let bob = open(&dir, &bob_jid).await?;

    let sent = alice.send_message(&bob_jid, b"Hello Bob", None).await?;
    println!("sent {} to devices {:?}", sent.id, sent.recipients);
    deliver(&dir, &bob).await;

    bob.send_message(&alice_jid, b"Hi Alice", None).await?;
    deliver(&dir, &alice).await;

    Ok(())
}
