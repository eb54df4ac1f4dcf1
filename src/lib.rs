//! # omemo-core
//!
//! Multi-device end-to-end encryption core for XMPP chat clients (OMEMO).
//!
//! ## Features
//!
//! - Identity, signed prekey and one-time prekey generation and publication
//! - X3DH session agreement and double ratchet per remote device
//! - One payload encrypted for every device of a contact and every other own device
//! - Trust-on-first-use identity checks, reported as events
//! - Device list discovery with timeouts; unreachable devices are skipped
//! - Pluggable persistence and transport
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use omemo_core::{transport::MemoryDirectory, Jid, KeyStore, OmemoConfig, OmemoCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let dir = MemoryDirectory::new();
//!     let alice = Jid::new("alice", "example.org");
//!     let omemo = OmemoCoordinator::open(
//!         alice.clone(),
//!         Arc::new(KeyStore::new()),
//!         Arc::new(dir.connect(alice)),
//!         OmemoConfig::default(),
//!     )
//!     .await?;
//!     omemo.announce().await?;
//!     omemo.send_message(&Jid::new("bob", "example.org"), b"hi", None).await?;
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod events;
pub mod omemo;
pub mod peer;
pub mod ratchet;
pub mod stanza;
pub mod store;
pub mod transport;
pub mod types;

pub use config::OmemoConfig;
pub use error::{Error, Result};
pub use events::Event;
pub use omemo::{OmemoCoordinator, SendRequestExtra, SendResponse};
pub use stanza::{Envelope, Node};
pub use store::{KeyStore, Persistence};
pub use transport::Transport;
pub use types::{DeviceAddress, DeviceId, Jid, MessageId};
