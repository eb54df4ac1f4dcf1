//! Device-list and bundle items published over pubsub.

use super::{stanza_error, Node, NS_OMEMO};
use crate::bundle::RemoteBundle;
use crate::crypto::IdentityKey;
use crate::ratchet::{PreKeyPublic, SignedPreKeyPublic};
use crate::types::{DeviceId, MAX_DEVICE_ID};
use crate::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

pub fn device_list_node(ids: impl IntoIterator<Item = DeviceId>) -> Node {
    Node::new("list").with_attr("xmlns", NS_OMEMO).with_children(
        ids.into_iter()
            .map(|id| Node::new("device").with_attr("id", id))
            .collect(),
    )
}

/// Device ids of a `<list>` item, in document order without duplicates.
pub fn parse_device_list(node: &Node) -> Result<Vec<DeviceId>> {
    if node.tag != "list" {
        return Err(stanza_error(format!("expected <list>, got <{}>", node.tag)));
    }
    let mut ids = Vec::new();
    for device in node.get_children_by_tag("device") {
        let id = id_attr(device)?;
        if id == 0 || id > MAX_DEVICE_ID {
            return Err(stanza_error(format!("device id {} out of range", id)));
        }
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn id_attr(node: &Node) -> Result<u32> {
    node.attr("id")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| stanza_error(format!("<{}> has no valid id", node.tag)))
}

fn b64_child<'a>(node: &'a Node, tag: &str) -> Result<(&'a Node, Vec<u8>)> {
    let child = node
        .get_child_by_tag(tag)
        .ok_or_else(|| stanza_error(format!("<{}> missing <{}>", node.tag, tag)))?;
    Ok((child, b64_text(child)?))
}

fn b64_text(node: &Node) -> Result<Vec<u8>> {
    let text = node
        .text()
        .ok_or_else(|| stanza_error(format!("<{}> has no text", node.tag)))?;
    BASE64
        .decode(text.trim())
        .map_err(|e| stanza_error(format!("<{}>: {}", node.tag, e)))
}

fn public_key(node: &Node, bytes: Vec<u8>) -> Result<[u8; 32]> {
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        stanza_error(format!(
            "<{}> key is {} bytes, expected 32",
            node.tag,
            bytes.len()
        ))
    })
}

impl RemoteBundle {
    pub fn to_node(&self) -> Node {
        let pre_keys = self
            .pre_keys
            .iter()
            .map(|pk| {
                Node::new("pk")
                    .with_attr("id", pk.id)
                    .with_text(BASE64.encode(pk.key))
            })
            .collect();
        Node::new("bundle")
            .with_attr("xmlns", NS_OMEMO)
            .with_children(vec![
                Node::new("spk")
                    .with_attr("id", self.signed_pre_key.id)
                    .with_text(BASE64.encode(self.signed_pre_key.key)),
                Node::new("spks").with_text(BASE64.encode(&self.signed_pre_key.signature)),
                Node::new("ik").with_text(BASE64.encode(self.identity_key.to_bytes())),
                Node::new("prekeys").with_children(pre_keys),
            ])
    }

    pub fn from_node(node: &Node) -> Result<Self> {
        if node.tag != "bundle" {
            return Err(stanza_error(format!("expected <bundle>, got <{}>", node.tag)));
        }
        let (spk_node, spk) = b64_child(node, "spk")?;
        let (_, signature) = b64_child(node, "spks")?;
        let (ik_node, ik) = b64_child(node, "ik")?;
        let identity_key = IdentityKey::from_bytes(&ik)
            .ok_or_else(|| stanza_error(format!("<{}> is not an identity key", ik_node.tag)))?;

        let mut pre_keys = Vec::new();
        if let Some(list) = node.get_child_by_tag("prekeys") {
            for pk in list.get_children_by_tag("pk") {
                pre_keys.push(PreKeyPublic {
                    id: id_attr(pk)?,
                    key: public_key(pk, b64_text(pk)?)?,
                });
            }
        }

        Ok(Self {
            signed_pre_key: SignedPreKeyPublic {
                id: id_attr(spk_node)?,
                key: public_key(spk_node, spk)?,
                signature,
            },
            identity_key,
            pre_keys,
        })
    }
}
