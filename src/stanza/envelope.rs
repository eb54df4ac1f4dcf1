use super::{Node, NS_OMEMO};
use crate::error::EnvelopeError;
use crate::types::DeviceId;
use crate::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Symmetric key material wrapped for one recipient device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrappedKey {
    pub device_id: DeviceId,
    /// The ratchet message is a prekey message (session bootstrap).
    pub is_prekey: bool,
    pub data: Vec<u8>,
}

/// One encrypted message: the payload encrypted once and its key wrapped for
/// every recipient device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Sender device id.
    pub sid: DeviceId,
    pub keys: Vec<WrappedKey>,
    pub iv: Vec<u8>,
    pub payload: Vec<u8>,
}

fn malformed(msg: impl Into<String>) -> EnvelopeError {
    EnvelopeError::Malformed(msg.into())
}

fn decode_b64(node: &Node) -> Result<Vec<u8>> {
    let text = node
        .text()
        .ok_or_else(|| malformed(format!("<{}> has no text", node.tag)))?;
    BASE64
        .decode(text.trim())
        .map_err(|e| malformed(format!("<{}>: {}", node.tag, e)).into())
}

fn parse_id(node: &Node, attr: &str) -> Result<DeviceId> {
    node.attr(attr)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| malformed(format!("<{}> has no valid {}", node.tag, attr)).into())
}

impl Envelope {
    /// Wrapped keys addressed to `device_id`.
    pub fn keys_for(&self, device_id: DeviceId) -> impl Iterator<Item = &WrappedKey> {
        self.keys.iter().filter(move |k| k.device_id == device_id)
    }

    pub fn recipients(&self) -> Vec<DeviceId> {
        self.keys.iter().map(|k| k.device_id).collect()
    }

    pub fn to_node(&self) -> Node {
        let mut header = Vec::with_capacity(self.keys.len() + 1);
        for key in &self.keys {
            let mut node = Node::new("key").with_attr("rid", key.device_id);
            if key.is_prekey {
                node = node.with_attr("prekey", true);
            }
            header.push(node.with_text(BASE64.encode(&key.data)));
        }
        header.push(Node::new("iv").with_text(BASE64.encode(&self.iv)));

        Node::new("encrypted")
            .with_attr("xmlns", NS_OMEMO)
            .with_children(vec![
                Node::new("header")
                    .with_attr("sid", self.sid)
                    .with_children(header),
                Node::new("payload").with_text(BASE64.encode(&self.payload)),
            ])
    }

    pub fn from_node(node: &Node) -> Result<Self> {
        if node.tag != "encrypted" {
            return Err(malformed(format!("expected <encrypted>, got <{}>", node.tag)).into());
        }
        let header = node
            .get_child_by_tag("header")
            .ok_or_else(|| malformed("missing <header>"))?;
        let sid = parse_id(header, "sid")?;

        let keys = header
            .get_children_by_tag("key")
            .map(|k| {
                Ok(WrappedKey {
                    device_id: parse_id(k, "rid")?,
                    is_prekey: matches!(k.attr("prekey"), Some("true" | "1")),
                    data: decode_b64(k)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let iv = decode_b64(
            header
                .get_child_by_tag("iv")
                .ok_or_else(|| malformed("missing <iv>"))?,
        )?;
        let payload = decode_b64(
            node.get_child_by_tag("payload")
                .ok_or_else(|| malformed("missing <payload>"))?,
        )?;

        Ok(Self {
            sid,
            keys,
            iv,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn envelope() -> Envelope {
        Envelope {
            sid: 7,
            keys: vec![
                WrappedKey {
                    device_id: 11,
                    is_prekey: true,
                    data: vec![1, 2, 3],
                },
                WrappedKey {
                    device_id: 12,
                    is_prekey: false,
                    data: vec![4, 5],
                },
            ],
            iv: vec![9; 12],
            payload: b"ciphertext".to_vec(),
        }
    }

    #[test]
    fn node_shape() {
        let node = envelope().to_node();
        assert_eq!(node.attr("xmlns"), Some(NS_OMEMO));
        let header = node.get_child_by_tag("header").unwrap();
        assert_eq!(header.attr("sid"), Some("7"));
        let keys: Vec<_> = header.get_children_by_tag("key").collect();
        assert_eq!(keys[0].attr("rid"), Some("11"));
        assert_eq!(keys[0].attr("prekey"), Some("true"));
        assert_eq!(keys[0].text(), Some("AQID"));
        assert_eq!(keys[1].attr("prekey"), None);
        assert!(node.get_child_by_tag("payload").is_some());
    }

    #[test]
    fn parses_back_through_binary_framing() {
        let original = envelope();
        let bytes = original.to_node().encode().unwrap();
        let parsed = Envelope::from_node(&Node::decode(&bytes).unwrap()).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.keys_for(12).count(), 1);
        assert_eq!(parsed.recipients(), vec![11, 12]);
    }

    #[test]
    fn malformed_nodes_are_rejected() {
        let mut node = envelope().to_node();
        node.tag = "message".into();
        assert!(matches!(
            Envelope::from_node(&node),
            Err(Error::Envelope(EnvelopeError::Malformed(_)))
        ));

        let bad_rid = Node::new("encrypted").with_children(vec![
            Node::new("header").with_attr("sid", 7).with_children(vec![
                Node::new("key").with_attr("rid", "x").with_text("AQID"),
                Node::new("iv").with_text("AAAA"),
            ]),
            Node::new("payload").with_text("AAAA"),
        ]);
        assert!(Envelope::from_node(&bad_rid).is_err());

        let no_payload = Node::new("encrypted").with_children(vec![Node::new("header")
            .with_attr("sid", 7)
            .with_children(vec![Node::new("iv").with_text("AAAA")])]);
        assert!(Envelope::from_node(&no_payload).is_err());

        let bad_b64 = Node::new("encrypted").with_children(vec![
            Node::new("header")
                .with_attr("sid", 7)
                .with_children(vec![Node::new("iv").with_text("!!")]),
            Node::new("payload").with_text("AAAA"),
        ]);
        assert!(Envelope::from_node(&bad_b64).is_err());
    }
}
