//! Stanza nodes exchanged with the transport.
//!
//! A [`Node`] is an XML-like element: tag, string attributes and either child
//! nodes or raw bytes. Transports that carry XML map it one to one; the binary
//! codec in this module gives a compact framing for transports that move
//! bytes.

mod codec;
mod envelope;
mod pubsub;

pub use envelope::{Envelope, WrappedKey};
pub use pubsub::{device_list_node, parse_device_list};

use crate::Error;
use std::collections::HashMap;

/// OMEMO element namespace.
pub const NS_OMEMO: &str = "urn:xmpp:omemo:1";

/// Pubsub node carrying the device list of an account.
pub const NODE_DEVICES: &str = "urn:xmpp:omemo:1:devices";

/// Pubsub node carrying per-device bundles.
pub const NODE_BUNDLES: &str = "urn:xmpp:omemo:1:bundles";

pub type Attrs = HashMap<String, String>;

/// Content of a node: either child nodes or raw bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NodeContent {
    #[default]
    Empty,
    Nodes(Vec<Node>),
    Bytes(Vec<u8>),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: NodeContent,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::Empty,
        }
    }

    pub fn with_attr(mut self, k: impl Into<String>, v: impl ToString) -> Self {
        self.attrs.insert(k.into(), v.to_string());
        self
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Nodes(children);
        self
    }

    pub fn with_content(mut self, bytes: Vec<u8>) -> Self {
        self.content = NodeContent::Bytes(bytes);
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_content(text.into().into_bytes())
    }

    pub fn attr(&self, k: &str) -> Option<&str> {
        self.attrs.get(k).map(String::as_str)
    }

    pub fn get_child_by_tag(&self, tag: &str) -> Option<&Node> {
        self.get_children().iter().find(|n| n.tag == tag)
    }

    pub fn get_children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.get_children().iter().filter(move |n| n.tag == tag)
    }

    pub fn get_children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Nodes(n) => n,
            _ => &[],
        }
    }

    /// Text content, when the node carries UTF-8 bytes.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            NodeContent::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Encode to the binary framing.
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        let mut out = Vec::new();
        codec::encode_node(self, &mut out)?;
        Ok(out)
    }

    /// Decode one node from the binary framing. Trailing bytes are an error.
    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        codec::decode(data)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}", self.tag)?;
        let mut attrs: Vec<_> = self.attrs.iter().collect();
        attrs.sort();
        for (k, v) in attrs {
            write!(f, " {}=\"{}\"", k, v)?;
        }
        match &self.content {
            NodeContent::Empty => write!(f, "/>"),
            NodeContent::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, ">{}</{}>", s, self.tag),
                Err(_) => write!(f, ">[{} bytes]</{}>", b.len(), self.tag),
            },
            NodeContent::Nodes(children) => {
                write!(f, ">")?;
                for c in children {
                    write!(f, "{}", c)?;
                }
                write!(f, "</{}>", self.tag)
            }
        }
    }
}

pub(crate) fn stanza_error(msg: impl Into<String>) -> Error {
    Error::Stanza(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_lookup() {
        let node = Node::new("list").with_attr("xmlns", NS_OMEMO).with_children(vec![
            Node::new("device").with_attr("id", 1),
            Node::new("device").with_attr("id", 2),
            Node::new("other"),
        ]);
        assert_eq!(node.attr("xmlns"), Some(NS_OMEMO));
        assert_eq!(node.get_children_by_tag("device").count(), 2);
        assert!(node.get_child_by_tag("missing").is_none());
        assert_eq!(Node::new("iv").with_text("abc").text(), Some("abc"));
    }

    #[test]
    fn display_is_stable() {
        let node = Node::new("key")
            .with_attr("rid", 11)
            .with_attr("prekey", true)
            .with_text("AAAA");
        assert_eq!(node.to_string(), r#"<key prekey="true" rid="11">AAAA</key>"#);
    }
}
