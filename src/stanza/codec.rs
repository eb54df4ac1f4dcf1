//! Binary framing for [`Node`] trees.
//!
//! A node is a list: tag, attribute pairs, then optional content. Strings and
//! byte blobs are length-prefixed (8-bit or 20-bit), lists carry an 8-bit or
//! 16-bit element count. Attributes are written in key order so equal nodes
//! encode to equal bytes.

use super::{stanza_error, Node, NodeContent};
use crate::Result;
use std::collections::HashMap;

const LIST_EMPTY: u8 = 0;
const LIST_8: u8 = 248;
const LIST_16: u8 = 249;
const BINARY_8: u8 = 252;
const BINARY_20: u8 = 253;

const MAX_BINARY_20: usize = 0x0F_FFFF;

/// Nesting limit when decoding untrusted input.
const MAX_DEPTH: usize = 64;

fn write_list_size(out: &mut Vec<u8>, n: usize) -> Result<()> {
    if n <= u8::MAX as usize {
        out.push(LIST_8);
        out.push(n as u8);
    } else if n <= u16::MAX as usize {
        out.push(LIST_16);
        out.extend_from_slice(&(n as u16).to_be_bytes());
    } else {
        return Err(stanza_error(format!("list of {} elements too long", n)));
    }
    Ok(())
}

fn write_bytes(out: &mut Vec<u8>, b: &[u8]) -> Result<()> {
    let len = b.len();
    if len <= u8::MAX as usize {
        out.push(BINARY_8);
        out.push(len as u8);
    } else if len <= MAX_BINARY_20 {
        out.push(BINARY_20);
        out.extend_from_slice(&[((len >> 16) & 0x0F) as u8, (len >> 8) as u8, len as u8]);
    } else {
        return Err(stanza_error(format!("{} bytes too long for BINARY_20", len)));
    }
    out.extend_from_slice(b);
    Ok(())
}

pub(super) fn encode_node(node: &Node, out: &mut Vec<u8>) -> Result<()> {
    let has_content = !matches!(node.content, NodeContent::Empty);
    write_list_size(out, 1 + 2 * node.attrs.len() + usize::from(has_content))?;

    write_bytes(out, node.tag.as_bytes())?;
    let mut attrs: Vec<_> = node.attrs.iter().collect();
    attrs.sort();
    for (k, v) in attrs {
        write_bytes(out, k.as_bytes())?;
        write_bytes(out, v.as_bytes())?;
    }

    match &node.content {
        NodeContent::Empty => {}
        NodeContent::Bytes(b) => write_bytes(out, b)?,
        NodeContent::Nodes(children) => {
            write_list_size(out, children.len())?;
            for child in children {
                encode_node(child, out)?;
            }
        }
    }
    Ok(())
}

pub(super) fn decode(data: &[u8]) -> Result<Node> {
    let mut d = Decoder { data, pos: 0 };
    let node = d.read_node(0)?;
    if d.pos != data.len() {
        return Err(stanza_error(format!(
            "{} trailing bytes after node",
            data.len() - d.pos
        )));
    }
    Ok(node)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| stanza_error("unexpected eof"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_list_size(&mut self, token: u8) -> Result<usize> {
        match token {
            LIST_EMPTY => Ok(0),
            LIST_8 => Ok(self.read_u8()? as usize),
            LIST_16 => {
                let b = self.take(2)?;
                Ok(u16::from_be_bytes([b[0], b[1]]) as usize)
            }
            _ => Err(stanza_error(format!("unsupported list token {}", token))),
        }
    }

    fn read_binary(&mut self, token: u8) -> Result<Vec<u8>> {
        let len = match token {
            BINARY_8 => self.read_u8()? as usize,
            BINARY_20 => {
                let b = self.take(3)?;
                ((b[0] as usize & 0x0F) << 16) | ((b[1] as usize) << 8) | b[2] as usize
            }
            _ => return Err(stanza_error(format!("unsupported binary token {}", token))),
        };
        Ok(self.take(len)?.to_vec())
    }

    fn read_string(&mut self) -> Result<String> {
        let token = self.read_u8()?;
        let bytes = self.read_binary(token)?;
        String::from_utf8(bytes).map_err(|e| stanza_error(e.to_string()))
    }

    fn read_node(&mut self, depth: usize) -> Result<Node> {
        if depth > MAX_DEPTH {
            return Err(stanza_error("node nesting too deep"));
        }
        let token = self.read_u8()?;
        let list_size = self.read_list_size(token)?;
        if list_size == 0 {
            return Err(stanza_error("empty list size for node"));
        }
        let tag = self.read_string()?;
        let attr_count = (list_size - 1) / 2;
        let has_content = list_size % 2 == 0;

        let mut attrs = HashMap::with_capacity(attr_count);
        for _ in 0..attr_count {
            let k = self.read_string()?;
            let v = self.read_string()?;
            attrs.insert(k, v);
        }

        let content = if has_content {
            match self.read_u8()? {
                t @ (BINARY_8 | BINARY_20) => NodeContent::Bytes(self.read_binary(t)?),
                t @ (LIST_EMPTY | LIST_8 | LIST_16) => {
                    let n = self.read_list_size(t)?;
                    let mut children = Vec::with_capacity(n.min(256));
                    for _ in 0..n {
                        children.push(self.read_node(depth + 1)?);
                    }
                    NodeContent::Nodes(children)
                }
                t => return Err(stanza_error(format!("unsupported content token {}", t))),
            }
        } else {
            NodeContent::Empty
        };

        Ok(Node {
            tag,
            attrs,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn sample() -> Node {
        Node::new("encrypted")
            .with_attr("xmlns", "urn:xmpp:omemo:1")
            .with_children(vec![
                Node::new("header").with_attr("sid", 7),
                Node::new("payload").with_content(vec![0xAB; 300]),
            ])
    }

    #[test]
    fn encode_decode_nested() {
        let node = sample();
        let bytes = node.encode().unwrap();
        assert_eq!(Node::decode(&bytes).unwrap(), node);
    }

    #[test]
    fn attribute_order_does_not_change_bytes() {
        let a = Node::new("key").with_attr("rid", 1).with_attr("prekey", true);
        let b = Node::new("key").with_attr("prekey", true).with_attr("rid", 1);
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }

    #[test]
    fn truncated_and_trailing_input_rejected() {
        let bytes = sample().encode().unwrap();
        assert!(matches!(
            Node::decode(&bytes[..bytes.len() - 1]),
            Err(Error::Stanza(_))
        ));
        let mut extra = bytes.clone();
        extra.push(0);
        assert!(matches!(Node::decode(&extra), Err(Error::Stanza(_))));
        assert!(matches!(Node::decode(&[]), Err(Error::Stanza(_))));
        assert!(matches!(Node::decode(&[LIST_8, 0]), Err(Error::Stanza(_))));
    }
}
