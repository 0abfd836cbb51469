//! Binary XML node type for WhatsApp stanzas.
//!
//! Every frame exchanged after the Noise handshake carries exactly one node:
//! a tag, a set of attributes and optional content (child nodes or bytes).

use std::collections::HashMap;

use crate::types::JID;

/// Attributes of a node
pub type Attrs = HashMap<String, AttrValue>;

/// Possible values for node attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    String(String),
    JID(JID),
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<&String> for AttrValue {
    fn from(s: &String) -> Self {
        AttrValue::String(s.clone())
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::String(n.to_string())
    }
}

impl From<u32> for AttrValue {
    fn from(n: u32) -> Self {
        AttrValue::String(n.to_string())
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::String(if b { "true" } else { "false" }.to_string())
    }
}

impl From<JID> for AttrValue {
    fn from(jid: JID) -> Self {
        AttrValue::JID(jid)
    }
}

impl AttrValue {
    /// Get as string if possible
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            AttrValue::JID(_) => None,
        }
    }

    /// Get as JID, parsing string values when needed
    pub fn to_jid(&self) -> Option<JID> {
        match self {
            AttrValue::JID(jid) => Some(jid.clone()),
            AttrValue::String(s) => s.parse().ok(),
        }
    }
}

/// Node represents a binary XML element in the WhatsApp protocol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    /// The tag name of the element
    pub tag: String,
    /// The attributes of the element
    pub attrs: Attrs,
    /// The content inside the element (nil, children, or bytes)
    pub content: NodeContent,
}

/// Content of a node
#[derive(Debug, Clone, Default, PartialEq)]
pub enum NodeContent {
    #[default]
    None,
    /// Child nodes
    Children(Vec<Node>),
    /// Binary data
    Bytes(Vec<u8>),
}

impl Node {
    /// Create a new node with the given tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::None,
        }
    }

    /// Builder form of [`Node::set_attr`].
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder form of [`Node::set_children`].
    pub fn children(mut self, children: Vec<Node>) -> Self {
        self.set_children(children);
        self
    }

    /// Builder form of [`Node::set_bytes`].
    pub fn bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.set_bytes(bytes.into());
        self
    }

    /// Set an attribute on this node
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(key.into(), value.into());
    }

    /// Get an attribute value
    pub fn get_attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    /// Get an attribute as string
    pub fn get_attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(|v| v.as_str())
    }

    /// Get an attribute as JID
    pub fn get_attr_jid(&self, key: &str) -> Option<JID> {
        self.attrs.get(key).and_then(|v| v.to_jid())
    }

    /// Get an attribute parsed as an integer
    pub fn get_attr_int(&self, key: &str) -> Option<i64> {
        self.get_attr_str(key).and_then(|v| v.parse().ok())
    }

    /// Set the content to child nodes
    pub fn set_children(&mut self, children: Vec<Node>) {
        self.content = NodeContent::Children(children);
    }

    /// Add a child node
    pub fn add_child(&mut self, child: Node) {
        match &mut self.content {
            NodeContent::Children(children) => children.push(child),
            _ => self.content = NodeContent::Children(vec![child]),
        }
    }

    /// Set the content to bytes
    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.content = NodeContent::Bytes(bytes);
    }

    /// Get children if content is children
    pub fn get_children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Children(children) => children,
            _ => &[],
        }
    }

    /// Get children by tag
    pub fn get_children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.get_children().iter().filter(move |n| n.tag == tag)
    }

    /// Get first child with the given tag
    pub fn get_child_by_tag(&self, tag: &str) -> Option<&Node> {
        self.get_children().iter().find(|n| n.tag == tag)
    }

    /// Get bytes content if present
    pub fn get_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Short description used in log lines (never includes content bytes).
    pub fn describe(&self) -> String {
        let mut out = format!("<{}", self.tag);
        for key in ["id", "type", "xmlns", "from", "code", "reason"] {
            if let Some(value) = self.get_attr(key) {
                match value {
                    AttrValue::String(s) => out.push_str(&format!(" {}=\"{}\"", key, s)),
                    AttrValue::JID(j) => out.push_str(&format!(" {}=\"{}\"", key, j)),
                }
            }
        }
        out.push('>');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builder() {
        let node = Node::new("iq")
            .attr("id", "123")
            .attr("type", "get")
            .children(vec![Node::new("ping")]);

        assert_eq!(node.tag, "iq");
        assert_eq!(node.get_attr_str("id"), Some("123"));
        assert_eq!(node.get_children().len(), 1);
        assert!(node.get_child_by_tag("ping").is_some());
    }

    #[test]
    fn test_node_children() {
        let mut parent = Node::new("pair-device");
        parent.add_child(Node::new("ref").bytes(b"a".to_vec()));
        parent.add_child(Node::new("ref").bytes(b"b".to_vec()));

        let refs: Vec<_> = parent.get_children_by_tag("ref").collect();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].get_bytes(), Some(&b"b"[..]));
    }

    #[test]
    fn test_jid_attr_parses_from_string() {
        let node = Node::new("device").attr("jid", "123:4@s.whatsapp.net");
        let jid = node.get_attr_jid("jid").unwrap();
        assert_eq!(jid.user, "123");
        assert_eq!(jid.device, 4);
    }

    #[test]
    fn test_describe_omits_content() {
        let node = Node::new("iq").attr("id", "1").bytes(vec![0xde, 0xad]);
        assert_eq!(node.describe(), "<iq id=\"1\">");
    }
}
