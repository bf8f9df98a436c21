use crate::ChunkOffset;
use crate::binxml::value_variant::{BinXmlValue, BinXmlValueType};

/// A node of a decoded event tree.
#[derive(Debug, PartialEq, Clone)]
pub enum XmlNode {
    Element(XmlElement),
    Value(BinXmlValue),
    CData(String),
    CharRef(u16),
    EntityRef(String),
    ProcessingInstruction(XmlPI),
    /// Substitution slot of a template definition. Never present in an event tree.
    Placeholder(Placeholder),
    /// A template reference that could not be resolved, kept with its instance values.
    TemplateInstance(UnresolvedTemplate),
}

#[derive(Debug, PartialEq, Clone)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<XmlAttribute>,
    pub children: Vec<XmlNode>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct XmlAttribute {
    pub name: String,
    pub value: Vec<XmlNode>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct XmlPI {
    pub target: String,
    pub data: String,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Placeholder {
    pub index: u16,
    pub value_type: Option<BinXmlValueType>,
    pub type_code: u8,
    /// Conditional substitution: omitted when the supplied value is null.
    pub optional: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct UnresolvedTemplate {
    pub template_offset: ChunkOffset,
    pub values: Vec<BinXmlValue>,
}

fn node_text(nodes: &[XmlNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            XmlNode::Value(value) => out.push_str(&value.to_string()),
            XmlNode::CData(text) => out.push_str(text),
            XmlNode::CharRef(c) => {
                out.push(char::from_u32(u32::from(*c)).unwrap_or(char::REPLACEMENT_CHARACTER))
            }
            XmlNode::EntityRef(name) => match name.as_str() {
                "amp" => out.push('&'),
                "lt" => out.push('<'),
                "gt" => out.push('>'),
                "quot" => out.push('"'),
                "apos" => out.push('\''),
                other => {
                    out.push('&');
                    out.push_str(other);
                    out.push(';');
                }
            },
            _ => {}
        }
    }
    out
}

impl XmlAttribute {
    pub fn text(&self) -> String {
        node_text(&self.value)
    }
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        XmlElement {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&XmlAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|child| match child {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.child_elements().find(|e| e.name == name)
    }

    /// Follow a `/` separated path of child element names.
    pub fn find(&self, path: &str) -> Option<&XmlElement> {
        path.split('/')
            .filter(|p| !p.is_empty())
            .try_fold(self, |element, name| element.child(name))
    }

    /// Concatenated text of the direct, non-element children.
    pub fn text(&self) -> String {
        node_text(&self.children)
    }

    /// The single value child, if the element holds exactly one.
    pub fn value(&self) -> Option<&BinXmlValue> {
        match self.children.as_slice() {
            [XmlNode::Value(value)] => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct PendingElement {
    element: XmlElement,
    in_attribute: bool,
}

/// Assembles nodes into a tree using an explicit stack of open elements.
///
/// Elements are attached to their parent once closed, so the builder never holds references
/// into the tree it is building.
#[derive(Debug, Default)]
pub(crate) struct XmlTreeBuilder {
    roots: Vec<XmlNode>,
    open: Vec<XmlElement>,
    pending: Option<PendingElement>,
}

impl XmlTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.open.len() + usize::from(self.pending.is_some())
    }

    /// Starts a new element. A start tag that was never closed is finalized as empty.
    pub fn open_start_element(&mut self, name: String) {
        if self.pending.is_some() {
            self.close_empty_element();
        }
        self.pending = Some(PendingElement {
            element: XmlElement::new(name),
            in_attribute: false,
        });
    }

    /// Returns false if there is no start tag to attach the attribute to.
    pub fn attribute(&mut self, name: String) -> bool {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.element.attributes.push(XmlAttribute {
                    name,
                    value: Vec::new(),
                });
                pending.in_attribute = true;
                true
            }
            None => false,
        }
    }

    pub fn close_start_element(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                self.open.push(pending.element);
                true
            }
            None => false,
        }
    }

    pub fn close_empty_element(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                self.attach(XmlNode::Element(pending.element));
                true
            }
            None => false,
        }
    }

    pub fn close_element(&mut self) -> bool {
        if self.pending.is_some() {
            self.close_start_element();
        }
        match self.open.pop() {
            Some(element) => {
                self.attach(XmlNode::Element(element));
                true
            }
            None => false,
        }
    }

    /// Adds a node to the current attribute value, or as a child of the innermost open element.
    pub fn push(&mut self, node: XmlNode) {
        if let Some(pending) = self.pending.as_mut() {
            if pending.in_attribute {
                if let Some(attribute) = pending.element.attributes.last_mut() {
                    attribute.value.push(node);
                    return;
                }
            }
            // Content before the start tag was closed. Close it implicitly.
            self.close_start_element();
        }
        self.attach(node);
    }

    /// The last node pushed at the current position, used to complete processing instructions.
    pub fn last_mut(&mut self) -> Option<&mut XmlNode> {
        match self.open.last_mut() {
            Some(element) => element.children.last_mut(),
            None => self.roots.last_mut(),
        }
    }

    fn attach(&mut self, node: XmlNode) {
        match self.open.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.roots.push(node),
        }
    }

    /// Closes everything that is still open and returns the top level nodes.
    pub fn finish(mut self) -> Vec<XmlNode> {
        self.close_empty_element();
        while self.close_element() {}
        self.roots
    }
}
