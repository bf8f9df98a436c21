use std::rc::Rc;

use ahash::AHashMap;
use log::{debug, trace};

use crate::ChunkOffset;
use crate::binxml::tokens::TemplateDefinitionHeader;
use crate::err::RecordError;
use crate::model::xml::{Placeholder, XmlNode};

/// A parsed template: an element tree with placeholders where instance values go.
#[derive(Debug, PartialEq, Clone)]
pub struct TemplateDefinition {
    pub offset: ChunkOffset,
    pub header: TemplateDefinitionHeader,
    pub nodes: Vec<XmlNode>,
}

impl TemplateDefinition {
    /// Placeholders in document order.
    pub fn placeholders(&self) -> Vec<Placeholder> {
        let mut out = Vec::new();
        let mut stack: Vec<&XmlNode> = self.nodes.iter().rev().collect();
        while let Some(node) = stack.pop() {
            match node {
                XmlNode::Placeholder(p) => out.push(*p),
                XmlNode::Element(e) => {
                    for child in e.children.iter().rev() {
                        stack.push(child);
                    }
                    for attribute in e.attributes.iter().rev() {
                        for value in attribute.value.iter().rev() {
                            stack.push(value);
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }
}

/// Per-chunk map of template definitions, keyed by chunk offset.
///
/// A template is parsed the first time a record references it and shared by every later
/// reference in the same chunk. Definitions that fail to parse are not cached.
#[derive(Debug, Default)]
pub struct TemplateCache {
    templates: AHashMap<ChunkOffset, Rc<TemplateDefinition>>,
    parse_count: usize,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_template(&self, offset: ChunkOffset) -> Option<&Rc<TemplateDefinition>> {
        self.templates.get(&offset)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Number of template definitions parsed so far (cache misses).
    pub fn parse_count(&self) -> usize {
        self.parse_count
    }

    /// Return the definition at `offset`, invoking `parse` on a cache miss.
    ///
    /// `depth` is the template nesting level of the reference. Parsing is refused beyond
    /// `limit`, which bounds recursion through self-referencing templates.
    pub(crate) fn resolve<F>(
        &mut self,
        offset: ChunkOffset,
        depth: usize,
        limit: usize,
        parse: F,
    ) -> Result<Rc<TemplateDefinition>, RecordError>
    where
        F: FnOnce(&mut TemplateCache) -> Result<TemplateDefinition, RecordError>,
    {
        if let Some(template) = self.templates.get(&offset) {
            trace!("Template at offset {} served from cache", offset);
            return Ok(Rc::clone(template));
        }

        if depth > limit {
            debug!(
                "Refusing to parse template at offset {} at nesting depth {}",
                offset, depth
            );
            return Err(RecordError::TemplateRecursionLimit { offset, limit });
        }

        self.parse_count += 1;
        let template = Rc::new(parse(self)?);
        self.templates.insert(offset, Rc::clone(&template));
        Ok(template)
    }
}
