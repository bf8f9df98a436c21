use std::rc::Rc;

use log::{debug, trace, warn};

use crate::ChunkOffset;
use crate::binxml::name::read_name_ref;
use crate::binxml::tokens::{
    BinXmlRawToken, TEMPLATE_DEFINITION_HEADER_SIZE, TemplateValueDescriptor,
    read_fragment_header, read_open_start_element, read_processing_instruction_data,
    read_processing_instruction_target, read_substitution_descriptor,
    read_template_definition_header, read_template_instance_header, read_value_descriptors,
};
use crate::binxml::value_variant::{BinXmlValue, BinXmlValueType};
use crate::err::{DeserializationError, RecordError};
use crate::evtx_chunk::EVTX_CHUNK_HEADER_SIZE;
use crate::evtx_parser::ParserSettings;
use crate::model::xml::{
    Placeholder, UnresolvedTemplate, XmlAttribute, XmlElement, XmlNode, XmlTreeBuilder,
};
use crate::string_cache::StringCache;
use crate::template_cache::{TemplateCache, TemplateDefinition};
use crate::utils::ByteCursor;

/// Open elements allowed within a single fragment.
pub const MAX_ELEMENT_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Template body: substitutions become placeholders and any failure rejects the whole
    /// definition.
    Template,
    /// Record or embedded fragment: decode as much as possible and record warnings.
    Record,
}

/// An instance value together with the type code and bytes it was declared with.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TemplateValue {
    pub type_code: u8,
    pub raw: Vec<u8>,
    pub value: BinXmlValue,
}

/// The output of decoding one record body.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DecodedRecord {
    pub nodes: Vec<XmlNode>,
    pub warnings: Vec<RecordError>,
}

/// Decodes BinXML token streams of one chunk into element trees.
///
/// All offsets are chunk relative, `data` is the whole chunk.
pub struct BinXmlDeserializer<'a, 'c> {
    data: &'a [u8],
    strings: &'c mut StringCache,
    templates: &'c mut TemplateCache,
    settings: &'c ParserSettings,
    warnings: Vec<RecordError>,
    /// Nodes the record may still produce through template instantiation.
    nodes_left: usize,
}

impl<'a, 'c> BinXmlDeserializer<'a, 'c> {
    pub fn new(
        data: &'a [u8],
        strings: &'c mut StringCache,
        templates: &'c mut TemplateCache,
        settings: &'c ParserSettings,
    ) -> Self {
        BinXmlDeserializer {
            data,
            strings,
            templates,
            settings,
            warnings: Vec::new(),
            nodes_left: settings.get_max_record_nodes(),
        }
    }

    /// Decode the record body at `[start, end)`. Never fails: whatever was decoded before a
    /// problem is returned along with a warning describing it.
    pub fn decode_record(mut self, start: usize, end: usize) -> DecodedRecord {
        let nodes = self.decode_salvaging(start, end, 0);
        DecodedRecord {
            nodes,
            warnings: self.warnings,
        }
    }

    fn decode_salvaging(&mut self, start: usize, end: usize, depth: usize) -> Vec<XmlNode> {
        let mut builder = XmlTreeBuilder::new();
        if let Err(e) = self.decode_tokens(&mut builder, start, end, Mode::Record, depth) {
            debug!("Fragment at offset {} stopped early: {}", start, e);
            self.warnings.push(e);
        }
        builder.finish()
    }

    fn decode_tokens(
        &mut self,
        builder: &mut XmlTreeBuilder,
        start: usize,
        end: usize,
        mode: Mode,
        depth: usize,
    ) -> Result<(), RecordError> {
        let end = end.min(self.data.len());
        let mut cursor = ByteCursor::with_pos(self.data, start)?;

        while cursor.pos() < end {
            let offset = cursor.position();
            let byte = cursor.u8_named("token")?;
            let token = BinXmlRawToken::from_u8(byte)
                .ok_or(DeserializationError::InvalidToken { value: byte, offset })?;

            trace!("Offset `0x{offset:08x}` ({offset}): {token:?}");

            let unexpected = |context: &'static str| DeserializationError::UnexpectedToken {
                token: token.name(),
                context,
                offset,
            };

            match token {
                BinXmlRawToken::EndOfStream => break,
                BinXmlRawToken::StartOfStream => read_fragment_header(&mut cursor)?,
                BinXmlRawToken::OpenStartElement { has_attributes } => {
                    if builder.depth() >= MAX_ELEMENT_DEPTH {
                        return Err(DeserializationError::ElementDepthLimit {
                            limit: MAX_ELEMENT_DEPTH,
                            offset,
                        }
                        .into());
                    }
                    let name = read_open_start_element(&mut cursor, self.strings, has_attributes)?;
                    builder.open_start_element(name);
                }
                BinXmlRawToken::CloseStartElement => {
                    if !builder.close_start_element() {
                        return Err(unexpected("outside of a start tag").into());
                    }
                }
                BinXmlRawToken::CloseEmptyElement => {
                    if !builder.close_empty_element() {
                        return Err(unexpected("outside of a start tag").into());
                    }
                }
                BinXmlRawToken::CloseElement => {
                    if !builder.close_element() {
                        return Err(unexpected("without an open element").into());
                    }
                }
                BinXmlRawToken::Attribute => {
                    let name = read_name_ref(&mut cursor, self.strings)?;
                    if !builder.attribute(name) {
                        return Err(unexpected("outside of a start tag").into());
                    }
                }
                BinXmlRawToken::Value => {
                    let value = self.read_value_token(&mut cursor, mode, depth)?;
                    push_value(builder, value);
                }
                BinXmlRawToken::CDataSection => {
                    let text = cursor.len_prefixed_utf16_string(false, "cdata")?;
                    builder.push(XmlNode::CData(text));
                }
                BinXmlRawToken::CharRef => {
                    builder.push(XmlNode::CharRef(cursor.u16_named("char ref")?));
                }
                BinXmlRawToken::EntityReference => {
                    let name = read_name_ref(&mut cursor, self.strings)?;
                    builder.push(XmlNode::EntityRef(name));
                }
                BinXmlRawToken::PITarget => {
                    let pi = read_processing_instruction_target(&mut cursor, self.strings)?;
                    builder.push(XmlNode::ProcessingInstruction(pi));
                }
                BinXmlRawToken::PIData => {
                    let data = read_processing_instruction_data(&mut cursor)?;
                    match builder.last_mut() {
                        Some(XmlNode::ProcessingInstruction(pi)) => pi.data = data,
                        _ => return Err(unexpected("without a processing instruction target").into()),
                    }
                }
                BinXmlRawToken::TemplateInstance => {
                    for node in self.read_template_instance(&mut cursor, mode, depth)? {
                        builder.push(node);
                    }
                }
                BinXmlRawToken::NormalSubstitution | BinXmlRawToken::ConditionalSubstitution => {
                    if mode != Mode::Template {
                        return Err(unexpected("outside of a template definition").into());
                    }
                    let placeholder = read_substitution_descriptor(
                        &mut cursor,
                        token == BinXmlRawToken::ConditionalSubstitution,
                    )?;
                    builder.push(XmlNode::Placeholder(placeholder));
                }
            }
        }

        Ok(())
    }

    fn read_value_token(
        &mut self,
        cursor: &mut ByteCursor<'a>,
        mode: Mode,
        depth: usize,
    ) -> Result<BinXmlValue, RecordError> {
        let offset = cursor.position();
        let type_code = cursor.u8_named("value type")?;
        let value_type = BinXmlValueType::from_u8(type_code)
            .ok_or(DeserializationError::InvalidValueVariant {
                value: type_code,
                offset,
            })?;

        if value_type == BinXmlValueType::BinXmlType {
            let size = usize::from(cursor.u16_named("binxml size")?);
            let start = cursor.pos();
            cursor.advance(size, "binxml fragment")?;
            let nodes = self.decode_embedded(start, start + size, mode, depth + 1)?;
            return Ok(BinXmlValue::BinXmlType(nodes));
        }

        Ok(BinXmlValue::from_cursor(
            value_type,
            cursor,
            None,
            self.settings.get_ansi_codec(),
        )?)
    }

    fn decode_embedded(
        &mut self,
        start: usize,
        end: usize,
        mode: Mode,
        depth: usize,
    ) -> Result<Vec<XmlNode>, RecordError> {
        let limit = self.settings.get_max_template_depth();
        if depth > limit {
            let err = RecordError::TemplateRecursionLimit {
                offset: start as ChunkOffset,
                limit,
            };
            return match mode {
                Mode::Template => Err(err),
                Mode::Record => {
                    self.warnings.push(err);
                    Ok(Vec::new())
                }
            };
        }
        Ok(self.decode_salvaging(start, end, depth))
    }

    fn read_template_instance(
        &mut self,
        cursor: &mut ByteCursor<'a>,
        mode: Mode,
        depth: usize,
    ) -> Result<Vec<XmlNode>, RecordError> {
        let instance = read_template_instance_header(cursor)?;
        let offset = instance.definition_offset;
        trace!(
            "\tTemplate instance {} -> definition at {}",
            instance.template_id, offset
        );

        if offset as usize == cursor.pos() {
            let header = read_template_definition_header(cursor)?;
            cursor.advance(header.data_size as usize, "inline template definition")?;
        }

        let values = self.read_substitution_values(cursor, mode, depth)?;

        match self.resolve_template(offset, depth + 1) {
            Ok(template) => self.instantiate(&template.nodes, &values),
            Err(e) if mode == Mode::Record => {
                warn!("Failed to resolve template at offset {}: {}", offset, e);
                self.warnings.push(e);
                Ok(vec![XmlNode::TemplateInstance(UnresolvedTemplate {
                    template_offset: offset,
                    values: values.into_iter().map(|v| v.value).collect(),
                })])
            }
            Err(e) => Err(e),
        }
    }

    fn read_substitution_values(
        &mut self,
        cursor: &mut ByteCursor<'a>,
        mode: Mode,
        depth: usize,
    ) -> Result<Vec<TemplateValue>, RecordError> {
        let descriptors = read_value_descriptors(cursor)?;
        let mut values = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let start = cursor.pos();
            let raw = cursor.take_bytes(usize::from(descriptor.size), "substitution value")?;
            let value = self.read_substitution_value(descriptor, start, raw, mode, depth)?;
            trace!("\tSubstitution {:?} -> {:?}", descriptor, value);

            values.push(TemplateValue {
                type_code: descriptor.type_code,
                raw: raw.to_vec(),
                value,
            });
        }

        Ok(values)
    }

    fn read_substitution_value(
        &mut self,
        descriptor: TemplateValueDescriptor,
        start: usize,
        raw: &[u8],
        mode: Mode,
        depth: usize,
    ) -> Result<BinXmlValue, RecordError> {
        let size = usize::from(descriptor.size);
        if size == 0 {
            return Ok(BinXmlValue::NullType);
        }

        let raw_value = || BinXmlValue::Raw {
            type_code: descriptor.type_code,
            bytes: raw.to_vec(),
        };

        let value_type = match BinXmlValueType::from_u8(descriptor.type_code) {
            Some(value_type) => value_type,
            None => {
                debug!(
                    "Unknown substitution value type 0x{:02x} at offset {}",
                    descriptor.type_code, start
                );
                return Ok(raw_value());
            }
        };

        if value_type == BinXmlValueType::BinXmlType {
            let nodes = self.decode_embedded(start, start + size, mode, depth + 1)?;
            return Ok(BinXmlValue::BinXmlType(nodes));
        }

        let mut value_cursor = ByteCursor::bounded(self.data, start, start + size)?;
        match BinXmlValue::from_cursor(
            value_type,
            &mut value_cursor,
            Some(descriptor.size),
            self.settings.get_ansi_codec(),
        ) {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!("Keeping substitution at offset {} as raw bytes: {}", start, e);
                Ok(raw_value())
            }
        }
    }

    fn resolve_template(
        &mut self,
        offset: ChunkOffset,
        depth: usize,
    ) -> Result<Rc<TemplateDefinition>, RecordError> {
        let limit = self.settings.get_max_template_depth();
        let BinXmlDeserializer {
            data,
            strings,
            templates,
            settings,
            warnings,
            nodes_left,
        } = self;

        templates.resolve(offset, depth, limit, |templates| {
            let mut nested = BinXmlDeserializer {
                data: *data,
                strings: &mut **strings,
                templates,
                settings: *settings,
                warnings: std::mem::take(warnings),
                nodes_left: *nodes_left,
            };
            let template = nested.read_template_definition(offset, depth);
            *warnings = nested.warnings;
            *nodes_left = nested.nodes_left;
            template
        })
    }

    /// Parse the template definition at `offset` (header, then the body as a token stream).
    fn read_template_definition(
        &mut self,
        offset: ChunkOffset,
        depth: usize,
    ) -> Result<TemplateDefinition, RecordError> {
        let dangling = RecordError::DanglingTemplateReference { offset };
        let start = offset as usize;

        if start < EVTX_CHUNK_HEADER_SIZE {
            return Err(dangling);
        }
        let mut cursor = ByteCursor::with_pos(self.data, start).map_err(|_| dangling.clone())?;
        let header = read_template_definition_header(&mut cursor).map_err(|_| dangling.clone())?;

        let body_start = start + TEMPLATE_DEFINITION_HEADER_SIZE;
        let body_end = body_start + header.data_size as usize;
        let body_starts_with_element_or_fragment = matches!(
            self.data.get(body_start).copied().and_then(BinXmlRawToken::from_u8),
            Some(BinXmlRawToken::StartOfStream | BinXmlRawToken::OpenStartElement { .. })
        );
        if header.data_size == 0 || body_end > self.data.len() || !body_starts_with_element_or_fragment
        {
            debug!(
                "No template definition at offset {} (data size {})",
                offset, header.data_size
            );
            return Err(dangling);
        }

        trace!(
            "Parsing template definition at {} ({} bytes, guid {})",
            offset, header.data_size, header.guid
        );

        let mut builder = XmlTreeBuilder::new();
        self.decode_tokens(&mut builder, body_start, body_end, Mode::Template, depth)
            .map_err(|e| match e {
                RecordError::MalformedBinXml { source } => {
                    RecordError::MalformedTemplate { offset, source }
                }
                other => other,
            })?;

        Ok(TemplateDefinition {
            offset,
            header,
            nodes: builder.finish(),
        })
    }

    /// Copy template nodes, replacing placeholders with instance values.
    fn instantiate(
        &mut self,
        nodes: &[XmlNode],
        values: &[TemplateValue],
    ) -> Result<Vec<XmlNode>, RecordError> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                XmlNode::Placeholder(placeholder) => self.substitute(placeholder, values, &mut out)?,
                XmlNode::Element(element) => {
                    self.take_nodes(1)?;
                    let mut attributes = Vec::with_capacity(element.attributes.len());
                    for attribute in &element.attributes {
                        let value = self.instantiate(&attribute.value, values)?;
                        // Attributes made only of omitted optional values disappear.
                        if value.is_empty() && !attribute.value.is_empty() {
                            continue;
                        }
                        attributes.push(XmlAttribute {
                            name: attribute.name.clone(),
                            value,
                        });
                    }
                    out.push(XmlNode::Element(XmlElement {
                        name: element.name.clone(),
                        attributes,
                        children: self.instantiate(&element.children, values)?,
                    }));
                }
                other => {
                    self.take_nodes(1)?;
                    out.push(other.clone());
                }
            }
        }
        Ok(out)
    }

    fn substitute(
        &mut self,
        placeholder: &Placeholder,
        values: &[TemplateValue],
        out: &mut Vec<XmlNode>,
    ) -> Result<(), RecordError> {
        let Some(supplied) = values.get(usize::from(placeholder.index)) else {
            let e = RecordError::MissingSubstitution {
                index: placeholder.index,
                count: values.len(),
            };
            debug!("{}", e);
            self.warnings.push(e);
            return Ok(());
        };

        match &supplied.value {
            BinXmlValue::NullType if placeholder.optional => {}
            BinXmlValue::BinXmlType(nodes) => {
                self.take_nodes(tree_size(nodes))?;
                out.extend(nodes.iter().cloned());
            }
            value => {
                self.take_nodes(1)?;
                let mismatch = matches!(
                    (placeholder.value_type, BinXmlValueType::from_u8(supplied.type_code)),
                    (Some(declared), Some(actual)) if !declared.accepts(actual)
                );
                if mismatch {
                    debug!(
                        "Substitution {} declared as 0x{:02x} but supplied as 0x{:02x}",
                        placeholder.index, placeholder.type_code, supplied.type_code
                    );
                    out.push(XmlNode::Value(BinXmlValue::Raw {
                        type_code: supplied.type_code,
                        bytes: supplied.raw.clone(),
                    }));
                } else {
                    out.push(XmlNode::Value(value.clone()));
                }
            }
        }
        Ok(())
    }

    fn take_nodes(&mut self, count: usize) -> Result<(), RecordError> {
        match self.nodes_left.checked_sub(count) {
            Some(left) => {
                self.nodes_left = left;
                Ok(())
            }
            None => {
                self.nodes_left = 0;
                Err(RecordError::NodeLimit {
                    limit: self.settings.get_max_record_nodes(),
                })
            }
        }
    }
}

fn push_value(builder: &mut XmlTreeBuilder, value: BinXmlValue) {
    match value {
        BinXmlValue::BinXmlType(nodes) => {
            for node in nodes {
                builder.push(node);
            }
        }
        value => builder.push(XmlNode::Value(value)),
    }
}

/// Nodes in `nodes`, counting nested elements and attribute values.
fn tree_size(nodes: &[XmlNode]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            XmlNode::Element(element) => {
                1 + tree_size(&element.children)
                    + element
                        .attributes
                        .iter()
                        .map(|attribute| tree_size(&attribute.value))
                        .sum::<usize>()
            }
            _ => 1,
        })
        .sum()
}
