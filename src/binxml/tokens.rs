use log::trace;
use winstructs::guid::Guid;

use crate::ChunkOffset;
use crate::binxml::name::read_name_ref;
use crate::binxml::value_variant::BinXmlValueType;
use crate::err::DeserializationResult as Result;
use crate::model::xml::{Placeholder, XmlPI};
use crate::string_cache::StringCache;
use crate::utils::ByteCursor;

/// BinXML token opcodes. The `0x40` bit of a byte only carries the "has more data" flag.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BinXmlRawToken {
    EndOfStream,
    OpenStartElement { has_attributes: bool },
    CloseStartElement,
    CloseEmptyElement,
    CloseElement,
    Value,
    Attribute,
    CDataSection,
    CharRef,
    EntityReference,
    PITarget,
    PIData,
    TemplateInstance,
    NormalSubstitution,
    ConditionalSubstitution,
    StartOfStream,
}

impl BinXmlRawToken {
    pub fn from_u8(byte: u8) -> Option<BinXmlRawToken> {
        let token = match byte {
            0x00 => BinXmlRawToken::EndOfStream,
            0x01 => BinXmlRawToken::OpenStartElement {
                has_attributes: false,
            },
            0x41 => BinXmlRawToken::OpenStartElement {
                has_attributes: true,
            },
            0x02 => BinXmlRawToken::CloseStartElement,
            0x03 => BinXmlRawToken::CloseEmptyElement,
            0x04 => BinXmlRawToken::CloseElement,
            0x05 | 0x45 => BinXmlRawToken::Value,
            0x06 | 0x46 => BinXmlRawToken::Attribute,
            0x07 | 0x47 => BinXmlRawToken::CDataSection,
            0x08 | 0x48 => BinXmlRawToken::CharRef,
            0x09 | 0x49 => BinXmlRawToken::EntityReference,
            0x0a => BinXmlRawToken::PITarget,
            0x0b => BinXmlRawToken::PIData,
            0x0c => BinXmlRawToken::TemplateInstance,
            0x0d => BinXmlRawToken::NormalSubstitution,
            0x0e => BinXmlRawToken::ConditionalSubstitution,
            0x0f => BinXmlRawToken::StartOfStream,
            _ => return None,
        };
        Some(token)
    }

    pub fn name(self) -> &'static str {
        match self {
            BinXmlRawToken::EndOfStream => "EndOfStream",
            BinXmlRawToken::OpenStartElement { .. } => "OpenStartElement",
            BinXmlRawToken::CloseStartElement => "CloseStartElement",
            BinXmlRawToken::CloseEmptyElement => "CloseEmptyElement",
            BinXmlRawToken::CloseElement => "CloseElement",
            BinXmlRawToken::Value => "Value",
            BinXmlRawToken::Attribute => "Attribute",
            BinXmlRawToken::CDataSection => "CDataSection",
            BinXmlRawToken::CharRef => "CharRef",
            BinXmlRawToken::EntityReference => "EntityReference",
            BinXmlRawToken::PITarget => "PITarget",
            BinXmlRawToken::PIData => "PIData",
            BinXmlRawToken::TemplateInstance => "TemplateInstance",
            BinXmlRawToken::NormalSubstitution => "NormalSubstitution",
            BinXmlRawToken::ConditionalSubstitution => "ConditionalSubstitution",
            BinXmlRawToken::StartOfStream => "StartOfStream",
        }
    }
}

pub(crate) const TEMPLATE_DEFINITION_HEADER_SIZE: usize = 24;

#[derive(Debug, PartialEq, Clone)]
pub struct TemplateDefinitionHeader {
    pub next_template_offset: ChunkOffset,
    pub guid: Guid,
    pub data_size: u32,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) struct TemplateInstanceHeader {
    pub template_id: u32,
    pub definition_offset: ChunkOffset,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) struct TemplateValueDescriptor {
    pub size: u16,
    pub type_code: u8,
}

/// Reads the rest of an open start element token and returns the element name.
pub(crate) fn read_open_start_element(
    cursor: &mut ByteCursor<'_>,
    strings: &mut StringCache,
    has_attributes: bool,
) -> Result<String> {
    let _dependency_id = cursor.u16_named("dependency id")?;
    let _data_size = cursor.u32_named("element data size")?;
    let name = read_name_ref(cursor, strings)?;

    if has_attributes {
        let _attribute_list_size = cursor.u32_named("attribute list size")?;
    }

    trace!("\tOpenStartElement <{}>", name);
    Ok(name)
}

pub(crate) fn read_substitution_descriptor(
    cursor: &mut ByteCursor<'_>,
    optional: bool,
) -> Result<Placeholder> {
    let index = cursor.u16_named("substitution index")?;
    let type_code = cursor.u8_named("substitution value type")?;

    Ok(Placeholder {
        index,
        value_type: BinXmlValueType::from_u8(type_code),
        type_code,
        optional,
    })
}

pub(crate) fn read_fragment_header(cursor: &mut ByteCursor<'_>) -> Result<()> {
    let major = cursor.u8_named("fragment major version")?;
    let minor = cursor.u8_named("fragment minor version")?;
    let flags = cursor.u8_named("fragment flags")?;
    trace!("\tFragment header v{}.{} (flags 0x{:02x})", major, minor, flags);
    Ok(())
}

pub(crate) fn read_processing_instruction_target(
    cursor: &mut ByteCursor<'_>,
    strings: &mut StringCache,
) -> Result<XmlPI> {
    Ok(XmlPI {
        target: read_name_ref(cursor, strings)?,
        data: String::new(),
    })
}

pub(crate) fn read_processing_instruction_data(cursor: &mut ByteCursor<'_>) -> Result<String> {
    cursor.len_prefixed_utf16_string(false, "pi data")
}

pub(crate) fn read_template_instance_header(
    cursor: &mut ByteCursor<'_>,
) -> Result<TemplateInstanceHeader> {
    let _unknown = cursor.u8_named("template instance reserved")?;
    let template_id = cursor.u32_named("template id")?;
    let definition_offset = cursor.u32_named("template definition offset")?;

    Ok(TemplateInstanceHeader {
        template_id,
        definition_offset,
    })
}

pub(crate) fn read_template_definition_header(
    cursor: &mut ByteCursor<'_>,
) -> Result<TemplateDefinitionHeader> {
    let next_template_offset = cursor.u32_named("next template offset")?;
    let guid = cursor.guid()?;
    let data_size = cursor.u32_named("template data size")?;

    Ok(TemplateDefinitionHeader {
        next_template_offset,
        guid,
        data_size,
    })
}

/// Reads the substitution count and the `(size, type)` descriptor of every value.
pub(crate) fn read_value_descriptors(
    cursor: &mut ByteCursor<'_>,
) -> Result<Vec<TemplateValueDescriptor>> {
    let start = cursor.pos();
    let count = cursor.u32_named("substitution count")? as usize;

    // Each descriptor takes 4 bytes. Reject counts the buffer cannot hold before allocating.
    let table = count.saturating_mul(4);
    if table > cursor.remaining() {
        let err = crate::utils::bytes::truncated(
            "substitution descriptors",
            cursor.pos(),
            table,
            cursor.buf().len(),
        );
        cursor.seek(start, "substitution count")?;
        return Err(err);
    }

    let mut descriptors = Vec::with_capacity(count);
    for _ in 0..count {
        let size = cursor.u16_named("substitution size")?;
        let type_code = cursor.u8_named("substitution type")?;
        let _padding = cursor.u8_named("substitution padding")?;
        descriptors.push(TemplateValueDescriptor { size, type_code });
    }

    trace!("\tValue descriptors: {:?}", descriptors);
    Ok(descriptors)
}
