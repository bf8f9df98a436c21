use jiff::Timestamp;
use log::warn;
use serde_json::Value;

use crate::binxml::deserializer::DecodedRecord;
use crate::err::{DeserializationResult, RecordError, Result};
use crate::json_output::nodes_to_json;
use crate::model::xml::{XmlElement, XmlNode};
use crate::utils::bytes::read_u32_le;
use crate::utils::{ByteCursor, filetime_to_timestamp};

pub const EVTX_RECORD_MAGIC: &[u8; 4] = b"\x2a\x2a\x00\x00";
pub const EVTX_RECORD_HEADER_SIZE: usize = 24;
/// Header plus the trailing copy of the size.
pub const EVTX_RECORD_MIN_SIZE: u32 = EVTX_RECORD_HEADER_SIZE as u32 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvtxRecordHeader {
    pub data_size: u32,
    pub event_record_id: u64,
    /// Raw FILETIME, converted when the record is assembled.
    pub filetime: u64,
    /// The size copy stored in the last four bytes of the record, if they are inside the chunk.
    pub trailing_size: Option<u32>,
}

impl EvtxRecordHeader {
    pub fn has_record_magic(data: &[u8], offset: usize) -> bool {
        data.get(offset..offset.saturating_add(4)) == Some(&EVTX_RECORD_MAGIC[..])
    }

    /// Read the record header at `offset`. The caller is expected to have checked the magic.
    pub fn from_bytes_at(data: &[u8], offset: usize) -> DeserializationResult<EvtxRecordHeader> {
        let mut cursor = ByteCursor::with_pos(data, offset)?;
        let _magic = cursor.array::<4>("record magic")?;
        let data_size = cursor.u32_named("record size")?;
        let event_record_id = cursor.u64_named("record id")?;
        let filetime = cursor.u64_named("record timestamp")?;

        let trailing_size = (data_size >= EVTX_RECORD_MIN_SIZE)
            .then(|| read_u32_le(data, offset + data_size as usize - 4))
            .flatten();

        Ok(EvtxRecordHeader {
            data_size,
            event_record_id,
            filetime,
            trailing_size,
        })
    }

    pub fn record_data_size(&self) -> u32 {
        // 24 - record header size
        // 4 - copy of size record size
        self.data_size.saturating_sub(EVTX_RECORD_MIN_SIZE)
    }

    /// Chunk relative `[start, end)` of the BinXML body of a record found at `offset`.
    pub fn body_range(&self, offset: usize) -> (usize, usize) {
        let start = offset + EVTX_RECORD_HEADER_SIZE;
        (start, start + self.record_data_size() as usize)
    }
}

/// A decoded event record.
#[derive(Debug, Clone, PartialEq)]
pub struct EvtxEvent {
    record_id: u64,
    timestamp: Timestamp,
    nodes: Vec<XmlNode>,
    chunk_number: u64,
    recovered: bool,
    carved: bool,
    warnings: Vec<RecordError>,
}

/// Combine a record header with its decoded body.
///
/// `recovered` tags events that come from a dirty chunk. Header inconsistencies are appended
/// to the decoder warnings, the event itself is always produced.
pub fn assemble(
    header: &EvtxRecordHeader,
    decoded: DecodedRecord,
    chunk_number: u64,
    recovered: bool,
) -> EvtxEvent {
    let DecodedRecord {
        nodes,
        mut warnings,
    } = decoded;

    if let Some(trailing) = header.trailing_size {
        if trailing != header.data_size {
            let e = RecordError::SizeMismatch {
                record_id: header.event_record_id,
                leading: header.data_size,
                trailing,
            };
            warn!("Chunk {}: {}", chunk_number, e);
            warnings.push(e);
        }
    }

    let timestamp = match filetime_to_timestamp(header.filetime) {
        Ok(ts) => ts,
        Err(_) => {
            let e = RecordError::InvalidTimestamp {
                filetime: header.filetime,
            };
            warn!("Chunk {}: record {}: {}", chunk_number, header.event_record_id, e);
            warnings.push(e);
            Timestamp::UNIX_EPOCH
        }
    };

    EvtxEvent {
        record_id: header.event_record_id,
        timestamp,
        nodes,
        chunk_number,
        recovered,
        carved: false,
        warnings,
    }
}

impl EvtxEvent {
    pub(crate) fn mark_carved(mut self) -> Self {
        self.carved = true;
        self.recovered = true;
        self
    }

    pub(crate) fn push_warning(&mut self, warning: RecordError) {
        self.warnings.push(warning);
    }

    pub fn record_id(&self) -> u64 {
        self.record_id
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn nodes(&self) -> &[XmlNode] {
        &self.nodes
    }

    /// The first top level element, normally `<Event>`.
    pub fn root(&self) -> Option<&XmlElement> {
        self.nodes.iter().find_map(|node| match node {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn chunk_number(&self) -> u64 {
        self.chunk_number
    }

    /// Whether the event was decoded from a chunk that failed its integrity checks.
    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    /// Whether the event was found by scanning past the chunk's declared record area.
    pub fn is_carved(&self) -> bool {
        self.carved
    }

    pub fn warnings(&self) -> &[RecordError] {
        &self.warnings
    }

    /// Whether a warning means part of the tree could not be decoded.
    pub fn is_partial(&self) -> bool {
        self.warnings.iter().any(RecordError::affects_content)
    }

    fn system(&self) -> Option<&XmlElement> {
        self.root()?.child("System")
    }

    fn system_text(&self, path: &str) -> Option<String> {
        let text = self.system()?.find(path)?.text();
        (!text.is_empty()).then_some(text)
    }

    pub fn event_id(&self) -> Option<u32> {
        let element = self.system()?.child("EventID")?;
        match element.value().and_then(|v| v.as_u64()) {
            Some(id) => u32::try_from(id).ok(),
            None => element.text().trim().parse().ok(),
        }
    }

    pub fn level(&self) -> Option<u8> {
        let element = self.system()?.child("Level")?;
        match element.value().and_then(|v| v.as_u64()) {
            Some(level) => u8::try_from(level).ok(),
            None => element.text().trim().parse().ok(),
        }
    }

    pub fn provider_name(&self) -> Option<String> {
        let name = self.system()?.child("Provider")?.attribute("Name")?.text();
        (!name.is_empty()).then_some(name)
    }

    pub fn computer(&self) -> Option<String> {
        self.system_text("Computer")
    }

    pub fn channel(&self) -> Option<String> {
        self.system_text("Channel")
    }

    pub fn to_xml_string(&self) -> Result<String> {
        crate::xml_output::nodes_to_xml_string(&self.nodes, true)
    }

    pub fn to_json_value(&self) -> Value {
        nodes_to_json(&self.nodes)
    }
}
