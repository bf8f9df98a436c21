use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::ChunkOffset;

pub type Result<T> = std::result::Result<T, EvtxError>;
pub type DeserializationResult<T> = std::result::Result<T, DeserializationError>;

/// Errors raised while reading primitives and BinXML tokens out of a byte buffer.
///
/// `Truncated` is the out-of-bounds failure of [`crate::ByteCursor`]. It never escapes the
/// decoder on its own: every caller wraps it into the enclosing file, chunk or record error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeserializationError {
    #[error("Offset {offset}: buffer too small for {what} (need {need} bytes, have {have})")]
    Truncated {
        what: &'static str,
        offset: u64,
        need: usize,
        have: usize,
    },

    #[error("Offset {offset}: tried to read an invalid byte `0x{value:02x}` as binxml token")]
    InvalidToken { value: u8, offset: u64 },

    #[error(
        "Offset {offset}: tried to read an invalid byte `0x{value:02x}` as binxml value variant"
    )]
    InvalidValueVariant { value: u8, offset: u64 },

    #[error("Offset {offset}: value variant `{name}` (size {size:?}) is unimplemented")]
    UnimplementedValueVariant {
        name: String,
        size: Option<u16>,
        offset: u64,
    },

    #[error("Offset {offset}: token `{token}` is not allowed {context}")]
    UnexpectedToken {
        token: &'static str,
        context: &'static str,
        offset: u64,
    },

    #[error("Offset {offset}: element nesting exceeds {limit} levels")]
    ElementDepthLimit { limit: usize, offset: u64 },

    #[error(
        "Offset {offset}: failed to decode ansi string (used encoding scheme {encoding}), caused by: {message}"
    )]
    AnsiDecodeError {
        encoding: &'static str,
        message: String,
        offset: u64,
    },

    #[error("Offset {offset}: {what} is not a representable point in time")]
    InvalidDateTime { what: &'static str, offset: u64 },

    #[error("Offset {offset}: failed to decode GUID")]
    InvalidGuid { offset: u64 },
}

impl DeserializationError {
    /// Offset (relative to the start of the buffer being read) where the error occurred.
    pub fn offset(&self) -> u64 {
        match self {
            DeserializationError::Truncated { offset, .. }
            | DeserializationError::InvalidToken { offset, .. }
            | DeserializationError::InvalidValueVariant { offset, .. }
            | DeserializationError::UnimplementedValueVariant { offset, .. }
            | DeserializationError::UnexpectedToken { offset, .. }
            | DeserializationError::ElementDepthLimit { offset, .. }
            | DeserializationError::AnsiDecodeError { offset, .. }
            | DeserializationError::InvalidDateTime { offset, .. }
            | DeserializationError::InvalidGuid { offset } => *offset,
        }
    }
}

/// File level failures. Only `InvalidMagic` and `Truncated` reject a file,
/// `ChecksumMismatch` is reported as a warning.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Invalid EVTX file header magic, expected `ElfFile0`, found `{magic:2X?}`")]
    InvalidMagic { magic: [u8; 8] },

    #[error("EVTX file header checksum mismatch (stored 0x{expected:08x}, computed 0x{found:08x})")]
    ChecksumMismatch { expected: u32, found: u32 },

    #[error("EVTX file header is truncated: {source}")]
    Truncated { source: DeserializationError },
}

/// Chunk level failures. Everything except `Truncated` downgrades the chunk to dirty.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Chunk {chunk_number}: invalid chunk magic, expected `ElfChnk0`, found `{magic:2X?}`")]
    InvalidMagic { chunk_number: u64, magic: [u8; 8] },

    #[error(
        "Chunk {chunk_number}: header checksum mismatch (stored 0x{expected:08x}, computed 0x{found:08x})"
    )]
    HeaderChecksumMismatch {
        chunk_number: u64,
        expected: u32,
        found: u32,
    },

    #[error(
        "Chunk {chunk_number}: record data checksum mismatch (stored 0x{expected:08x}, computed 0x{found:08x})"
    )]
    DataChecksumMismatch {
        chunk_number: u64,
        expected: u32,
        found: u32,
    },

    #[error("Chunk {chunk_number}: free space offset {offset} is outside of the chunk")]
    InvalidFreeSpaceOffset { chunk_number: u64, offset: u32 },

    #[error("Chunk {chunk_number}: chunk header is truncated: {source}")]
    Truncated {
        chunk_number: u64,
        source: DeserializationError,
    },
}

/// Record level failures. These are attached to the emitted event as warnings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record {record_id}: leading size {leading} does not match trailing size {trailing}")]
    SizeMismatch {
        record_id: u64,
        leading: u32,
        trailing: u32,
    },

    #[error("Template reference to chunk offset {offset} does not point to a template definition")]
    DanglingTemplateReference { offset: ChunkOffset },

    #[error("Template at chunk offset {offset} exceeds the nesting limit of {limit}")]
    TemplateRecursionLimit { offset: ChunkOffset, limit: usize },

    #[error("Template at chunk offset {offset} is malformed: {source}")]
    MalformedTemplate {
        offset: ChunkOffset,
        source: DeserializationError,
    },

    #[error("Template instances expand to more than {limit} nodes")]
    NodeLimit { limit: usize },

    #[error("Substitution {index} is missing, the instance supplies {count} values")]
    MissingSubstitution { index: u16, count: usize },

    #[error("Record id {current} does not follow previous record id {previous}")]
    NonMonotonicRecordId { previous: u64, current: u64 },

    #[error("Record timestamp 0x{filetime:016x} is out of range")]
    InvalidTimestamp { filetime: u64 },

    #[error("Failed to decode record body: {source}")]
    MalformedBinXml {
        #[from]
        source: DeserializationError,
    },
}

impl RecordError {
    /// Whether this warning means the decoded tree is missing content.
    pub fn affects_content(&self) -> bool {
        !matches!(
            self,
            RecordError::NonMonotonicRecordId { .. } | RecordError::InvalidTimestamp { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum EvtxError {
    #[error("Failed to open file {}: {}", path.display(), source)]
    FailedToOpenFile { source: io::Error, path: PathBuf },

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Deserialization(#[from] DeserializationError),

    #[error("Chunk index {index} is out of range, file holds {count} chunks")]
    InvalidChunkIndex { index: usize, count: usize },

    #[error("Writing to XML failed with: {message}")]
    XmlOutputError { message: String },
}
