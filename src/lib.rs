#![forbid(unsafe_code)]
#![deny(unused_must_use)]
// Don't allow dbg! prints in release.
#![cfg_attr(not(debug_assertions), deny(clippy::dbg_macro))]

pub use evtx_chunk::{
    ChunkFlags, DecodeStats, EVTX_CHUNK_HEADER_SIZE, EVTX_CHUNK_SIZE, EvtxChunk,
    EvtxChunkHeader, IterChunkEvents,
};
pub use evtx_file_header::{EVTX_FILE_HEADER_BLOCK_SIZE, EvtxFileHeader, HeaderFlags};
pub use evtx_filter::{EventFilter, Level};
pub use evtx_parser::{
    DEFAULT_MAX_RECORD_NODES, DEFAULT_MAX_TEMPLATE_DEPTH, EvtxParser, IterEvents, ParserSettings,
};
pub use evtx_record::{EvtxEvent, EvtxRecordHeader, assemble};
pub use json_output::nodes_to_json;
pub use string_cache::StringCache;
pub use template_cache::{TemplateCache, TemplateDefinition};
pub use utils::{ByteCursor, format_timestamp};
pub use xml_output::nodes_to_xml_string;

pub mod binxml;
pub mod err;
pub mod model;

mod evtx_chunk;
mod evtx_file_header;
mod evtx_filter;
mod evtx_parser;
mod evtx_record;
mod json_output;
mod recovery;
mod string_cache;
mod template_cache;
mod utils;
mod xml_output;

pub use recovery::find_next_record;

/// Offset of a structure relative to the start of its chunk.
pub type ChunkOffset = u32;

#[cfg(test)]
mod tests;

#[cfg(test)]
use std::sync::Once;
#[cfg(test)]
static LOGGER_INIT: Once = Once::new();

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging facilities.
#[cfg(test)]
pub fn ensure_env_logger_initialized() {
    use std::io::Write;

    LOGGER_INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
            .init();
    });
}
