#![allow(dead_code)]
use std::path::{Path, PathBuf};
use std::sync::Once;

#[path = "../src/tests/synthetic.rs"]
pub mod synthetic;

use synthetic::{BinXmlWriter, ChunkBuilder, FileHeaderOptions, SAMPLE_FILETIME, SubValue, build_file};

static LOGGER_INIT: Once = Once::new();

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging facilities.
pub fn ensure_env_logger_initialized() {
    use std::io::Write;

    LOGGER_INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
            .init();
    });
}

/// `<Event><System><Provider Name=%0/><EventID>%1</EventID><Level>%2</Level>
/// <Computer>%3</Computer></System></Event>`
pub fn system_template(w: &mut BinXmlWriter, _definition: u32) {
    w.fragment_header();
    w.open_element("Event", false);
    w.close_start();
    w.open_element("System", false);
    w.close_start();
    w.open_element("Provider", true);
    w.attribute("Name");
    w.substitution(0, 0x01, false);
    w.close_empty();
    w.substituted_element("EventID", 1, 0x06, false);
    w.substituted_element("Level", 2, 0x04, false);
    w.substituted_element("Computer", 3, 0x01, false);
    w.close_element();
    w.close_element();
    w.end_of_stream();
}

pub fn system_values(event_id: u16, level: u8) -> Vec<SubValue> {
    vec![
        SubValue::string("Service Control Manager"),
        SubValue::UInt16(event_id),
        SubValue::UInt8(level),
        SubValue::string("WKS-01"),
    ]
}

/// A chunk whose records share one template. `records` holds `(record id, event id, level)`.
pub fn template_chunk(records: &[(u64, u16, u8)]) -> Vec<u8> {
    let mut builder = ChunkBuilder::new();
    let mut definition = None;

    for &(record_id, event_id, level) in records {
        builder.record(record_id, SAMPLE_FILETIME, |w| {
            w.fragment_header();
            match definition {
                Some(offset) => w.template_instance_ref(1, offset, system_values(event_id, level)),
                None => {
                    definition = Some(w.template_instance_inline(
                        1,
                        system_template,
                        system_values(event_id, level),
                    ))
                }
            }
            w.end_of_stream();
        });
    }

    builder.finish()
}

pub fn file_with_chunks(chunks: &[Vec<u8>]) -> Vec<u8> {
    build_file(
        &FileHeaderOptions {
            chunk_count: chunks.len() as u16,
            next_record_id: 1,
            flags: 0,
        },
        chunks,
    )
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}
