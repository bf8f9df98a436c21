use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use encoding::EncodingRef;
use log::{debug, info, warn};
#[cfg(feature = "multithreading")]
use rayon::prelude::*;

use crate::err::{EvtxError, Result};
use crate::evtx_chunk::{DecodeStats, EVTX_CHUNK_HEADER_SIZE, EVTX_CHUNK_SIZE, EvtxChunk, IterChunkEvents};
use crate::evtx_file_header::{EVTX_FILE_HEADER_BLOCK_SIZE, EvtxFileHeader};
use crate::evtx_record::EvtxEvent;

/// Nesting allowed for templates instantiated inside templates (and embedded BinXML values).
pub const DEFAULT_MAX_TEMPLATE_DEPTH: usize = 32;
/// Nodes a single record may produce by instantiating templates.
pub const DEFAULT_MAX_RECORD_NODES: usize = 1 << 18;

#[derive(Clone)]
pub struct ParserSettings {
    /// Worker threads for [`EvtxParser::events_parallel`]. `0` uses the global rayon pool.
    num_threads: usize,
    /// Compare chunk checksums and treat mismatching chunks as dirty.
    validate_checksums: bool,
    /// Scan dirty chunks for records past the declared record area.
    recovery_scan: bool,
    max_template_depth: usize,
    max_record_nodes: usize,
    /// Code page used for `AnsiString` values.
    ansi_codec: EncodingRef,
}

impl Debug for ParserSettings {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ParserSettings")
            .field("num_threads", &self.num_threads)
            .field("validate_checksums", &self.validate_checksums)
            .field("recovery_scan", &self.recovery_scan)
            .field("max_template_depth", &self.max_template_depth)
            .field("max_record_nodes", &self.max_record_nodes)
            .field("ansi_codec", &self.ansi_codec.name())
            .finish()
    }
}

impl PartialEq for ParserSettings {
    fn eq(&self, other: &Self) -> bool {
        self.num_threads == other.num_threads
            && self.validate_checksums == other.validate_checksums
            && self.recovery_scan == other.recovery_scan
            && self.max_template_depth == other.max_template_depth
            && self.max_record_nodes == other.max_record_nodes
            && self.ansi_codec.name() == other.ansi_codec.name()
    }
}

impl Default for ParserSettings {
    fn default() -> Self {
        ParserSettings {
            num_threads: 0,
            validate_checksums: true,
            recovery_scan: true,
            max_template_depth: DEFAULT_MAX_TEMPLATE_DEPTH,
            max_record_nodes: DEFAULT_MAX_RECORD_NODES,
            ansi_codec: encoding::all::WINDOWS_1252,
        }
    }
}

impl ParserSettings {
    pub fn new() -> Self {
        ParserSettings::default()
    }

    /// Sets the number of worker threads.
    /// `0` will let rayon decide.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = if cfg!(feature = "multithreading") {
            num_threads
        } else {
            1
        };
        self
    }

    pub fn validate_checksums(mut self, validate_checksums: bool) -> Self {
        self.validate_checksums = validate_checksums;
        self
    }

    pub fn recovery_scan(mut self, recovery_scan: bool) -> Self {
        self.recovery_scan = recovery_scan;
        self
    }

    pub fn max_template_depth(mut self, max_template_depth: usize) -> Self {
        self.max_template_depth = max_template_depth;
        self
    }

    /// Bounds the element tree of a record. Records needing more nodes are decoded partially.
    pub fn max_record_nodes(mut self, max_record_nodes: usize) -> Self {
        self.max_record_nodes = max_record_nodes;
        self
    }

    pub fn ansi_codec(mut self, ansi_codec: EncodingRef) -> Self {
        self.ansi_codec = ansi_codec;
        self
    }

    pub fn get_num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn should_validate_checksums(&self) -> bool {
        self.validate_checksums
    }

    pub fn should_recover(&self) -> bool {
        self.recovery_scan
    }

    pub fn get_max_template_depth(&self) -> usize {
        self.max_template_depth
    }

    pub fn get_max_record_nodes(&self) -> usize {
        self.max_record_nodes
    }

    pub fn get_ansi_codec(&self) -> EncodingRef {
        self.ansi_codec
    }
}

/// An EVTX file loaded in memory.
///
/// Chunks are independent of each other, they can be opened by index with
/// [`EvtxParser::chunk`] and decoded in any order.
pub struct EvtxParser {
    data: Vec<u8>,
    header: EvtxFileHeader,
    config: Arc<ParserSettings>,
}

impl Debug for EvtxParser {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("EvtxParser")
            .field("header", &self.header)
            .field("len", &self.data.len())
            .field("config", &self.config)
            .finish()
    }
}

impl EvtxParser {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| EvtxError::FailedToOpenFile {
            source,
            path: path.to_path_buf(),
        })?;

        info!("Loaded {} ({} bytes)", path.display(), data.len());
        Self::from_buffer(data)
    }

    /// Parse the file header of `buffer`. Fails only when the header is not an EVTX header.
    pub fn from_buffer(buffer: Vec<u8>) -> Result<Self> {
        let header = EvtxFileHeader::from_bytes(&buffer)?;
        debug!("EVTX file header: {:#?}", header);

        let parser = EvtxParser {
            data: buffer,
            header,
            config: Arc::new(ParserSettings::default()),
        };

        let chunk_count = parser.chunk_count();
        if chunk_count != usize::from(parser.header.chunk_count) {
            debug!(
                "File header declares {} chunks, buffer holds {}",
                parser.header.chunk_count, chunk_count
            );
        }

        Ok(parser)
    }

    pub fn with_configuration(mut self, configuration: ParserSettings) -> Self {
        self.config = Arc::new(configuration);
        self
    }

    pub fn header(&self) -> &EvtxFileHeader {
        &self.header
    }

    pub fn settings(&self) -> &ParserSettings {
        &self.config
    }

    /// Number of chunks present in the buffer.
    ///
    /// Derived from the buffer length rather than the header, which goes stale when a log is
    /// not closed cleanly. A trailing partial chunk counts if it holds a whole chunk header.
    pub fn chunk_count(&self) -> usize {
        let body = self.data.len().saturating_sub(EVTX_FILE_HEADER_BLOCK_SIZE);
        let full = body / EVTX_CHUNK_SIZE;
        let partial = usize::from(body % EVTX_CHUNK_SIZE >= EVTX_CHUNK_HEADER_SIZE);
        full + partial
    }

    /// Open the chunk at `index`.
    pub fn chunk(&self, index: usize) -> Result<EvtxChunk<'_>> {
        let count = self.chunk_count();
        if index >= count {
            return Err(EvtxError::InvalidChunkIndex { index, count });
        }

        let start = EVTX_FILE_HEADER_BLOCK_SIZE + index * EVTX_CHUNK_SIZE;
        let end = (start + EVTX_CHUNK_SIZE).min(self.data.len());
        Ok(EvtxChunk::new(
            &self.data[start..end],
            index as u64,
            &self.config,
        )?)
    }

    pub fn chunks(&self) -> impl Iterator<Item = Result<EvtxChunk<'_>>> {
        (0..self.chunk_count()).map(move |index| self.chunk(index))
    }

    /// Lazily decode every event of the file, chunk after chunk.
    pub fn events(&self) -> IterEvents<'_> {
        IterEvents {
            parser: self,
            next_chunk: 0,
            current: None,
            stats: DecodeStats::default(),
        }
    }

    fn decode_chunk(&self, index: usize) -> (Vec<EvtxEvent>, DecodeStats) {
        match self.chunk(index) {
            Ok(chunk) => {
                let mut iter = chunk.into_iter();
                let events: Vec<EvtxEvent> = iter.by_ref().collect();
                (events, iter.stats())
            }
            Err(e) => {
                warn!("Skipping chunk {}: {}", index, e);
                (Vec::new(), unreadable_chunk_stats())
            }
        }
    }

    /// Decode all chunks on a rayon thread pool. Events are returned in file order.
    #[cfg(feature = "multithreading")]
    pub fn events_parallel(&self) -> (Vec<EvtxEvent>, DecodeStats) {
        let decode_all = || {
            (0..self.chunk_count())
                .into_par_iter()
                .map(|index| self.decode_chunk(index))
                .collect::<Vec<_>>()
        };

        let per_chunk = match self.config.get_num_threads() {
            0 => decode_all(),
            1 => (0..self.chunk_count())
                .map(|index| self.decode_chunk(index))
                .collect(),
            n => match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
                Ok(pool) => pool.install(decode_all),
                Err(e) => {
                    warn!("Failed to build a pool of {} threads ({}), using the global pool", n, e);
                    decode_all()
                }
            },
        };

        merge(per_chunk)
    }

    #[cfg(not(feature = "multithreading"))]
    pub fn events_parallel(&self) -> (Vec<EvtxEvent>, DecodeStats) {
        merge(
            (0..self.chunk_count())
                .map(|index| self.decode_chunk(index))
                .collect(),
        )
    }
}

fn unreadable_chunk_stats() -> DecodeStats {
    DecodeStats {
        chunks: 1,
        empty_chunks: 1,
        ..DecodeStats::default()
    }
}

fn merge(per_chunk: Vec<(Vec<EvtxEvent>, DecodeStats)>) -> (Vec<EvtxEvent>, DecodeStats) {
    let mut all = Vec::new();
    let mut stats = DecodeStats::default();
    for (events, chunk_stats) in per_chunk {
        all.extend(events);
        stats += chunk_stats;
    }
    (all, stats)
}

/// Sequential event iterator over a whole file. Only one chunk is open at a time.
pub struct IterEvents<'a> {
    parser: &'a EvtxParser,
    next_chunk: usize,
    current: Option<IterChunkEvents<'a>>,
    stats: DecodeStats,
}

impl IterEvents<'_> {
    /// Statistics of everything decoded so far.
    pub fn stats(&self) -> DecodeStats {
        let mut stats = self.stats;
        if let Some(current) = &self.current {
            stats += current.stats();
        }
        stats
    }
}

impl Iterator for IterEvents<'_> {
    type Item = EvtxEvent;

    fn next(&mut self) -> Option<EvtxEvent> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if let Some(event) = current.next() {
                    return Some(event);
                }
                self.stats += current.stats();
                self.current = None;
            }

            if self.next_chunk >= self.parser.chunk_count() {
                return None;
            }

            let index = self.next_chunk;
            self.next_chunk += 1;
            match self.parser.chunk(index) {
                Ok(chunk) => self.current = Some(chunk.into_iter()),
                Err(e) => {
                    warn!("Skipping chunk {}: {}", index, e);
                    self.stats += unreadable_chunk_stats();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_env_logger_initialized;
    use crate::err::FormatError;
    use crate::tests::synthetic::{ChunkBuilder, FileHeaderOptions, build_file, build_file_header};
    use pretty_assertions::assert_eq;

    fn chunk_with_ids(ids: &[u64]) -> Vec<u8> {
        let mut builder = ChunkBuilder::new();
        for &id in ids {
            builder.record(id, 0x01D4_E25B_4EE1_2E40, |w| {
                w.fragment_header();
                w.open_element("Event", false);
                w.close_empty();
                w.end_of_stream();
            });
        }
        builder.finish()
    }

    #[test]
    fn test_default_settings() {
        let settings = ParserSettings::default();
        assert!(settings.should_validate_checksums());
        assert!(settings.should_recover());
        assert_eq!(settings.get_max_template_depth(), DEFAULT_MAX_TEMPLATE_DEPTH);
        assert_eq!(settings.get_max_record_nodes(), DEFAULT_MAX_RECORD_NODES);
        assert_eq!(settings.get_ansi_codec().name(), "windows-1252");
    }

    #[test]
    fn test_rejects_non_evtx_buffer() {
        let err = EvtxParser::from_buffer(vec![0_u8; 8192]).unwrap_err();
        assert!(matches!(
            err,
            EvtxError::Format(FormatError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = EvtxParser::from_path("/nonexistent/Security.evtx").unwrap_err();
        assert!(matches!(err, EvtxError::FailedToOpenFile { .. }));
    }

    #[test]
    fn test_chunk_count_follows_the_buffer() {
        ensure_env_logger_initialized();
        let mut file = build_file(
            &FileHeaderOptions {
                chunk_count: 5,
                ..FileHeaderOptions::default()
            },
            &[chunk_with_ids(&[1, 2])],
        );
        // A partial chunk large enough for a header.
        file.extend(chunk_with_ids(&[3]).into_iter().take(EVTX_CHUNK_HEADER_SIZE));

        let parser = EvtxParser::from_buffer(file).unwrap();
        assert_eq!(parser.header().chunk_count, 5);
        assert_eq!(parser.chunk_count(), 2);
        assert!(matches!(
            parser.chunk(2).unwrap_err(),
            EvtxError::InvalidChunkIndex { index: 2, count: 2 }
        ));
    }

    #[test]
    fn test_events_span_chunks() {
        ensure_env_logger_initialized();
        let file = build_file(
            &FileHeaderOptions {
                chunk_count: 3,
                ..FileHeaderOptions::default()
            },
            &[
                chunk_with_ids(&[1, 2]),
                vec![0_u8; EVTX_CHUNK_SIZE],
                chunk_with_ids(&[3]),
            ],
        );

        let parser = EvtxParser::from_buffer(file)
            .unwrap()
            .with_configuration(ParserSettings::new().num_threads(1));
        let mut events = parser.events();
        let ids: Vec<(u64, u64)> = events
            .by_ref()
            .map(|e| (e.chunk_number(), e.record_id()))
            .collect();

        assert_eq!(ids, vec![(0, 1), (0, 2), (2, 3)]);
        assert_eq!(
            events.stats(),
            DecodeStats {
                chunks: 3,
                empty_chunks: 1,
                events: 3,
                ..DecodeStats::default()
            }
        );
    }

    #[test]
    fn test_parallel_decode_keeps_file_order() {
        ensure_env_logger_initialized();
        let chunks: Vec<Vec<u8>> = (0..6_u64)
            .map(|i| chunk_with_ids(&[i * 10 + 1, i * 10 + 2]))
            .collect();
        let file = build_file(
            &FileHeaderOptions {
                chunk_count: 6,
                ..FileHeaderOptions::default()
            },
            &chunks,
        );

        let parser = EvtxParser::from_buffer(file)
            .unwrap()
            .with_configuration(ParserSettings::new().num_threads(4));
        let (events, stats) = parser.events_parallel();
        let sequential: Vec<u64> = parser.events().map(|e| e.record_id()).collect();

        assert_eq!(
            events.iter().map(EvtxEvent::record_id).collect::<Vec<_>>(),
            sequential
        );
        assert_eq!(stats.events, 12);
        assert_eq!(stats.chunks, 6);
    }

    #[test]
    fn test_stale_file_header_checksum_is_not_fatal() {
        let mut file = build_file(&FileHeaderOptions::default(), &[chunk_with_ids(&[1])]);
        let header = build_file_header(&FileHeaderOptions::default());
        assert_eq!(&file[..128], &header[..128]);
        file[24] ^= 0xFF;

        let parser = EvtxParser::from_buffer(file).unwrap();
        assert!(parser.header().validate_checksum().is_err());
        assert_eq!(parser.events().count(), 1);
    }
}
