use std::fmt::{self, Debug, Formatter};
use std::ops::AddAssign;

use bitflags::bitflags;
use log::{debug, info, trace, warn};

use crate::binxml::deserializer::BinXmlDeserializer;
use crate::err::{ChunkError, DeserializationError, RecordError};
use crate::evtx_parser::ParserSettings;
use crate::evtx_record::{EVTX_RECORD_MIN_SIZE, EvtxEvent, EvtxRecordHeader, assemble};
use crate::recovery::find_next_record;
use crate::string_cache::StringCache;
use crate::template_cache::TemplateCache;
use crate::utils::ByteCursor;

pub const EVTX_CHUNK_SIZE: usize = 65536;
pub const EVTX_CHUNK_HEADER_SIZE: usize = 512;
pub const EVTX_CHUNK_MAGIC: &[u8; 8] = b"ElfChnk\x00";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChunkFlags: u32 {
        const DIRTY = 0x1;
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct EvtxChunkHeader {
    pub magic: [u8; 8],
    pub first_event_record_number: u64,
    pub last_event_record_number: u64,
    pub first_event_record_id: u64,
    pub last_event_record_id: u64,
    pub header_size: u32,
    pub last_event_record_data_offset: u32,
    pub free_space_offset: u32,
    pub events_checksum: u32,
    pub flags: ChunkFlags,
    pub header_chunk_checksum: u32,
    // For every string a 16 bit hash is calculated, modulo the 64 buckets of this table.
    // Each bucket holds the offset of the last string that hashed into it.
    pub strings_offsets: [u32; 64],
    pub template_offsets: [u32; 32],
}

impl Debug for EvtxChunkHeader {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        fmt.debug_struct("EvtxChunkHeader")
            .field("first_event_record_number", &self.first_event_record_number)
            .field("last_event_record_number", &self.last_event_record_number)
            .field("first_event_record_id", &self.first_event_record_id)
            .field("last_event_record_id", &self.last_event_record_id)
            .field("free_space_offset", &self.free_space_offset)
            .field("checksum", &self.header_chunk_checksum)
            .finish()
    }
}

impl EvtxChunkHeader {
    /// Read the fixed 512 byte chunk header. The magic is returned as is, not validated.
    pub fn from_bytes(data: &[u8], chunk_number: u64) -> Result<EvtxChunkHeader, ChunkError> {
        let truncated = |source: DeserializationError| ChunkError::Truncated {
            chunk_number,
            source,
        };
        let mut cursor = ByteCursor::new(data);

        let magic = cursor.array::<8>("chunk magic").map_err(truncated)?;
        let first_event_record_number = cursor.u64_named("first record number").map_err(truncated)?;
        let last_event_record_number = cursor.u64_named("last record number").map_err(truncated)?;
        let first_event_record_id = cursor.u64_named("first record id").map_err(truncated)?;
        let last_event_record_id = cursor.u64_named("last record id").map_err(truncated)?;

        let header_size = cursor.u32_named("chunk header size").map_err(truncated)?;
        let last_event_record_data_offset =
            cursor.u32_named("last record offset").map_err(truncated)?;
        let free_space_offset = cursor.u32_named("free space offset").map_err(truncated)?;
        let events_checksum = cursor.u32_named("records checksum").map_err(truncated)?;

        // Reserved
        cursor.advance(64, "chunk header reserved").map_err(truncated)?;

        let flags = ChunkFlags::from_bits_retain(cursor.u32_named("chunk flags").map_err(truncated)?);
        let header_chunk_checksum = cursor.u32_named("chunk header checksum").map_err(truncated)?;

        let mut strings_offsets = [0_u32; 64];
        for offset in strings_offsets.iter_mut() {
            *offset = cursor.u32_named("string table").map_err(truncated)?;
        }

        let mut template_offsets = [0_u32; 32];
        for offset in template_offsets.iter_mut() {
            *offset = cursor.u32_named("template table").map_err(truncated)?;
        }

        Ok(EvtxChunkHeader {
            magic,
            first_event_record_number,
            last_event_record_number,
            first_event_record_id,
            last_event_record_id,
            header_size,
            last_event_record_data_offset,
            free_space_offset,
            events_checksum,
            flags,
            header_chunk_checksum,
            strings_offsets,
            template_offsets,
        })
    }
}

/// Counters describing what a decode pass saw. Chunks report their own, the file iterator
/// sums them up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStats {
    pub chunks: usize,
    pub empty_chunks: usize,
    pub dirty_chunks: usize,
    pub events: usize,
    /// Events decoded from dirty chunks.
    pub recovered_events: usize,
    /// Events found by the recovery scan, a subset of `recovered_events`.
    pub carved_events: usize,
    pub partial_events: usize,
    pub skipped_records: usize,
}

impl AddAssign for DecodeStats {
    fn add_assign(&mut self, other: DecodeStats) {
        self.chunks += other.chunks;
        self.empty_chunks += other.empty_chunks;
        self.dirty_chunks += other.dirty_chunks;
        self.events += other.events;
        self.recovered_events += other.recovered_events;
        self.carved_events += other.carved_events;
        self.partial_events += other.partial_events;
        self.skipped_records += other.skipped_records;
    }
}

/// One chunk of an EVTX file, with the caches its records share.
pub struct EvtxChunk<'a> {
    pub header: EvtxChunkHeader,
    pub chunk_number: u64,
    data: &'a [u8],
    settings: &'a ParserSettings,
    string_cache: StringCache,
    template_cache: TemplateCache,
    valid_magic: bool,
    dirty: bool,
    issues: Vec<ChunkError>,
}

impl<'a> EvtxChunk<'a> {
    /// Parse the chunk header and run the integrity checks.
    ///
    /// Only fails when `data` cannot even hold a chunk header. A zero filled magic yields an
    /// unused chunk without records. Any other bad magic or failed integrity check marks the
    /// chunk as dirty.
    pub fn new(
        data: &'a [u8],
        chunk_number: u64,
        settings: &'a ParserSettings,
    ) -> Result<EvtxChunk<'a>, ChunkError> {
        let header = EvtxChunkHeader::from_bytes(data, chunk_number)?;

        let mut chunk = EvtxChunk {
            header,
            chunk_number,
            data,
            settings,
            string_cache: StringCache::new(),
            template_cache: TemplateCache::new(),
            valid_magic: true,
            dirty: false,
            issues: Vec::new(),
        };

        if &chunk.header.magic != EVTX_CHUNK_MAGIC {
            let e = ChunkError::InvalidMagic {
                chunk_number,
                magic: chunk.header.magic,
            };
            chunk.valid_magic = false;
            // Unused chunks at the end of a file are zero filled.
            if chunk.header.magic == [0; 8] {
                debug!("{}", e);
                chunk.issues.push(e);
            } else {
                // Records are only reachable through the recovery scan.
                chunk.mark_dirty(e);
            }
            return Ok(chunk);
        }

        debug!("Chunk {}: {:?}", chunk_number, chunk.header);

        if chunk.free_space_offset().is_none() {
            chunk.mark_dirty(ChunkError::InvalidFreeSpaceOffset {
                chunk_number,
                offset: chunk.header.free_space_offset,
            });
        }

        if settings.should_validate_checksums() {
            if let Err(e) = chunk.validate_header_checksum() {
                chunk.mark_dirty(e);
            }
            if let Err(e) = chunk.validate_data_checksum() {
                chunk.mark_dirty(e);
            }
        }

        Ok(chunk)
    }

    fn mark_dirty(&mut self, issue: ChunkError) {
        warn!("{}, decoding it as dirty", issue);
        self.dirty = true;
        self.issues.push(issue);
    }

    /// The free space offset, if it lies between the end of the header and the end of the chunk.
    fn free_space_offset(&self) -> Option<usize> {
        let offset = self.header.free_space_offset as usize;
        (EVTX_CHUNK_HEADER_SIZE..=self.data.len())
            .contains(&offset)
            .then_some(offset)
    }

    pub fn validate_header_checksum(&self) -> Result<(), ChunkError> {
        trace!("Validating header checksum of chunk {}", self.chunk_number);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..120]);
        hasher.update(&self.data[128..EVTX_CHUNK_HEADER_SIZE]);
        let found = hasher.finalize();

        if found == self.header.header_chunk_checksum {
            Ok(())
        } else {
            Err(ChunkError::HeaderChecksumMismatch {
                chunk_number: self.chunk_number,
                expected: self.header.header_chunk_checksum,
                found,
            })
        }
    }

    /// Checksum of the record area. Skipped (reported as valid) when the free space offset
    /// is unusable, which is already an integrity failure of its own.
    pub fn validate_data_checksum(&self) -> Result<(), ChunkError> {
        trace!("Validating data checksum of chunk {}", self.chunk_number);
        let Some(end) = self.free_space_offset() else {
            return Ok(());
        };
        let found = crc32fast::hash(&self.data[EVTX_CHUNK_HEADER_SIZE..end]);

        if found == self.header.events_checksum {
            Ok(())
        } else {
            Err(ChunkError::DataChecksumMismatch {
                chunk_number: self.chunk_number,
                expected: self.header.events_checksum,
                found,
            })
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn has_valid_magic(&self) -> bool {
        self.valid_magic
    }

    /// Every integrity problem found while opening the chunk.
    pub fn issues(&self) -> &[ChunkError] {
        &self.issues
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn string_cache(&self) -> &StringCache {
        &self.string_cache
    }

    pub fn template_cache(&self) -> &TemplateCache {
        &self.template_cache
    }

    fn decode_event(&mut self, offset: usize, header: &EvtxRecordHeader) -> EvtxEvent {
        let (start, end) = header.body_range(offset);
        trace!(
            "Record {} at offset {}, {} bytes of binxml",
            header.event_record_id,
            offset,
            end - start
        );

        let decoded = BinXmlDeserializer::new(
            self.data,
            &mut self.string_cache,
            &mut self.template_cache,
            self.settings,
        )
        .decode_record(start, end);

        assemble(header, decoded, self.chunk_number, self.dirty)
    }
}

impl Debug for EvtxChunk<'_> {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        writeln!(fmt, "\nEvtxChunk {}", self.chunk_number)?;
        writeln!(fmt, "-----------------------")?;
        writeln!(fmt, "{:#?}", &self.header)?;
        writeln!(fmt, "dirty: {}", self.dirty)?;
        writeln!(fmt, "{} common strings", self.string_cache.len())?;
        writeln!(fmt, "{} common templates", self.template_cache.len())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sequential,
    Recovery,
    Done,
}

/// Lazily decodes the events of a chunk: first the records reachable from the chunk header,
/// then, for dirty chunks, whatever the recovery scan finds after them.
pub struct IterChunkEvents<'a> {
    chunk: EvtxChunk<'a>,
    offset: usize,
    phase: Phase,
    last_record_id: Option<u64>,
    stats: DecodeStats,
}

impl<'a> IterChunkEvents<'a> {
    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    pub fn chunk(&self) -> &EvtxChunk<'a> {
        &self.chunk
    }

    fn end_sequential_walk(&mut self) {
        self.phase = if self.chunk.dirty && self.chunk.settings.should_recover() {
            debug!(
                "Chunk {}: scanning for records from offset {}",
                self.chunk.chunk_number, self.offset
            );
            Phase::Recovery
        } else {
            Phase::Done
        };
    }

    fn skip_record(&mut self, reason: &str) {
        warn!(
            "Chunk {}: skipping record at offset {}: {}",
            self.chunk.chunk_number, self.offset, reason
        );
        self.stats.skipped_records += 1;
    }

    fn next_sequential(&mut self) -> Option<EvtxEvent> {
        let data = self.chunk.data;
        let limit = self.chunk.free_space_offset().unwrap_or(data.len());

        if self.offset >= limit {
            return None;
        }

        if !EvtxRecordHeader::has_record_magic(data, self.offset) {
            self.skip_record("invalid record magic");
            return None;
        }

        let header = match EvtxRecordHeader::from_bytes_at(data, self.offset) {
            Ok(header) => header,
            Err(e) => {
                self.skip_record(&e.to_string());
                return None;
            }
        };

        if header.data_size < EVTX_RECORD_MIN_SIZE {
            self.skip_record(&format!("record size {} is too small", header.data_size));
            return None;
        }

        if self.offset + header.data_size as usize > data.len() {
            self.skip_record(&format!(
                "record {} of {} bytes overruns the chunk",
                header.event_record_id, header.data_size
            ));
            return None;
        }

        let offset = self.offset;
        self.offset += header.data_size as usize;
        Some(self.emit(offset, &header, false))
    }

    fn next_carved(&mut self) -> Option<EvtxEvent> {
        let (offset, size) = find_next_record(self.chunk.data, self.offset)?;
        self.offset = offset + size as usize;

        let header = EvtxRecordHeader::from_bytes_at(self.chunk.data, offset).ok()?;
        info!(
            "Chunk {}: recovered record {} at offset {}",
            self.chunk.chunk_number, header.event_record_id, offset
        );
        Some(self.emit(offset, &header, true))
    }

    fn emit(&mut self, offset: usize, header: &EvtxRecordHeader, carved: bool) -> EvtxEvent {
        let mut event = self.chunk.decode_event(offset, header);

        if let Some(previous) = self.last_record_id {
            if header.event_record_id <= previous {
                let e = RecordError::NonMonotonicRecordId {
                    previous,
                    current: header.event_record_id,
                };
                warn!("Chunk {}: {}", self.chunk.chunk_number, e);
                event.push_warning(e);
            }
        }
        self.last_record_id = Some(header.event_record_id);

        if carved {
            event = event.mark_carved();
            self.stats.carved_events += 1;
        }
        if event.is_recovered() {
            self.stats.recovered_events += 1;
        }
        if event.is_partial() {
            debug!(
                "Chunk {}: record {} decoded partially: {:?}",
                self.chunk.chunk_number,
                event.record_id(),
                event.warnings()
            );
            self.stats.partial_events += 1;
        }
        self.stats.events += 1;
        event
    }

    fn finish(&mut self) {
        self.phase = Phase::Done;
        if self.stats.events == 0 {
            self.stats.empty_chunks = 1;
        }
        debug!(
            "Chunk {} done: {} events, {} templates parsed",
            self.chunk.chunk_number,
            self.stats.events,
            self.chunk.template_cache.parse_count()
        );
    }
}

impl Iterator for IterChunkEvents<'_> {
    type Item = EvtxEvent;

    fn next(&mut self) -> Option<EvtxEvent> {
        loop {
            match self.phase {
                Phase::Sequential => match self.next_sequential() {
                    Some(event) => return Some(event),
                    None => self.end_sequential_walk(),
                },
                Phase::Recovery => match self.next_carved() {
                    Some(event) => return Some(event),
                    None => self.finish(),
                },
                Phase::Done => return None,
            }
        }
    }
}

impl<'a> IntoIterator for EvtxChunk<'a> {
    type Item = EvtxEvent;
    type IntoIter = IterChunkEvents<'a>;

    fn into_iter(self) -> IterChunkEvents<'a> {
        let stats = DecodeStats {
            chunks: 1,
            dirty_chunks: usize::from(self.dirty),
            ..DecodeStats::default()
        };
        let phase = if self.valid_magic {
            Phase::Sequential
        } else if self.dirty && self.settings.should_recover() {
            debug!(
                "Chunk {}: scanning for records from the end of the header",
                self.chunk_number
            );
            Phase::Recovery
        } else {
            Phase::Done
        };

        let mut iter = IterChunkEvents {
            chunk: self,
            offset: EVTX_CHUNK_HEADER_SIZE,
            phase,
            last_record_id: None,
            stats,
        };
        if phase == Phase::Done {
            iter.finish();
        }
        iter
    }
}
