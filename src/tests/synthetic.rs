//! Test-only EVTX encoder: writes file headers, chunks and BinXML the way Windows lays them out,
//! with valid checksums. Shared by the unit tests and the integration tests under `tests/`.
#![allow(dead_code)]

use std::collections::HashMap;

pub const FILE_HEADER_SIZE: usize = 4096;
pub const CHUNK_SIZE: usize = 65536;
pub const CHUNK_HEADER_SIZE: usize = 512;

// 2019-03-24T16:04:49.386860800Z
pub const SAMPLE_FILETIME: u64 = 0x01D4_E25B_4EE1_2E40;

#[derive(Debug, Clone)]
pub struct FileHeaderOptions {
    pub chunk_count: u16,
    pub next_record_id: u64,
    pub flags: u32,
}

impl Default for FileHeaderOptions {
    fn default() -> Self {
        FileHeaderOptions {
            chunk_count: 1,
            next_record_id: 1,
            flags: 0,
        }
    }
}

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

pub fn build_file_header(spec: &FileHeaderOptions) -> Vec<u8> {
    let mut header = vec![0_u8; FILE_HEADER_SIZE];
    put(&mut header, 0, b"ElfFile\x00");
    put(&mut header, 8, &0_u64.to_le_bytes());
    put(
        &mut header,
        16,
        &u64::from(spec.chunk_count.saturating_sub(1)).to_le_bytes(),
    );
    put(&mut header, 24, &spec.next_record_id.to_le_bytes());
    put(&mut header, 32, &128_u32.to_le_bytes());
    put(&mut header, 36, &1_u16.to_le_bytes());
    put(&mut header, 38, &3_u16.to_le_bytes());
    put(&mut header, 40, &4096_u16.to_le_bytes());
    put(&mut header, 42, &spec.chunk_count.to_le_bytes());
    put(&mut header, 120, &spec.flags.to_le_bytes());
    let checksum = crc32fast::hash(&header[..120]);
    put(&mut header, 124, &checksum.to_le_bytes());
    header
}

pub fn build_file(spec: &FileHeaderOptions, chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut file = build_file_header(spec);
    for chunk in chunks {
        file.extend_from_slice(chunk);
    }
    file
}

/// A substitution value of a template instance.
pub enum SubValue {
    Null,
    String(String),
    Ansi(Vec<u8>),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Int32(i32),
    HexInt32(u32),
    HexInt64(u64),
    Bool(bool),
    Guid([u8; 16]),
    FileTime(u64),
    Sid(Vec<u8>),
    Binary(Vec<u8>),
    StringArray(Vec<String>),
    /// An embedded BinXML fragment, written in place.
    BinXml(Box<dyn FnOnce(&mut BinXmlWriter<'_>)>),
    /// Arbitrary bytes under an arbitrary type code.
    Raw(u8, Vec<u8>),
}

impl SubValue {
    pub fn string(s: &str) -> SubValue {
        SubValue::String(s.to_owned())
    }

    pub fn binxml(f: impl FnOnce(&mut BinXmlWriter<'_>) + 'static) -> SubValue {
        SubValue::BinXml(Box::new(f))
    }

    pub fn type_code(&self) -> u8 {
        match self {
            SubValue::Null => 0x00,
            SubValue::String(_) => 0x01,
            SubValue::Ansi(_) => 0x02,
            SubValue::UInt8(_) => 0x04,
            SubValue::UInt16(_) => 0x06,
            SubValue::Int32(_) => 0x07,
            SubValue::UInt32(_) => 0x08,
            SubValue::UInt64(_) => 0x0a,
            SubValue::Bool(_) => 0x0d,
            SubValue::Binary(_) => 0x0e,
            SubValue::Guid(_) => 0x0f,
            SubValue::FileTime(_) => 0x11,
            SubValue::Sid(_) => 0x13,
            SubValue::HexInt32(_) => 0x14,
            SubValue::HexInt64(_) => 0x15,
            SubValue::BinXml(_) => 0x21,
            SubValue::StringArray(_) => 0x81,
            SubValue::Raw(code, _) => *code,
        }
    }
}

pub fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Builds a single 64KiB chunk record by record.
pub struct ChunkBuilder {
    data: Vec<u8>,
    pos: usize,
    record_offsets: Vec<usize>,
    record_ids: Vec<u64>,
    names: HashMap<String, u32>,
    templates: Vec<u32>,
}

impl Default for ChunkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkBuilder {
    pub fn new() -> Self {
        ChunkBuilder {
            data: vec![0_u8; CHUNK_SIZE],
            pos: CHUNK_HEADER_SIZE,
            record_offsets: Vec::new(),
            record_ids: Vec::new(),
            names: HashMap::new(),
            templates: Vec::new(),
        }
    }

    /// Offsets of the records written so far.
    pub fn record_offsets(&self) -> &[usize] {
        &self.record_offsets
    }

    /// Current write position, which is where the next record starts.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Append a record whose BinXML body is produced by `body`.
    pub fn record(
        &mut self,
        record_id: u64,
        filetime: u64,
        body: impl FnOnce(&mut BinXmlWriter<'_>),
    ) -> &mut Self {
        let start = self.pos;
        put(&mut self.data, start, b"\x2a\x2a\x00\x00");
        put(&mut self.data, start + 8, &record_id.to_le_bytes());
        put(&mut self.data, start + 16, &filetime.to_le_bytes());
        self.pos = start + 24;

        body(&mut BinXmlWriter { chunk: &mut *self });

        let end = self.pos + 4;
        let size = (end - start) as u32;
        put(&mut self.data, start + 4, &size.to_le_bytes());
        put(&mut self.data, end - 4, &size.to_le_bytes());
        self.pos = end;

        self.record_offsets.push(start);
        self.record_ids.push(record_id);
        self
    }

    /// Fill in the chunk header and both checksums.
    pub fn finish(mut self) -> Vec<u8> {
        let count = self.record_ids.len() as u64;
        let first_id = self.record_ids.first().copied().unwrap_or(0);
        let last_id = self.record_ids.last().copied().unwrap_or(0);
        let last_offset = self.record_offsets.last().copied().unwrap_or(0) as u32;
        let free_space = self.pos as u32;

        let header = &mut self.data;
        put(header, 0, b"ElfChnk\x00");
        put(header, 8, &1_u64.to_le_bytes());
        put(header, 16, &count.to_le_bytes());
        put(header, 24, &first_id.to_le_bytes());
        put(header, 32, &last_id.to_le_bytes());
        put(header, 40, &128_u32.to_le_bytes());
        put(header, 44, &last_offset.to_le_bytes());
        put(header, 48, &free_space.to_le_bytes());

        let data_checksum = crc32fast::hash(&self.data[CHUNK_HEADER_SIZE..self.pos]);
        put(&mut self.data, 52, &data_checksum.to_le_bytes());

        for (slot, offset) in self.templates.iter().take(32).enumerate() {
            put(&mut self.data, 384 + slot * 4, &offset.to_le_bytes());
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..120]);
        hasher.update(&self.data[128..CHUNK_HEADER_SIZE]);
        let header_checksum = hasher.finalize();
        put(&mut self.data, 124, &header_checksum.to_le_bytes());

        self.data
    }
}

/// Writes BinXML tokens at the chunk's current position.
pub struct BinXmlWriter<'a> {
    chunk: &'a mut ChunkBuilder,
}

impl BinXmlWriter<'_> {
    pub fn position(&self) -> u32 {
        self.chunk.pos as u32
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        let pos = self.chunk.pos;
        put(&mut self.chunk.data, pos, bytes);
        self.chunk.pos += bytes.len();
    }

    fn u8(&mut self, v: u8) {
        self.raw(&[v]);
    }

    fn u16(&mut self, v: u16) {
        self.raw(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.raw(&v.to_le_bytes());
    }

    fn patch_u16(&mut self, at: usize, v: u16) {
        put(&mut self.chunk.data, at, &v.to_le_bytes());
    }

    fn patch_u32(&mut self, at: usize, v: u32) {
        put(&mut self.chunk.data, at, &v.to_le_bytes());
    }

    /// A name reference: inline on first use in the chunk, by offset afterwards.
    fn name(&mut self, name: &str) {
        if let Some(&offset) = self.chunk.names.get(name) {
            self.u32(offset);
            return;
        }

        let offset = self.position() + 4;
        self.u32(offset);
        self.u32(0);
        self.u16(0);
        self.u16(name.encode_utf16().count() as u16);
        self.raw(&utf16(name));
        self.u16(0);
        self.chunk.names.insert(name.to_owned(), offset);
    }

    pub fn fragment_header(&mut self) {
        self.raw(&[0x0f, 0x01, 0x01, 0x00]);
    }

    pub fn open_element(&mut self, name: &str, has_attributes: bool) {
        self.u8(if has_attributes { 0x41 } else { 0x01 });
        // Dependency id, then data size.
        self.u16(0xFFFF);
        self.u32(0);
        self.name(name);
        if has_attributes {
            self.u32(0);
        }
    }

    pub fn attribute(&mut self, name: &str) {
        self.u8(0x06);
        self.name(name);
    }

    pub fn close_start(&mut self) {
        self.u8(0x02);
    }

    pub fn close_empty(&mut self) {
        self.u8(0x03);
    }

    pub fn close_element(&mut self) {
        self.u8(0x04);
    }

    pub fn end_of_stream(&mut self) {
        self.u8(0x00);
    }

    pub fn value_string(&mut self, s: &str) {
        self.raw(&[0x05, 0x01]);
        self.u16(s.encode_utf16().count() as u16);
        self.raw(&utf16(s));
    }

    pub fn cdata(&mut self, s: &str) {
        self.u8(0x07);
        self.u16(s.encode_utf16().count() as u16);
        self.raw(&utf16(s));
    }

    pub fn char_ref(&mut self, c: u16) {
        self.u8(0x08);
        self.u16(c);
    }

    pub fn entity_ref(&mut self, name: &str) {
        self.u8(0x09);
        self.name(name);
    }

    pub fn processing_instruction(&mut self, target: &str, data: &str) {
        self.u8(0x0a);
        self.name(target);
        self.u8(0x0b);
        self.u16(data.encode_utf16().count() as u16);
        self.raw(&utf16(data));
    }

    /// `<name>{text}</name>`
    pub fn text_element(&mut self, name: &str, text: &str) {
        self.open_element(name, false);
        self.close_start();
        self.value_string(text);
        self.close_element();
    }

    pub fn substitution(&mut self, index: u16, type_code: u8, optional: bool) {
        self.u8(if optional { 0x0e } else { 0x0d });
        self.u16(index);
        self.u8(type_code);
    }

    /// `<name>%index%</name>`
    pub fn substituted_element(&mut self, name: &str, index: u16, type_code: u8, optional: bool) {
        self.open_element(name, false);
        self.close_start();
        self.substitution(index, type_code, optional);
        self.close_element();
    }

    /// A template instance followed by its definition. `body` receives the definition offset
    /// and writes the template's tokens. Returns the definition offset.
    pub fn template_instance_inline(
        &mut self,
        template_id: u32,
        body: impl FnOnce(&mut BinXmlWriter<'_>, u32),
        values: Vec<SubValue>,
    ) -> u32 {
        self.u8(0x0c);
        self.u8(0x01);
        self.u32(template_id);
        let definition = self.position() + 4;
        self.u32(definition);

        // Definition header: next offset, GUID, data size.
        self.u32(0);
        let mut guid = [0_u8; 16];
        guid[..4].copy_from_slice(&template_id.to_le_bytes());
        self.raw(&guid);
        let size_at = self.chunk.pos;
        self.u32(0);

        let body_start = self.chunk.pos;
        body(self, definition);
        let size = (self.chunk.pos - body_start) as u32;
        self.patch_u32(size_at, size);

        self.chunk.templates.push(definition);
        self.values(values);
        definition
    }

    /// A template instance reusing a definition written earlier in the chunk.
    pub fn template_instance_ref(&mut self, template_id: u32, definition: u32, values: Vec<SubValue>) {
        self.u8(0x0c);
        self.u8(0x01);
        self.u32(template_id);
        self.u32(definition);
        self.values(values);
    }

    fn values(&mut self, values: Vec<SubValue>) {
        self.u32(values.len() as u32);
        let descriptors = self.chunk.pos;
        for value in &values {
            self.u16(0);
            self.u8(value.type_code());
            self.u8(0);
        }

        for (i, value) in values.into_iter().enumerate() {
            let start = self.chunk.pos;
            match value {
                SubValue::Null => {}
                SubValue::String(s) => self.raw(&utf16(&s)),
                SubValue::Ansi(bytes) | SubValue::Binary(bytes) | SubValue::Sid(bytes) => {
                    self.raw(&bytes)
                }
                SubValue::UInt8(v) => self.u8(v),
                SubValue::UInt16(v) => self.u16(v),
                SubValue::UInt32(v) | SubValue::HexInt32(v) => self.u32(v),
                SubValue::Int32(v) => self.raw(&v.to_le_bytes()),
                SubValue::UInt64(v) | SubValue::HexInt64(v) | SubValue::FileTime(v) => {
                    self.raw(&v.to_le_bytes())
                }
                SubValue::Bool(v) => self.u32(u32::from(v)),
                SubValue::Guid(bytes) => self.raw(&bytes),
                SubValue::StringArray(items) => {
                    for item in items {
                        self.raw(&utf16(&item));
                        self.u16(0);
                    }
                }
                SubValue::BinXml(write) => write(self),
                SubValue::Raw(_, bytes) => self.raw(&bytes),
            }
            let size = (self.chunk.pos - start) as u16;
            self.patch_u16(descriptors + i * 4, size);
        }
    }
}

/// The well known SID S-1-5-18 (LocalSystem).
pub fn local_system_sid() -> Vec<u8> {
    vec![1, 1, 0, 0, 0, 0, 0, 5, 18, 0, 0, 0]
}
