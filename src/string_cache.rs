use std::collections::hash_map::Entry;

use ahash::AHashMap;
use log::trace;

use crate::ChunkOffset;
use crate::binxml::name::BinXmlName;
use crate::err::DeserializationResult;
use crate::utils::ByteCursor;

/// Names of a single chunk, keyed by their chunk offset. Filled lazily on first reference.
#[derive(Debug, Default)]
pub struct StringCache(AHashMap<ChunkOffset, BinXmlName>);

impl StringCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the name at `offset`, reading it from `data` if it has not been seen yet.
    pub fn get_or_read(
        &mut self,
        data: &[u8],
        offset: ChunkOffset,
    ) -> DeserializationResult<&BinXmlName> {
        match self.0.entry(offset) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut cursor = ByteCursor::with_pos(data, offset as usize)?;
                let name = BinXmlName::from_cursor(&mut cursor)?;
                trace!("Cached name `{}` at offset {}", name.as_str(), offset);
                Ok(entry.insert(name))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
