//! Indirection-таблица: document id -> голова цепочки.
//!
//! Таблица self-hosted — сама лежит документом в том же страничном
//! формате, который индексирует. Формат:
//!   [count u32]
//!   count x [uuid 16B][first_page i32][version i32]
//!
//! В памяти держится целиком; перезапись документа порождает новую
//! таблицу и новую цепочку, корень переключается ротацией versioned
//! link (см. db).

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::consts::NO_PAGE;
use crate::error::{Result, StreamDbError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub first_page: i32,
    /// Текущая версия документа; ею штампуются страницы цепочки.
    pub version: i32,
}

#[derive(Debug, Default)]
pub struct DocIndex {
    map: HashMap<Uuid, IndexEntry>,
}

impl DocIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<IndexEntry> {
        self.map.get(id).copied()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.map.contains_key(id)
    }

    pub fn insert(&mut self, id: Uuid, entry: IndexEntry) -> Option<IndexEntry> {
        self.map.insert(id, entry)
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<IndexEntry> {
        self.map.remove(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &IndexEntry)> {
        self.map.iter()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.map.len() * 24);
        let mut b4 = [0u8; 4];
        LittleEndian::write_u32(&mut b4, self.map.len() as u32);
        out.extend_from_slice(&b4);
        for (id, e) in &self.map {
            out.extend_from_slice(id.as_bytes());
            LittleEndian::write_i32(&mut b4, e.first_page);
            out.extend_from_slice(&b4);
            LittleEndian::write_i32(&mut b4, e.version);
            out.extend_from_slice(&b4);
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<DocIndex> {
        let corrupt = |reason: &str| StreamDbError::CorruptChain {
            page: NO_PAGE,
            reason: format!("indirection table: {}", reason),
        };
        if data.len() < 4 {
            return Err(corrupt("shorter than count header"));
        }
        let count = LittleEndian::read_u32(&data[0..4]) as usize;
        let need = 4 + count * 24;
        if data.len() < need {
            return Err(corrupt("truncated entries"));
        }
        let mut map = HashMap::with_capacity(count);
        let mut pos = 4usize;
        for _ in 0..count {
            let raw: [u8; 16] = data[pos..pos + 16]
                .try_into()
                .map_err(|_| corrupt("bad uuid bytes"))?;
            let id = Uuid::from_bytes(raw);
            let first_page = LittleEndian::read_i32(&data[pos + 16..pos + 20]);
            let version = LittleEndian::read_i32(&data[pos + 20..pos + 24]);
            if first_page < 0 {
                return Err(corrupt("entry with negative first page"));
            }
            map.insert(id, IndexEntry { first_page, version });
            pos += 24;
        }
        Ok(DocIndex { map })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_roundtrip() {
        let mut idx = DocIndex::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        idx.insert(a, IndexEntry { first_page: 4, version: 1 });
        idx.insert(b, IndexEntry { first_page: 9, version: 3 });

        let bytes = idx.serialize();
        let got = DocIndex::deserialize(&bytes).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got.get(&a), Some(IndexEntry { first_page: 4, version: 1 }));
        assert_eq!(got.get(&b), Some(IndexEntry { first_page: 9, version: 3 }));
    }

    #[test]
    fn empty_roundtrip() {
        let idx = DocIndex::new();
        let got = DocIndex::deserialize(&idx.serialize()).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn deserialize_rejects_truncation() {
        let mut idx = DocIndex::new();
        idx.insert(Uuid::new_v4(), IndexEntry { first_page: 4, version: 1 });
        let bytes = idx.serialize();
        assert!(DocIndex::deserialize(&bytes[..bytes.len() - 1]).is_err());
        assert!(DocIndex::deserialize(&[0, 0]).is_err());
    }
}
