//! Per-document records and the offset table that indexes them
//!
//! The serialized map is an offset table followed by variable-length
//! records, one per document in arrival order:
//! - table: one u32 per document, record offset relative to the record area
//! - record: summary offset u32, packed rank/kind/length u32, key count u8,
//!   then `key_count` 8-byte key chunks with the document hash first

use crate::error::{IndexError, Result};

use super::types::DocKey;

/// Fixed bytes of a record before its key chunks.
const RECORD_HEAD_LEN: usize = 9;

/// Document length saturates at 24 bits in the packed word.
pub const MAX_STORED_DOC_LEN: u32 = (1 << 24) - 1;

/// One document's stored metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocInfo {
    /// Byte offset of the document summary in its archive partition.
    pub summary_offset: u32,
    /// Indexed term count, saturating at [`MAX_STORED_DOC_LEN`].
    pub doc_len: u32,
    /// Optional editorial rank, four bits; zero means unranked.
    pub rank: u8,
    /// True for documents, false for link records.
    pub is_doc: bool,
    /// Key chunks; the first is the document hash.
    pub keys: Vec<DocKey>,
}

impl DocInfo {
    /// The identifying hash chunk.
    pub fn doc_key(&self) -> DocKey {
        self.keys[0]
    }

    /// Serialized length in bytes.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEAD_LEN + self.keys.len() * 8
    }

    fn packed_word(&self) -> u32 {
        (u32::from(self.rank & 0x0F) << 28)
            | (u32::from(self.is_doc) << 27)
            | self.doc_len.min(MAX_STORED_DOC_LEN)
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.summary_offset.to_be_bytes());
        out.extend_from_slice(&self.packed_word().to_be_bytes());
        out.push(self.keys.len() as u8);
        for key in &self.keys {
            out.extend_from_slice(key.as_bytes());
        }
    }

    /// Parse a record at `at`, returning it with its byte length.
    pub fn parse(data: &[u8], at: usize, max_keys: u8) -> Result<(DocInfo, usize)> {
        let head = data.get(at..at + RECORD_HEAD_LEN).ok_or(IndexError::CorruptRecord {
            context: "doc record head",
            offset: at as u64,
        })?;
        let summary_offset = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
        let packed = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
        let key_count = head[8];
        if key_count == 0 || key_count > max_keys {
            return Err(IndexError::CorruptRecord {
                context: "doc record key count",
                offset: at as u64,
            });
        }
        let keys_at = at + RECORD_HEAD_LEN;
        let keys_len = key_count as usize * 8;
        let key_bytes = data.get(keys_at..keys_at + keys_len).ok_or(IndexError::CorruptRecord {
            context: "doc record keys",
            offset: keys_at as u64,
        })?;
        let keys = key_bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                DocKey(raw)
            })
            .collect();
        let info = DocInfo {
            summary_offset,
            doc_len: packed & MAX_STORED_DOC_LEN,
            rank: (packed >> 28) as u8,
            is_doc: packed & (1 << 27) != 0,
            keys,
        };
        Ok((info, RECORD_HEAD_LEN + keys_len))
    }
}

/// Append-only collection of document records plus their offset table.
#[derive(Clone, Debug, Default)]
pub struct DocMap {
    offsets: Vec<u32>,
    records: Vec<u8>,
    max_doc_keys: u8,
}

impl DocMap {
    pub fn new(max_doc_keys: u8) -> Self {
        DocMap {
            offsets: Vec::new(),
            records: Vec::new(),
            max_doc_keys,
        }
    }

    /// Number of documents recorded.
    pub fn len(&self) -> u32 {
        self.offsets.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Append a record and return the document index it was assigned.
    ///
    /// The caller guarantees at least one key and at most `max_doc_keys`;
    /// ingest rejects other shapes before they reach the map.
    pub fn push(&mut self, info: &DocInfo) -> u32 {
        debug_assert!(!info.keys.is_empty());
        debug_assert!(info.keys.len() <= self.max_doc_keys as usize);
        let doc_index = self.offsets.len() as u32;
        self.offsets.push(self.records.len() as u32);
        info.encode_into(&mut self.records);
        doc_index
    }

    pub fn get(&self, doc_index: u32) -> Result<Option<DocInfo>> {
        let Some(&offset) = self.offsets.get(doc_index as usize) else {
            return Ok(None);
        };
        let (info, _) = DocInfo::parse(&self.records, offset as usize, self.max_doc_keys)?;
        Ok(Some(info))
    }

    /// Rewrite one record's summary offset in place.
    pub fn set_summary_offset(&mut self, doc_index: u32, summary_offset: u32) -> bool {
        let Some(&offset) = self.offsets.get(doc_index as usize) else {
            return false;
        };
        let at = offset as usize;
        if at + 4 > self.records.len() {
            return false;
        }
        self.records[at..at + 4].copy_from_slice(&summary_offset.to_be_bytes());
        true
    }

    /// Serialized length: offset table plus record area.
    pub fn encoded_len(&self) -> usize {
        self.offsets.len() * 4 + self.records.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        for &offset in &self.offsets {
            out.extend_from_slice(&offset.to_be_bytes());
        }
        out.extend_from_slice(&self.records);
    }

    /// Rebuild a map from its serialized form.
    pub fn decode(data: &[u8], doc_total: u32, max_doc_keys: u8) -> Result<DocMap> {
        let table_len = doc_total as usize * 4;
        if data.len() < table_len {
            return Err(IndexError::CorruptRecord {
                context: "doc offset table",
                offset: data.len() as u64,
            });
        }
        let records = data[table_len..].to_vec();
        let mut offsets = Vec::with_capacity(doc_total as usize);
        for entry in data[..table_len].chunks_exact(4) {
            let offset = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
            if offset as usize >= records.len() {
                return Err(IndexError::CorruptRecord {
                    context: "doc offset table entry",
                    offset: u64::from(offset),
                });
            }
            offsets.push(offset);
        }
        Ok(DocMap {
            offsets,
            records,
            max_doc_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(doc: u64, extra: &[u64]) -> DocInfo {
        let mut keys = vec![DocKey(doc.to_be_bytes())];
        keys.extend(extra.iter().map(|&k| DocKey(k.to_be_bytes())));
        DocInfo {
            summary_offset: 9000 + doc as u32,
            doc_len: 120 + doc as u32,
            rank: (doc % 16) as u8,
            is_doc: doc % 2 == 0,
            keys,
        }
    }

    #[test]
    fn test_push_then_get_round_trips() {
        let mut map = DocMap::new(8);
        let infos = [sample(0, &[]), sample(1, &[77, 78]), sample(2, &[5])];
        for (i, info) in infos.iter().enumerate() {
            assert_eq!(map.push(info), i as u32);
        }
        assert_eq!(map.len(), 3);
        for (i, info) in infos.iter().enumerate() {
            assert_eq!(map.get(i as u32).unwrap().as_ref(), Some(info));
        }
        assert_eq!(map.get(3).unwrap(), None);
    }

    #[test]
    fn test_doc_len_saturates_in_stored_form() {
        let mut info = sample(4, &[]);
        info.doc_len = MAX_STORED_DOC_LEN + 500;
        let mut map = DocMap::new(4);
        map.push(&info);
        assert_eq!(map.get(0).unwrap().unwrap().doc_len, MAX_STORED_DOC_LEN);
    }

    #[test]
    fn test_serialized_form_round_trips() {
        let mut map = DocMap::new(8);
        for i in 0..10 {
            map.push(&sample(i, &[i + 100]));
        }
        let mut blob = Vec::new();
        map.encode_into(&mut blob);
        assert_eq!(blob.len(), map.encoded_len());

        let reloaded = DocMap::decode(&blob, 10, 8).unwrap();
        for i in 0..10u32 {
            assert_eq!(reloaded.get(i).unwrap(), map.get(i).unwrap());
        }
    }

    #[test]
    fn test_summary_offset_rewrites_in_place() {
        let mut map = DocMap::new(4);
        map.push(&sample(1, &[]));
        map.push(&sample(2, &[]));
        assert!(map.set_summary_offset(1, 31_337));
        assert_eq!(map.get(1).unwrap().unwrap().summary_offset, 31_337);
        assert_eq!(map.get(0).unwrap().unwrap().summary_offset, 9001);
        assert!(!map.set_summary_offset(9, 1));
    }

    #[test]
    fn test_parse_rejects_bad_key_counts() {
        let mut blob = Vec::new();
        sample(3, &[1, 2]).encode_into(&mut blob);
        blob[8] = 0;
        assert!(DocInfo::parse(&blob, 0, 8).is_err());
        blob[8] = 9;
        assert!(DocInfo::parse(&blob, 0, 8).is_err());
        blob[8] = 4;
        assert!(DocInfo::parse(&blob, 0, 8).is_err());
    }

    #[test]
    fn test_decode_rejects_short_table_and_wild_offsets() {
        assert!(DocMap::decode(&[0, 0, 0], 1, 4).is_err());
        let mut blob = Vec::new();
        let mut map = DocMap::new(4);
        map.push(&sample(6, &[]));
        map.encode_into(&mut blob);
        blob[3] = 0xEE;
        assert!(DocMap::decode(&blob, 1, 4).is_err());
    }
}
