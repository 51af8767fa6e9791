//! Streaming tier-file read, write, and merge
//!
//! Tier files open with a 2048-byte second-byte index (256 entries of
//! first slot and slot count, in 32-byte slot units) followed by the
//! entry slots sorted by key. Writers stream through a `.tmp` path
//! with a placeholder index, seek back to fill it in, fsync, and
//! rename, so a crash never leaves a half-written live file.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::DictionaryConfig;
use crate::dictionary::record::{
    decode_aux, decode_base, is_aux_slot, DictEntry, SLOT_LEN,
};
use crate::error::{IndexError, Result};
use crate::shard::{PrefixEntry, WordKey, PREFIX_ENTRIES, PREFIX_INDEX_LEN};

const MIN_BUFFER: usize = 32 * 1024;
const PROGRESS_EVERY: u64 = 1 << 16;

fn stream_buffer(config: &DictionaryConfig) -> usize {
    (config.merge_segment_bytes / 4).max(MIN_BUFFER)
}

/// Writes one tier file entry-by-entry. Entries must arrive in key
/// order; the second-byte index is accumulated as they pass through.
pub(crate) struct TierWriter {
    out: BufWriter<File>,
    tmp_path: PathBuf,
    index: Vec<PrefixEntry>,
    written_slots: u64,
    last_key: Option<WordKey>,
}

impl TierWriter {
    pub(crate) fn create(tmp_path: &Path, config: &DictionaryConfig) -> Result<Self> {
        let file = File::create(tmp_path)?;
        let mut out = BufWriter::with_capacity(stream_buffer(config), file);
        out.write_all(&[0u8; PREFIX_INDEX_LEN])?;
        Ok(TierWriter {
            out,
            tmp_path: tmp_path.to_path_buf(),
            index: vec![PrefixEntry::absent(); PREFIX_ENTRIES],
            written_slots: 0,
            last_key: None,
        })
    }

    pub(crate) fn write_entry(&mut self, entry: &DictEntry) -> Result<()> {
        debug_assert!(self.last_key.map_or(true, |last| last < entry.key));
        self.last_key = Some(entry.key);

        let at = u32::try_from(self.written_slots).map_err(|_| {
            IndexError::Internal("tier file exceeds addressable slots".into())
        })?;
        let second = entry.key.second_byte() as usize;
        if self.index[second].is_absent() {
            self.index[second].first = at;
        }
        self.index[second].count += entry.slot_len() as u32;

        let mut bytes = Vec::with_capacity(entry.slot_len() as usize * SLOT_LEN);
        entry.encode_into(&mut bytes);
        self.out.write_all(&bytes)?;
        self.written_slots += entry.slot_len();
        Ok(())
    }

    /// Fill in the index, fsync, and rename into place.
    pub(crate) fn finish(self, final_path: &Path) -> Result<()> {
        let TierWriter { mut out, tmp_path, index, .. } = self;
        out.flush()?;
        let mut file = out.into_inner().map_err(|e| e.into_error())?;

        let mut head = Vec::with_capacity(PREFIX_INDEX_LEN);
        for entry in &index {
            entry.write_to(&mut head);
        }
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&head)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, final_path)?;
        Ok(())
    }
}

/// Streams the entries of one tier file in key order.
pub(crate) struct EntrySource {
    reader: BufReader<File>,
    remaining_slots: u64,
    cursor: u64,
}

impl EntrySource {
    pub(crate) fn open(path: &Path, config: &DictionaryConfig) -> Result<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let head = PREFIX_INDEX_LEN as u64;
        if len < head || (len - head) % SLOT_LEN as u64 != 0 {
            return Err(IndexError::CorruptRecord {
                context: "tier file length",
                offset: len,
            });
        }
        file.seek(SeekFrom::Start(head))?;
        Ok(EntrySource {
            reader: BufReader::with_capacity(stream_buffer(config), file),
            remaining_slots: (len - head) / SLOT_LEN as u64,
            cursor: 0,
        })
    }

    fn next_slot(&mut self) -> Result<[u8; SLOT_LEN]> {
        let mut slot = [0u8; SLOT_LEN];
        self.reader.read_exact(&mut slot)?;
        self.remaining_slots -= 1;
        self.cursor += 1;
        Ok(slot)
    }

    pub(crate) fn next_entry(&mut self) -> Result<Option<DictEntry>> {
        if self.remaining_slots == 0 {
            return Ok(None);
        }
        let base = self.next_slot()?;
        if is_aux_slot(&base) {
            return Err(IndexError::CorruptRecord {
                context: "dictionary entry chain",
                offset: (self.cursor - 1) * SLOT_LEN as u64,
            });
        }
        let (raw, aux_count, first) = decode_base(&base);
        let mut triples = vec![first];
        for _ in 0..aux_count {
            if self.remaining_slots == 0 {
                return Err(IndexError::CorruptRecord {
                    context: "dictionary entry chain",
                    offset: self.cursor * SLOT_LEN as u64,
                });
            }
            let slot = self.next_slot()?;
            triples.extend(decode_aux(&slot, self.cursor - 1)?);
        }
        Ok(Some(DictEntry {
            key: WordKey::from_bytes(raw),
            triples,
        }))
    }
}

/// Merge two tier files for the same prefix into one. `older` must be
/// the file whose data predates `newer`'s; on matching keys the
/// combined entry keeps the older file's generations first so a
/// generation present in both resolves to the newer copy.
pub(crate) fn merge_entry_files(
    older: &Path,
    newer: &Path,
    tmp: &Path,
    final_path: &Path,
    config: &DictionaryConfig,
) -> Result<()> {
    let mut left = EntrySource::open(older, config)?;
    let mut right = EntrySource::open(newer, config)?;
    let mut writer = TierWriter::create(tmp, config)?;

    let mut a = left.next_entry()?;
    let mut b = right.next_entry()?;
    let mut written = 0u64;
    loop {
        match (a.take(), b.take()) {
            (None, None) => break,
            (Some(x), None) => {
                writer.write_entry(&x)?;
                a = left.next_entry()?;
            }
            (None, Some(y)) => {
                writer.write_entry(&y)?;
                b = right.next_entry()?;
            }
            (Some(x), Some(y)) => match x.key.cmp(&y.key) {
                std::cmp::Ordering::Less => {
                    writer.write_entry(&x)?;
                    a = left.next_entry()?;
                    b = Some(y);
                }
                std::cmp::Ordering::Greater => {
                    writer.write_entry(&y)?;
                    a = Some(x);
                    b = right.next_entry()?;
                }
                std::cmp::Ordering::Equal => {
                    let mut combined = DictEntry::combine(x, y);
                    combined.apply_aux_cap(config.max_aux_slots);
                    writer.write_entry(&combined)?;
                    a = left.next_entry()?;
                    b = right.next_entry()?;
                }
            },
        }
        written += 1;
        if written % PROGRESS_EVERY == 0 {
            debug!(entries = written, "tier merge in progress");
        }
    }
    writer.finish(final_path)
}

/// Stream one tier file through a fresh writer, re-applying the aux
/// cap and rebuilding the index.
pub(crate) fn rewrite_entries_file(
    src: &Path,
    tmp: &Path,
    final_path: &Path,
    config: &DictionaryConfig,
) -> Result<()> {
    let mut source = EntrySource::open(src, config)?;
    let mut writer = TierWriter::create(tmp, config)?;
    while let Some(mut entry) = source.next_entry()? {
        entry.apply_aux_cap(config.max_aux_slots);
        writer.write_entry(&entry)?;
    }
    writer.finish(final_path)
}
