//! Multi-tier on-disk dictionary
//!
//! Postings stay in their generation's shard; the dictionary maps each
//! word key to the shards and offsets holding its lists. Layout under
//! the dictionary directory:
//!
//! - 256 subdirectories `0`..`255`, one per key first byte
//! - per subdirectory, tier files `{tier}{A|B}.dic`
//! - `max_tier.txt`, the highest tier in decimal text
//!
//! Each shard ingest lands as a tier-0 file per prefix. A tier holds
//! at most two files; when both slots fill, the pair merges one tier
//! up, binary-counter style, deferred to the start of the next ingest
//! so a crash mid-merge costs nothing that a re-run will not redo.

use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::DictionaryConfig;
use crate::dictionary::merge;
use crate::dictionary::record::{
    decode_aux, decode_base, is_aux_slot, DictEntry, GenTriple, SLOT_LEN,
};
use crate::dictionary::window::GenerationWindow;
use crate::error::{IndexError, Result};
use crate::shard::{
    MetaMask, PostingsRef, PrefixEntry, ShardReader, WordKey, MAX_GENERATION,
    PREFIX_ENTRIES, PREFIX_INDEX_LEN,
};

const MAX_TIER_FILE: &str = "max_tier.txt";

/// Shifts this large blur the key's first byte, so the prefix
/// directory itself can no longer be derived from the probe key.
const PREFIX_SHIFT_LIMIT: u32 = 56;

/// Shifts past this blur the second byte and invalidate the per-file
/// second-byte index.
const SECOND_BYTE_SHIFT_LIMIT: u32 = 48;

/// The two file slots a tier can hold per prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    fn letter(self) -> char {
        match self {
            Slot::A => 'A',
            Slot::B => 'B',
        }
    }
}

/// Lookup options for dictionary searches.
#[derive(Clone, Copy, Debug)]
pub struct DictOptions {
    /// Ignore this many low-order bits of the 8-byte hash prefix.
    pub shift: u32,
    /// Compare the full 20 key bytes instead of the hash prefix.
    pub exact: bool,
    /// Filter candidates by their materialized meta bytes.
    pub mask: Option<MetaMask>,
    /// Stop scanning older tiers once this many postings are in hand.
    pub threshold: u32,
    /// Drop generations below this one.
    pub start_generation: u32,
    /// Keep at most this many generations; zero means all.
    pub generation_window: usize,
    /// Total generations in the index, for extrapolating a count from
    /// a clipped window.
    pub estimate_total: Option<u32>,
}

impl Default for DictOptions {
    fn default() -> Self {
        DictOptions {
            shift: 0,
            exact: false,
            mask: None,
            threshold: u32::MAX,
            start_generation: 0,
            generation_window: DictionaryConfig::default().generation_window,
            estimate_total: None,
        }
    }
}

impl DictOptions {
    pub fn exact_match() -> Self {
        DictOptions {
            exact: true,
            ..Default::default()
        }
    }

    pub fn with_shift(mut self, shift: u32) -> Self {
        self.shift = shift;
        self
    }

    pub fn with_mask(mut self, mask: MetaMask) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }
}

/// One generation's postings for a looked-up word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WordDictEntry {
    pub generation: u32,
    pub postings: PostingsRef,
}

/// Aggregated lookup result, generations ascending.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DictLookup {
    pub entries: Vec<WordDictEntry>,
    /// Postings covered by the kept generations (counts saturate per
    /// generation at the stored cap).
    pub total_count: u64,
    /// Extrapolated index-wide count when the caller supplied the
    /// total generation count and the window clipped.
    pub estimated_total: Option<u64>,
}

/// Per-tier file counts and sizes.
#[derive(Clone, Debug, Default)]
pub struct DictionaryStats {
    pub max_tier: u32,
    /// `(tier, files, bytes)` ascending by tier.
    pub tiers: Vec<(u32, u32, u64)>,
}

pub struct IndexDictionary {
    dir: PathBuf,
    config: DictionaryConfig,
    max_tier: u32,
}

impl IndexDictionary {
    /// Create a fresh dictionary directory tree.
    pub fn create(dir: impl AsRef<Path>, config: DictionaryConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        for prefix in 0..PREFIX_ENTRIES {
            fs::create_dir_all(dir.join(prefix.to_string()))?;
        }
        let dict = IndexDictionary {
            dir,
            config,
            max_tier: 0,
        };
        dict.write_max_tier(0)?;
        info!(dir = %dict.dir.display(), "created index dictionary");
        Ok(dict)
    }

    /// Open an existing dictionary, sweeping interrupted writes.
    pub fn open(dir: impl AsRef<Path>, config: DictionaryConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let marker = dir.join(MAX_TIER_FILE);
        let text = fs::read_to_string(&marker).map_err(|_| {
            IndexError::DictionaryState(format!("no dictionary at {}", dir.display()))
        })?;
        let max_tier = text.trim().parse().map_err(|_| {
            IndexError::DictionaryState(format!("unreadable tier marker {text:?}"))
        })?;
        let mut dict = IndexDictionary {
            dir,
            config,
            max_tier,
        };
        dict.recover()?;
        Ok(dict)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_tier(&self) -> u32 {
        self.max_tier
    }

    /// Lookup options seeded from this dictionary's configuration.
    pub fn default_options(&self) -> DictOptions {
        DictOptions {
            generation_window: self.config.generation_window,
            ..Default::default()
        }
    }

    /// Ingest one shard's word rows as tier-0 files, running any
    /// deferred merges first. Rows stream straight from the shard; one
    /// file per prefix is written even where the shard has no keys, so
    /// every tier-0 slot fills at the same rate.
    pub fn add_shard_dictionary(
        &mut self,
        reader: &ShardReader,
        generation: u32,
    ) -> Result<()> {
        if generation > MAX_GENERATION {
            return Err(IndexError::GenerationOverflow(generation));
        }
        self.carry_pending_merges()?;

        let mut rows = reader.row_entries();
        let mut row = rows.next().transpose()?;
        for prefix in 0..PREFIX_ENTRIES {
            let prefix = prefix as u8;
            let slot = if self.slot_path(prefix, 0, Slot::A).exists() {
                Slot::B
            } else {
                Slot::A
            };
            let final_path = self.slot_path(prefix, 0, slot);
            let mut writer = merge::TierWriter::create(&tmp_path(&final_path), &self.config)?;
            while let Some((key, postings)) = row {
                if key.first_byte() != prefix {
                    row = Some((key, postings));
                    break;
                }
                writer.write_entry(&DictEntry::new(key, generation, &postings))?;
                row = rows.next().transpose()?;
            }
            writer.finish(&final_path)?;
        }
        info!(generation, words = reader.row_count(), "shard added to dictionary");
        Ok(())
    }

    /// Merge the tier-file pair at `(prefix, tier)` one tier up, then
    /// delete the inputs. Slot A is the older of the pair.
    pub fn merge_tier_files(&self, prefix: u8, tier: u32, out_slot: Slot) -> Result<()> {
        let a = self.slot_path(prefix, tier, Slot::A);
        let b = self.slot_path(prefix, tier, Slot::B);
        let dest = self.slot_path(prefix, tier + 1, out_slot);
        merge::merge_entry_files(&a, &b, &tmp_path(&dest), &dest, &self.config)?;
        fs::remove_file(&b)?;
        fs::remove_file(&a)?;
        Ok(())
    }

    /// Run every merge the binary counter owes, highest tier first so
    /// a destination slot is always free. A pair at the top tier
    /// raises `max_tier`.
    pub fn carry_pending_merges(&mut self) -> Result<()> {
        while let Some(tier) = self.highest_tier_with_pair() {
            for prefix in 0..PREFIX_ENTRIES {
                let prefix = prefix as u8;
                if !self.has_pair(prefix, tier) {
                    continue;
                }
                let out_slot = if self.slot_path(prefix, tier + 1, Slot::A).exists() {
                    Slot::B
                } else {
                    Slot::A
                };
                self.merge_tier_files(prefix, tier, out_slot)?;
            }
            if tier + 1 > self.max_tier {
                self.set_max_tier(tier + 1)?;
            }
        }
        Ok(())
    }

    /// Collapse every tier into a single file per prefix at the top.
    /// `fast` renames files upward where the destination is free
    /// instead of rewriting them.
    pub fn merge_all_tiers(&mut self, fast: bool) -> Result<()> {
        self.carry_pending_merges()?;
        let top = self.max_tier;
        for tier in 0..top {
            for prefix in 0..PREFIX_ENTRIES {
                let prefix = prefix as u8;
                let Some(slot) = self.find_slot(prefix, tier) else {
                    continue;
                };
                let src = self.slot_path(prefix, tier, slot);
                if let Some(dest_slot) = self.find_slot(prefix, tier + 1) {
                    let dest = self.slot_path(prefix, tier + 1, dest_slot);
                    merge::merge_entry_files(&dest, &src, &tmp_path(&dest), &dest, &self.config)?;
                    fs::remove_file(&src)?;
                } else {
                    let dest = self.slot_path(prefix, tier + 1, Slot::A);
                    if fast {
                        fs::rename(&src, &dest)?;
                    } else {
                        merge::rewrite_entries_file(&src, &tmp_path(&dest), &dest, &self.config)?;
                        fs::remove_file(&src)?;
                    }
                }
            }
        }
        for prefix in 0..PREFIX_ENTRIES {
            let prefix = prefix as u8;
            let a = self.slot_path(prefix, top, Slot::A);
            let b = self.slot_path(prefix, top, Slot::B);
            if b.exists() && !a.exists() {
                fs::rename(&b, &a)?;
            }
        }
        info!(top_tier = top, fast, "merged all dictionary tiers");
        Ok(())
    }

    /// Look a word up across every tier, newest data first. Failures
    /// along the way degrade to whatever was readable.
    pub fn get_word_info(&self, key: &WordKey, options: &DictOptions) -> DictLookup {
        match self.lookup(key, options) {
            Ok(found) => found,
            Err(err) => {
                warn!(error = %err, key = ?key, "dictionary lookup failed");
                DictLookup::default()
            }
        }
    }

    fn lookup(&self, key: &WordKey, options: &DictOptions) -> Result<DictLookup> {
        let mut window = GenerationWindow::new(options.generation_window);
        let prefixes: Vec<u8> = if options.shift < PREFIX_SHIFT_LIMIT {
            vec![key.first_byte()]
        } else {
            (0..PREFIX_ENTRIES).map(|p| p as u8).collect()
        };

        'tiers: for tier in 0..=self.max_tier {
            for slot in [Slot::B, Slot::A] {
                for &prefix in &prefixes {
                    let path = self.slot_path(prefix, tier, slot);
                    if !path.exists() {
                        continue;
                    }
                    let collected = TierFile::open(&path).and_then(|mut file| {
                        collect_tier(&mut file, key, options, self.config.break_count, &mut window)
                    });
                    if let Err(err) = collected {
                        warn!(error = %err, path = %path.display(), "skipping unreadable tier file");
                    }
                }
            }
            if window.total_count() >= u64::from(options.threshold) {
                break 'tiers;
            }
        }

        let total_count = window.total_count();
        let kept = window.len();
        let estimated_total = match options.estimate_total {
            Some(total_generations) if kept > 0 => {
                Some(total_count * u64::from(total_generations) / kept as u64)
            }
            _ => None,
        };
        let entries = window
            .into_entries()
            .into_iter()
            .map(|(generation, postings)| WordDictEntry {
                generation,
                postings,
            })
            .collect();
        Ok(DictLookup {
            entries,
            total_count,
            estimated_total,
        })
    }

    /// Walk the tree counting files and bytes per tier.
    pub fn stats(&self) -> Result<DictionaryStats> {
        let mut tiers: Vec<(u32, u32, u64)> = Vec::new();
        for prefix in 0..PREFIX_ENTRIES {
            let dir = self.prefix_dir(prefix as u8);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(tier) = parse_tier_name(&name.to_string_lossy()) else {
                    continue;
                };
                let bytes = entry.metadata()?.len();
                match tiers.iter_mut().find(|(t, _, _)| *t == tier) {
                    Some((_, files, total)) => {
                        *files += 1;
                        *total += bytes;
                    }
                    None => tiers.push((tier, 1, bytes)),
                }
            }
        }
        tiers.sort_unstable_by_key(|&(tier, _, _)| tier);
        Ok(DictionaryStats {
            max_tier: self.max_tier,
            tiers,
        })
    }

    fn recover(&mut self) -> Result<()> {
        let mut discovered = 0u32;
        for prefix in 0..PREFIX_ENTRIES {
            let dir = self.prefix_dir(prefix as u8);
            if !dir.is_dir() {
                fs::create_dir_all(&dir)?;
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.ends_with(".tmp") {
                    warn!(file = %entry.path().display(), "removing interrupted dictionary write");
                    fs::remove_file(entry.path())?;
                } else if let Some(tier) = parse_tier_name(&name) {
                    discovered = discovered.max(tier);
                }
            }
        }
        if discovered > self.max_tier {
            warn!(
                recorded = self.max_tier,
                discovered, "raising max tier to match files on disk"
            );
            self.set_max_tier(discovered)?;
        }
        Ok(())
    }

    fn highest_tier_with_pair(&self) -> Option<u32> {
        (0..=self.max_tier).rev().find(|&tier| {
            (0..PREFIX_ENTRIES).any(|p| self.has_pair(p as u8, tier))
        })
    }

    fn has_pair(&self, prefix: u8, tier: u32) -> bool {
        self.slot_path(prefix, tier, Slot::A).exists()
            && self.slot_path(prefix, tier, Slot::B).exists()
    }

    fn find_slot(&self, prefix: u8, tier: u32) -> Option<Slot> {
        [Slot::A, Slot::B]
            .into_iter()
            .find(|&slot| self.slot_path(prefix, tier, slot).exists())
    }

    fn prefix_dir(&self, prefix: u8) -> PathBuf {
        self.dir.join(prefix.to_string())
    }

    fn slot_path(&self, prefix: u8, tier: u32, slot: Slot) -> PathBuf {
        self.prefix_dir(prefix)
            .join(format!("{tier}{}.dic", slot.letter()))
    }

    fn set_max_tier(&mut self, tier: u32) -> Result<()> {
        self.max_tier = tier;
        self.write_max_tier(tier)
    }

    fn write_max_tier(&self, tier: u32) -> Result<()> {
        let mut file = File::create(self.dir.join(MAX_TIER_FILE))?;
        file.write_all(tier.to_string().as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn parse_tier_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(".dic")?;
    let tier = stem
        .strip_suffix('A')
        .or_else(|| stem.strip_suffix('B'))?;
    tier.parse().ok()
}

/// One open tier file: eager second-byte index, slots read on demand.
struct TierFile {
    file: File,
    slot_count: u64,
    index: Vec<PrefixEntry>,
}

impl TierFile {
    fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let head = PREFIX_INDEX_LEN as u64;
        if len < head || (len - head) % SLOT_LEN as u64 != 0 {
            return Err(IndexError::CorruptRecord {
                context: "tier file length",
                offset: len,
            });
        }
        let mut head_bytes = vec![0u8; PREFIX_INDEX_LEN];
        file.read_exact(&mut head_bytes)?;
        let index = (0..PREFIX_ENTRIES)
            .map(|i| PrefixEntry::read_from(&head_bytes[i * 8..i * 8 + 8]))
            .collect();
        Ok(TierFile {
            file,
            slot_count: (len - head) / SLOT_LEN as u64,
            index,
        })
    }

    fn read_slot(&mut self, at: u64) -> Result<[u8; SLOT_LEN]> {
        if at >= self.slot_count {
            return Err(IndexError::CorruptRecord {
                context: "tier slot read",
                offset: at * SLOT_LEN as u64,
            });
        }
        self.file
            .seek(SeekFrom::Start(PREFIX_INDEX_LEN as u64 + at * SLOT_LEN as u64))?;
        let mut slot = [0u8; SLOT_LEN];
        self.file.read_exact(&mut slot)?;
        Ok(slot)
    }
}

/// Binary-search one tier file for the key, fan across the matching
/// run, and feed the triples into the window newest-first.
fn collect_tier(
    file: &mut TierFile,
    key: &WordKey,
    options: &DictOptions,
    break_count: u32,
    window: &mut GenerationWindow,
) -> Result<()> {
    let (lo, hi) = if options.shift <= SECOND_BYTE_SHIFT_LIMIT {
        let entry = file.index[key.second_byte() as usize];
        if entry.is_absent() {
            return Ok(());
        }
        let first = u64::from(entry.first);
        (first, (first + u64::from(entry.count)).min(file.slot_count))
    } else {
        (0, file.slot_count)
    };

    // Probes landing on an aux slot back up to the owning base row.
    let mut found = None;
    let (mut low, mut high) = (lo, hi);
    while low < high {
        let mid = low + (high - low) / 2;
        let mut probe = mid;
        let mut slot = file.read_slot(probe)?;
        while is_aux_slot(&slot) {
            if probe == lo {
                return Err(IndexError::CorruptRecord {
                    context: "tier slot run",
                    offset: lo * SLOT_LEN as u64,
                });
            }
            probe -= 1;
            slot = file.read_slot(probe)?;
        }
        let (raw, _, _) = decode_base(&slot);
        match key.cmp_stored(&raw, options.shift, options.exact) {
            Ordering::Greater => low = mid + 1,
            Ordering::Less => high = probe,
            Ordering::Equal => {
                found = Some(probe);
                break;
            }
        }
    }
    let Some(hit) = found else {
        return Ok(());
    };

    // Walk left to where the matching run starts.
    let mut start = hit;
    'left: while start > lo {
        let mut at = start - 1;
        loop {
            let slot = file.read_slot(at)?;
            if !is_aux_slot(&slot) {
                let (raw, _, _) = decode_base(&slot);
                if key.cmp_stored(&raw, options.shift, options.exact) == Ordering::Equal {
                    start = at;
                    continue 'left;
                }
                break 'left;
            }
            if at == lo {
                break 'left;
            }
            at -= 1;
        }
    }

    // Scan forward. Rows that fail the filter or decode burn the break
    // budget; rows past the run end the scan.
    let mut rows: Vec<Vec<GenTriple>> = Vec::new();
    let mut breaks = 0u32;
    let mut at = start;
    while at < hi {
        let slot = file.read_slot(at)?;
        if is_aux_slot(&slot) {
            breaks += 1;
            if breaks > break_count {
                break;
            }
            at += 1;
            continue;
        }
        let (raw, aux_count, first) = decode_base(&slot);
        if key.cmp_stored(&raw, options.shift, options.exact) != Ordering::Equal {
            break;
        }
        let mut triples = vec![first];
        let mut chain_ok = true;
        for link in 0..u64::from(aux_count) {
            let aux_at = at + 1 + link;
            if aux_at >= file.slot_count {
                chain_ok = false;
                break;
            }
            let aux = file.read_slot(aux_at)?;
            match decode_aux(&aux, aux_at) {
                Ok(more) => triples.extend(more),
                Err(_) => {
                    chain_ok = false;
                    break;
                }
            }
        }
        if !chain_ok {
            breaks += 1;
            if breaks > break_count {
                break;
            }
            at += 1;
            continue;
        }
        if key.matches_stored(&raw, options.shift, options.exact, options.mask.as_ref()) {
            rows.push(triples);
        } else {
            breaks += 1;
            if breaks > break_count {
                break;
            }
        }
        at += 1 + u64::from(aux_count);
    }

    // Newest sightings first: within a file later rows and later
    // triples shadow earlier copies of the same generation.
    for triples in rows.iter().rev() {
        for triple in triples.iter().rev() {
            if triple.generation < options.start_generation {
                continue;
            }
            window.insert(triple.generation, triple.postings(), triple.count());
        }
    }
    Ok(())
}
