use std::fs;
use std::path::Path;

use tempfile::TempDir;

use crawldex::dictionary::{decode_base, is_aux_slot, SLOT_LEN};
use crawldex::shard::{
    LookupOptions, PostingsRef, PrefixEntry, ScoreContext, ShardReader, WordKey,
    PREFIX_INDEX_LEN,
};
use crawldex::{
    DictOptions, DictionaryConfig, IndexDictionary, IndexShard, ScoringConfig,
    ShardConfig,
};

/// Single-term key with no meta bytes.
fn word(term: u64) -> WordKey {
    WordKey::single(term, &[])
}

/// One-document shard carrying the given terms, two positions each.
fn shard_reader(generation: u32, terms: &[u64]) -> ShardReader {
    let mut shard = IndexShard::new(generation, ShardConfig::default()).unwrap();
    let words: Vec<(WordKey, Vec<u32>)> = terms
        .iter()
        .map(|&term| (word(term), vec![0, generation + 5]))
        .collect();
    let doc_key = [(generation + 1) as u8; 8];
    assert!(shard.add_document_words(&doc_key, 0, &words, &[], &[], true, 1));
    shard.to_reader().unwrap()
}

fn tier_files(dict_dir: &Path, prefix: u8) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dict_dir.join(prefix.to_string()))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_third_ingest_merges_the_tier_zero_pair() {
    let dir = TempDir::new().unwrap();
    let mut dict =
        IndexDictionary::create(dir.path().join("dict"), DictionaryConfig::default()).unwrap();

    dict.add_shard_dictionary(&shard_reader(0, &[10, 11]), 0).unwrap();
    let stats = dict.stats().unwrap();
    assert_eq!(stats.tiers, vec![(0, 256, stats.tiers[0].2)]);

    dict.add_shard_dictionary(&shard_reader(1, &[10, 12]), 1).unwrap();
    let stats = dict.stats().unwrap();
    assert_eq!(stats.tiers.len(), 1);
    assert_eq!(stats.tiers[0].1, 512);

    dict.add_shard_dictionary(&shard_reader(2, &[10, 13]), 2).unwrap();
    assert_eq!(dict.max_tier(), 1);
    let stats = dict.stats().unwrap();
    assert_eq!(stats.tiers.len(), 2);
    assert_eq!(stats.tiers[0].1, 256, "tier 0 should hold only the new ingest");
    assert_eq!(stats.tiers[1].1, 256, "the old pair should merge to one tier-1 file");

    let prefix = word(10).first_byte();
    assert_eq!(
        tier_files(dict.dir(), prefix),
        vec!["0A.dic".to_string(), "1A.dic".to_string()]
    );

    // All three generations resolve through the merged layout
    let found = dict.get_word_info(&word(10), &DictOptions::exact_match());
    let generations: Vec<u32> = found.entries.iter().map(|e| e.generation).collect();
    assert_eq!(generations, vec![0, 1, 2]);
}

#[test]
fn test_the_generation_window_keeps_the_newest() {
    let dir = TempDir::new().unwrap();
    let mut dict =
        IndexDictionary::create(dir.path().join("dict"), DictionaryConfig::default()).unwrap();
    for generation in 0..4 {
        dict.add_shard_dictionary(&shard_reader(generation, &[7171]), generation)
            .unwrap();
    }

    let everything = dict.get_word_info(&word(7171), &DictOptions::exact_match());
    let generations: Vec<u32> = everything.entries.iter().map(|e| e.generation).collect();
    assert_eq!(generations, vec![0, 1, 2, 3]);

    let clipped = DictOptions {
        generation_window: 2,
        ..DictOptions::exact_match()
    };
    let found = dict.get_word_info(&word(7171), &clipped);
    let generations: Vec<u32> = found.entries.iter().map(|e| e.generation).collect();
    assert_eq!(generations, vec![2, 3]);
}

#[test]
fn test_merge_order_does_not_change_lookups() {
    let dir = TempDir::new().unwrap();
    let gens: Vec<Vec<u64>> = vec![vec![1, 2, 3], vec![2, 3, 4], vec![3, 4, 5]];

    // Lazy carries only
    let mut lazy =
        IndexDictionary::create(dir.path().join("lazy"), DictionaryConfig::default()).unwrap();
    for (generation, terms) in gens.iter().enumerate() {
        let generation = generation as u32;
        lazy.add_shard_dictionary(&shard_reader(generation, terms), generation)
            .unwrap();
    }

    // Full merge after every ingest
    let mut eager =
        IndexDictionary::create(dir.path().join("eager"), DictionaryConfig::default()).unwrap();
    for (generation, terms) in gens.iter().enumerate() {
        let generation = generation as u32;
        eager
            .add_shard_dictionary(&shard_reader(generation, terms), generation)
            .unwrap();
        eager.merge_all_tiers(false).unwrap();
    }

    for term in 1..=5u64 {
        let options = DictOptions::exact_match();
        assert_eq!(
            lazy.get_word_info(&word(term), &options),
            eager.get_word_info(&word(term), &options),
            "term {term} resolved differently across merge orders"
        );
    }
}

#[test]
fn test_interrupted_writes_are_swept_on_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dict");
    let mut dict = IndexDictionary::create(&path, DictionaryConfig::default()).unwrap();
    dict.add_shard_dictionary(&shard_reader(0, &[40]), 0).unwrap();

    let stray = path.join("5").join("0B.dic.tmp");
    fs::write(&stray, b"interrupted").unwrap();
    drop(dict);

    let mut dict = IndexDictionary::open(&path, DictionaryConfig::default()).unwrap();
    assert!(!stray.exists());

    dict.add_shard_dictionary(&shard_reader(1, &[40]), 1).unwrap();
    dict.add_shard_dictionary(&shard_reader(2, &[40]), 2).unwrap();
    let found = dict.get_word_info(&word(40), &DictOptions::exact_match());
    let generations: Vec<u32> = found.entries.iter().map(|e| e.generation).collect();
    assert_eq!(generations, vec![0, 1, 2]);
}

#[test]
fn test_stale_merge_inputs_remerge_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let terms = [9u64, 10];

    let mut dict =
        IndexDictionary::create(dir.path().join("dict"), DictionaryConfig::default()).unwrap();
    dict.add_shard_dictionary(&shard_reader(0, &terms), 0).unwrap();
    dict.add_shard_dictionary(&shard_reader(1, &terms), 1).unwrap();

    // Keep a copy of a tier-0 input, as if a crash interrupted the
    // merge after its output landed but before the input was deleted.
    let prefix = word(9).first_byte();
    let survivor = dict.dir().join(prefix.to_string()).join("0A.dic");
    let stash = dir.path().join("survivor.dic");
    fs::copy(&survivor, &stash).unwrap();

    dict.add_shard_dictionary(&shard_reader(2, &terms), 2).unwrap();
    fs::copy(&stash, dict.dir().join(prefix.to_string()).join("0B.dic")).unwrap();

    // The stale copy holds generation 0 data identical to what already
    // merged upward, so lookups agree with a dictionary built cleanly.
    let mut clean =
        IndexDictionary::create(dir.path().join("clean"), DictionaryConfig::default()).unwrap();
    for generation in 0..3 {
        clean
            .add_shard_dictionary(&shard_reader(generation, &terms), generation)
            .unwrap();
    }
    let options = DictOptions::exact_match();
    assert_eq!(
        dict.get_word_info(&word(9), &options),
        clean.get_word_info(&word(9), &options)
    );

    // The next ingest merges the stale pair; generations never double
    dict.add_shard_dictionary(&shard_reader(3, &terms), 3).unwrap();
    clean.add_shard_dictionary(&shard_reader(3, &terms), 3).unwrap();
    for term in terms {
        assert_eq!(
            dict.get_word_info(&word(term), &options),
            clean.get_word_info(&word(term), &options)
        );
    }
}

#[test]
fn test_merge_all_leaves_one_file_per_prefix() {
    let dir = TempDir::new().unwrap();
    let mut dict =
        IndexDictionary::create(dir.path().join("dict"), DictionaryConfig::default()).unwrap();
    let terms: Vec<u64> = (50..70).collect();
    for generation in 0..6 {
        dict.add_shard_dictionary(&shard_reader(generation, &terms), generation)
            .unwrap();
    }
    let options = DictOptions::exact_match();
    let before: Vec<_> = terms
        .iter()
        .map(|&t| dict.get_word_info(&word(t), &options))
        .collect();

    dict.merge_all_tiers(false).unwrap();

    let top = dict.max_tier();
    let stats = dict.stats().unwrap();
    assert_eq!(stats.tiers.len(), 1, "only the top tier should hold files");
    assert_eq!(stats.tiers[0].0, top);
    assert_eq!(stats.tiers[0].1, 256);
    for prefix in [0u8, 17, 255] {
        assert_eq!(tier_files(dict.dir(), prefix), vec![format!("{top}A.dic")]);
    }

    let after: Vec<_> = terms
        .iter()
        .map(|&t| dict.get_word_info(&word(t), &options))
        .collect();
    assert_eq!(before, after);

    // Re-running is a no-op, and the fast path gives the same answers
    dict.merge_all_tiers(false).unwrap();
    assert_eq!(dict.stats().unwrap().tiers.len(), 1);

    let mut fast =
        IndexDictionary::create(dir.path().join("fast"), DictionaryConfig::default()).unwrap();
    for generation in 0..6 {
        fast.add_shard_dictionary(&shard_reader(generation, &terms), generation)
            .unwrap();
    }
    fast.merge_all_tiers(true).unwrap();
    for (term, expected) in terms.iter().zip(&before) {
        assert_eq!(&fast.get_word_info(&word(*term), &options), expected);
    }
}

#[test]
fn test_the_second_byte_index_stays_consistent() {
    let dir = TempDir::new().unwrap();
    let mut dict =
        IndexDictionary::create(dir.path().join("dict"), DictionaryConfig::default()).unwrap();
    let terms: Vec<u64> = (0..400).map(|t| t * 7 + 1).collect();
    for generation in 0..3 {
        dict.add_shard_dictionary(&shard_reader(generation, &terms), generation)
            .unwrap();
    }
    dict.merge_all_tiers(false).unwrap();

    let prefix = word(terms[0]).first_byte();
    let path = dict
        .dir()
        .join(prefix.to_string())
        .join(format!("{}A.dic", dict.max_tier()));
    let bytes = fs::read(&path).unwrap();
    assert!(bytes.len() > PREFIX_INDEX_LEN);
    assert_eq!((bytes.len() - PREFIX_INDEX_LEN) % SLOT_LEN, 0);

    // Walk the slots and rebuild the second-byte ranges
    let mut observed: Vec<PrefixEntry> = vec![PrefixEntry::absent(); 256];
    let slots = (bytes.len() - PREFIX_INDEX_LEN) / SLOT_LEN;
    let mut at = 0usize;
    while at < slots {
        let start = PREFIX_INDEX_LEN + at * SLOT_LEN;
        let mut slot = [0u8; SLOT_LEN];
        slot.copy_from_slice(&bytes[start..start + SLOT_LEN]);
        assert!(!is_aux_slot(&slot), "entries must start with a base row");
        let (raw, aux_count, _) = decode_base(&slot);
        assert_eq!(raw[0], prefix);
        let second = raw[1] as usize;
        if observed[second].is_absent() {
            observed[second].first = at as u32;
        }
        observed[second].count += 1 + u32::from(aux_count);
        at += 1 + aux_count as usize;
    }

    for (second, expected) in observed.iter().enumerate() {
        let stored = PrefixEntry::read_from(&bytes[second * 8..second * 8 + 8]);
        assert_eq!(&stored, expected, "second byte {second:#x} range mismatch");
    }
}

#[test]
fn test_dictionary_triples_drive_shard_reads() {
    let dir = TempDir::new().unwrap();
    let shard_path = dir.path().join("gen0.shard");

    let mut shard = IndexShard::new(0, ShardConfig::default()).unwrap();
    for seed in 1..=3u8 {
        let words: Vec<(WordKey, Vec<u32>)> = vec![
            (word(4242), vec![u32::from(seed)]),
            (word(5000 + u64::from(seed)), vec![0]),
        ];
        assert!(shard.add_document_words(&[seed; 8], 0, &words, &[], &[], true, 1));
    }
    shard.save(&shard_path).unwrap();

    let reader = ShardReader::open(&shard_path, ShardConfig::default()).unwrap();
    let mut dict =
        IndexDictionary::create(dir.path().join("dict"), DictionaryConfig::default()).unwrap();
    dict.add_shard_dictionary(&reader, 0).unwrap();

    let found = dict.get_word_info(&word(4242), &DictOptions::exact_match());
    assert_eq!(found.entries.len(), 1);
    assert_eq!(found.entries[0].generation, 0);
    let postings = found.entries[0].postings;
    assert!(matches!(postings, PostingsRef::Extent { count: 3, .. }));

    // The dictionary's extent reads back through the shard it came from
    let scoring = ScoringConfig::default();
    let ctx = ScoreContext::new(&scoring);
    let mut cursor = 0;
    let via_dict = reader.get_postings_slice(&postings, &mut cursor, 10, &ctx);
    let info = reader
        .get_word_info(&word(4242), &LookupOptions::exact_match())
        .unwrap();
    let mut cursor = 0;
    let via_shard = reader.get_postings_slice(&info.postings, &mut cursor, 10, &ctx);

    assert_eq!(via_dict.len(), 3);
    for (a, b) in via_dict.iter().zip(&via_shard) {
        assert_eq!(a.doc_index, b.doc_index);
        assert_eq!(a.positions, b.positions);
        assert_eq!(a.doc_key, b.doc_key);
    }
}
