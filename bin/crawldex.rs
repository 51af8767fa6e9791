use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crawldex::shard::WORD_KEY_LEN;
use crawldex::{
    DictOptions, DictionaryConfig, IndexDictionary, ShardConfig, ShardReader, WordKey,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "crawldex")]
#[command(about = "Inspect and maintain crawldex shards and dictionaries", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a saved shard's header and document counts
    ShardInfo {
        /// Path to the shard file
        #[arg(env = "CRAWLDEX_SHARD")]
        file: PathBuf,
    },

    /// Summarize a dictionary's tier files
    DictInfo {
        /// Dictionary directory
        #[arg(env = "CRAWLDEX_DICT")]
        dir: PathBuf,
    },

    /// Look a word key up across every dictionary tier
    Lookup {
        /// Dictionary directory
        #[arg(env = "CRAWLDEX_DICT")]
        dir: PathBuf,

        /// The 20-byte word key as 40 hex digits
        key: String,

        /// Ignore this many low-order bits of the hash prefix
        #[arg(long, default_value = "0")]
        shift: u32,

        /// Stop scanning older tiers after this many postings
        #[arg(long)]
        threshold: Option<u32>,

        /// Drop generations below this one
        #[arg(long, default_value = "0")]
        start_generation: u32,

        /// Keep at most this many generations (0 keeps all)
        #[arg(long)]
        window: Option<usize>,

        /// Extrapolate an index-wide count from this many total generations
        #[arg(long)]
        total_generations: Option<u32>,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Merge every dictionary tier into one file per prefix
    MergeAll {
        /// Dictionary directory
        #[arg(env = "CRAWLDEX_DICT")]
        dir: PathBuf,

        /// Rename files upward where possible instead of rewriting
        #[arg(long)]
        fast: bool,
    },
}

#[derive(Serialize)]
struct LookupRow {
    generation: u32,
    count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_offset: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_offset: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    doc_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<u32>,
}

#[derive(Serialize)]
struct LookupOutput {
    entries: Vec<LookupRow>,
    total_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    estimated_total: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::ShardInfo { file } => shard_info(&file),
        Command::DictInfo { dir } => dict_info(&dir),
        Command::Lookup {
            dir,
            key,
            shift,
            threshold,
            start_generation,
            window,
            total_generations,
            json,
        } => lookup(
            &dir,
            &key,
            shift,
            threshold,
            start_generation,
            window,
            total_generations,
            json,
        ),
        Command::MergeAll { dir, fast } => merge_all(&dir, fast),
    }
}

fn shard_info(file: &Path) -> Result<()> {
    let reader = ShardReader::open(file, ShardConfig::default())
        .with_context(|| format!("opening shard {}", file.display()))?;
    let header = reader.header();
    println!("shard {}", file.display());
    println!("  generation        {}", header.generation);
    println!("  docs per gen      {}", header.docs_per_generation);
    println!("  words             {}", reader.row_count());
    println!("  docs              {}", header.num_docs);
    println!("  link docs         {}", header.num_link_docs);
    println!("  doc word total    {}", header.len_all_docs);
    println!("  link word total   {}", header.len_all_link_docs);
    println!("  postings bytes    {}", header.postings_len);
    println!("  doc record bytes  {}", header.doc_infos_len);
    Ok(())
}

fn dict_info(dir: &Path) -> Result<()> {
    let dict = IndexDictionary::open(dir, DictionaryConfig::default())
        .with_context(|| format!("opening dictionary {}", dir.display()))?;
    let stats = dict.stats()?;
    println!("dictionary {}", dir.display());
    println!("  max tier {}", stats.max_tier);
    for (tier, files, bytes) in stats.tiers {
        println!("  tier {tier:>3}  {files:>4} files  {bytes:>12} bytes");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn lookup(
    dir: &Path,
    key: &str,
    shift: u32,
    threshold: Option<u32>,
    start_generation: u32,
    window: Option<usize>,
    total_generations: Option<u32>,
    json: bool,
) -> Result<()> {
    let dict = IndexDictionary::open(dir, DictionaryConfig::default())
        .with_context(|| format!("opening dictionary {}", dir.display()))?;
    let key = parse_key(key)?;
    let mut options = DictOptions {
        shift,
        exact: shift == 0,
        start_generation,
        estimate_total: total_generations,
        ..dict.default_options()
    };
    if let Some(threshold) = threshold {
        options.threshold = threshold;
    }
    if let Some(window) = window {
        options.generation_window = window;
    }

    let found = dict.get_word_info(&key, &options);
    let entries: Vec<LookupRow> = found
        .entries
        .iter()
        .map(|entry| match entry.postings {
            crawldex::shard::PostingsRef::Extent {
                first_offset,
                last_offset,
                count,
            } => LookupRow {
                generation: entry.generation,
                count,
                first_offset: Some(first_offset),
                last_offset: Some(last_offset),
                doc_index: None,
                position: None,
            },
            crawldex::shard::PostingsRef::Inline {
                doc_index,
                position,
            } => LookupRow {
                generation: entry.generation,
                count: 1,
                first_offset: None,
                last_offset: None,
                doc_index: Some(doc_index),
                position: Some(position),
            },
        })
        .collect();

    if json {
        let output = LookupOutput {
            entries,
            total_count: found.total_count,
            estimated_total: found.estimated_total,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("no postings for {key:?}");
        return Ok(());
    }
    for row in &entries {
        match (row.first_offset, row.doc_index) {
            (Some(first), _) => println!(
                "  gen {:>5}  {:>6} postings  bytes {}..{}",
                row.generation,
                row.count,
                first,
                row.last_offset.unwrap_or(first),
            ),
            (None, Some(doc)) => println!(
                "  gen {:>5}  inline  doc {} position {}",
                row.generation,
                doc,
                row.position.unwrap_or(0),
            ),
            _ => {}
        }
    }
    println!("  total {} postings", found.total_count);
    if let Some(estimate) = found.estimated_total {
        println!("  estimated {estimate} postings index-wide");
    }
    Ok(())
}

fn merge_all(dir: &Path, fast: bool) -> Result<()> {
    let mut dict = IndexDictionary::open(dir, DictionaryConfig::default())
        .with_context(|| format!("opening dictionary {}", dir.display()))?;
    dict.merge_all_tiers(fast)?;
    let stats = dict.stats()?;
    println!("merged into tier {}", stats.max_tier);
    for (tier, files, bytes) in stats.tiers {
        println!("  tier {tier:>3}  {files:>4} files  {bytes:>12} bytes");
    }
    Ok(())
}

fn parse_key(hex: &str) -> Result<WordKey> {
    let hex = hex.trim();
    if hex.len() != 2 * WORD_KEY_LEN {
        bail!("word keys are {} hex digits, got {}", 2 * WORD_KEY_LEN, hex.len());
    }
    let mut bytes = [0u8; WORD_KEY_LEN];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk).context("key is not ASCII hex")?;
        bytes[i] = u8::from_str_radix(pair, 16)
            .with_context(|| format!("bad hex pair {pair:?}"))?;
    }
    Ok(WordKey::from_bytes(bytes))
}
