//! Relevance scoring for posting items
//!
//! Term frequency saturates BM25-style with a length-normalized knee.
//! Document text splits into a title zone (early positions) and a
//! description zone; link records weigh all positions as anchor text.
//! Unranked documents fall back to a crawl-order authority decay.

use crate::config::ScoringConfig;

use super::types::PostingItem;

/// Corpus-level counts a reader derives from its header.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShardStats {
    pub num_docs: u32,
    pub num_link_docs: u32,
    pub len_all_docs: u32,
    pub len_all_link_docs: u32,
}

impl ShardStats {
    pub fn total_docs(&self) -> u32 {
        self.num_docs + self.num_link_docs
    }

    pub fn avg_doc_len(&self) -> f32 {
        (self.len_all_docs as f32 / self.num_docs.max(1) as f32).max(1.0)
    }

    pub fn avg_link_len(&self) -> f32 {
        (self.len_all_link_docs as f32 / self.num_link_docs.max(1) as f32).max(1.0)
    }
}

/// Per-lookup scoring inputs.
#[derive(Clone, Copy, Debug)]
pub struct ScoreContext<'a> {
    pub config: &'a ScoringConfig,
    /// Replacement total occurrence count, scaled across zones. Phrase
    /// lookups pass the phrase count here so items score as if the
    /// phrase, not its head word, had occurred.
    pub override_occurs: Option<u32>,
    /// Extra multiplicative factors, one per active query modifier.
    pub rank_factors: &'a [f32],
}

impl<'a> ScoreContext<'a> {
    pub fn new(config: &'a ScoringConfig) -> Self {
        ScoreContext {
            config,
            override_occurs: None,
            rank_factors: &[],
        }
    }

    pub fn with_override_occurs(mut self, occurrences: u32) -> Self {
        self.override_occurs = Some(occurrences);
        self
    }

    pub fn with_rank_factors(mut self, factors: &'a [f32]) -> Self {
        self.rank_factors = factors;
        self
    }
}

/// Saturating term frequency with the zone's length ratio as the knee.
fn saturation(tf: f32, len_ratio: f32) -> f32 {
    if tf <= 0.0 {
        return 0.0;
    }
    3.0 * tf / (tf + 0.5 + 1.5 * len_ratio)
}

fn idf(total_docs: u32, docs_with_word: u32) -> f32 {
    (total_docs.max(1) as f32 / docs_with_word.max(1) as f32)
        .log2()
        .max(0.0)
}

/// Fill in `relevance` and `score` for an item whose positional fields
/// are already populated.
pub fn score_item(
    item: &mut PostingItem,
    docs_with_word: u32,
    stats: &ShardStats,
    ctx: &ScoreContext,
) {
    let config = ctx.config;
    let mut title_tf = 0.0f32;
    let mut description_tf = 0.0f32;
    let mut link_tf = 0.0f32;
    if item.is_doc {
        let title_count = item
            .positions
            .iter()
            .take_while(|&&p| p < config.title_length_threshold)
            .count();
        title_tf = title_count as f32;
        description_tf = (item.positions.len() - title_count) as f32;
    } else {
        link_tf = item.positions.len() as f32;
    }

    if let Some(occurrences) = ctx.override_occurs {
        let total = title_tf + description_tf + link_tf;
        if total > 0.0 {
            let scale = occurrences as f32 / total;
            title_tf *= scale;
            description_tf *= scale;
            link_tf *= scale;
        }
    }

    let idf = idf(stats.total_docs(), docs_with_word);
    let relevance = if item.is_doc {
        let description_ratio = item.doc_len as f32 / stats.avg_doc_len();
        idf * (config.title_weight * saturation(title_tf, 1.0)
            + config.description_weight * saturation(description_tf, description_ratio))
    } else {
        let link_ratio = item.doc_len as f32 / stats.avg_link_len();
        idf * config.link_weight * saturation(link_tf, link_ratio)
    };

    let authority = if item.rank > 0 {
        f32::from(item.rank)
    } else {
        (16.0 - ((item.doc_index + 2) as f32).log2()).max(1.0)
    };

    item.relevance = relevance;
    item.score = authority * relevance * ctx.rank_factors.iter().product::<f32>();
}
