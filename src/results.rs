//! Post-execution result processing: obfuscation, ranking, and optimization
//! stages. Each stage is independently toggleable and they compose in that
//! order.

use chrono::Utc;
use rand::Rng;
use tracing::trace;

use crate::types::{IndexSource, PipelineConfig, SearchResult};

/// Boost factors per privacy level 1..=5 for privacy-aware ranking.
const BOOST_FACTORS: [f64; 5] = [1.0, 1.1, 1.25, 1.5, 2.0];

/// Ceiling on dummy-result relevance.
const DUMMY_RELEVANCE_CAP: f64 = 0.3;

/// Ranking strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RankingMode {
    /// Relevance scaled by the privacy-level boost, perturbed at L >= 4.
    PrivacyBoosted,
    /// Plain descending relevance.
    RelevanceOnly,
}

/// Configurable three-stage result pipeline.
pub struct ResultProcessor {
    pub obfuscation: bool,
    pub ranking: RankingMode,
    pub optimization: bool,
    min_results: usize,
    dummy_ratio: f64,
}

impl ResultProcessor {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            obfuscation: true,
            ranking: RankingMode::PrivacyBoosted,
            optimization: true,
            min_results: cfg.min_results,
            dummy_ratio: cfg.dummy_result_ratio,
        }
    }

    /// Run the configured stages over a result set.
    pub fn process(
        &self,
        mut results: Vec<SearchResult>,
        privacy_level: u8,
        noise_level: f64,
        max_results: usize,
    ) -> Vec<SearchResult> {
        if self.obfuscation {
            self.obfuscate(&mut results, privacy_level, noise_level);
        }
        self.rank(&mut results, privacy_level);
        if self.optimization {
            self.optimize(&mut results, privacy_level, noise_level, max_results);
        }
        trace!(count = results.len(), level = privacy_level, "result processing complete");
        results
    }

    /// Stamp the privacy level, add relevance noise at L >= 3, and append
    /// dummy results at L >= 4.
    fn obfuscate(&self, results: &mut Vec<SearchResult>, privacy_level: u8, noise_level: f64) {
        let mut rng = rand::thread_rng();
        for result in results.iter_mut() {
            result.privacy_level = privacy_level;
            if privacy_level >= 3 && noise_level > 0.0 {
                let noise = rng.gen_range(-noise_level / 2.0..=noise_level / 2.0);
                result.relevance = (result.relevance + noise).clamp(0.0, 1.0);
                result.noise_level = noise_level;
            }
        }
        if privacy_level >= 4 {
            let dummy_count = (results.len() as f64 * self.dummy_ratio).floor() as usize;
            for i in 0..dummy_count {
                results.push(make_dummy(privacy_level, noise_level, i, &mut rng));
            }
        }
    }

    /// Sort by boosted relevance. The boost is uniform within one response,
    /// so it preserves order against itself; the L >= 4 perturbation is the
    /// point where ranking becomes deliberately unstable.
    fn rank(&self, results: &mut [SearchResult], privacy_level: u8) {
        let boost = match self.ranking {
            RankingMode::PrivacyBoosted => BOOST_FACTORS[(privacy_level as usize - 1).min(4)],
            RankingMode::RelevanceOnly => 1.0,
        };
        let perturb = self.ranking == RankingMode::PrivacyBoosted && privacy_level >= 4;
        let mut rng = rand::thread_rng();
        let mut keyed: Vec<(f64, SearchResult)> = results
            .iter()
            .cloned()
            .map(|r| {
                let mut key = r.relevance * boost;
                if perturb {
                    key += rng.gen_range(-0.05..=0.05);
                }
                (key, r)
            })
            .collect();
        keyed.sort_unstable_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        for (slot, (_, r)) in results.iter_mut().zip(keyed) {
            *slot = r;
        }
    }

    /// Truncate to `max_results`, pad sparse (but non-empty) result sets up
    /// to the minimum, and partially shuffle at L >= 3.
    fn optimize(
        &self,
        results: &mut Vec<SearchResult>,
        privacy_level: u8,
        noise_level: f64,
        max_results: usize,
    ) {
        results.truncate(max_results.max(1));

        let real = results.iter().filter(|r| r.match_type != "dummy").count();
        if real > 0 && results.len() < self.min_results {
            let mut rng = rand::thread_rng();
            while results.len() < self.min_results {
                let i = results.len();
                results.push(make_dummy(privacy_level, noise_level, i, &mut rng));
            }
        }

        if privacy_level >= 3 && results.len() > 1 {
            let mut rng = rand::thread_rng();
            let swaps = 2 * privacy_level as usize;
            for _ in 0..swaps {
                let a = rng.gen_range(0..results.len());
                let b = rng.gen_range(0..results.len());
                results.swap(a, b);
            }
        }
    }
}

/// A synthetic low-relevance result. `indexed_at` is back-dated so dummies
/// do not stand out from real entries as freshly indexed.
fn make_dummy(privacy_level: u8, noise_level: f64, ordinal: usize, rng: &mut impl Rng) -> SearchResult {
    let age = chrono::Duration::minutes(rng.gen_range(30..30 * 24 * 60));
    SearchResult {
        file_id: format!("anon-{:08x}", rng.gen::<u32>() ^ ordinal as u32),
        filename: None,
        directory: None,
        content_type: None,
        relevance: rng.gen_range(0.05..DUMMY_RELEVANCE_CAP),
        match_type: "dummy".to_string(),
        similarity: 0.0,
        metadata: None,
        privacy_level,
        noise_level,
        sources: Vec::new(),
        index_source: IndexSource::Privacy,
        last_modified: None,
        indexed_at: Utc::now() - age,
    }
}
