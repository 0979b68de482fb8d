//! Privacy transformation of validated queries.
//!
//! Level 2 normalizes and pads the query with noise terms; level 3 adds
//! dummy queries; level 4 attaches relevance noise and a timing delay drawn
//! from a 24-bucket traffic model; level 5 tightens everything further. The
//! transformation also prices the query against the session budget.

use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

use crate::types::{PipelineConfig, Query};

/// Fixed dictionary of plausible filler terms for noise and dummy queries.
const NOISE_DICTIONARY: &[&str] = &[
    "document", "report", "backup", "archive", "notes", "photo", "invoice", "draft",
    "presentation", "spreadsheet", "config", "readme", "summary", "meeting", "budget",
    "schedule", "contract", "manual", "journal", "recording",
];

/// Hour-of-day traffic factors in [0.1, 1.0]; quiet hours stretch delays
/// less because a lone late-night query is already conspicuous.
const TRAFFIC_FACTORS: [f64; 24] = [
    0.2, 0.15, 0.1, 0.1, 0.1, 0.15, 0.3, 0.5, 0.7, 0.9, 1.0, 1.0, //
    0.95, 1.0, 1.0, 0.95, 0.9, 0.8, 0.7, 0.6, 0.5, 0.4, 0.3, 0.25,
];

/// Per-level cost model: base + level + dummy + noise components.
pub fn privacy_cost(level: u8, dummies: usize, noise: f64) -> f64 {
    0.001 + 0.01 * level as f64 + 0.0005 * dummies as f64 + 0.01 * noise
}

/// Noise magnitude for a privacy level: 0.01 * L * configured.
fn calc_noise(level: u8, configured: f64) -> f64 {
    0.01 * level as f64 * configured
}

/// Applies privacy transformations in place on a parsed query.
pub struct PrivacyTransformer {
    cfg: PipelineConfig,
}

impl PrivacyTransformer {
    pub fn new(cfg: PipelineConfig) -> Self {
        Self { cfg }
    }

    /// Transform a query according to its privacy level. Returns the number
    /// of dummy queries generated.
    pub fn transform(&self, query: &mut Query) -> usize {
        let level = query.privacy_level;
        let mut rng = rand::thread_rng();

        // Level >= 2: normalization plus noise-term suffix.
        if level >= 2 {
            let mut obfuscated = query.raw.trim().to_lowercase();
            let noise_terms = (level - 2) as usize;
            for term in NOISE_DICTIONARY.choose_multiple(&mut rng, noise_terms) {
                obfuscated.push(' ');
                obfuscated.push_str(term);
            }
            query.obfuscated = obfuscated;
        } else {
            query.obfuscated = query.raw.clone();
        }

        // Level >= 3: dummy queries.
        if level >= 3 {
            query.dummy_queries = self.generate_dummies(&mut rng);
        }

        // Level >= 4: relevance noise and timing obfuscation.
        if level >= 4 {
            query.noise_level = calc_noise(level, self.cfg.noise_level);
            query.timing_delay = self.timing_delay(level, &mut rng);
        }

        query.k_anonymity_group = self.k_anonymity_group(query, &mut rng);
        query.privacy_cost = privacy_cost(level, query.dummy_queries.len(), query.noise_level);
        query.dummy_queries.len()
    }

    /// Dummy queries drawn from the dictionary: single terms and two-term
    /// phrases, `dummy_query_count` of them.
    fn generate_dummies(&self, rng: &mut impl Rng) -> Vec<String> {
        (0..self.cfg.dummy_query_count)
            .map(|_| {
                let first = NOISE_DICTIONARY.choose(rng).expect("dictionary is non-empty");
                if rng.gen_bool(0.5) {
                    let second = NOISE_DICTIONARY.choose(rng).expect("dictionary is non-empty");
                    format!("{first} {second}")
                } else {
                    (*first).to_string()
                }
            })
            .collect()
    }

    /// base_delay[L] + U(0, random_range), scaled by the current hour's
    /// traffic factor.
    fn timing_delay(&self, level: u8, rng: &mut impl Rng) -> Duration {
        let base = self.cfg.base_delay_ms[(level as usize - 1).min(4)];
        let jitter = if self.cfg.random_delay_range_ms > 0 {
            rng.gen_range(0..self.cfg.random_delay_range_ms)
        } else {
            0
        };
        let hour = chrono::Utc::now().format("%H").to_string().parse::<usize>().unwrap_or(12);
        let factor = TRAFFIC_FACTORS[hour % 24];
        Duration::from_millis(((base + jitter) as f64 * factor).round() as u64)
    }

    /// Build an indistinguishability cohort of at least `k_anonymity`
    /// members: the real query, its dummies, and dictionary filler.
    fn k_anonymity_group(&self, query: &Query, rng: &mut impl Rng) -> Vec<String> {
        let mut group = vec![query.obfuscated.clone()];
        group.extend(query.dummy_queries.iter().cloned());
        while group.len() < self.cfg.k_anonymity {
            let filler = NOISE_DICTIONARY.choose(rng).expect("dictionary is non-empty");
            group.push((*filler).to_string());
        }
        group.shuffle(rng);
        group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryParser;
    use crate::types::SearchOptions;

    fn query_at_level(level: u8) -> Query {
        let opts = SearchOptions { privacy_level: Some(level), ..Default::default() };
        QueryParser::new(&PipelineConfig::default())
            .parse("Confidential Document", &opts, "sess-t")
            .unwrap()
    }

    fn transformer() -> PrivacyTransformer {
        PrivacyTransformer::new(PipelineConfig::default())
    }

    #[test]
    fn level_one_leaves_query_untouched() {
        let mut q = query_at_level(1);
        transformer().transform(&mut q);
        assert_eq!(q.obfuscated, "Confidential Document");
        assert!(q.dummy_queries.is_empty());
        assert_eq!(q.noise_level, 0.0);
        assert_eq!(q.timing_delay, Duration::ZERO);
    }

    #[test]
    fn level_two_normalizes() {
        let mut q = query_at_level(2);
        transformer().transform(&mut q);
        assert_eq!(q.obfuscated, "confidential document");
    }

    #[test]
    fn level_three_adds_noise_terms_and_dummies() {
        let mut q = query_at_level(3);
        transformer().transform(&mut q);
        // One noise term appended at level 3 (level - 2).
        assert_eq!(q.obfuscated.split_whitespace().count(), 3);
        assert!(q.obfuscated.starts_with("confidential document"));
        assert_eq!(q.dummy_queries.len(), PipelineConfig::default().dummy_query_count);
    }

    #[test]
    fn level_four_attaches_noise_and_delay() {
        let mut q = query_at_level(4);
        transformer().transform(&mut q);
        assert!(q.noise_level > 0.0);
        assert!(q.timing_delay > Duration::ZERO);
        // calc_noise(4, 1.0) = 0.04.
        assert!((q.noise_level - 0.04).abs() < 1e-12);
    }

    #[test]
    fn k_anonymity_group_has_floor_size() {
        let mut q = query_at_level(2);
        transformer().transform(&mut q);
        assert!(q.k_anonymity_group.len() >= PipelineConfig::default().k_anonymity);
        assert!(q.k_anonymity_group.contains(&q.obfuscated));
    }

    #[test]
    fn cost_model_matches_formula() {
        let cost = privacy_cost(4, 3, 0.04);
        assert!((cost - (0.001 + 0.04 + 0.0015 + 0.0004)).abs() < 1e-12);
    }

    #[test]
    fn cost_rises_with_level() {
        let mut low = query_at_level(1);
        let mut high = query_at_level(5);
        let t = transformer();
        t.transform(&mut low);
        t.transform(&mut high);
        assert!(high.privacy_cost > low.privacy_cost);
    }

    #[test]
    fn dummies_come_from_the_dictionary() {
        let mut q = query_at_level(5);
        transformer().transform(&mut q);
        for dummy in &q.dummy_queries {
            for word in dummy.split_whitespace() {
                assert!(NOISE_DICTIONARY.contains(&word), "unexpected dummy term {word}");
            }
        }
    }

    #[test]
    fn traffic_factors_are_bounded() {
        for f in TRAFFIC_FACTORS {
            assert!((0.1..=1.0).contains(&f));
        }
    }
}
