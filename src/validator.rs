//! Query validation: structural limits, a hard-coded security screen,
//! multi-window rate limiting, and behavioral anomaly detection.
//!
//! The validator never executes anything; it emits a structured report and
//! the engine decides how to respond. Rate and security blocks always win
//! over warnings.

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::types::{PipelineConfig, Query, RateLimitConfig, MAX_QUERY_LENGTH, MAX_TERMS_PER_QUERY};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssueAction {
    Log,
    Warn,
    Block,
    Escalate,
}

/// One matched security rule.
#[derive(Clone, Debug)]
pub struct SecurityIssue {
    pub rule: &'static str,
    pub severity: Severity,
    pub action: IssueAction,
    pub detail: String,
}

/// Structured validation outcome.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub blocked: bool,
    /// A rate window (not a security rule) caused the block.
    pub rate_limited: bool,
    pub warnings: Vec<String>,
    pub issues: Vec<SecurityIssue>,
}

// ---------------------------------------------------------------------------
// Security screen
// ---------------------------------------------------------------------------

struct SecurityRule {
    name: &'static str,
    pattern: Regex,
    severity: Severity,
    action: IssueAction,
}

fn build_rules() -> Vec<SecurityRule> {
    let rule = |name, pattern: &str, severity, action| SecurityRule {
        name,
        pattern: RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("security rule patterns are static"),
        severity,
        action,
    };
    vec![
        rule(
            "SQL_INJECTION",
            r"\b(select|insert|update|delete|drop|union)\b.*\b(from|into|table|where|values)\b|('|\x22)\s*or\s*('|\x22)?1('|\x22)?\s*=\s*('|\x22)?1",
            Severity::Critical,
            IssueAction::Block,
        ),
        rule(
            "PATH_TRAVERSAL",
            r"\.\./|\.\.\\|%2e%2e",
            Severity::High,
            IssueAction::Block,
        ),
        rule(
            "SCRIPT_INJECTION",
            r"<script|javascript:|\bon(load|error|click|mouseover)\s*=",
            Severity::Critical,
            IssueAction::Block,
        ),
        rule(
            "CREDENTIAL_EXFILTRATION",
            r"\b(password|passwd|secret|api[_-]?key|private[_-]?key|token)\b\s*[:=]",
            Severity::High,
            IssueAction::Block,
        ),
        rule(
            "PII_PATTERN",
            r"\b\d{3}-\d{2}-\d{4}\b|\b(?:\d[ -]?){13,16}\b",
            Severity::High,
            IssueAction::Escalate,
        ),
        rule(
            "EXCESSIVE_WILDCARDS",
            r"(\*.*){4,}|(%.*){4,}|(\?.*){6,}",
            Severity::Medium,
            IssueAction::Warn,
        ),
    ]
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

struct Window {
    started: Instant,
    count: u32,
}

impl Window {
    fn hit(&mut self, span: Duration, limit: u32, now: Instant) -> bool {
        if now.duration_since(self.started) >= span {
            self.started = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= limit
    }
}

struct RateState {
    minute: Window,
    hour: Window,
    day: Window,
    /// Token bucket for short bursts.
    tokens: f64,
    last_refill: Instant,
}

/// Minute/hour/day windows plus a burst token bucket, keyed per session.
pub struct RateLimiter {
    states: DashMap<String, RateState>,
    cfg: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self { states: DashMap::new(), cfg }
    }

    /// Count one request against the key. Returns the violated window name,
    /// if any.
    pub fn check(&self, key: &str) -> Option<&'static str> {
        let now = Instant::now();
        let mut state = self.states.entry(key.to_string()).or_insert_with(|| RateState {
            minute: Window { started: now, count: 0 },
            hour: Window { started: now, count: 0 },
            day: Window { started: now, count: 0 },
            tokens: self.cfg.burst as f64,
            last_refill: now,
        });

        // Refill burst tokens at the sustained per-minute rate.
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens =
            (state.tokens + elapsed * self.cfg.per_minute as f64 / 60.0).min(self.cfg.burst as f64);
        state.last_refill = now;
        if state.tokens < 1.0 {
            return Some("burst");
        }
        state.tokens -= 1.0;

        if !state.minute.hit(Duration::from_secs(60), self.cfg.per_minute, now) {
            return Some("minute");
        }
        if !state.hour.hit(Duration::from_secs(3600), self.cfg.per_hour, now) {
            return Some("hour");
        }
        if !state.day.hit(Duration::from_secs(86_400), self.cfg.per_day, now) {
            return Some("day");
        }
        None
    }

    /// Drop counters for dead sessions.
    pub fn retain(&self, live: &dyn Fn(&str) -> bool) {
        self.states.retain(|k, _| live(k));
    }
}

// ---------------------------------------------------------------------------
// Automation and anomaly detection
// ---------------------------------------------------------------------------

const AUTOMATION_SAMPLES: usize = 10;
const AUTOMATION_MIN_GAPS: usize = 5;
/// Coefficient of variation below this reads as machine-regular timing.
const AUTOMATION_CV_THRESHOLD: f64 = 0.05;

struct AutomationDetector {
    arrivals: DashMap<String, VecDeque<Instant>>,
}

impl AutomationDetector {
    fn new() -> Self {
        Self { arrivals: DashMap::new() }
    }

    /// Record an arrival and flag suspiciously regular interarrival gaps.
    fn observe(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut ring = self.arrivals.entry(key.to_string()).or_default();
        ring.push_back(now);
        while ring.len() > AUTOMATION_SAMPLES {
            ring.pop_front();
        }
        if ring.len() < AUTOMATION_MIN_GAPS + 1 {
            return false;
        }
        let gaps: Vec<f64> = ring
            .iter()
            .zip(ring.iter().skip(1))
            .map(|(a, b)| b.duration_since(*a).as_secs_f64())
            .collect();
        let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
        if mean <= f64::EPSILON {
            return false;
        }
        let variance =
            gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
        (variance.sqrt() / mean) < AUTOMATION_CV_THRESHOLD
    }
}

/// Slowly-updated exponential baseline of query shape.
struct AnomalyBaseline {
    avg_len: f64,
    avg_terms: f64,
    samples: u64,
}

const BASELINE_ALPHA: f64 = 0.05;
const BASELINE_WARMUP: u64 = 20;

struct AnomalyDetector {
    baseline: RwLock<AnomalyBaseline>,
}

impl AnomalyDetector {
    fn new() -> Self {
        Self { baseline: RwLock::new(AnomalyBaseline { avg_len: 0.0, avg_terms: 0.0, samples: 0 }) }
    }

    fn observe(&self, query: &str) -> Vec<String> {
        let len = query.chars().count() as f64;
        let terms = query.split_whitespace().count() as f64;
        let mut warnings = Vec::new();

        let mut baseline = self.baseline.write().unwrap_or_else(|p| p.into_inner());
        if baseline.samples >= BASELINE_WARMUP {
            if len > 3.0 * baseline.avg_len.max(1.0) {
                warnings.push(format!(
                    "query length {len} is far above the baseline {:.1}",
                    baseline.avg_len
                ));
            }
            if terms > 3.0 * baseline.avg_terms.max(1.0) {
                warnings.push(format!(
                    "term count {terms} is far above the baseline {:.1}",
                    baseline.avg_terms
                ));
            }
        }
        let symbolic =
            query.chars().filter(|c| !c.is_alphanumeric() && !c.is_whitespace()).count() as f64;
        if len > 8.0 && symbolic / len > 0.5 {
            warnings.push("query is mostly non-alphanumeric".to_string());
        }

        baseline.samples += 1;
        if baseline.samples == 1 {
            baseline.avg_len = len;
            baseline.avg_terms = terms;
        } else {
            baseline.avg_len += BASELINE_ALPHA * (len - baseline.avg_len);
            baseline.avg_terms += BASELINE_ALPHA * (terms - baseline.avg_terms);
        }
        warnings
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Full validation pass over a parsed query.
pub struct QueryValidator {
    rules: Vec<SecurityRule>,
    limiter: RateLimiter,
    automation: AutomationDetector,
    anomalies: AnomalyDetector,
    require_privacy_level: u8,
}

impl QueryValidator {
    pub fn new(pipeline: &PipelineConfig, rate: RateLimitConfig) -> Self {
        Self {
            rules: build_rules(),
            limiter: RateLimiter::new(rate),
            automation: AutomationDetector::new(),
            anomalies: AnomalyDetector::new(),
            require_privacy_level: pipeline.require_privacy_level,
        }
    }

    /// Validate a query and produce the structured report. Block conditions:
    /// any rate violation, any issue with a block action or critical
    /// severity, or two or more high-severity issues.
    pub fn validate(&self, query: &Query) -> ValidationReport {
        let mut report = ValidationReport { valid: true, ..ValidationReport::default() };
        let text = query.raw.trim();

        // Structural limits.
        if text.is_empty() {
            report.valid = false;
            report.warnings.push("empty query".to_string());
            return report;
        }
        if text.len() > MAX_QUERY_LENGTH {
            report.valid = false;
            report.warnings.push(format!(
                "query length {} exceeds maximum {MAX_QUERY_LENGTH}",
                text.len()
            ));
        }
        if text.split_whitespace().count() > MAX_TERMS_PER_QUERY {
            report.valid = false;
            report
                .warnings
                .push(format!("more than {MAX_TERMS_PER_QUERY} terms"));
        }
        if query.privacy_level < self.require_privacy_level {
            report.valid = false;
            report.warnings.push(format!(
                "privacy level {} below required {}",
                query.privacy_level, self.require_privacy_level
            ));
        }

        // Security screen.
        for rule in &self.rules {
            if rule.pattern.is_match(text) {
                report.issues.push(SecurityIssue {
                    rule: rule.name,
                    severity: rule.severity,
                    action: rule.action,
                    detail: format!("query matched {}", rule.name),
                });
            }
        }

        // Rate windows.
        if let Some(window) = self.limiter.check(&query.session_id) {
            report.rate_limited = true;
            report.issues.push(SecurityIssue {
                rule: "RATE_LIMIT",
                severity: Severity::High,
                action: IssueAction::Block,
                detail: format!("{window} window exceeded"),
            });
        }

        // Behavioral detectors.
        if self.automation.observe(&query.session_id) {
            report.issues.push(SecurityIssue {
                rule: "AUTOMATION_PATTERN",
                severity: Severity::Medium,
                action: IssueAction::Warn,
                detail: "machine-regular request timing".to_string(),
            });
        }
        report.warnings.extend(self.anomalies.observe(text));

        let high_issues =
            report.issues.iter().filter(|i| i.severity >= Severity::High).count();
        let hard_block = report.issues.iter().any(|i| {
            i.action == IssueAction::Block || i.severity >= Severity::Critical
        });
        report.blocked = report.rate_limited || hard_block || high_issues >= 2;
        if !report.issues.is_empty() || report.blocked {
            report.valid = false;
        }
        if report.blocked {
            debug!(
                session = query.session_id.as_str(),
                issues = report.issues.len(),
                "query blocked by validator"
            );
        }
        report
    }

    /// Drop per-session limiter state for dead sessions.
    pub fn retain_sessions(&self, live: &dyn Fn(&str) -> bool) {
        self.limiter.retain(live);
        self.automation.arrivals.retain(|k, _| live(k));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QueryType, SearchOptions};
    use crate::query::QueryParser;

    fn validator() -> QueryValidator {
        QueryValidator::new(&PipelineConfig::default(), RateLimitConfig::default())
    }

    fn query(raw: &str) -> Query {
        QueryParser::new(&PipelineConfig::default())
            .parse(raw, &SearchOptions::default(), "sess-val")
            .unwrap()
    }

    #[test]
    fn sql_injection_is_blocked() {
        let report = validator().validate(&query("SELECT * FROM users WHERE password='1'"));
        assert!(!report.valid);
        assert!(report.blocked);
        assert!(report.issues.iter().any(|i| i.rule == "SQL_INJECTION"));
    }

    #[test]
    fn path_traversal_is_blocked() {
        let report = validator().validate(&query("../../etc/passwd"));
        assert!(report.blocked);
        assert!(report.issues.iter().any(|i| i.rule == "PATH_TRAVERSAL"));
    }

    #[test]
    fn script_injection_is_blocked() {
        let report = validator().validate(&query("<script>alert(1)</script>"));
        assert!(report.blocked);
        assert!(report.issues.iter().any(|i| i.rule == "SCRIPT_INJECTION"));
    }

    #[test]
    fn credential_pattern_is_blocked() {
        let report = validator().validate(&query("api_key = sk_live_abcdef"));
        assert!(report.blocked);
        assert!(report.issues.iter().any(|i| i.rule == "CREDENTIAL_EXFILTRATION"));
    }

    #[test]
    fn benign_query_passes() {
        let report = validator().validate(&query("quarterly report 2026"));
        assert!(report.valid, "issues: {:?}, warnings: {:?}", report.issues, report.warnings);
        assert!(!report.blocked);
    }

    #[test]
    fn wildcard_spam_warns_without_blocking() {
        let report = validator().validate(&query("*a*b*c*d*e"));
        assert!(report.issues.iter().any(|i| i.rule == "EXCESSIVE_WILDCARDS"));
        assert!(!report.blocked);
    }

    #[test]
    fn oversized_query_is_invalid() {
        let long = "x".repeat(MAX_QUERY_LENGTH + 1);
        let mut q = query("placeholder");
        q.raw = long;
        let report = validator().validate(&q);
        assert!(!report.valid);
    }

    #[test]
    fn too_many_terms_is_invalid() {
        let raw = vec!["term"; MAX_TERMS_PER_QUERY + 1].join(" ");
        let report = validator().validate(&query(&raw));
        assert!(!report.valid);
    }

    #[test]
    fn privacy_floor_is_enforced() {
        let mut pipeline = PipelineConfig::default();
        pipeline.require_privacy_level = 3;
        let v = QueryValidator::new(&pipeline, RateLimitConfig::default());
        let mut q = query("doc");
        q.privacy_level = 2;
        let report = v.validate(&q);
        assert!(!report.valid);
    }

    #[test]
    fn burst_limit_trips() {
        let rate = RateLimitConfig { burst: 3, per_minute: 1000, ..RateLimitConfig::default() };
        let v = QueryValidator::new(&PipelineConfig::default(), rate);
        let mut tripped = false;
        for _ in 0..10 {
            let report = v.validate(&query("doc"));
            if report.rate_limited {
                tripped = true;
                break;
            }
        }
        assert!(tripped, "ten immediate requests must exhaust a burst of 3");
    }

    #[test]
    fn minute_window_trips() {
        let rate = RateLimitConfig { per_minute: 5, burst: 100, ..RateLimitConfig::default() };
        let v = QueryValidator::new(&PipelineConfig::default(), rate);
        let mut violations = 0;
        for _ in 0..8 {
            if v.validate(&query("doc")).rate_limited {
                violations += 1;
            }
        }
        assert!(violations >= 3, "requests beyond the minute limit must be rate limited");
    }

    #[test]
    fn query_types_do_not_affect_screening() {
        let mut q = query("DROP TABLE users WHERE 1=1");
        q.query_type = QueryType::Complex;
        assert!(validator().validate(&q).blocked);
    }
}
