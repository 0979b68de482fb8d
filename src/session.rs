//! Privacy sessions: lifecycle, per-session budget, behavior analysis, and
//! the security monitor.
//!
//! Sessions are created on first request, extended on activity when
//! configured, and expire at their wall-clock deadline or after an
//! inactivity window. The security monitor turns recorded events into a
//! threat level with fixed response actions per level.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::types::{QueryType, SessionConfig, RECENT_QUERY_RING};

/// Total privacy budget issued to a new session.
pub const SESSION_BUDGET_TOTAL: f64 = 10.0;

/// Privacy cap applied by the `LimitPrivacyLevel` response action.
const LIMITED_PRIVACY_LEVEL: u8 = 3;

/// TTL divisor applied by the `ReduceTtl` response action.
const REDUCED_TTL_DIVISOR: u32 = 4;

// ---------------------------------------------------------------------------
// Threat model
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseAction {
    Log,
    Warn,
    LimitPrivacyLevel,
    ReduceTtl,
    BlockSession,
    Escalate,
}

/// Default response actions per threat level.
pub fn actions_for(level: ThreatLevel) -> &'static [ResponseAction] {
    match level {
        ThreatLevel::None => &[],
        ThreatLevel::Low => &[ResponseAction::Log],
        ThreatLevel::Medium => &[ResponseAction::Log, ResponseAction::Warn],
        ThreatLevel::High => &[
            ResponseAction::Log,
            ResponseAction::LimitPrivacyLevel,
            ResponseAction::ReduceTtl,
        ],
        ThreatLevel::Critical => {
            &[ResponseAction::Log, ResponseAction::BlockSession, ResponseAction::Escalate]
        }
    }
}

/// One recorded security event.
#[derive(Clone, Debug, Serialize)]
pub struct SecurityEvent {
    pub rule: String,
    pub severity: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Ring entry: no raw query strings, only shape.
#[derive(Clone, Debug)]
pub struct RecentQuery {
    pub query_type: QueryType,
    pub privacy_level: u8,
    pub at: Instant,
    pub success: bool,
}

/// Interarrival statistics used by the behavior analyzer.
#[derive(Clone, Debug, Default)]
pub struct BehaviorProfile {
    pub avg_interarrival_secs: f64,
    pub samples: u64,
}

/// One privacy session.
pub struct Session {
    pub session_id: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub expires_at: Instant,
    pub budget_total: f64,
    pub budget_used: f64,
    pub query_count: u64,
    pub queries_by_type: HashMap<QueryType, u64>,
    pub queries_by_privacy_level: HashMap<u8, u64>,
    pub recent_queries: VecDeque<RecentQuery>,
    pub behavior: BehaviorProfile,
    pub security_events: Vec<SecurityEvent>,
    pub threat_level: ThreatLevel,
    pub blocked: bool,
    /// Cap imposed by the `LimitPrivacyLevel` action; `None` means uncapped.
    pub privacy_cap: Option<u8>,
}

impl Session {
    fn new(session_id: String, user_id: Option<String>, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            user_id,
            created_at: Utc::now(),
            last_activity: now,
            expires_at: now + ttl,
            budget_total: SESSION_BUDGET_TOTAL,
            budget_used: 0.0,
            query_count: 0,
            queries_by_type: HashMap::new(),
            queries_by_privacy_level: HashMap::new(),
            recent_queries: VecDeque::with_capacity(RECENT_QUERY_RING),
            behavior: BehaviorProfile::default(),
            security_events: Vec::new(),
            threat_level: ThreatLevel::None,
            blocked: false,
            privacy_cap: None,
        }
    }

    fn expired(&self, inactivity: Duration) -> bool {
        let now = Instant::now();
        now >= self.expires_at || now.duration_since(self.last_activity) >= inactivity
    }
}

// ---------------------------------------------------------------------------
// Security monitor
// ---------------------------------------------------------------------------

/// Deterministic threat scoring over a session's recorded events and
/// behavior profile.
fn evaluate_threat(session: &Session) -> ThreatLevel {
    let critical = session.security_events.iter().filter(|e| e.severity == "critical").count();
    let high = session.security_events.iter().filter(|e| e.severity == "high").count();
    let medium = session.security_events.iter().filter(|e| e.severity == "medium").count();

    let mut level = if critical >= 2 {
        ThreatLevel::Critical
    } else if critical == 1 || high >= 3 {
        ThreatLevel::High
    } else if high >= 1 || medium >= 3 {
        ThreatLevel::Medium
    } else if medium >= 1 || !session.security_events.is_empty() {
        ThreatLevel::Low
    } else {
        ThreatLevel::None
    };

    // Sustained sub-100ms cadence reads as scripted traffic.
    if session.behavior.samples >= 10 && session.behavior.avg_interarrival_secs < 0.1 {
        level = level.max(ThreatLevel::Medium);
    }
    level
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub blocked_sessions: usize,
    pub total_created: u64,
    pub total_evicted: u64,
}

/// Owns the session table. Everyone else refers to sessions by ID only.
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    user_index: DashMap<String, Vec<String>>,
    cfg: SessionConfig,
    created: std::sync::atomic::AtomicU64,
    evicted: std::sync::atomic::AtomicU64,
}

impl SessionManager {
    pub fn new(cfg: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            user_index: DashMap::new(),
            cfg,
            created: Default::default(),
            evicted: Default::default(),
        }
    }

    fn generate_id() -> String {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        format!("sess_{}", hex::encode(bytes))
    }

    /// Resolve or create the session for a request. A supplied ID is reused
    /// when live and adopted when unknown (callers key their budgets and
    /// rate windows on it); absent IDs get a generated `sess_` id.
    pub fn get_or_create(&self, requested: Option<&str>, user_id: Option<&str>) -> String {
        if let Some(id) = requested {
            if let Some(mut session) = self.sessions.get_mut(id) {
                if !session.expired(Duration::from_secs(self.cfg.inactivity_timeout_secs)) {
                    session.last_activity = Instant::now();
                    if self.cfg.extend_on_activity {
                        session.expires_at =
                            Instant::now() + Duration::from_secs(self.cfg.session_ttl_secs);
                    }
                    return id.to_string();
                }
            }
        }

        let id = match requested {
            Some(explicit) if !explicit.is_empty() => explicit.to_string(),
            _ => Self::generate_id(),
        };
        self.enforce_user_cap(user_id);
        self.enforce_global_cap();
        let session = Session::new(
            id.clone(),
            user_id.map(str::to_string),
            Duration::from_secs(self.cfg.session_ttl_secs),
        );
        if let Some(user) = user_id {
            let mut ids = self.user_index.entry(user.to_string()).or_default();
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
        }
        self.sessions.insert(id.clone(), session);
        self.created.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        id
    }

    /// Oldest-inactive-wins eviction for one user's sessions.
    fn enforce_user_cap(&self, user_id: Option<&str>) {
        let Some(user) = user_id else { return };
        let Some(ids) = self.user_index.get(user).map(|v| v.clone()) else { return };
        let mut live: Vec<(String, Instant)> = Vec::new();
        for id in ids {
            if let Some(session) = self.sessions.get(&id) {
                let at = session.last_activity;
                drop(session);
                live.push((id, at));
            }
        }
        if live.len() < self.cfg.max_sessions_per_user {
            return;
        }
        if let Some((oldest, _)) = live.into_iter().min_by_key(|(_, at)| *at) {
            self.evict(&oldest);
        }
    }

    /// Oldest-inactive-wins eviction at the process scope.
    fn enforce_global_cap(&self) {
        if self.sessions.len() < self.cfg.max_active_sessions {
            return;
        }
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|e| e.last_activity)
            .map(|e| e.session_id.clone());
        if let Some(id) = oldest {
            self.evict(&id);
        }
    }

    fn evict(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            if let Some(user) = &session.user_id {
                if let Some(mut ids) = self.user_index.get_mut(user) {
                    ids.retain(|sid| sid != id);
                }
            }
            self.evicted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Record a query against a session: activity refresh, counters, the
    /// recent ring, and the behavior profile.
    pub fn record_query(&self, id: &str, query_type: QueryType, privacy_level: u8, success: bool) {
        let Some(mut session) = self.sessions.get_mut(id) else { return };
        let now = Instant::now();
        let gap = now.duration_since(session.last_activity).as_secs_f64();

        session.query_count += 1;
        *session.queries_by_type.entry(query_type).or_insert(0) += 1;
        *session.queries_by_privacy_level.entry(privacy_level).or_insert(0) += 1;
        session.recent_queries.push_back(RecentQuery { query_type, privacy_level, at: now, success });
        while session.recent_queries.len() > RECENT_QUERY_RING {
            session.recent_queries.pop_front();
        }

        let profile = &mut session.behavior;
        profile.samples += 1;
        if profile.samples == 1 {
            profile.avg_interarrival_secs = gap;
        } else {
            profile.avg_interarrival_secs += 0.2 * (gap - profile.avg_interarrival_secs);
        }

        session.last_activity = now;
        if self.cfg.extend_on_activity {
            session.expires_at = now + Duration::from_secs(self.cfg.session_ttl_secs);
        }

        let threat = evaluate_threat(&session);
        if threat != session.threat_level {
            session.threat_level = threat;
            drop(session);
            self.apply_actions(id, threat);
        }
    }

    /// Record a security event and re-run the monitor.
    pub fn record_security_event(&self, id: &str, rule: &str, severity: &str, detail: &str) {
        let threat = {
            let Some(mut session) = self.sessions.get_mut(id) else { return };
            session.security_events.push(SecurityEvent {
                rule: rule.to_string(),
                severity: severity.to_string(),
                detail: detail.to_string(),
                at: Utc::now(),
            });
            let threat = evaluate_threat(&session);
            session.threat_level = threat;
            threat
        };
        self.apply_actions(id, threat);
    }

    fn apply_actions(&self, id: &str, threat: ThreatLevel) {
        for action in actions_for(threat) {
            match action {
                ResponseAction::Log => {
                    warn!(session = id, threat = ?threat, "session threat level changed");
                }
                ResponseAction::Warn => {
                    warn!(session = id, "session flagged for suspicious activity");
                }
                ResponseAction::LimitPrivacyLevel => {
                    if let Some(mut s) = self.sessions.get_mut(id) {
                        s.privacy_cap = Some(LIMITED_PRIVACY_LEVEL);
                    }
                }
                ResponseAction::ReduceTtl => {
                    if let Some(mut s) = self.sessions.get_mut(id) {
                        let remaining = s.expires_at.saturating_duration_since(Instant::now());
                        s.expires_at = Instant::now() + remaining / REDUCED_TTL_DIVISOR;
                    }
                }
                ResponseAction::BlockSession => {
                    if let Some(mut s) = self.sessions.get_mut(id) {
                        s.blocked = true;
                    }
                }
                ResponseAction::Escalate => {
                    error!(session = id, "critical threat escalated");
                }
            }
        }
    }

    /// Debit the session budget. Returns false (without debiting) when the
    /// remaining budget cannot cover the cost.
    pub fn consume_budget(&self, id: &str, cost: f64) -> bool {
        let Some(mut session) = self.sessions.get_mut(id) else { return false };
        if session.budget_used + cost > session.budget_total {
            return false;
        }
        session.budget_used += cost;
        true
    }

    pub fn budget_remaining(&self, id: &str) -> f64 {
        self.sessions.get(id).map(|s| s.budget_total - s.budget_used).unwrap_or(0.0)
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.sessions.get(id).map(|s| s.blocked).unwrap_or(false)
    }

    /// The privacy level a session is allowed to use, after any monitor cap.
    pub fn effective_privacy_level(&self, id: &str, requested: u8) -> u8 {
        match self.sessions.get(id).and_then(|s| s.privacy_cap) {
            Some(cap) => requested.min(cap),
            None => requested,
        }
    }

    pub fn threat_level(&self, id: &str) -> ThreatLevel {
        self.sessions.get(id).map(|s| s.threat_level).unwrap_or(ThreatLevel::None)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Remove expired sessions. Returns the number pruned.
    pub fn prune_expired(&self) -> usize {
        let inactivity = Duration::from_secs(self.cfg.inactivity_timeout_secs);
        let before = self.sessions.len();
        let dead: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.expired(inactivity))
            .map(|s| s.session_id.clone())
            .collect();
        for id in dead {
            self.evict(&id);
        }
        before - self.sessions.len()
    }

    /// Drop every session.
    pub fn clear(&self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        self.user_index.clear();
        count
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active_sessions: self.sessions.len(),
            blocked_sessions: self.sessions.iter().filter(|s| s.blocked).count(),
            total_created: self.created.load(std::sync::atomic::Ordering::Relaxed),
            total_evicted: self.evicted.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}
