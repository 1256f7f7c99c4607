use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Elapsed-time buckets for health classification. Boundaries are inclusive
/// on the healthier side: exactly 60s is still healthy, exactly 180s is
/// still degraded.
const HEALTHY_WITHIN_SECS: i64 = 60;
const DEGRADED_WITHIN_SECS: i64 = 180;

/// Elapsed-time buckets for activity classification, independent from the
/// health thresholds.
const HIGH_ACTIVITY_WITHIN_SECS: i64 = 120;
const MEDIUM_ACTIVITY_WITHIN_SECS: i64 = 300;

#[derive(Debug, Clone, Error)]
pub enum FleetError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("rate limited: node {node_id} has {count} nudges in the current window")]
    RateLimited { node_id: i64, count: u32 },
    #[error("stale write rejected: {0}")]
    StaleWriteRejected(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Inactive,
    Active,
    Completed,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Inactive
    }
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Inactive => "inactive",
            NodeStatus::Active => "active",
            NodeStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "inactive" => Ok(NodeStatus::Inactive),
            "active" => Ok(NodeStatus::Active),
            "completed" => Ok(NodeStatus::Completed),
            other => Err(format!("Unknown node status: {other}")),
        }
    }
}

/// The independent signal types whose staleness is tracked per node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SignalChannel {
    Activity,
    Audio,
    Transcript,
    Summary,
}

impl SignalChannel {
    pub const ALL: [SignalChannel; 4] = [
        SignalChannel::Activity,
        SignalChannel::Audio,
        SignalChannel::Transcript,
        SignalChannel::Summary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalChannel::Activity => "activity",
            SignalChannel::Audio => "audio",
            SignalChannel::Transcript => "transcript",
            SignalChannel::Summary => "summary",
        }
    }
}

impl fmt::Display for SignalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalChannel {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "activity" => Ok(SignalChannel::Activity),
            "audio" => Ok(SignalChannel::Audio),
            "transcript" => Ok(SignalChannel::Transcript),
            "summary" => Ok(SignalChannel::Summary),
            other => Err(format!("Unknown signal channel: {other}")),
        }
    }
}

/// Derived liveness classification. Never stored; recomputed from the
/// stored instants on every read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Offline,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Offline => "offline",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "healthy" => Ok(HealthState::Healthy),
            "degraded" => Ok(HealthState::Degraded),
            "offline" => Ok(HealthState::Offline),
            other => Err(format!("Unknown health state: {other}")),
        }
    }
}

/// Derived engagement classification, computed from the generic-activity
/// channel only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    High,
    Medium,
    Low,
    Inactive,
}

impl ActivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityLevel::High => "high",
            ActivityLevel::Medium => "medium",
            ActivityLevel::Low => "low",
            ActivityLevel::Inactive => "inactive",
        }
    }
}

impl fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NudgePriority {
    Normal,
    Urgent,
}

impl Default for NudgePriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl NudgePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NudgePriority::Normal => "normal",
            NudgePriority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for NudgePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NudgePriority {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "normal" => Ok(NudgePriority::Normal),
            "urgent" => Ok(NudgePriority::Urgent),
            other => Err(format!("Unknown nudge priority: {other}")),
        }
    }
}

/// One discussion table tracked by the fleet monitor. The four `last_*_at`
/// instants are updated independently; once `completed` no further instant
/// updates are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: i64,
    pub session_id: i64,
    pub session_name: String,
    pub event_name: String,
    pub topic: String,
    pub join_code: String,
    pub status: NodeStatus,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_audio_at: Option<DateTime<Utc>>,
    pub last_transcript_at: Option<DateTime<Utc>>,
    pub last_summary_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn last_seen(&self, channel: SignalChannel) -> Option<DateTime<Utc>> {
        match channel {
            SignalChannel::Activity => self.last_activity_at,
            SignalChannel::Audio => self.last_audio_at,
            SignalChannel::Transcript => self.last_transcript_at,
            SignalChannel::Summary => self.last_summary_at,
        }
    }

    /// The instant health is judged from: the audio channel, falling back
    /// to generic activity when audio has never been seen.
    pub fn health_instant(&self) -> Option<DateTime<Utc>> {
        self.last_audio_at.or(self.last_activity_at)
    }

    pub fn health(&self, now: DateTime<Utc>) -> HealthState {
        classify_health(self.health_instant(), now)
    }

    pub fn activity(&self, now: DateTime<Utc>) -> ActivityLevel {
        classify_activity(self.last_activity_at, now)
    }
}

/// One administrator-authored directive targeted at a single node.
/// Broadcasts fan out to one independent `Nudge` per recipient node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nudge {
    pub nudge_id: i64,
    pub node_id: i64,
    pub session_id: i64,
    pub message: String,
    pub priority: NudgePriority,
    pub created_at: DateTime<Utc>,
}

/// Per-recipient tracking row for a nudge. Instants are unset until the
/// stage happens and only ever move forward:
/// `delivered_at <= opened_at <= acknowledged_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub delivery_id: i64,
    pub nudge_id: i64,
    pub recipient_node_id: i64,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NudgeStats {
    pub sent: u32,
    pub delivered: u32,
    pub pending: u32,
    pub opened: u32,
    pub acknowledged: u32,
}

/// Rolling-window nudge rate limit: at most `max_per_window` nudges per
/// node inside `window`. Urgent nudges bypass the check but still count
/// toward the window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_per_window: u32,
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_per_window: 5,
            window: Duration::seconds(60),
        }
    }
}

/// Tri-state liveness from a single last-seen instant. Total and pure;
/// callers must re-evaluate on every read since "now" keeps moving.
pub fn classify_health(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> HealthState {
    let Some(seen) = last_seen else {
        return HealthState::Offline;
    };
    let elapsed = now.signed_duration_since(seen);
    if elapsed <= Duration::seconds(HEALTHY_WITHIN_SECS) {
        HealthState::Healthy
    } else if elapsed <= Duration::seconds(DEGRADED_WITHIN_SECS) {
        HealthState::Degraded
    } else {
        HealthState::Offline
    }
}

/// Four-state engagement level from the generic-activity instant.
pub fn classify_activity(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ActivityLevel {
    let Some(seen) = last_seen else {
        return ActivityLevel::Inactive;
    };
    let elapsed = now.signed_duration_since(seen);
    if elapsed <= Duration::seconds(HIGH_ACTIVITY_WITHIN_SECS) {
        ActivityLevel::High
    } else if elapsed <= Duration::seconds(MEDIUM_ACTIVITY_WITHIN_SECS) {
        ActivityLevel::Medium
    } else {
        ActivityLevel::Low
    }
}

/// Short join code handed to facilitator devices. Uniqueness is per event
/// and checked by the caller.
pub fn generate_join_code() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_756_000_000, 0).single().expect("valid timestamp")
    }

    #[test]
    fn missing_instants_classify_as_offline_and_inactive() {
        assert_eq!(classify_health(None, ts()), HealthState::Offline);
        assert_eq!(classify_activity(None, ts()), ActivityLevel::Inactive);
    }

    #[test]
    fn health_boundaries_are_inclusive_on_the_healthier_bucket() {
        let now = ts();
        let at = |secs: i64| Some(now - Duration::seconds(secs));
        assert_eq!(classify_health(at(0), now), HealthState::Healthy);
        assert_eq!(classify_health(at(60), now), HealthState::Healthy);
        assert_eq!(classify_health(at(61), now), HealthState::Degraded);
        assert_eq!(classify_health(at(180), now), HealthState::Degraded);
        assert_eq!(classify_health(at(181), now), HealthState::Offline);
    }

    #[test]
    fn subsecond_overshoot_falls_into_the_staler_bucket() {
        let now = ts();
        let just_over_60 = Some(now - Duration::milliseconds(60_001));
        let just_over_180 = Some(now - Duration::milliseconds(180_001));
        assert_eq!(classify_health(just_over_60, now), HealthState::Degraded);
        assert_eq!(classify_health(just_over_180, now), HealthState::Offline);
    }

    #[test]
    fn health_only_degrades_as_elapsed_time_grows() {
        let now = ts();
        let rank = |state: HealthState| match state {
            HealthState::Healthy => 0,
            HealthState::Degraded => 1,
            HealthState::Offline => 2,
        };
        let mut previous = 0;
        for secs in [0, 30, 60, 61, 120, 180, 181, 600, 86_400] {
            let state = classify_health(Some(now - Duration::seconds(secs)), now);
            assert!(
                rank(state) >= previous,
                "health went back up at {secs}s: {state}"
            );
            previous = rank(state);
        }
    }

    #[test]
    fn activity_tiers_follow_the_two_and_five_minute_cuts() {
        let now = ts();
        let at = |secs: i64| Some(now - Duration::seconds(secs));
        assert_eq!(classify_activity(at(0), now), ActivityLevel::High);
        // Exact boundaries land in the more active tier, same as health.
        assert_eq!(classify_activity(at(120), now), ActivityLevel::High);
        assert_eq!(classify_activity(at(121), now), ActivityLevel::Medium);
        assert_eq!(classify_activity(at(300), now), ActivityLevel::Medium);
        assert_eq!(classify_activity(at(301), now), ActivityLevel::Low);
        assert_eq!(classify_activity(at(7_200), now), ActivityLevel::Low);
    }

    #[test]
    fn health_instant_prefers_audio_and_falls_back_to_activity() {
        let now = ts();
        let mut node = Node {
            node_id: 1,
            session_id: 1,
            session_name: "Breakout A".to_string(),
            event_name: "Summit".to_string(),
            topic: "Onboarding".to_string(),
            join_code: "AB12CD".to_string(),
            status: NodeStatus::Active,
            last_activity_at: Some(now - Duration::seconds(30)),
            last_audio_at: None,
            last_transcript_at: None,
            last_summary_at: None,
        };
        assert_eq!(node.health_instant(), node.last_activity_at);
        assert_eq!(node.health(now), HealthState::Healthy);

        node.last_audio_at = Some(now - Duration::seconds(200));
        assert_eq!(node.health_instant(), node.last_audio_at);
        assert_eq!(node.health(now), HealthState::Offline);
    }

    #[test]
    fn enum_round_trips_via_from_str() {
        for channel in SignalChannel::ALL {
            assert_eq!(channel.as_str().parse::<SignalChannel>().expect("parse"), channel);
        }
        assert_eq!("Urgent".parse::<NudgePriority>().expect("parse"), NudgePriority::Urgent);
        assert_eq!("completed".parse::<NodeStatus>().expect("parse"), NodeStatus::Completed);
        assert_eq!("degraded".parse::<HealthState>().expect("parse"), HealthState::Degraded);
        assert!("push".parse::<SignalChannel>().is_err());
    }

    #[test]
    fn join_codes_are_short_and_uppercase() {
        let code = generate_join_code();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }
}
