use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fleet_contracts::{ActivityLevel, HealthState, Node};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetRow {
    pub node: Node,
    pub health: HealthState,
    pub activity: ActivityLevel,
}

/// Operator-facing snapshot. `hot_count` and `alert_count` cover the whole
/// input set, not just the filtered rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetView {
    pub rows: Vec<FleetRow>,
    pub hot_count: u32,
    pub alert_count: u32,
}

/// Point-in-time projection over the registry's active nodes, recomputed on
/// every call. `filter_text` matches case-insensitively against session
/// name, event name, topic and join code; empty matches everything.
/// `health_filter = None` passes all buckets.
pub fn fleet_view(
    nodes: &[Node],
    filter_text: &str,
    health_filter: Option<HealthState>,
    now: DateTime<Utc>,
) -> FleetView {
    let needle = filter_text.trim().to_lowercase();
    let mut rows = Vec::new();
    let mut hot_count = 0;
    let mut alert_count = 0;

    for node in nodes {
        let health = node.health(now);
        let activity = node.activity(now);
        if activity == ActivityLevel::High {
            hot_count += 1;
        }
        if health != HealthState::Healthy {
            alert_count += 1;
        }

        if !needle.is_empty() && !matches_filter(node, &needle) {
            continue;
        }
        if let Some(wanted) = health_filter {
            if health != wanted {
                continue;
            }
        }
        rows.push(FleetRow {
            node: node.clone(),
            health,
            activity,
        });
    }

    // Stable order for a given input set.
    rows.sort_by_key(|row| row.node.node_id);

    FleetView {
        rows,
        hot_count,
        alert_count,
    }
}

fn matches_filter(node: &Node, needle: &str) -> bool {
    node.session_name.to_lowercase().contains(needle)
        || node.event_name.to_lowercase().contains(needle)
        || node.topic.to_lowercase().contains(needle)
        || node.join_code.to_lowercase().contains(needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet_contracts::NodeStatus;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_756_000_000, 0).single().expect("valid timestamp")
    }

    fn node(node_id: i64, topic: &str, audio_secs_ago: Option<i64>, activity_secs_ago: Option<i64>) -> Node {
        Node {
            node_id,
            session_id: 7,
            session_name: "Morning Breakouts".to_string(),
            event_name: "Leadership Summit".to_string(),
            topic: topic.to_string(),
            join_code: format!("JC{node_id:04}"),
            status: NodeStatus::Active,
            last_activity_at: activity_secs_ago.map(|s| now() - Duration::seconds(s)),
            last_audio_at: audio_secs_ago.map(|s| now() - Duration::seconds(s)),
            last_transcript_at: None,
            last_summary_at: None,
        }
    }

    #[test]
    fn empty_filter_returns_every_node() {
        let nodes = vec![node(1, "budget", Some(10), Some(10)), node(2, "hiring", None, None)];
        let view = fleet_view(&nodes, "", None, now());
        assert_eq!(view.rows.len(), 2);
    }

    #[test]
    fn text_filter_matches_any_field_case_insensitively() {
        let nodes = vec![node(1, "Budget Review", Some(10), Some(10)), node(2, "hiring", Some(10), Some(10))];
        assert_eq!(fleet_view(&nodes, "BUDGET", None, now()).rows.len(), 1);
        assert_eq!(fleet_view(&nodes, "summit", None, now()).rows.len(), 2);
        assert_eq!(fleet_view(&nodes, "jc0002", None, now()).rows.len(), 1);
        assert_eq!(fleet_view(&nodes, "no-such-table", None, now()).rows.len(), 0);
    }

    #[test]
    fn health_filter_uses_audio_with_activity_fallback() {
        let fresh_audio = node(1, "a", Some(30), Some(30));
        let stale_audio = node(2, "b", Some(200), Some(10));
        let no_audio_fresh_activity = node(3, "c", None, Some(30));

        let nodes = vec![fresh_audio, stale_audio, no_audio_fresh_activity];

        let healthy = fleet_view(&nodes, "", Some(HealthState::Healthy), now());
        let ids: Vec<i64> = healthy.rows.iter().map(|r| r.node.node_id).collect();
        assert_eq!(ids, vec![1, 3]);

        let offline = fleet_view(&nodes, "", Some(HealthState::Offline), now());
        let ids: Vec<i64> = offline.rows.iter().map(|r| r.node.node_id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn counts_cover_the_whole_fleet_regardless_of_filters() {
        let nodes = vec![
            node(1, "hot and healthy", Some(30), Some(30)),
            node(2, "quiet and degraded", Some(90), Some(900)),
            node(3, "silent", None, None),
        ];
        let view = fleet_view(&nodes, "silent", Some(HealthState::Offline), now());
        assert_eq!(view.rows.len(), 1);
        assert_eq!(view.hot_count, 1);
        assert_eq!(view.alert_count, 2);
    }

    #[test]
    fn rows_come_back_ordered_by_node_id() {
        let nodes = vec![node(9, "z", Some(5), Some(5)), node(2, "a", Some(5), Some(5)), node(5, "m", Some(5), Some(5))];
        let view = fleet_view(&nodes, "", None, now());
        let ids: Vec<i64> = view.rows.iter().map(|r| r.node.node_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }
}
