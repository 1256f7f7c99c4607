pub mod fleet_contracts;
pub mod fleet_view;

pub use fleet_contracts::{
    classify_activity, classify_health, generate_join_code, ActivityLevel, Delivery, FleetError,
    HealthState, Node, NodeStatus, Nudge, NudgePriority, NudgeStats, RateLimitPolicy,
    SignalChannel,
};
pub use fleet_view::{fleet_view, FleetRow, FleetView};
