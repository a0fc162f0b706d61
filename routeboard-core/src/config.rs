//! Tunables for a dispatch session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Coordinate;

/// Average courier speed used to turn straight-line distance into a duration estimate.
pub const DEFAULT_AVERAGE_SPEED_KMH: f64 = 25.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
/// Engine configuration. Every field has a default, so partial config files are fine.
pub struct DispatchConfig {
    /// Seconds between live position polls.
    pub poll_interval_secs: u64,
    /// Milliseconds to wait for coordinate updates to settle before re-optimizing.
    pub reoptimize_debounce_ms: u64,
    /// Speed used by the heuristic duration estimate.
    pub average_speed_kmh: f64,
    /// Fallback route start when a courier has no live position.
    pub depot: Option<Coordinate>,
    /// Hosts whose links are always shortened and need expansion.
    pub short_link_hosts: Vec<String>,
    /// Number of board snapshots kept for undo.
    pub history_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 6,
            reoptimize_debounce_ms: 800,
            average_speed_kmh: DEFAULT_AVERAGE_SPEED_KMH,
            depot: None,
            short_link_hosts: vec![
                "maps.app.goo.gl".to_owned(),
                "goo.gl".to_owned(),
                "g.co".to_owned(),
                "go.2gis.com".to_owned(),
            ],
            history_limit: 50,
        }
    }
}

impl DispatchConfig {
    /// Live poll period.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Quiet period before a coordinate change triggers re-optimization.
    #[must_use]
    pub fn reoptimize_debounce(&self) -> Duration {
        Duration::from_millis(self.reoptimize_debounce_ms)
    }
}
