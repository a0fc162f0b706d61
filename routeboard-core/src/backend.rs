//! Bundle of port implementations a dispatch session talks to.

use std::sync::Arc;

use crate::config::DispatchConfig;
use crate::optimizer::RouteOptimizer;
use crate::ports::{
    AssignmentPort, DispatchDataPort, LiveSnapshotPort, RouteOptimizationPort, UrlExpansionPort,
};

/// Collection of ports implementing one dispatch backend.
#[derive(Clone)]
pub struct DispatchBackend {
    /// Source of orders, couriers and the depot.
    pub data: Arc<dyn DispatchDataPort>,
    /// Sink for saved assignments.
    pub assignments: Arc<dyn AssignmentPort>,
    /// Short link expansion.
    pub expander: Arc<dyn UrlExpansionPort>,
    /// Remote routing service; `None` uses the local heuristic only.
    pub optimizer: Option<Arc<dyn RouteOptimizationPort>>,
    /// Live courier and client positions.
    pub live: Arc<dyn LiveSnapshotPort>,
}

impl DispatchBackend {
    /// Route optimizer for this backend, falling back to the heuristic at the configured speed.
    #[must_use]
    pub fn route_optimizer(&self, config: &DispatchConfig) -> RouteOptimizer {
        match &self.optimizer {
            Some(port) => RouteOptimizer::with_remote(Arc::clone(port), config.average_speed_kmh),
            None => RouteOptimizer::local_only(config.average_speed_kmh),
        }
    }
}
