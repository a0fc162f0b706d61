//! Traits describing the network collaborators of the dispatch engine and shared helper types.

use std::future::Future;

use async_trait::async_trait;
use reqwest::Error as ReqwestError;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::model::{
    AssignmentUpdate, ContainerKey, Coordinate, Courier, LiveSnapshot, Order, OrderId, VersionToken,
};

#[derive(thiserror::Error, Debug)]
/// Errors that can occur while talking to backend services.
pub enum PortError {
    /// Network layer failed.
    #[error("Network error: {0}")]
    Network(#[from] ReqwestError),
    /// Backend answered with an unexpected status code.
    #[error("Unexpected status {0}")]
    Status(u16),
    /// Response body could not be interpreted.
    #[error("Decode error: {0}")]
    Decode(String),
    /// Backend rejected the request as a whole.
    #[error("Rejected: {0}")]
    Rejected(String),
    /// The request was aborted by its cancellation token.
    #[error("Request cancelled")]
    Cancelled,
    /// Internal backend error.
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One located stop handed to the routing service.
pub struct RouteStop {
    /// Order delivered at this stop.
    pub order_id: OrderId,
    /// Destination.
    pub coordinate: Coordinate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Routing request for a single container.
pub struct RouteRequest {
    /// Container the stops belong to.
    pub container: ContainerKey,
    /// Where the courier starts, if known.
    pub start: Option<Coordinate>,
    /// Located stops in their current order.
    pub stops: Vec<RouteStop>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Routing answer for a single container.
pub struct OptimizedRoute {
    /// Container the answer belongs to.
    pub container: ContainerKey,
    /// Stops in visiting order.
    pub ordered_ids: Vec<OrderId>,
    /// Road geometry, if supplied.
    pub polyline: Option<Vec<Coordinate>>,
    /// Driving time in seconds, if supplied.
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
/// Result of a conditional live snapshot fetch.
pub enum SnapshotFetch {
    /// The backend returned a new snapshot.
    Modified(LiveSnapshot),
    /// The sent version token is still current.
    NotModified,
}

#[async_trait]
/// Read access to the order subsystem.
pub trait DispatchDataPort: Send + Sync {
    /// Orders visible in the dispatch view.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the backend request fails.
    async fn orders(&self) -> Result<Vec<Order>, PortError>;

    /// Couriers that can receive orders.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the backend request fails.
    async fn couriers(&self) -> Result<Vec<Courier>, PortError>;

    /// Shared depot used as a fallback route start.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the backend request fails.
    async fn depot(&self) -> Result<Option<Coordinate>, PortError>;
}

#[async_trait]
/// Write-back of courier assignments and order numbers.
pub trait AssignmentPort: Send + Sync {
    /// Persist the full assignment as one all-or-nothing batch.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the request fails or any entry is rejected.
    async fn save_assignment(&self, updates: &[AssignmentUpdate]) -> Result<(), PortError>;
}

#[async_trait]
/// Expansion of shortened map links.
pub trait UrlExpansionPort: Send + Sync {
    /// Resolve a short link to the long URL it redirects to.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the link cannot be expanded.
    async fn expand(&self, short_url: &str) -> Result<String, PortError>;
}

#[async_trait]
/// Batched multi-stop route optimization.
pub trait RouteOptimizationPort: Send + Sync {
    /// Optimize every route in one round trip. Containers may be missing from the answer.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the request fails entirely.
    async fn optimize(&self, routes: &[RouteRequest]) -> Result<Vec<OptimizedRoute>, PortError>;
}

#[async_trait]
/// Conditional polling of live courier/client positions.
pub trait LiveSnapshotPort: Send + Sync {
    /// Fetch the current snapshot unless `since` is still current.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the request fails.
    async fn fetch(&self, since: Option<&VersionToken>) -> Result<SnapshotFetch, PortError>;
}

/// Run `request` until it finishes or `token` is cancelled, whichever comes first.
///
/// # Errors
///
/// Returns [`PortError::Cancelled`] when the token fires first, otherwise the request's own result.
pub async fn cancellable<T, F>(token: &CancellationToken, request: F) -> Result<T, PortError>
where
    F: Future<Output = Result<T, PortError>>,
{
    tokio::select! {
        biased;
        () = token.cancelled() => Err(PortError::Cancelled),
        outcome = request => outcome,
    }
}
