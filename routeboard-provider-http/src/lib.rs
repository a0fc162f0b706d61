//! Routeboard ports backed by a JSON HTTP dispatch backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use routeboard_core::{
    backend::DispatchBackend,
    model::{
        AssignmentUpdate, ContainerKey, Coordinate, Courier, CourierId, LivePosition,
        LiveSnapshot, Order, OrderId, VersionToken,
    },
    ports::{
        AssignmentPort, DispatchDataPort, LiveSnapshotPort, OptimizedRoute, PortError,
        RouteOptimizationPort, RouteRequest, SnapshotFetch, UrlExpansionPort,
    },
};

const UNASSIGNED: &str = "unassigned";
const COURIER_PREFIX: &str = "courier:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
/// Connection settings for the dispatch backend.
pub struct HttpConfig {
    /// Backend root, e.g. `https://dispatch.example.com/api`.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
    /// Expand short links by following redirects instead of calling `/expand`.
    pub expand_via_redirect: bool,
    /// Use the backend's `/optimize` endpoint; when false routes are planned locally.
    pub remote_optimization: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_owned(),
            timeout_secs: 15,
            user_agent: concat!("routeboard/", env!("CARGO_PKG_VERSION")).to_owned(),
            expand_via_redirect: false,
            remote_optimization: true,
        }
    }
}

impl HttpConfig {
    /// Request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// HTTP client carrying the timeout and user agent.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Network`] when the client cannot be built.
    pub fn client(&self) -> Result<Client, PortError> {
        Client::builder()
            .timeout(self.timeout())
            .user_agent(self.user_agent.as_str())
            .build()
            .map_err(PortError::from)
    }
}

#[derive(Debug, Clone)]
struct Endpoints {
    base: Arc<str>,
}

impl Endpoints {
    fn new(base_url: &str) -> Self {
        Self {
            base: Arc::from(base_url.trim_end_matches('/')),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base)
    }
}

#[derive(Debug, Deserialize)]
struct DepotResponse {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct ExpandResponse {
    url: String,
}

#[derive(Debug, Serialize)]
struct OptimizeRequest<'req> {
    routes: Vec<RouteDto<'req>>,
}

#[derive(Debug, Serialize)]
struct RouteDto<'req> {
    container: String,
    start: Option<Coordinate>,
    stops: Vec<StopDto<'req>>,
}

#[derive(Debug, Serialize)]
struct StopDto<'req> {
    id: &'req str,
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct OptimizeResponse {
    routes: Vec<OptimizedDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptimizedDto {
    container: String,
    ordered_ids: Vec<String>,
    #[serde(default)]
    polyline: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    duration_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveResponse {
    #[serde(default)]
    couriers: Vec<LivePosition>,
    #[serde(default)]
    clients: Vec<LivePosition>,
    #[serde(default)]
    version_token: Option<String>,
}

/// Orders, couriers and depot read from the backend.
pub struct HttpDispatchData {
    client: Client,
    endpoints: Endpoints,
}

impl HttpDispatchData {
    /// Create a data port bound to the given HTTP client.
    #[must_use]
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoints: Endpoints::new(base_url),
        }
    }
}

#[async_trait]
impl DispatchDataPort for HttpDispatchData {
    async fn orders(&self) -> Result<Vec<Order>, PortError> {
        let orders: Vec<Order> =
            fetch_json(self.client.get(self.endpoints.url("orders"))).await?;
        debug!(count = orders.len(), "Fetched orders");
        Ok(orders)
    }

    async fn couriers(&self) -> Result<Vec<Courier>, PortError> {
        let couriers: Vec<Courier> =
            fetch_json(self.client.get(self.endpoints.url("couriers"))).await?;
        debug!(count = couriers.len(), "Fetched couriers");
        Ok(couriers)
    }

    async fn depot(&self) -> Result<Option<Coordinate>, PortError> {
        let resp = self
            .client
            .get(self.endpoints.url("depot"))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let depot: DepotResponse = checked(resp)?.json().await?;
        Coordinate::new(depot.lat, depot.lng)
            .map(Some)
            .ok_or_else(|| PortError::Decode(format!("depot out of range: {}, {}", depot.lat, depot.lng)))
    }
}

/// Saves assignment batches with one `POST /assignments`.
pub struct HttpAssignments {
    client: Client,
    endpoints: Endpoints,
}

impl HttpAssignments {
    /// Create an assignment port bound to the given HTTP client.
    #[must_use]
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoints: Endpoints::new(base_url),
        }
    }
}

#[async_trait]
impl AssignmentPort for HttpAssignments {
    async fn save_assignment(&self, updates: &[AssignmentUpdate]) -> Result<(), PortError> {
        let resp = self
            .client
            .post(self.endpoints.url("assignments"))
            .json(updates)
            .send()
            .await?;
        let status = resp.status();
        if status.is_client_error() {
            let reason = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %reason, "Assignment batch rejected");
            return Err(PortError::Rejected(if reason.is_empty() {
                status.to_string()
            } else {
                reason
            }));
        }
        checked(resp)?;
        Ok(())
    }
}

/// Expands short links through the backend, or by following redirects.
pub struct HttpUrlExpander {
    client: Client,
    endpoints: Endpoints,
    via_redirect: bool,
}

impl HttpUrlExpander {
    /// Expander calling `GET /expand?url=`.
    #[must_use]
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoints: Endpoints::new(base_url),
            via_redirect: false,
        }
    }

    /// Expander that requests the short link itself and reports where redirects end.
    #[must_use]
    pub fn following_redirects(client: Client) -> Self {
        Self {
            client,
            endpoints: Endpoints::new(""),
            via_redirect: true,
        }
    }
}

#[async_trait]
impl UrlExpansionPort for HttpUrlExpander {
    async fn expand(&self, short_url: &str) -> Result<String, PortError> {
        if self.via_redirect {
            let resp = checked(self.client.get(short_url).send().await?)?;
            return Ok(resp.url().to_string());
        }
        let req = self
            .client
            .get(self.endpoints.url("expand"))
            .query(&[("url", short_url)]);
        let expanded: ExpandResponse = fetch_json(req).await?;
        Ok(expanded.url)
    }
}

/// Batched route optimization via `POST /optimize`.
pub struct HttpRouteOptimizer {
    client: Client,
    endpoints: Endpoints,
}

impl HttpRouteOptimizer {
    /// Create an optimization port bound to the given HTTP client.
    #[must_use]
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoints: Endpoints::new(base_url),
        }
    }
}

#[async_trait]
impl RouteOptimizationPort for HttpRouteOptimizer {
    async fn optimize(&self, routes: &[RouteRequest]) -> Result<Vec<OptimizedRoute>, PortError> {
        let body = OptimizeRequest {
            routes: routes
                .iter()
                .map(|route| RouteDto {
                    container: container_to_wire(&route.container),
                    start: route.start,
                    stops: route
                        .stops
                        .iter()
                        .map(|stop| StopDto {
                            id: stop.order_id.0.as_str(),
                            lat: stop.coordinate.lat,
                            lng: stop.coordinate.lng,
                        })
                        .collect(),
                })
                .collect(),
        };
        let req = self.client.post(self.endpoints.url("optimize")).json(&body);
        let resp: OptimizeResponse = fetch_json(req).await?;

        let mut optimized = Vec::with_capacity(resp.routes.len());
        for route in resp.routes {
            let Some(container) = container_from_wire(&route.container) else {
                warn!(container = %route.container, "Optimizer returned unknown container");
                continue;
            };
            let polyline = route.polyline.map(|points| {
                points
                    .into_iter()
                    .filter_map(|[lat, lng]| Coordinate::new(lat, lng))
                    .collect()
            });
            optimized.push(OptimizedRoute {
                container,
                ordered_ids: route.ordered_ids.into_iter().map(OrderId).collect(),
                polyline,
                duration_seconds: route.duration_seconds,
            });
        }
        debug!(requested = routes.len(), returned = optimized.len(), "Optimizer answered");
        Ok(optimized)
    }
}

/// Live positions via conditional `GET /live`.
pub struct HttpLiveFeed {
    client: Client,
    endpoints: Endpoints,
}

impl HttpLiveFeed {
    /// Create a live feed bound to the given HTTP client.
    #[must_use]
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoints: Endpoints::new(base_url),
        }
    }
}

#[async_trait]
impl LiveSnapshotPort for HttpLiveFeed {
    async fn fetch(&self, since: Option<&VersionToken>) -> Result<SnapshotFetch, PortError> {
        let mut req = self.client.get(self.endpoints.url("live"));
        if let Some(token) = since {
            req = req.header(IF_NONE_MATCH, token.0.as_str());
        }
        let resp = req.send().await?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(SnapshotFetch::NotModified);
        }
        let resp = checked(resp)?;
        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body: LiveResponse = resp.json().await?;

        Ok(SnapshotFetch::Modified(LiveSnapshot {
            couriers: body.couriers,
            clients: body.clients,
            version: etag.or(body.version_token).map(VersionToken),
            fetched_at: Utc::now(),
        }))
    }
}

/// Build the port bundle for an HTTP backend.
#[must_use]
pub fn backend(client: Client, config: &HttpConfig) -> DispatchBackend {
    let base_url = config.base_url.as_str();
    let expander = if config.expand_via_redirect {
        HttpUrlExpander::following_redirects(client.clone())
    } else {
        HttpUrlExpander::new(client.clone(), base_url)
    };
    let optimizer: Option<Arc<dyn RouteOptimizationPort>> = if config.remote_optimization {
        Some(Arc::new(HttpRouteOptimizer::new(client.clone(), base_url)))
    } else {
        None
    };

    DispatchBackend {
        data: Arc::new(HttpDispatchData::new(client.clone(), base_url)),
        assignments: Arc::new(HttpAssignments::new(client.clone(), base_url)),
        expander: Arc::new(expander),
        optimizer,
        live: Arc::new(HttpLiveFeed::new(client, base_url)),
    }
}

/// Wire name of a container: `unassigned` or `courier:<id>`.
#[must_use]
pub fn container_to_wire(key: &ContainerKey) -> String {
    match key {
        ContainerKey::Unassigned => UNASSIGNED.to_owned(),
        ContainerKey::Courier(id) => format!("{COURIER_PREFIX}{id}"),
    }
}

/// Parse a wire container name.
#[must_use]
pub fn container_from_wire(raw: &str) -> Option<ContainerKey> {
    if raw == UNASSIGNED {
        return Some(ContainerKey::Unassigned);
    }
    raw.strip_prefix(COURIER_PREFIX)
        .filter(|id| !id.is_empty())
        .map(|id| ContainerKey::Courier(CourierId::from(id)))
}

fn checked(resp: Response) -> Result<Response, PortError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(PortError::Status(status.as_u16()))
    }
}

// Small helper to fetch and decode JSON with status handling.
async fn fetch_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, PortError> {
    checked(req.send().await?)?
        .json()
        .await
        .map_err(PortError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_round_trip() {
        for key in [
            ContainerKey::Unassigned,
            ContainerKey::Courier(CourierId::from("c-17")),
        ] {
            assert_eq!(container_from_wire(&container_to_wire(&key)), Some(key));
        }
        assert_eq!(container_from_wire("courier:"), None);
        assert_eq!(container_from_wire("truck:1"), None);
    }

    #[test]
    fn endpoints_join_without_double_slash() {
        let endpoints = Endpoints::new("http://host/api/");
        assert_eq!(endpoints.url("orders"), "http://host/api/orders");
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: HttpConfig =
            serde_json::from_str(r#"{"baseUrl": "http://dispatch"}"#).expect("config");
        assert_eq!(config.base_url, "http://dispatch");
        assert_eq!(config.timeout(), Duration::from_secs(15));
        assert!(config.remote_optimization);
        assert!(!config.expand_via_redirect);
    }
}
