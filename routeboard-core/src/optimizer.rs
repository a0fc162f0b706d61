//! Visiting-order computation per container: remote multi-stop routing with a local
//! nearest-neighbor fallback.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_AVERAGE_SPEED_KMH;
use crate::geo::haversine_km;
use crate::model::{
    ContainerKey, Coordinate, Courier, DurationEstimate, OrderId, RouteOrigin, RouteResult,
};
use crate::ports::{PortError, RouteOptimizationPort, RouteRequest, RouteStop};
use crate::resolver::CoordinateMap;
use crate::store::RouteBoard;

/// Route per container.
pub type RoutePlan = HashMap<ContainerKey, RouteResult>;

#[async_trait]
/// A strategy that orders the located stops of containers.
///
/// Results only cover located stops; the caller appends unresolved orders.
/// A container missing from the returned map was not handled by the strategy.
pub trait RouteSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Plan routes for every request.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the strategy failed as a whole.
    async fn plan(&self, requests: &[RouteRequest]) -> Result<RoutePlan, PortError>;
}

/// Remote routing service behind a [`RouteOptimizationPort`].
pub struct RemoteRouteSource {
    port: Arc<dyn RouteOptimizationPort>,
}

impl RemoteRouteSource {
    /// Wrap an optimization port.
    #[must_use]
    pub fn new(port: Arc<dyn RouteOptimizationPort>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl RouteSource for RemoteRouteSource {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn plan(&self, requests: &[RouteRequest]) -> Result<RoutePlan, PortError> {
        let answers = self.port.optimize(requests).await?;
        let mut plan = RoutePlan::new();
        for answer in answers {
            let Some(request) = requests
                .iter()
                .find(|request| request.container == answer.container)
            else {
                debug!(container = %answer.container, "Ignoring route for unknown container");
                continue;
            };
            let ordered_ids = sanitize_order(&request.stops, &answer.ordered_ids);
            plan.insert(
                answer.container,
                RouteResult {
                    ordered_ids,
                    polyline: answer.polyline,
                    duration: answer.duration_seconds.map(|seconds| DurationEstimate {
                        seconds,
                        approximate: false,
                    }),
                    origin: RouteOrigin::Remote,
                },
            );
        }
        Ok(plan)
    }
}

/// Keep ids the remote returned that belong to the request, once each, then append any
/// located stops it left out in their original order.
fn sanitize_order(stops: &[RouteStop], returned: &[OrderId]) -> Vec<OrderId> {
    let known: HashSet<&OrderId> = stops.iter().map(|stop| &stop.order_id).collect();
    let mut seen: HashSet<&OrderId> = HashSet::with_capacity(stops.len());
    let mut ordered: Vec<OrderId> = returned
        .iter()
        .filter(|id| known.contains(id) && seen.insert(*id))
        .cloned()
        .collect();
    ordered.extend(
        stops
            .iter()
            .filter(|stop| !seen.contains(&stop.order_id))
            .map(|stop| stop.order_id.clone()),
    );
    ordered
}

/// Greedy nearest-neighbor ordering by great-circle distance.
pub struct HeuristicRouteSource {
    average_speed_kmh: f64,
}

impl Default for HeuristicRouteSource {
    fn default() -> Self {
        Self {
            average_speed_kmh: DEFAULT_AVERAGE_SPEED_KMH,
        }
    }
}

impl HeuristicRouteSource {
    /// Heuristic with a custom speed for duration estimates.
    #[must_use]
    pub fn new(average_speed_kmh: f64) -> Self {
        Self { average_speed_kmh }
    }

    /// Order one container's stops, starting at `start` or the first stop.
    #[must_use]
    pub fn route(&self, start: Option<Coordinate>, stops: &[RouteStop]) -> RouteResult {
        let mut remaining: Vec<&RouteStop> = stops.iter().collect();
        let mut polyline = Vec::with_capacity(stops.len() + 1);
        let mut ordered_ids = Vec::with_capacity(stops.len());
        let mut distance_km = 0.0;

        let mut current = match (start, stops.first()) {
            (Some(origin), _) => origin,
            (None, Some(first)) => first.coordinate,
            (None, None) => return RouteResult::unoptimized(Vec::new()),
        };
        polyline.push(current);

        while let Some((index, hop_km)) = nearest(current, &remaining) {
            let stop = remaining.remove(index);
            distance_km += hop_km;
            current = stop.coordinate;
            polyline.push(current);
            ordered_ids.push(stop.order_id.clone());
        }

        RouteResult {
            ordered_ids,
            polyline: Some(polyline),
            duration: Some(DurationEstimate {
                seconds: hours_to_seconds(distance_km / self.average_speed_kmh),
                approximate: true,
            }),
            origin: RouteOrigin::Heuristic,
        }
    }
}

#[async_trait]
impl RouteSource for HeuristicRouteSource {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn plan(&self, requests: &[RouteRequest]) -> Result<RoutePlan, PortError> {
        Ok(requests
            .iter()
            .map(|request| {
                (
                    request.container.clone(),
                    self.route(request.start, &request.stops),
                )
            })
            .collect())
    }
}

/// Closest stop to `from`; ties go to the earliest stop.
fn nearest(from: Coordinate, stops: &[&RouteStop]) -> Option<(usize, f64)> {
    stops
        .iter()
        .enumerate()
        .map(|(index, stop)| (index, haversine_km(from, stop.coordinate)))
        .fold(None, |best, (index, distance)| match best {
            Some((_, best_distance)) if best_distance <= distance => best,
            _ => Some((index, distance)),
        })
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "durations are non-negative and far below u64::MAX"
)]
fn hours_to_seconds(hours: f64) -> u64 {
    if hours.is_finite() && hours > 0.0 {
        (hours * 3600.0).round() as u64
    } else {
        0
    }
}

/// Route start per container: the courier's live position, else the depot.
#[must_use]
pub fn start_points(
    board: &RouteBoard,
    couriers: &[Courier],
    depot: Option<Coordinate>,
) -> HashMap<ContainerKey, Coordinate> {
    board
        .containers()
        .iter()
        .filter_map(|container| {
            let live = container.key.courier_id().and_then(|courier_id| {
                couriers
                    .iter()
                    .find(|courier| &courier.id == courier_id)
                    .and_then(Courier::live_position)
            });
            live.or(depot).map(|start| (container.key.clone(), start))
        })
        .collect()
}

/// Straight-line length of a visiting order in kilometres, skipping unlocated stops.
#[must_use]
pub fn route_distance_km(
    start: Option<Coordinate>,
    ordered_ids: &[OrderId],
    coordinates: &CoordinateMap,
) -> f64 {
    let mut points = start
        .into_iter()
        .chain(
            ordered_ids
                .iter()
                .filter_map(|id| coordinates.get(id).and_then(|state| state.coordinate())),
        )
        .peekable();
    let mut total = 0.0;
    while let Some(point) = points.next() {
        if let Some(next) = points.peek() {
            total += haversine_km(point, *next);
        }
    }
    total
}

/// Picks the remote source when configured and falls back to the heuristic per container.
pub struct RouteOptimizer {
    remote: Option<Box<dyn RouteSource>>,
    fallback: Box<dyn RouteSource>,
}

impl RouteOptimizer {
    /// Optimizer that tries `remote` first, if present.
    #[must_use]
    pub fn new(remote: Option<Box<dyn RouteSource>>, fallback: Box<dyn RouteSource>) -> Self {
        Self { remote, fallback }
    }

    /// Optimizer using the remote port and a heuristic at `average_speed_kmh`.
    #[must_use]
    pub fn with_remote(port: Arc<dyn RouteOptimizationPort>, average_speed_kmh: f64) -> Self {
        Self::new(
            Some(Box::new(RemoteRouteSource::new(port))),
            Box::new(HeuristicRouteSource::new(average_speed_kmh)),
        )
    }

    /// Optimizer that only runs the local heuristic.
    #[must_use]
    pub fn local_only(average_speed_kmh: f64) -> Self {
        Self::new(None, Box::new(HeuristicRouteSource::new(average_speed_kmh)))
    }

    /// Compute a route for every container on the board.
    ///
    /// Every order on the board appears exactly once in the result; orders without a located
    /// coordinate follow the located ones in their original relative order.
    pub async fn optimize_all(
        &self,
        board: &RouteBoard,
        coordinates: &CoordinateMap,
        starts: &HashMap<ContainerKey, Coordinate>,
    ) -> RoutePlan {
        let mut unlocated: HashMap<ContainerKey, Vec<OrderId>> = HashMap::new();
        let mut requests: Vec<RouteRequest> = Vec::new();
        for container in board.containers() {
            let mut stops = Vec::new();
            let mut rest = Vec::new();
            for id in &container.order_ids {
                match coordinates.get(id).and_then(|state| state.coordinate()) {
                    Some(coordinate) => stops.push(RouteStop {
                        order_id: id.clone(),
                        coordinate,
                    }),
                    None => rest.push(id.clone()),
                }
            }
            unlocated.insert(container.key.clone(), rest);
            if !stops.is_empty() {
                requests.push(RouteRequest {
                    container: container.key.clone(),
                    start: starts.get(&container.key).copied(),
                    stops,
                });
            }
        }

        let mut planned = match &self.remote {
            Some(remote) if !requests.is_empty() => match remote.plan(&requests).await {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(source = remote.name(), error = %err, "Remote routing failed, falling back");
                    RoutePlan::new()
                }
            },
            _ => RoutePlan::new(),
        };

        let missing: Vec<RouteRequest> = requests
            .iter()
            .filter(|request| !planned.contains_key(&request.container))
            .cloned()
            .collect();
        if !missing.is_empty() {
            debug!(
                source = self.fallback.name(),
                containers = missing.len(),
                "Planning containers locally"
            );
            match self.fallback.plan(&missing).await {
                Ok(local) => planned.extend(local),
                Err(err) => warn!(source = self.fallback.name(), error = %err, "Fallback routing failed"),
            }
        }

        let plan: RoutePlan = board
            .containers()
            .iter()
            .map(|container| {
                let tail = unlocated.remove(&container.key).unwrap_or_default();
                let result = match planned.remove(&container.key) {
                    Some(mut route) => {
                        route.ordered_ids.extend(tail);
                        route
                    }
                    None => RouteResult::unoptimized(container.order_ids.clone()),
                };
                (container.key.clone(), result)
            })
            .collect();

        info!(
            containers = plan.len(),
            remote = plan
                .values()
                .filter(|route| route.origin == RouteOrigin::Remote)
                .count(),
            heuristic = plan
                .values()
                .filter(|route| route.origin == RouteOrigin::Heuristic)
                .count(),
            "Optimization finished"
        );
        plan
    }
}

/// Delays re-optimization until coordinate updates have been quiet for a while.
#[derive(Debug, Clone)]
pub struct ReoptimizeDebounce {
    delay: Duration,
    deadline: Option<Instant>,
}

impl ReoptimizeDebounce {
    /// Debouncer with the given quiet period.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    /// Record a change at `now`, pushing the deadline back.
    pub fn note_change(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    /// Pending deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the deadline has passed; clears it so it fires only once.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
