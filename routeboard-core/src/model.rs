//! Domain data structures for orders, couriers, containers, routes, and live positions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Identifier for a delivery order.
pub struct OrderId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Identifier for a courier.
pub struct CourierId(pub String);

impl fmt::Display for OrderId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl fmt::Display for CourierId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<&str> for OrderId {
    fn from(raw: &str) -> Self {
        OrderId(raw.to_owned())
    }
}

impl From<&str> for CourierId {
    fn from(raw: &str) -> Self {
        CourierId(raw.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// WGS84 latitude/longitude pair in decimal degrees.
pub struct Coordinate {
    /// Latitude in degrees, `[-90, 90]`.
    pub lat: f64,
    /// Longitude in degrees, `[-180, 180]`.
    pub lng: f64,
}

impl Coordinate {
    /// Build a coordinate, rejecting non-finite or out-of-range values.
    #[must_use]
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let lat_ok = lat.is_finite() && (-90.0..=90.0).contains(&lat);
        let lng_ok = lng.is_finite() && (-180.0..=180.0).contains(&lng);
        (lat_ok && lng_ok).then_some(Self { lat, lng })
    }

    /// Build a coordinate from an optional pair, as stored on orders and couriers.
    #[must_use]
    pub fn from_parts(lat: Option<f64>, lng: Option<f64>) -> Option<Self> {
        Self::new(lat?, lng?)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{:.5}, {:.5}", self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Delivery order as supplied by the order subsystem.
pub struct Order {
    /// Unique identifier.
    pub id: OrderId,
    /// Visiting/display position, unique within its container.
    pub order_number: u32,
    /// Free-text destination: an address, a coordinate pair, or a map link.
    pub delivery_address: String,
    /// Persisted latitude, if the order subsystem geocoded it.
    #[serde(default)]
    pub latitude: Option<f64>,
    /// Persisted longitude, if the order subsystem geocoded it.
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Courier currently assigned, if any.
    #[serde(default)]
    pub courier_id: Option<CourierId>,
    /// Opaque order status.
    #[serde(default)]
    pub status: String,
    /// Customer-facing label.
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Courier who can be assigned orders.
pub struct Courier {
    /// Unique identifier.
    pub id: CourierId,
    /// Display name.
    pub name: String,
    /// Last known live latitude.
    #[serde(default)]
    pub latitude: Option<f64>,
    /// Last known live longitude.
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl Courier {
    /// Live position, if both parts are present and valid.
    #[must_use]
    pub fn live_position(&self) -> Option<Coordinate> {
        Coordinate::from_parts(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Key of a route container: a courier, or the unassigned bucket.
pub enum ContainerKey {
    /// Orders not yet given to any courier.
    Unassigned,
    /// Orders assigned to the courier.
    Courier(CourierId),
}

impl ContainerKey {
    /// Courier this container belongs to, `None` for the unassigned bucket.
    #[must_use]
    pub fn courier_id(&self) -> Option<&CourierId> {
        match self {
            ContainerKey::Unassigned => None,
            ContainerKey::Courier(id) => Some(id),
        }
    }
}

impl From<Option<CourierId>> for ContainerKey {
    fn from(courier: Option<CourierId>) -> Self {
        courier.map_or(ContainerKey::Unassigned, ContainerKey::Courier)
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKey::Unassigned => write!(formatter, "unassigned"),
            ContainerKey::Courier(id) => write!(formatter, "courier:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Outcome of resolving one order's destination.
pub enum ResolvedCoordinate {
    /// The destination is known.
    Located(Coordinate),
    /// Nothing usable was found, or a link expansion failed.
    Unresolved,
    /// A short link is being expanded.
    Pending,
}

impl ResolvedCoordinate {
    /// Coordinate if located.
    #[must_use]
    pub fn coordinate(&self) -> Option<Coordinate> {
        match self {
            ResolvedCoordinate::Located(coordinate) => Some(*coordinate),
            ResolvedCoordinate::Unresolved | ResolvedCoordinate::Pending => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Which strategy produced a route.
pub enum RouteOrigin {
    /// The remote multi-stop routing service.
    Remote,
    /// The local nearest-neighbor heuristic.
    Heuristic,
    /// No optimization describes the current order.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Estimated driving time for a route.
pub struct DurationEstimate {
    /// Total seconds.
    pub seconds: u64,
    /// True when derived from straight-line distance rather than a road network.
    pub approximate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Visiting order and geometry computed for one container.
pub struct RouteResult {
    /// Every order of the container in visiting order.
    pub ordered_ids: Vec<OrderId>,
    /// Route geometry, if known.
    pub polyline: Option<Vec<Coordinate>>,
    /// Travel time, if known.
    pub duration: Option<DurationEstimate>,
    /// Strategy that produced the result.
    pub origin: RouteOrigin,
}

impl RouteResult {
    /// Result that keeps the given order and carries no geometry.
    #[must_use]
    pub fn unoptimized(ordered_ids: Vec<OrderId>) -> Self {
        Self {
            ordered_ids,
            polyline: None,
            duration: None,
            origin: RouteOrigin::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A courier or client marker on the live map.
pub struct LivePosition {
    /// Courier or client identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Opaque marker identifying a live snapshot.
pub struct VersionToken(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Live positions of couriers and clients at one point in time.
pub struct LiveSnapshot {
    /// Courier markers.
    pub couriers: Vec<LivePosition>,
    /// Client markers.
    pub clients: Vec<LivePosition>,
    /// Token to send on the next conditional fetch.
    pub version: Option<VersionToken>,
    /// When the snapshot was received.
    pub fetched_at: DateTime<Utc>,
}

impl LiveSnapshot {
    /// Structural comparison of the displayed content, ignoring token and timestamp.
    #[must_use]
    pub fn same_positions(&self, other: &LiveSnapshot) -> bool {
        self.couriers == other.couriers && self.clients == other.clients
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// One entry of a save request.
pub struct AssignmentUpdate {
    /// Order being written back.
    pub order_id: OrderId,
    /// New visiting/display position.
    pub order_number: u32,
    /// New courier, `None` for unassigned.
    pub courier_id: Option<CourierId>,
}
