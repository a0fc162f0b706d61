//! Turns order address text into coordinates, expanding short map links in the background.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::geo::{self, MapLink};
use crate::model::{Coordinate, Order, OrderId, ResolvedCoordinate};
use crate::ports::{PortError, UrlExpansionPort, cancellable};

/// Resolution state of every order in the view.
pub type CoordinateMap = HashMap<OrderId, ResolvedCoordinate>;

#[derive(Debug, Clone, PartialEq)]
/// A late resolution delivered after a short link was expanded.
pub struct ResolutionUpdate {
    /// Order whose destination changed.
    pub order_id: OrderId,
    /// New state, either located or unresolved.
    pub resolved: ResolvedCoordinate,
}

enum Expansion {
    InFlight(Vec<OrderId>),
    Done(Option<Coordinate>),
}

struct Inner {
    expander: Arc<dyn UrlExpansionPort>,
    short_hosts: Vec<String>,
    cache: Mutex<HashMap<String, Expansion>>,
    updates: mpsc::UnboundedSender<ResolutionUpdate>,
    cancel: CancellationToken,
}

/// Resolver for order destinations with a per-session expansion cache keyed by raw URL.
///
/// Cloning is cheap and shares the cache.
#[derive(Clone)]
pub struct CoordinateResolver {
    inner: Arc<Inner>,
}

impl CoordinateResolver {
    /// Create a resolver and the channel on which late resolutions arrive.
    ///
    /// Expansions are aborted when `cancel` fires.
    #[must_use]
    pub fn new(
        expander: Arc<dyn UrlExpansionPort>,
        short_hosts: Vec<String>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<ResolutionUpdate>) {
        let (updates, receiver) = mpsc::unbounded_channel();
        let resolver = Self {
            inner: Arc::new(Inner {
                expander,
                short_hosts,
                cache: Mutex::new(HashMap::new()),
                updates,
                cancel,
            }),
        };
        (resolver, receiver)
    }

    /// Resolve one order.
    ///
    /// Priority: valid persisted coordinates, a decimal pair in the text, a map link.
    /// Short links return [`ResolvedCoordinate::Pending`] and report back through the update
    /// channel. Must be called within a Tokio runtime.
    #[must_use]
    pub fn resolve(&self, order: &Order) -> ResolvedCoordinate {
        if let Some(persisted) = Coordinate::from_parts(order.latitude, order.longitude) {
            return ResolvedCoordinate::Located(persisted);
        }
        if let Some(pair) = geo::parse_coordinate_pair(&order.delivery_address) {
            return ResolvedCoordinate::Located(pair);
        }
        match geo::find_map_link(&order.delivery_address, &self.inner.short_hosts) {
            Some(MapLink::Long(Some(coordinate))) => ResolvedCoordinate::Located(coordinate),
            Some(MapLink::Long(None)) | None => ResolvedCoordinate::Unresolved,
            Some(MapLink::Short(short_url)) => self.resolve_short(&order.id, short_url),
        }
    }

    /// Resolve every order, returning the immediate state of each.
    #[must_use]
    pub fn resolve_all(&self, orders: &[Order]) -> CoordinateMap {
        orders
            .iter()
            .map(|order| (order.id.clone(), self.resolve(order)))
            .collect()
    }

    /// Abort every pending expansion.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    fn resolve_short(&self, order_id: &OrderId, short_url: String) -> ResolvedCoordinate {
        let mut cache = self.inner.cache.lock();
        match cache.get_mut(&short_url) {
            Some(Expansion::Done(Some(coordinate))) => ResolvedCoordinate::Located(*coordinate),
            Some(Expansion::Done(None)) => ResolvedCoordinate::Unresolved,
            Some(Expansion::InFlight(waiters)) => {
                if !waiters.contains(order_id) {
                    waiters.push(order_id.clone());
                }
                ResolvedCoordinate::Pending
            }
            None => {
                cache.insert(short_url.clone(), Expansion::InFlight(vec![order_id.clone()]));
                drop(cache);
                debug!(url = %short_url, order_id = %order_id, "Expanding short link");
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { expand_and_publish(inner, short_url).await });
                ResolvedCoordinate::Pending
            }
        }
    }
}

async fn expand_and_publish(inner: Arc<Inner>, short_url: String) {
    let outcome = cancellable(&inner.cancel, inner.expander.expand(&short_url)).await;

    let coordinate = match outcome {
        Ok(long_url) => {
            let parsed = Url::parse(&long_url)
                .ok()
                .and_then(|url| geo::coordinate_from_url(&url));
            if parsed.is_none() {
                warn!(url = %short_url, expanded = %long_url, "Expanded link carries no coordinate");
            }
            parsed
        }
        Err(PortError::Cancelled) => {
            debug!(url = %short_url, "Expansion cancelled");
            inner.cache.lock().remove(&short_url);
            return;
        }
        Err(err) => {
            warn!(url = %short_url, error = %err, "Short link expansion failed");
            None
        }
    };

    let waiters = {
        let mut cache = inner.cache.lock();
        match cache.insert(short_url, Expansion::Done(coordinate)) {
            Some(Expansion::InFlight(waiters)) => waiters,
            _ => Vec::new(),
        }
    };

    let resolved = coordinate.map_or(ResolvedCoordinate::Unresolved, ResolvedCoordinate::Located);
    for order_id in waiters {
        if inner
            .updates
            .send(ResolutionUpdate { order_id, resolved })
            .is_err()
        {
            debug!("Resolution receiver dropped");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::StaticExpander;

    fn order(id: &str, address: &str) -> Order {
        Order {
            id: OrderId::from(id),
            order_number: 1,
            delivery_address: address.to_owned(),
            latitude: None,
            longitude: None,
            courier_id: None,
            status: String::new(),
            display_name: String::new(),
        }
    }

    fn hosts() -> Vec<String> {
        vec!["maps.app.goo.gl".to_owned()]
    }

    #[tokio::test]
    async fn persisted_coordinates_win_unless_out_of_range() {
        let (resolver, _updates) =
            CoordinateResolver::new(Arc::new(StaticExpander::default()), hosts(), CancellationToken::new());

        let mut stored = order("a", "10.5, 20.5");
        stored.latitude = Some(1.0);
        stored.longitude = Some(2.0);
        assert_eq!(
            resolver.resolve(&stored),
            ResolvedCoordinate::Located(Coordinate { lat: 1.0, lng: 2.0 })
        );

        stored.latitude = Some(123.0);
        assert_eq!(
            resolver.resolve(&stored),
            ResolvedCoordinate::Located(Coordinate { lat: 10.5, lng: 20.5 })
        );
    }

    #[tokio::test]
    async fn plain_address_is_unresolved() {
        let (resolver, _updates) =
            CoordinateResolver::new(Arc::new(StaticExpander::default()), hosts(), CancellationToken::new());
        assert_eq!(
            resolver.resolve(&order("a", "Abay avenue 10, flat 5")),
            ResolvedCoordinate::Unresolved
        );
        assert_eq!(
            resolver.resolve(&order("b", "https://example.com/contact")),
            ResolvedCoordinate::Unresolved
        );
    }

    #[tokio::test]
    async fn long_links_resolve_synchronously() {
        let (resolver, _updates) =
            CoordinateResolver::new(Arc::new(StaticExpander::default()), hosts(), CancellationToken::new());
        let resolved = resolver.resolve(&order("a", "see https://maps.google.com/?q=43.25,76.95"));
        assert_eq!(
            resolved,
            ResolvedCoordinate::Located(Coordinate { lat: 43.25, lng: 76.95 })
        );
    }

    #[tokio::test]
    async fn map_link_after_unrelated_link_resolves() {
        let (resolver, _updates) =
            CoordinateResolver::new(Arc::new(StaticExpander::default()), hosts(), CancellationToken::new());
        let resolved = resolver.resolve(&order(
            "a",
            "menu https://example.com/menu deliver https://maps.google.com/?q=43.25,76.95",
        ));
        assert_eq!(
            resolved,
            ResolvedCoordinate::Located(Coordinate { lat: 43.25, lng: 76.95 })
        );
    }

    #[tokio::test]
    async fn trailing_dot_is_not_sent_to_expander() {
        let expander = Arc::new(
            StaticExpander::default()
                .with("https://maps.app.goo.gl/xyz", "https://maps.google.com/?q=1.5,2.5"),
        );
        let (resolver, mut updates) =
            CoordinateResolver::new(expander, hosts(), CancellationToken::new());

        assert_eq!(
            resolver.resolve(&order("a", "Pin is https://maps.app.goo.gl/xyz.")),
            ResolvedCoordinate::Pending
        );
        let update = tokio::time::timeout(Duration::from_secs(2), updates.recv())
            .await
            .expect("update in time")
            .expect("channel open");
        assert_eq!(
            update.resolved,
            ResolvedCoordinate::Located(Coordinate { lat: 1.5, lng: 2.5 })
        );
    }

    #[tokio::test]
    async fn shared_short_link_expands_once() {
        let expander = Arc::new(
            StaticExpander::default()
                .with("https://maps.app.goo.gl/xyz", "https://www.google.com/maps/@43.25,76.95,17z")
                .with_delay(Duration::from_millis(20)),
        );
        let (resolver, mut updates) =
            CoordinateResolver::new(expander.clone(), hosts(), CancellationToken::new());

        let orders = vec![
            order("a", "https://maps.app.goo.gl/xyz"),
            order("b", "door code 12 https://maps.app.goo.gl/xyz"),
        ];
        let immediate = resolver.resolve_all(&orders);
        assert!(immediate.values().all(|state| *state == ResolvedCoordinate::Pending));

        let mut received = Vec::new();
        for _ in 0..2 {
            let update = tokio::time::timeout(Duration::from_secs(2), updates.recv())
                .await
                .expect("update in time")
                .expect("channel open");
            received.push(update);
        }
        assert_eq!(expander.calls(), 1);
        assert!(received.iter().all(|update| update.resolved
            == ResolvedCoordinate::Located(Coordinate { lat: 43.25, lng: 76.95 })));

        // Later lookups hit the cache.
        assert_eq!(
            resolver.resolve(&order("c", "https://maps.app.goo.gl/xyz")),
            ResolvedCoordinate::Located(Coordinate { lat: 43.25, lng: 76.95 })
        );
        assert_eq!(expander.calls(), 1);
    }

    #[tokio::test]
    async fn failed_expansion_only_affects_its_orders() {
        let expander = Arc::new(
            StaticExpander::default()
                .with("https://maps.app.goo.gl/good", "https://maps.google.com/?q=1.5,2.5"),
        );
        let (resolver, mut updates) =
            CoordinateResolver::new(expander, hosts(), CancellationToken::new());

        let orders = vec![
            order("bad", "https://maps.app.goo.gl/broken"),
            order("good", "https://maps.app.goo.gl/good"),
            order("plain", "3.5 4.5"),
        ];
        let immediate = resolver.resolve_all(&orders);
        assert_eq!(
            immediate.get(&OrderId::from("plain")),
            Some(&ResolvedCoordinate::Located(Coordinate { lat: 3.5, lng: 4.5 }))
        );

        let mut finals = HashMap::new();
        for _ in 0..2 {
            let update = tokio::time::timeout(Duration::from_secs(2), updates.recv())
                .await
                .expect("update in time")
                .expect("channel open");
            finals.insert(update.order_id, update.resolved);
        }
        assert_eq!(finals.get(&OrderId::from("bad")), Some(&ResolvedCoordinate::Unresolved));
        assert_eq!(
            finals.get(&OrderId::from("good")),
            Some(&ResolvedCoordinate::Located(Coordinate { lat: 1.5, lng: 2.5 }))
        );
    }

    #[tokio::test]
    async fn cancel_aborts_pending_expansions() {
        let expander = Arc::new(
            StaticExpander::default()
                .with("https://maps.app.goo.gl/slow", "https://maps.google.com/?q=1.5,2.5")
                .with_delay(Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();
        let (resolver, mut updates) = CoordinateResolver::new(expander, hosts(), cancel);

        assert_eq!(
            resolver.resolve(&order("a", "https://maps.app.goo.gl/slow")),
            ResolvedCoordinate::Pending
        );
        resolver.cancel();
        drop(resolver);

        let next = tokio::time::timeout(Duration::from_secs(2), updates.recv())
            .await
            .expect("channel closes after cancellation");
        assert!(next.is_none());
    }
}
