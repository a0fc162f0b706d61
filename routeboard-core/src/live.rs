//! Background polling of live courier and client positions.
//!
//! The poller is a small `Idle → Fetching → Idle` machine driven by a timer and a visibility
//! signal. Each request gets its own [`CancellationToken`], so a manual refresh or closing the
//! view aborts the pending request instead of racing it.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{LiveSnapshot, VersionToken};
use crate::ports::{LiveSnapshotPort, PortError, SnapshotFetch, cancellable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Whether a request is outstanding.
pub enum SyncPhase {
    /// Waiting for the next tick.
    #[default]
    Idle,
    /// A request is in flight.
    Fetching,
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Poller status for display next to the map.
pub struct SyncStatus {
    /// Current phase.
    pub phase: SyncPhase,
    /// Last successful contact, including "not modified" answers.
    pub last_synced: Option<DateTime<Utc>>,
    /// Error of the last failed request, cleared on success.
    pub last_error: Option<String>,
    /// Whether polling is active.
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq)]
/// What applying a fetch result did to the displayed state.
pub enum Commit {
    /// New positions replaced the displayed ones.
    Replaced(Arc<LiveSnapshot>),
    /// A snapshot arrived but matched what is displayed.
    Unchanged,
    /// The backend reported the sent token as current.
    NotModified,
}

/// Displayed snapshot plus the bookkeeping for conditional fetches.
#[derive(Debug, Clone, Default)]
pub struct LiveState {
    displayed: Option<Arc<LiveSnapshot>>,
    version: Option<VersionToken>,
    last_synced: Option<DateTime<Utc>>,
}

impl LiveState {
    /// Token to send with the next fetch.
    #[must_use]
    pub fn version(&self) -> Option<&VersionToken> {
        self.version.as_ref()
    }

    /// Snapshot currently displayed.
    #[must_use]
    pub fn displayed(&self) -> Option<&Arc<LiveSnapshot>> {
        self.displayed.as_ref()
    }

    /// Last successful contact.
    #[must_use]
    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.last_synced
    }

    /// Apply a fetch result, only replacing the displayed snapshot when positions differ.
    pub fn apply(&mut self, fetch: SnapshotFetch, now: DateTime<Utc>) -> Commit {
        self.last_synced = Some(now);
        match fetch {
            SnapshotFetch::NotModified => Commit::NotModified,
            SnapshotFetch::Modified(snapshot) => {
                self.version.clone_from(&snapshot.version);
                let unchanged = self
                    .displayed
                    .as_ref()
                    .is_some_and(|current| current.same_positions(&snapshot));
                if unchanged {
                    return Commit::Unchanged;
                }
                let snapshot = Arc::new(snapshot);
                self.displayed = Some(Arc::clone(&snapshot));
                Commit::Replaced(snapshot)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LiveCommand {
    SetVisible(bool),
    SyncNow,
}

struct InFlight {
    token: CancellationToken,
    handle: JoinHandle<Result<SnapshotFetch, PortError>>,
}

impl InFlight {
    fn abort(self) {
        self.token.cancel();
        self.handle.abort();
    }
}

/// Handle to a running poller. Dropping it stops polling and aborts any pending request.
pub struct LiveSyncClient {
    commands: mpsc::UnboundedSender<LiveCommand>,
    positions: watch::Receiver<Option<Arc<LiveSnapshot>>>,
    status: watch::Receiver<SyncStatus>,
    cancel: CancellationToken,
}

impl LiveSyncClient {
    /// Start polling `port` every `period`, beginning with an immediate fetch.
    ///
    /// Must be called within a Tokio runtime. `cancel` stops the poller (e.g. when the view closes).
    #[must_use]
    pub fn spawn(
        port: Arc<dyn LiveSnapshotPort>,
        period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (positions_tx, positions) = watch::channel(None);
        let (status_tx, status) = watch::channel(SyncStatus {
            visible: true,
            ..SyncStatus::default()
        });

        let poller = Poller {
            port,
            period,
            cancel: cancel.clone(),
            commands: command_rx,
            positions: positions_tx,
            status: status_tx,
            state: LiveState::default(),
            visible: true,
            in_flight: None,
        };
        tokio::spawn(poller.run());

        Self {
            commands,
            positions,
            status,
            cancel,
        }
    }

    /// Suspend (`false`) or resume (`true`) polling. Resuming fetches immediately.
    pub fn set_visible(&self, visible: bool) {
        self.send(LiveCommand::SetVisible(visible));
    }

    /// Abort any pending request and fetch now.
    pub fn sync_now(&self) {
        self.send(LiveCommand::SyncNow);
    }

    /// Receiver that only changes when displayed positions change.
    #[must_use]
    pub fn positions(&self) -> watch::Receiver<Option<Arc<LiveSnapshot>>> {
        self.positions.clone()
    }

    /// Receiver for poller status.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop polling and abort any pending request.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn send(&self, command: LiveCommand) {
        if self.commands.send(command).is_err() {
            debug!(?command, "Live sync already stopped");
        }
    }
}

impl Drop for LiveSyncClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Poller {
    port: Arc<dyn LiveSnapshotPort>,
    period: Duration,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<LiveCommand>,
    positions: watch::Sender<Option<Arc<LiveSnapshot>>>,
    status: watch::Sender<SyncStatus>,
    state: LiveState,
    visible: bool,
    in_flight: Option<InFlight>,
}

impl Poller {
    async fn run(mut self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = self.period.as_secs(), "Live sync started");
        self.start_fetch();

        loop {
            let fetching = self.in_flight.is_some();
            let pending_request = &mut self.in_flight;
            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(LiveCommand::SetVisible(visible)) => {
                        let resumed = visible && !self.visible;
                        self.visible = visible;
                        self.status.send_modify(|status| status.visible = visible);
                        if resumed {
                            ticker.reset();
                            if self.in_flight.is_none() {
                                self.start_fetch();
                            }
                        }
                    }
                    Some(LiveCommand::SyncNow) => {
                        if let Some(pending) = self.in_flight.take() {
                            debug!("Manual sync aborts pending request");
                            pending.abort();
                        }
                        self.start_fetch();
                    }
                    None => break,
                },
                _ = ticker.tick(), if self.visible => {
                    if fetching {
                        debug!("Previous live request still pending, skipping tick");
                    } else {
                        self.start_fetch();
                    }
                }
                joined = async {
                    match pending_request.as_mut() {
                        Some(pending) => (&mut pending.handle).await,
                        None => future::pending().await,
                    }
                }, if fetching => {
                    self.in_flight = None;
                    match joined {
                        Ok(outcome) => self.finish(outcome),
                        Err(err) => warn!(error = %err, "Live request task failed"),
                    }
                    self.status.send_modify(|status| status.phase = SyncPhase::Idle);
                }
            }
        }

        if let Some(pending) = self.in_flight.take() {
            pending.abort();
        }
        info!("Live sync stopped");
    }

    fn start_fetch(&mut self) {
        let token = self.cancel.child_token();
        let port = Arc::clone(&self.port);
        let since = self.state.version().cloned();
        let request_token = token.clone();
        let handle = tokio::spawn(async move {
            cancellable(&request_token, port.fetch(since.as_ref())).await
        });
        self.in_flight = Some(InFlight { token, handle });
        self.status.send_modify(|status| status.phase = SyncPhase::Fetching);
    }

    fn finish(&mut self, outcome: Result<SnapshotFetch, PortError>) {
        match outcome {
            Ok(fetch) => {
                let commit = self.state.apply(fetch, Utc::now());
                let synced = self.state.last_synced();
                self.status.send_modify(|status| {
                    status.last_synced = synced;
                    status.last_error = None;
                });
                match commit {
                    Commit::Replaced(snapshot) => {
                        debug!(
                            couriers = snapshot.couriers.len(),
                            clients = snapshot.clients.len(),
                            "Live positions updated"
                        );
                        self.positions.send_replace(Some(snapshot));
                    }
                    Commit::Unchanged | Commit::NotModified => {
                        debug!("Live positions unchanged");
                    }
                }
            }
            Err(PortError::Cancelled) => debug!("Live request cancelled"),
            Err(err) => {
                warn!(error = %err, "Live sync failed, keeping last positions");
                let message = err.to_string();
                self.status
                    .send_modify(|status| status.last_error = Some(message));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LivePosition;
    use crate::testing::{FeedReply, ScriptedLiveFeed};

    fn snapshot(token: &str, lat: f64) -> LiveSnapshot {
        LiveSnapshot {
            couriers: vec![LivePosition {
                id: "c1".to_owned(),
                name: "Ana".to_owned(),
                lat,
                lng: 76.9,
            }],
            clients: Vec::new(),
            version: Some(VersionToken(token.to_owned())),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn apply_gates_unchanged_snapshots() {
        let mut state = LiveState::default();
        let now = Utc::now();
        assert!(matches!(
            state.apply(SnapshotFetch::Modified(snapshot("v1", 43.0)), now),
            Commit::Replaced(_)
        ));
        assert_eq!(state.apply(SnapshotFetch::NotModified, now), Commit::NotModified);
        assert_eq!(
            state.apply(SnapshotFetch::Modified(snapshot("v2", 43.0)), now),
            Commit::Unchanged
        );
        assert_eq!(state.version(), Some(&VersionToken("v2".to_owned())));
        assert!(matches!(
            state.apply(SnapshotFetch::Modified(snapshot("v3", 44.0)), now),
            Commit::Replaced(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn not_modified_leaves_positions_untouched() {
        let feed = Arc::new(ScriptedLiveFeed::new(vec![
            FeedReply::Snapshot(snapshot("v1", 43.0)),
            FeedReply::NotModified,
        ]));
        let client = LiveSyncClient::spawn(feed.clone(), Duration::from_secs(6), CancellationToken::new());
        let mut positions = client.positions();
        let mut status = client.status();

        positions.changed().await.expect("first snapshot");
        assert!(positions.borrow_and_update().is_some());
        let first_sync = status.borrow_and_update().last_synced;

        tokio::time::sleep(Duration::from_secs(7)).await;

        assert_eq!(feed.calls(), 2);
        assert_eq!(feed.tokens_seen().get(1), Some(&Some(VersionToken("v1".to_owned()))));
        assert!(!positions.has_changed().expect("sender alive"), "no redraw");
        let second_sync = status.borrow_and_update().last_synced;
        assert!(second_sync.is_some() && second_sync >= first_sync, "timestamp refreshed");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_request_skips_ticks() {
        let feed = Arc::new(
            ScriptedLiveFeed::new(vec![FeedReply::NotModified]).with_delay(Duration::from_secs(10)),
        );
        let _client = LiveSyncClient::spawn(feed.clone(), Duration::from_secs(6), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(feed.calls(), 1, "tick at 6s was skipped");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(feed.calls(), 2, "tick at 12s fetched again");
    }

    #[tokio::test(start_paused = true)]
    async fn sync_now_replaces_pending_request() {
        let feed = Arc::new(
            ScriptedLiveFeed::new(vec![
                FeedReply::Snapshot(snapshot("v1", 1.0)),
                FeedReply::Snapshot(snapshot("v2", 2.0)),
            ])
            .with_delay(Duration::from_secs(3)),
        );
        let client = LiveSyncClient::spawn(feed.clone(), Duration::from_secs(60), CancellationToken::new());
        let mut positions = client.positions();

        tokio::time::sleep(Duration::from_secs(1)).await;
        client.sync_now();

        positions.changed().await.expect("snapshot arrives");
        let shown = positions.borrow_and_update().clone().expect("snapshot");
        assert_eq!(shown.version, Some(VersionToken("v2".to_owned())));
        assert_eq!(feed.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_view_does_not_poll_and_refreshes_on_return() {
        let feed = Arc::new(ScriptedLiveFeed::new(vec![FeedReply::NotModified]));
        let client = LiveSyncClient::spawn(feed.clone(), Duration::from_secs(6), CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(10)).await;
        client.set_visible(false);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(feed.calls(), 1);

        client.set_visible(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(feed.calls(), 2, "immediate refresh on becoming visible");
    }

    #[tokio::test(start_paused = true)]
    async fn failures_keep_last_positions() {
        let feed = Arc::new(ScriptedLiveFeed::new(vec![
            FeedReply::Snapshot(snapshot("v1", 1.0)),
            FeedReply::Fail,
        ]));
        let client = LiveSyncClient::spawn(feed.clone(), Duration::from_secs(6), CancellationToken::new());
        let mut positions = client.positions();
        positions.changed().await.expect("snapshot");
        drop(positions.borrow_and_update());

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(client.status().borrow().last_error.is_some());
        assert!(positions.borrow().is_some());
        assert!(!positions.has_changed().expect("sender alive"));
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_polling() {
        let feed = Arc::new(ScriptedLiveFeed::new(vec![FeedReply::NotModified]));
        let client = LiveSyncClient::spawn(feed.clone(), Duration::from_secs(6), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.close();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(feed.calls(), 1);
    }
}
