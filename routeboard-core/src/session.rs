//! Per-view dispatch session tying loading, editing, optimization and saving together.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::DispatchBackend;
use crate::config::DispatchConfig;
use crate::drag::{DragGesture, apply_gesture};
use crate::live::LiveSyncClient;
use crate::model::{
    AssignmentUpdate, ContainerKey, Coordinate, Courier, LiveSnapshot, Order, OrderId,
    ResolvedCoordinate, RouteResult,
};
use crate::optimizer::{
    ReoptimizeDebounce, RouteOptimizer, RoutePlan, route_distance_km, start_points,
};
use crate::ports::{AssignmentPort, PortError};
use crate::resolver::{CoordinateMap, CoordinateResolver, ResolutionUpdate};
use crate::store::{History, RouteBoard, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of a dispatch view.
pub enum SessionPhase {
    /// Nothing loaded.
    Closed,
    /// Orders and couriers are being fetched.
    Opening,
    /// Loaded and matching the backend.
    Ready,
    /// Holds edits not yet saved.
    Editing,
    /// A route optimization is running.
    Optimizing,
    /// A save request is in flight; edits are queued.
    Saving,
    /// The last save failed; edits are kept and saving may be retried.
    Error,
}

#[derive(thiserror::Error, Debug)]
/// Failures of session operations.
pub enum SessionError {
    /// The operation is not allowed in the current phase.
    #[error("Cannot {action} while {phase:?}")]
    InvalidPhase {
        /// Operation attempted.
        action: &'static str,
        /// Phase at the time.
        phase: SessionPhase,
    },
    /// A board edit was rejected.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A backend call failed.
    #[error(transparent)]
    Port(#[from] PortError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What happened to an edit.
pub enum EditOutcome {
    /// Applied; the listed containers lost their optimized route.
    Applied(Vec<ContainerKey>),
    /// Held until the running save settles.
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of a completed save.
pub enum SaveOutcome {
    /// The backend accepted the assignment.
    Saved,
    /// The backend rejected it; the board is unchanged.
    Failed(String),
    /// The view was closed before the response arrived.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// Display figures for one container.
pub struct RouteStats {
    /// Orders in the container.
    pub stops: usize,
    /// Orders with a known destination.
    pub located: usize,
    /// Straight-line length of the current visiting order.
    pub distance_km: f64,
}

/// An assignment save started by [`DispatchSession::begin_save`].
#[derive(Clone)]
pub struct SaveTicket {
    view: u64,
    updates: Vec<AssignmentUpdate>,
    port: Arc<dyn AssignmentPort>,
}

impl SaveTicket {
    /// Payload that will be written.
    #[must_use]
    pub fn updates(&self) -> &[AssignmentUpdate] {
        &self.updates
    }

    /// Send the payload to the backend.
    ///
    /// # Errors
    ///
    /// Returns the [`PortError`] of the save request.
    pub async fn send(&self) -> Result<(), PortError> {
        self.port.save_assignment(&self.updates).await
    }
}

/// A route optimization started by [`DispatchSession::begin_optimize`].
pub struct OptimizeJob {
    view: u64,
    optimizer: Arc<RouteOptimizer>,
    board: RouteBoard,
    coordinates: CoordinateMap,
    starts: HashMap<ContainerKey, Coordinate>,
}

/// Routes computed by an [`OptimizeJob`] together with the board they were computed for.
pub struct OptimizeResult {
    view: u64,
    basis: RouteBoard,
    plan: RoutePlan,
}

impl OptimizeJob {
    /// Compute routes for every container.
    pub async fn run(self) -> OptimizeResult {
        let plan = self
            .optimizer
            .optimize_all(&self.board, &self.coordinates, &self.starts)
            .await;
        OptimizeResult {
            view: self.view,
            basis: self.board,
            plan,
        }
    }
}

struct OpenView {
    orders: Vec<Order>,
    couriers: Vec<Courier>,
    depot: Option<Coordinate>,
    history: History,
    saved: RouteBoard,
    coordinates: CoordinateMap,
    routes: RoutePlan,
    updates: mpsc::UnboundedReceiver<ResolutionUpdate>,
    cancel: CancellationToken,
    // Keeps the expansion cache alive for the life of the view.
    _resolver: CoordinateResolver,
}

impl OpenView {
    fn board(&self) -> &RouteBoard {
        self.history.current()
    }

    fn invalidate(&mut self, key: &ContainerKey) {
        let ids = self
            .board()
            .container(key)
            .map(|container| container.order_ids.clone())
            .unwrap_or_default();
        self.routes.insert(key.clone(), RouteResult::unoptimized(ids));
    }

    fn invalidate_stale_routes(&mut self) {
        let stale: Vec<ContainerKey> = self
            .board()
            .containers()
            .iter()
            .filter(|container| {
                self.routes
                    .get(&container.key)
                    .is_none_or(|route| route.ordered_ids != container.order_ids)
            })
            .map(|container| container.key.clone())
            .collect();
        for key in &stale {
            self.invalidate(key);
        }
    }
}

/// One open dispatch view over a backend.
pub struct DispatchSession {
    backend: DispatchBackend,
    config: DispatchConfig,
    optimizer: Arc<RouteOptimizer>,
    phase: SessionPhase,
    view: Option<OpenView>,
    generation: u64,
    queued: VecDeque<DragGesture>,
    debounce: ReoptimizeDebounce,
    last_error: Option<String>,
}

impl DispatchSession {
    /// Create a closed session.
    #[must_use]
    pub fn new(backend: DispatchBackend, config: DispatchConfig) -> Self {
        let optimizer = Arc::new(backend.route_optimizer(&config));
        let debounce = ReoptimizeDebounce::new(config.reoptimize_debounce());
        Self {
            backend,
            config,
            optimizer,
            phase: SessionPhase::Closed,
            view: None,
            generation: 0,
            queued: VecDeque::new(),
            debounce,
            last_error: None,
        }
    }

    /// Load orders and couriers, resolve destinations and run the first optimization.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidPhase`] unless closed, or the error that aborted loading;
    /// the session is closed again in that case.
    pub async fn open(&mut self) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Closed {
            return Err(self.invalid("open"));
        }
        self.phase = SessionPhase::Opening;
        let view = match self.load().await {
            Ok(view) => view,
            Err(err) => {
                warn!(error = %err, "Opening dispatch view failed");
                self.phase = SessionPhase::Closed;
                return Err(err);
            }
        };
        info!(
            orders = view.orders.len(),
            couriers = view.couriers.len(),
            containers = view.board().containers().len(),
            "Dispatch view opened"
        );
        self.view = Some(view);
        self.generation += 1;
        self.last_error = None;
        self.phase = SessionPhase::Ready;

        let job = self.begin_optimize()?;
        let result = job.run().await;
        self.complete_optimize(result);
        Ok(())
    }

    async fn load(&self) -> Result<OpenView, SessionError> {
        let data = &self.backend.data;
        let (orders, couriers, depot) =
            tokio::try_join!(data.orders(), data.couriers(), data.depot())?;
        let board = RouteBoard::initialize(&orders, &couriers)?;

        let cancel = CancellationToken::new();
        let (resolver, updates) = CoordinateResolver::new(
            Arc::clone(&self.backend.expander),
            self.config.short_link_hosts.clone(),
            cancel.child_token(),
        );
        let coordinates = resolver.resolve_all(&orders);
        let routes = board
            .containers()
            .iter()
            .map(|container| {
                (
                    container.key.clone(),
                    RouteResult::unoptimized(container.order_ids.clone()),
                )
            })
            .collect();

        Ok(OpenView {
            orders,
            couriers,
            depot: depot.or(self.config.depot),
            history: History::new(board.clone(), self.config.history_limit),
            saved: board,
            coordinates,
            routes,
            updates,
            cancel,
            _resolver: resolver,
        })
    }

    /// Close the view: abort expansions and live sync, drop queued edits.
    ///
    /// A save still in flight finishes, but its result is discarded.
    pub fn close(&mut self) {
        if let Some(view) = self.view.take() {
            view.cancel.cancel();
            info!("Dispatch view closed");
        }
        self.queued.clear();
        self.debounce = ReoptimizeDebounce::new(self.config.reoptimize_debounce());
        self.phase = SessionPhase::Closed;
    }

    /// Apply a gesture, or queue it while a save is in flight.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidPhase`] when nothing is open, or
    /// [`SessionError::Store`] when the gesture is rejected; the board is unchanged then.
    pub fn apply_edit(&mut self, gesture: DragGesture) -> Result<EditOutcome, SessionError> {
        if self.phase == SessionPhase::Saving {
            debug!(?gesture, "Save in flight, queueing edit");
            self.queued.push_back(gesture);
            return Ok(EditOutcome::Queued);
        }
        self.ensure_editable("edit")?;
        let view = self.view_mut("edit")?;
        let outcome = apply_gesture(view.board(), &gesture)?;
        view.history.commit(outcome.board);
        for key in &outcome.touched {
            view.invalidate(key);
        }
        debug!(?gesture, touched = outcome.touched.len(), "Edit applied");
        self.settle();
        Ok(EditOutcome::Applied(outcome.touched))
    }

    /// Step back one edit. Returns false when there is nothing to undo.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidPhase`] when nothing is open or a save is in flight.
    pub fn undo(&mut self) -> Result<bool, SessionError> {
        self.step_history("undo", History::undo)
    }

    /// Re-apply the last undone edit. Returns false when there is nothing to redo.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidPhase`] when nothing is open or a save is in flight.
    pub fn redo(&mut self) -> Result<bool, SessionError> {
        self.step_history("redo", History::redo)
    }

    fn step_history(
        &mut self,
        action: &'static str,
        step: fn(&mut History) -> bool,
    ) -> Result<bool, SessionError> {
        self.ensure_editable(action)?;
        let view = self.view_mut(action)?;
        if !step(&mut view.history) {
            return Ok(false);
        }
        view.invalidate_stale_routes();
        self.settle();
        Ok(true)
    }

    /// Snapshot the current board and coordinates for an optimization run.
    ///
    /// Edits stay allowed while the job runs; containers edited in the meantime keep their
    /// new order when the result is applied.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidPhase`] when nothing is open, a save is in flight or
    /// another optimization is running.
    pub fn begin_optimize(&mut self) -> Result<OptimizeJob, SessionError> {
        if !matches!(
            self.phase,
            SessionPhase::Ready | SessionPhase::Editing | SessionPhase::Error
        ) {
            return Err(self.invalid("optimize"));
        }
        let generation = self.generation;
        let optimizer = Arc::clone(&self.optimizer);
        let view = self.view_mut("optimize")?;
        let board = view.board().clone();
        let starts = start_points(&board, &view.couriers, view.depot);
        let job = OptimizeJob {
            view: generation,
            optimizer,
            board,
            coordinates: view.coordinates.clone(),
            starts,
        };
        self.phase = SessionPhase::Optimizing;
        Ok(job)
    }

    /// Apply a finished optimization. Returns the number of containers whose route was taken.
    ///
    /// Each container's route replaces its sequence atomically, and only if the container
    /// still matches the board the job was computed for. Results for a closed view are dropped.
    pub fn complete_optimize(&mut self, result: OptimizeResult) -> usize {
        if self.phase != SessionPhase::Optimizing || result.view != self.generation {
            debug!("Optimization finished after the view changed, discarding");
            return 0;
        }
        let Some(view) = self.view.as_mut() else {
            return 0;
        };

        let mut next = view.board().clone();
        let mut applied = 0;
        for (key, route) in result.plan {
            let unchanged = result.basis.container(&key).map(|old| &old.order_ids)
                == next.container(&key).map(|current| &current.order_ids);
            if !unchanged {
                debug!(container = %key, "Container edited during optimization, keeping edit");
                continue;
            }
            match next.replace_order(&key, &route.ordered_ids) {
                Ok(replaced) => {
                    next = replaced;
                    view.routes.insert(key, route);
                    applied += 1;
                }
                Err(err) => warn!(container = %key, error = %err, "Ignoring unusable route"),
            }
        }
        if &next != view.board() {
            view.history.commit(next);
        }
        info!(applied, "Routes applied");
        self.phase = SessionPhase::Ready;
        self.settle();
        applied
    }

    /// Optimize and apply the result in one call.
    ///
    /// # Errors
    ///
    /// See [`DispatchSession::begin_optimize`].
    pub async fn optimize(&mut self) -> Result<usize, SessionError> {
        let job = self.begin_optimize()?;
        let result = job.run().await;
        Ok(self.complete_optimize(result))
    }

    /// Take every late coordinate resolution. Returns how many destinations changed.
    ///
    /// A change schedules a debounced re-optimization.
    pub fn poll_resolutions(&mut self, now: Instant) -> usize {
        let Some(view) = self.view.as_mut() else {
            return 0;
        };
        let mut changed = 0;
        while let Ok(update) = view.updates.try_recv() {
            let previous = view
                .coordinates
                .insert(update.order_id.clone(), update.resolved);
            if previous != Some(update.resolved) {
                debug!(order_id = %update.order_id, resolved = ?update.resolved, "Destination resolved");
                changed += 1;
            }
        }
        if changed > 0 {
            self.debounce.note_change(now);
        }
        changed
    }

    /// When the pending re-optimization should run, if one is scheduled.
    #[must_use]
    pub fn reoptimize_deadline(&self) -> Option<Instant> {
        self.debounce.deadline()
    }

    /// True when a scheduled re-optimization is due and may start now.
    pub fn reoptimize_due(&mut self, now: Instant) -> bool {
        matches!(
            self.phase,
            SessionPhase::Ready | SessionPhase::Editing | SessionPhase::Error
        ) && self.debounce.take_due(now)
    }

    /// Take new live courier positions as route start points.
    /// Returns true when any courier moved.
    pub fn apply_live_positions(&mut self, snapshot: &LiveSnapshot) -> bool {
        let Some(view) = self.view.as_mut() else {
            return false;
        };
        let mut moved = false;
        for courier in &mut view.couriers {
            let Some(fresh) = snapshot
                .couriers
                .iter()
                .find(|position| position.id == courier.id.0)
                .and_then(|position| Coordinate::new(position.lat, position.lng))
            else {
                continue;
            };
            if courier.live_position() != Some(fresh) {
                courier.latitude = Some(fresh.lat);
                courier.longitude = Some(fresh.lng);
                moved = true;
            }
        }
        moved
    }

    /// Start polling live positions for this view; polling stops when the view closes.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidPhase`] when nothing is open.
    pub fn start_live_sync(&self) -> Result<LiveSyncClient, SessionError> {
        let view = self.view.as_ref().ok_or_else(|| self.invalid("sync"))?;
        Ok(LiveSyncClient::spawn(
            Arc::clone(&self.backend.live),
            self.config.poll_interval(),
            view.cancel.clone(),
        ))
    }

    /// Freeze the current assignment for saving; later edits are queued.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidPhase`] when nothing is open, or while optimizing or
    /// already saving.
    pub fn begin_save(&mut self) -> Result<SaveTicket, SessionError> {
        if !matches!(
            self.phase,
            SessionPhase::Ready | SessionPhase::Editing | SessionPhase::Error
        ) {
            return Err(self.invalid("save"));
        }
        let view = self.view.as_ref().ok_or_else(|| self.invalid("save"))?;
        let ticket = SaveTicket {
            view: self.generation,
            updates: view.board().assignment_updates(),
            port: Arc::clone(&self.backend.assignments),
        };
        info!(orders = ticket.updates.len(), "Saving assignments");
        self.phase = SessionPhase::Saving;
        Ok(ticket)
    }

    /// Settle a save. Success closes the view unless edits were queued meanwhile;
    /// failure keeps every edit. Queued edits are applied afterwards either way.
    pub fn complete_save(
        &mut self,
        ticket: &SaveTicket,
        result: Result<(), PortError>,
    ) -> SaveOutcome {
        if self.phase != SessionPhase::Saving || ticket.view != self.generation {
            debug!("Save finished after the view closed, discarding result");
            return SaveOutcome::Discarded;
        }

        let outcome = match result {
            Ok(()) => {
                info!(orders = ticket.updates.len(), "Assignments saved");
                self.last_error = None;
                if self.queued.is_empty() {
                    self.close();
                    return SaveOutcome::Saved;
                }
                if let Some(view) = self.view.as_mut() {
                    view.saved = view.board().clone();
                }
                self.phase = SessionPhase::Ready;
                SaveOutcome::Saved
            }
            Err(err) => {
                warn!(error = %err, "Saving assignments failed");
                let message = err.to_string();
                self.last_error = Some(message.clone());
                self.phase = SessionPhase::Error;
                SaveOutcome::Failed(message)
            }
        };

        while let Some(gesture) = self.queued.pop_front() {
            if let Err(err) = self.apply_edit(gesture) {
                warn!(error = %err, "Queued edit rejected");
                self.last_error = Some(err.to_string());
            }
        }
        outcome
    }

    /// Save the current assignment and settle the result.
    ///
    /// # Errors
    ///
    /// See [`DispatchSession::begin_save`].
    pub async fn save(&mut self) -> Result<SaveOutcome, SessionError> {
        let ticket = self.begin_save()?;
        let result = ticket.send().await;
        Ok(self.complete_save(&ticket, result))
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Message of the last failed save or rejected queued edit.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Number of edits waiting for the running save.
    #[must_use]
    pub fn queued_edits(&self) -> usize {
        self.queued.len()
    }

    /// Current board, if open.
    #[must_use]
    pub fn board(&self) -> Option<&RouteBoard> {
        self.view.as_ref().map(OpenView::board)
    }

    /// True when the board differs from what the backend last stored.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.view
            .as_ref()
            .is_some_and(|view| view.board() != &view.saved)
    }

    /// Loaded order by id.
    #[must_use]
    pub fn order(&self, order_id: &OrderId) -> Option<&Order> {
        self.view
            .as_ref()
            .and_then(|view| view.orders.iter().find(|order| &order.id == order_id))
    }

    /// Loaded couriers.
    #[must_use]
    pub fn couriers(&self) -> &[Courier] {
        self.view
            .as_ref()
            .map(|view| view.couriers.as_slice())
            .unwrap_or_default()
    }

    /// Resolution state of an order's destination.
    #[must_use]
    pub fn coordinate(&self, order_id: &OrderId) -> ResolvedCoordinate {
        self.view
            .as_ref()
            .and_then(|view| view.coordinates.get(order_id).copied())
            .unwrap_or(ResolvedCoordinate::Unresolved)
    }

    /// Route last computed for a container.
    #[must_use]
    pub fn route(&self, key: &ContainerKey) -> Option<&RouteResult> {
        self.view.as_ref().and_then(|view| view.routes.get(key))
    }

    /// Stop counts and distance for a container.
    #[must_use]
    pub fn route_stats(&self, key: &ContainerKey) -> Option<RouteStats> {
        let view = self.view.as_ref()?;
        let container = view.board().container(key)?;
        let start = start_points(view.board(), &view.couriers, view.depot)
            .get(key)
            .copied();
        let located = container
            .order_ids
            .iter()
            .filter(|id| {
                view.coordinates
                    .get(*id)
                    .and_then(ResolvedCoordinate::coordinate)
                    .is_some()
            })
            .count();
        Some(RouteStats {
            stops: container.order_ids.len(),
            located,
            distance_km: route_distance_km(start, &container.order_ids, &view.coordinates),
        })
    }

    fn ensure_editable(&self, action: &'static str) -> Result<(), SessionError> {
        match self.phase {
            SessionPhase::Ready
            | SessionPhase::Editing
            | SessionPhase::Optimizing
            | SessionPhase::Error => Ok(()),
            SessionPhase::Closed | SessionPhase::Opening | SessionPhase::Saving => {
                Err(self.invalid(action))
            }
        }
    }

    fn view_mut(&mut self, action: &'static str) -> Result<&mut OpenView, SessionError> {
        let phase = self.phase;
        self.view
            .as_mut()
            .ok_or(SessionError::InvalidPhase { action, phase })
    }

    // Optimizing ends only in `complete_optimize`; errors stay visible until the next edit.
    fn settle(&mut self) {
        if self.phase == SessionPhase::Optimizing {
            return;
        }
        self.phase = if self.is_dirty() {
            SessionPhase::Editing
        } else {
            SessionPhase::Ready
        };
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidPhase {
            action,
            phase: self.phase,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{CourierId, RouteOrigin};
    use crate::testing::{
        FeedReply, RecordingAssignments, ScriptedLiveFeed, StaticDispatchData, StaticExpander,
    };

    fn order(id: &str, number: u32, courier: Option<&str>, at: Option<(f64, f64)>) -> Order {
        Order {
            id: OrderId::from(id),
            order_number: number,
            delivery_address: String::new(),
            latitude: at.map(|(lat, _)| lat),
            longitude: at.map(|(_, lng)| lng),
            courier_id: courier.map(CourierId::from),
            status: "new".to_owned(),
            display_name: id.to_uppercase(),
        }
    }

    fn courier(id: &str, at: Option<(f64, f64)>) -> Courier {
        Courier {
            id: CourierId::from(id),
            name: id.to_uppercase(),
            latitude: at.map(|(lat, _)| lat),
            longitude: at.map(|(_, lng)| lng),
        }
    }

    fn key(id: &str) -> ContainerKey {
        ContainerKey::Courier(CourierId::from(id))
    }

    fn data() -> StaticDispatchData {
        StaticDispatchData {
            orders: vec![
                order("a", 1, Some("c1"), Some((0.0, 3.0))),
                order("b", 2, Some("c1"), Some((0.0, 1.0))),
                order("c", 3, Some("c1"), Some((0.0, 0.0))),
                order("u", 4, None, None),
            ],
            couriers: vec![courier("c1", Some((0.0, 0.0))), courier("c2", None)],
            depot: None,
        }
    }

    fn session_with(
        data: StaticDispatchData,
        expander: StaticExpander,
        assignments: Arc<RecordingAssignments>,
    ) -> DispatchSession {
        let backend = DispatchBackend {
            data: Arc::new(data),
            assignments,
            expander: Arc::new(expander),
            optimizer: None,
            live: Arc::new(ScriptedLiveFeed::new(vec![FeedReply::NotModified])),
        };
        DispatchSession::new(backend, DispatchConfig::default())
    }

    async fn opened() -> (DispatchSession, Arc<RecordingAssignments>) {
        let assignments = Arc::new(RecordingAssignments::default());
        let mut session = session_with(data(), StaticExpander::default(), Arc::clone(&assignments));
        session.open().await.expect("open");
        (session, assignments)
    }

    fn ids(session: &DispatchSession, key: &ContainerKey) -> Vec<String> {
        session
            .board()
            .and_then(|board| board.container(key))
            .map(|container| container.order_ids.iter().map(|id| id.0.clone()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn open_optimizes_from_courier_position() {
        let (session, _) = opened().await;

        assert_eq!(ids(&session, &key("c1")), vec!["c", "b", "a"]);
        let board = session.board().expect("open");
        assert_eq!(board.number_of(&OrderId::from("c")), Some(1));
        assert_eq!(board.number_of(&OrderId::from("a")), Some(3));
        assert_eq!(
            session.route(&key("c1")).map(|route| route.origin),
            Some(RouteOrigin::Heuristic)
        );
        assert!(session.board().and_then(|board| board.container(&key("c2"))).is_some());
        assert_eq!(session.phase(), SessionPhase::Editing);
    }

    #[tokio::test]
    async fn edit_invalidates_only_touched_routes() {
        let (mut session, _) = opened().await;

        let outcome = session
            .apply_edit(DragGesture::Move {
                order_id: OrderId::from("u"),
                target: key("c2"),
                index: 0,
            })
            .expect("move");
        assert_eq!(
            outcome,
            EditOutcome::Applied(vec![ContainerKey::Unassigned, key("c2")])
        );
        assert_eq!(
            session.route(&key("c1")).map(|route| route.origin),
            Some(RouteOrigin::Heuristic)
        );
        let moved = session.route(&key("c2")).expect("route");
        assert_eq!(moved.origin, RouteOrigin::None);
        assert_eq!(moved.ordered_ids, vec![OrderId::from("u")]);
    }

    #[tokio::test]
    async fn rejected_swap_leaves_board_unchanged() {
        let (mut session, _) = opened().await;
        let before = session.board().cloned();

        let err = session
            .apply_edit(DragGesture::SwapNumber {
                order_id: OrderId::from("a"),
                number: 42,
            })
            .expect_err("unknown number");
        assert!(matches!(err, SessionError::Store(StoreError::NumberNotFound(42))));
        assert_eq!(session.board().cloned(), before);
    }

    #[tokio::test]
    async fn save_sends_every_order_and_closes() {
        let (mut session, assignments) = opened().await;

        let outcome = session.save().await.expect("save");
        assert_eq!(outcome, SaveOutcome::Saved);
        assert_eq!(session.phase(), SessionPhase::Closed);

        let saved = assignments.saved();
        assert_eq!(saved.len(), 1);
        let batch = saved.first().expect("batch");
        assert_eq!(batch.len(), 4);
        for update in batch {
            let unassigned = update.order_id == OrderId::from("u");
            assert_eq!(update.courier_id.is_none(), unassigned);
        }
    }

    #[tokio::test]
    async fn failed_save_keeps_edits_and_allows_retry() {
        let (mut session, assignments) = opened().await;
        assignments.set_rejecting(true);
        let before = session.board().cloned();

        let outcome = session.save().await.expect("save attempt");
        assert!(matches!(outcome, SaveOutcome::Failed(_)));
        assert_eq!(session.phase(), SessionPhase::Error);
        assert_eq!(session.board().cloned(), before);
        assert!(session.last_error().is_some());

        assignments.set_rejecting(false);
        assert_eq!(session.save().await.expect("retry"), SaveOutcome::Saved);
        assert_eq!(assignments.saved().len(), 1);
    }

    #[tokio::test]
    async fn edits_during_save_are_queued_until_it_settles() {
        let (mut session, _) = opened().await;
        let ticket = session.begin_save().expect("begin");

        let queued = session
            .apply_edit(DragGesture::Reorder {
                container: key("c1"),
                from: 0,
                to: 2,
            })
            .expect("queue");
        assert_eq!(queued, EditOutcome::Queued);
        assert_eq!(ids(&session, &key("c1")), vec!["c", "b", "a"]);

        let outcome = session.complete_save(&ticket, Err(PortError::Status(500)));
        assert!(matches!(outcome, SaveOutcome::Failed(_)));
        assert_eq!(ids(&session, &key("c1")), vec!["b", "a", "c"]);
        assert_eq!(session.queued_edits(), 0);
        assert_eq!(session.phase(), SessionPhase::Editing);
    }

    #[tokio::test]
    async fn successful_save_with_queued_edits_stays_open() {
        let (mut session, _) = opened().await;
        let ticket = session.begin_save().expect("begin");
        session
            .apply_edit(DragGesture::Reorder {
                container: key("c1"),
                from: 0,
                to: 1,
            })
            .expect("queue");

        assert_eq!(session.complete_save(&ticket, Ok(())), SaveOutcome::Saved);
        assert_eq!(session.phase(), SessionPhase::Editing);
        assert_eq!(ids(&session, &key("c1")), vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn save_result_after_close_is_discarded() {
        let (mut session, assignments) = opened().await;
        let ticket = session.begin_save().expect("begin");
        session.close();

        let result = ticket.send().await;
        assert_eq!(session.complete_save(&ticket, result), SaveOutcome::Discarded);
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(assignments.saved().len(), 1);
    }

    #[tokio::test]
    async fn optimization_keeps_containers_edited_meanwhile() {
        let assignments = Arc::new(RecordingAssignments::default());
        let mut data = data();
        data.orders.push(order("d", 1, Some("c2"), Some((5.0, 5.0))));
        data.orders.push(order("e", 2, Some("c2"), Some((1.0, 1.0))));
        let mut session = session_with(data, StaticExpander::default(), assignments);
        session.open().await.expect("open");

        session
            .apply_edit(DragGesture::Reorder {
                container: key("c1"),
                from: 0,
                to: 2,
            })
            .expect("reorder");
        let job = session.begin_optimize().expect("begin");
        assert_eq!(session.phase(), SessionPhase::Optimizing);
        session
            .apply_edit(DragGesture::Reorder {
                container: key("c2"),
                from: 1,
                to: 0,
            })
            .expect("edit while optimizing");

        let applied = session.complete_optimize(job.run().await);
        assert!(applied >= 1);
        // c1 was only edited before the job started, so the route is taken again.
        assert_eq!(ids(&session, &key("c1")), vec!["c", "b", "a"]);
        assert_eq!(ids(&session, &key("c2")), vec!["e", "d"]);
        assert_eq!(
            session.route(&key("c2")).map(|route| route.origin),
            Some(RouteOrigin::None)
        );
    }

    #[tokio::test]
    async fn undo_restores_board_and_clears_stale_routes() {
        let (mut session, _) = opened().await;
        session
            .apply_edit(DragGesture::Move {
                order_id: OrderId::from("a"),
                target: key("c2"),
                index: 0,
            })
            .expect("move");

        assert!(session.undo().expect("undo"));
        assert_eq!(ids(&session, &key("c1")), vec!["c", "b", "a"]);
        assert!(session.redo().expect("redo"));
        assert_eq!(ids(&session, &key("c2")), vec!["a"]);
        assert!(!session.redo().expect("nothing to redo"));
    }

    #[tokio::test]
    async fn late_resolution_schedules_reoptimization() {
        let assignments = Arc::new(RecordingAssignments::default());
        let mut data = data();
        let mut linked = order("l", 5, Some("c2"), None);
        linked.delivery_address = "https://maps.app.goo.gl/abc".to_owned();
        data.orders.push(linked);
        let expander = StaticExpander::default()
            .with("https://maps.app.goo.gl/abc", "https://maps.google.com/?q=2.5,3.5");
        let mut session = session_with(data, expander, assignments);
        session.open().await.expect("open");

        let mut changed = 0;
        for _ in 0..100 {
            changed = session.poll_resolutions(Instant::now());
            if changed > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(changed, 1);
        assert_eq!(
            session.coordinate(&OrderId::from("l")),
            ResolvedCoordinate::Located(Coordinate { lat: 2.5, lng: 3.5 })
        );

        let deadline = session.reoptimize_deadline().expect("scheduled");
        assert!(!session.reoptimize_due(deadline - Duration::from_millis(1)));
        assert!(session.reoptimize_due(deadline));
        assert!(!session.reoptimize_due(deadline));
    }

    #[tokio::test]
    async fn live_positions_move_route_start() {
        let (mut session, _) = opened().await;
        let snapshot = LiveSnapshot {
            couriers: vec![crate::model::LivePosition {
                id: "c1".to_owned(),
                name: "C1".to_owned(),
                lat: 0.0,
                lng: 3.0,
            }],
            clients: Vec::new(),
            version: None,
            fetched_at: chrono::Utc::now(),
        };
        assert!(session.apply_live_positions(&snapshot));
        assert!(!session.apply_live_positions(&snapshot));

        session.optimize().await.expect("optimize");
        assert_eq!(ids(&session, &key("c1")), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn route_stats_count_located_stops() {
        let (session, _) = opened().await;
        let stats = session.route_stats(&key("c1")).expect("stats");
        assert_eq!(stats.stops, 3);
        assert_eq!(stats.located, 3);
        assert!(stats.distance_km > 300.0);

        let unassigned = session.route_stats(&ContainerKey::Unassigned).expect("stats");
        assert_eq!(unassigned.located, 0);
        assert!(unassigned.distance_km.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn edits_need_an_open_view() {
        let mut session = session_with(
            data(),
            StaticExpander::default(),
            Arc::new(RecordingAssignments::default()),
        );
        let err = session
            .apply_edit(DragGesture::Reorder {
                container: key("c1"),
                from: 0,
                to: 1,
            })
            .expect_err("closed");
        assert!(matches!(
            err,
            SessionError::InvalidPhase {
                phase: SessionPhase::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn close_stops_expansions_and_live_sync() {
        let expander = Arc::new(
            StaticExpander::default()
                .with("https://maps.app.goo.gl/slow", "https://maps.google.com/?q=1.5,2.5")
                .with_delay(Duration::from_secs(30)),
        );
        let mut linked = order("l", 5, None, None);
        linked.delivery_address = "https://maps.app.goo.gl/slow".to_owned();
        let mut orders = data();
        orders.orders.push(linked);

        let backend = DispatchBackend {
            data: Arc::new(orders),
            assignments: Arc::new(RecordingAssignments::default()),
            expander: expander.clone(),
            optimizer: None,
            live: Arc::new(
                ScriptedLiveFeed::new(vec![FeedReply::NotModified])
                    .with_delay(Duration::from_secs(30)),
            ),
        };
        let mut session = DispatchSession::new(backend, DispatchConfig::default());
        let idle = Arc::strong_count(&expander);

        session.open().await.expect("open");
        assert_eq!(session.coordinate(&OrderId::from("l")), ResolvedCoordinate::Pending);
        assert!(Arc::strong_count(&expander) > idle, "expansion running");
        let live = session.start_live_sync().expect("live sync");
        let mut status = live.status();

        session.close();

        tokio::time::timeout(Duration::from_secs(2), async {
            while Arc::strong_count(&expander) > idle {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("expansion aborted");
        tokio::time::timeout(Duration::from_secs(2), async {
            while status.changed().await.is_ok() {}
        })
        .await
        .expect("poller stopped while its client is still held");
        drop(live);
    }
}
