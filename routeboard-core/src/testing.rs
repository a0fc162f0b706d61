//! In-memory port implementations for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::model::{AssignmentUpdate, Coordinate, Courier, LiveSnapshot, Order, VersionToken};
use crate::ports::{
    AssignmentPort, DispatchDataPort, LiveSnapshotPort, OptimizedRoute, PortError,
    RouteOptimizationPort, RouteRequest, SnapshotFetch, UrlExpansionPort,
};

/// Expander answering from a fixed table; unknown links fail.
#[derive(Default)]
pub struct StaticExpander {
    table: HashMap<String, String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticExpander {
    /// Add a short → long mapping.
    #[must_use]
    pub fn with(mut self, short_url: &str, long_url: &str) -> Self {
        self.table.insert(short_url.to_owned(), long_url.to_owned());
        self
    }

    /// Sleep before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of expansion requests received.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UrlExpansionPort for StaticExpander {
    async fn expand(&self, short_url: &str) -> Result<String, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.table.get(short_url).cloned().ok_or(PortError::Status(404))
    }
}

/// Optimizer returning a canned answer, or failing, and recording requests.
pub struct ScriptedOptimizer {
    answer: Option<Vec<OptimizedRoute>>,
    requests: Mutex<Vec<Vec<RouteRequest>>>,
}

impl ScriptedOptimizer {
    /// Always answer with `routes`.
    #[must_use]
    pub fn answering(routes: Vec<OptimizedRoute>) -> Self {
        Self {
            answer: Some(routes),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always fail.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            answer: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every batch received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<Vec<RouteRequest>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RouteOptimizationPort for ScriptedOptimizer {
    async fn optimize(&self, routes: &[RouteRequest]) -> Result<Vec<OptimizedRoute>, PortError> {
        self.requests.lock().push(routes.to_vec());
        self.answer
            .clone()
            .ok_or_else(|| PortError::Internal("optimizer unavailable".to_owned()))
    }
}

#[derive(Debug, Clone)]
/// One scripted live feed answer.
pub enum FeedReply {
    /// Return this snapshot.
    Snapshot(LiveSnapshot),
    /// Report the token as current.
    NotModified,
    /// Fail the request.
    Fail,
}

/// Live feed replaying replies in order; the last reply repeats.
pub struct ScriptedLiveFeed {
    replies: Vec<FeedReply>,
    delay: Option<Duration>,
    tokens: Mutex<Vec<Option<VersionToken>>>,
}

impl ScriptedLiveFeed {
    /// Feed answering with `replies`.
    #[must_use]
    pub fn new(replies: Vec<FeedReply>) -> Self {
        Self {
            replies,
            delay: None,
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering each request.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of fetches started.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Version token sent with each fetch.
    #[must_use]
    pub fn tokens_seen(&self) -> Vec<Option<VersionToken>> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl LiveSnapshotPort for ScriptedLiveFeed {
    async fn fetch(&self, since: Option<&VersionToken>) -> Result<SnapshotFetch, PortError> {
        let reply = {
            let mut tokens = self.tokens.lock();
            tokens.push(since.cloned());
            let index = tokens.len() - 1;
            self.replies
                .get(index)
                .or_else(|| self.replies.last())
                .cloned()
                .unwrap_or(FeedReply::NotModified)
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match reply {
            FeedReply::Snapshot(snapshot) => Ok(SnapshotFetch::Modified(snapshot)),
            FeedReply::NotModified => Ok(SnapshotFetch::NotModified),
            FeedReply::Fail => Err(PortError::Status(503)),
        }
    }
}

/// Assignment sink recording saved batches; can be told to reject.
#[derive(Default)]
pub struct RecordingAssignments {
    saved: Mutex<Vec<Vec<AssignmentUpdate>>>,
    reject: AtomicBool,
}

impl RecordingAssignments {
    /// Make subsequent saves fail (`true`) or succeed (`false`).
    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Batches accepted so far.
    #[must_use]
    pub fn saved(&self) -> Vec<Vec<AssignmentUpdate>> {
        self.saved.lock().clone()
    }
}

#[async_trait]
impl AssignmentPort for RecordingAssignments {
    async fn save_assignment(&self, updates: &[AssignmentUpdate]) -> Result<(), PortError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(PortError::Rejected("batch rejected".to_owned()));
        }
        self.saved.lock().push(updates.to_vec());
        Ok(())
    }
}

/// Order/courier source serving fixed data.
#[derive(Default, Clone)]
pub struct StaticDispatchData {
    /// Orders returned.
    pub orders: Vec<Order>,
    /// Couriers returned.
    pub couriers: Vec<Courier>,
    /// Depot returned.
    pub depot: Option<Coordinate>,
}

#[async_trait]
impl DispatchDataPort for StaticDispatchData {
    async fn orders(&self) -> Result<Vec<Order>, PortError> {
        Ok(self.orders.clone())
    }

    async fn couriers(&self) -> Result<Vec<Courier>, PortError> {
        Ok(self.couriers.clone())
    }

    async fn depot(&self) -> Result<Option<Coordinate>, PortError> {
        Ok(self.depot)
    }
}
