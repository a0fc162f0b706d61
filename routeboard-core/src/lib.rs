//! Core types and engine for the routeboard courier dispatch board.

/// Bundle of port implementations backing a session.
pub mod backend;
/// Engine tunables.
pub mod config;
/// Board gestures and their store transitions.
pub mod drag;
/// Coordinate parsing, map links and distances.
pub mod geo;
/// Live courier/client position polling.
pub mod live;
/// Domain models and identifiers.
pub mod model;
/// Visiting-order computation and re-optimization scheduling.
pub mod optimizer;
/// Traits describing the backend interfaces.
pub mod ports;
/// Order destination resolution with short link expansion.
pub mod resolver;
/// Per-view state machine combining the engine parts.
pub mod session;
/// Assignment snapshot, transitions and undo history.
pub mod store;
/// In-memory port implementations for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::*;
pub use config::*;
pub use drag::*;
pub use live::*;
pub use model::*;
pub use optimizer::*;
pub use ports::*;
pub use resolver::*;
pub use session::*;
pub use store::*;
