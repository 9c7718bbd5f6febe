//! HTTP API: the operator control surface.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `GET /api/sessions` - List sessions (active and finished)
//! - `POST /api/sessions/{id}/abort` - Abort one session
//! - `POST /api/orchestrator/abort` - Stop fetching and abort in-flight work
//! - `GET /api/safety` - Safety monitor counters
//! - `POST /api/safety/reset` - Clear the circuit breaker

pub mod control;
mod routes;

pub use routes::{serve, AppState};
