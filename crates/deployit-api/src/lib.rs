//! Webhook listener and run API for DeployIt.
//!
//! Push webhooks and manual triggers feed the run queue; run history is
//! read back over REST.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
