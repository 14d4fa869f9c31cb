//! portfolio_sync — reconciliation core for a trading-dashboard backend.
//!
//! REST snapshots seed the portfolio state, WebSocket deltas patch it in
//! place, and a single reconciler task owns the result and publishes a
//! consistent view model. Mutating commands are fire-and-forget HTTP calls
//! followed by a forced re-snapshot, so local state only ever changes on
//! the server's authority.

pub mod api;
pub mod commands;
pub mod config;
pub mod domain;
pub mod metrics;
pub mod project;
pub mod reconcile;
pub mod recorder;
pub mod snapshot;
pub mod stream;
