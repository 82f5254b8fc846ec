//! Rendezvous relay for fleece workers.
//!
//! Each worker keeps one websocket open on `/register`. The relay forwards
//! `connect_request` and `connect_reply` frames to the worker named in them
//! and answers offers for unregistered workers with a refusal.

pub mod config;
pub mod registry;
pub mod server;
pub mod telemetry;

pub use config::{Cli, RoadConfig};
pub use registry::{RelayOutcome, RelayRegistry};
pub use server::{router, serve, AppState};
