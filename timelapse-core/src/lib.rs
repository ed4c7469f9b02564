//! # Timelapse Core
//!
//! Supervision of the external timelapse capture script and live fan-out of
//! its progress.
//!
//! ## Overview
//!
//! - [`supervisor::ProcessSupervisor`] starts and stops the script, tails its
//!   merged stdout/stderr and turns `captured: <n>` markers into progress.
//! - [`status::StatusStore`] keeps the single current [`status::RunStatus`]
//!   in an atomically replaced JSON file.
//! - [`logs::LogRingBuffer`] holds the bounded tail of the current run's
//!   output.
//! - [`broadcast::BroadcastHub`] pushes log lines and status snapshots to any
//!   number of subscribers without ever blocking on a slow one.
//!
//! The crate has no HTTP dependencies; `timelapse-server` adapts it to axum.

pub mod broadcast;
pub mod error;
pub mod logs;
pub mod status;
pub mod supervisor;

pub use broadcast::{
    BroadcastHub, EventKind, HubConfig, HubEvent, SubscriberId, Subscription,
};
pub use error::{Result, StoreError, SupervisorError};
pub use logs::{LogLine, LogRingBuffer};
pub use status::{RunState, RunStatus, StatusStore};
pub use supervisor::{ProcessSupervisor, SupervisorConfig, SupervisorPhase};
