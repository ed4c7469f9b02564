//! HTTP surface of the timelapse capture server: run control, live log and
//! status streams, and access to the latest run's frames and video.

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
