pub mod artifacts;
pub mod control;
pub mod stream;
