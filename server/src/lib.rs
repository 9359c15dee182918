//! riptide server: configuration, logging, and process wiring for the
//! HTTP and framed listeners.

pub mod banner;
pub mod config;
pub mod logging;
pub mod signal;
