//! Middleware for the diagnostics HTTP surface.

pub mod logging;

pub use logging::request_logging_simple;
