//! HTTP API: status gateway, admin view and worker bootstrap.

pub mod app;
pub mod middleware;
