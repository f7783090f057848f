//! Islet control-plane daemon: HTTP/WebSocket surface over the kernel.

pub mod accounts;
pub mod auth;
pub mod environments;
pub mod middleware;
pub mod sandboxes;
pub mod server;
pub mod shutdown;
pub mod telemetry;
pub mod ws;
