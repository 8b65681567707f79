//! HTTP side of the gateway.
//!
//! Terminates TLS, authenticates Git smart-HTTP requests against the
//! authorization service and reverse-proxies the allowed ones to the upstream
//! host with a pooled service account.

pub mod proxy;
pub mod server;

pub use server::{bind_http_server, HttpServer};
