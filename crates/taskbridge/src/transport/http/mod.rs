//! HTTP bridge via axum.

pub mod routes;
pub mod server;

pub use routes::{SESSION_HEADER, routes};
pub use server::{serve, serve_on};
