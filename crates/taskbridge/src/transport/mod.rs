//! Transport layer for taskbridge.
//!
//! The HTTP bridge (broker endpoints and `/rpc`) via axum. The framed TCP
//! transports live in `server`, `client` and `dispatch::framed`.

pub mod http;

pub use http::{serve, serve_on};
