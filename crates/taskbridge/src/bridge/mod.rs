//! Wire layer for the coordinator channel.
//!
//! # Architecture
//!
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **protocol**: command request/response frames and their validation

pub mod codec;
pub mod protocol;
