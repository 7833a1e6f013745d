//! JSON-RPC 2.0 method dispatch with a per-session `initialize` handshake.
//!
//! The dispatcher is transport-agnostic. `framed` binds it to the length
//! prefixed TCP channel (one session per connection); the HTTP binding lives
//! in `transport::http` and keys sessions by the `mcp-session-id` header.

pub mod dispatcher;
pub mod framed;
pub mod rpc;
pub mod session;

pub use dispatcher::{
    BridgeExecutor, DirectExecutor, DispatchError, Executor, FailureKind, MethodDispatcher,
    Operation, Resource, ToolFailure, ToolOutcome,
};
pub use rpc::{Payload, RpcError, RpcRequest, RpcResponse};
pub use session::{SessionId, SessionState, SessionStore};
