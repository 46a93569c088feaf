//! RPC server: session handling, call dispatch and the HTTP transport.

pub mod app;
pub mod cli;
pub mod dispatch;
pub mod error;
pub mod middleware;

pub use app::{AppServices, build_app};
pub use dispatch::{RpcRequest, RpcResponse};
pub use error::RpcError;
