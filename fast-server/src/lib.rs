//! # fast-server
//!
//! Server library for Fast RPC.
//!
//! This crate provides:
//! - TCP connection handling with async I/O
//! - Protocol framing and per-connection message dispatch
//! - A method registry with streaming request handlers
//! - Graceful shutdown that drains in-flight requests

pub mod connection;
pub mod error;
pub mod handler;
pub mod server;

pub use error::ServerError;
pub use handler::{HandlerResult, MethodRegistry, RequestContext, RpcHandler};
pub use server::{Server, ServerConfig, ServerStats, Transport};
