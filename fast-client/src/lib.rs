//! # fast-client
//!
//! Client library for Fast RPC.
//!
//! This crate provides:
//! - A request multiplexer running any number of concurrent RPCs over one
//!   connection, correlated by message id
//! - Lazy result streams with per-request timeouts
//! - Transport-neutral operation over any async byte channel

pub mod client;
pub mod connection;
pub mod error;
pub mod stream;

pub use client::FastClient;
pub use connection::{
    ClientConfig, Connection, RecentRequest, RequestOutcome, RpcOptions, Transport,
};
pub use error::ClientError;
pub use stream::ResultStream;
