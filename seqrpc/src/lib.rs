//! # seqrpc — a symmetric client/server RPC runtime
//!
//! seqrpc lets a caller invoke a named procedure on a remote process over a
//! stream transport, passing typed arguments and receiving a typed reply.
//!
//! ## Features
//!
//! - **Framed wire protocol**: a JSON option handshake followed by
//!   length-delimited (header, body) frames with pluggable payload codecs
//!   (MessagePack by default, JSON as an alternative)
//! - **Concurrent server**: many in-flight calls multiplexed over one
//!   connection, with per-request handler timeouts
//! - **Pipelining client**: asynchronous calls correlated by sequence
//!   number, with connect timeouts, per-call deadlines and cancellation
//! - **Transports**: TCP, Unix sockets, and an HTTP CONNECT upgrade, routed
//!   by `scheme@address` strings
//! - **Load balancing**: a discovery-driven front end that fans calls out
//!   across servers
//!
//! ## Quick Start
//!
//! ### Register a service and start a server
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use seqrpc::{Server, Service};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SumArgs {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> seqrpc::Result<()> {
//!     let mut service = Service::new("Foo")?;
//!     service.register_method("Sum", |args: SumArgs| async move {
//!         Ok(args.num1 + args.num2)
//!     })?;
//!
//!     let server = Arc::new(Server::new());
//!     server.register(service)?;
//!     let addr = server.listen("127.0.0.1:8000".parse().unwrap()).await?;
//!     println!("serving on {addr}...");
//!     server.join().await;
//!     Ok(())
//! }
//! ```
//!
//! ### Call it
//!
//! ```rust,no_run
//! # use serde::{Deserialize, Serialize};
//! # #[derive(Serialize, Deserialize)]
//! # struct SumArgs { num1: i64, num2: i64 }
//! #[tokio::main]
//! async fn main() -> seqrpc::Result<()> {
//!     let client = seqrpc::x_dial("tcp@127.0.0.1:8000").await?;
//!     let sum: i64 = client.call("Foo.Sum", &SumArgs { num1: 1, num2: 3 }).await?;
//!     println!("1 + 3 = {sum}");
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

/// Error types and error handling utilities.
mod error;
pub use error::{Error, ErrorKind, Result};

/// Wire headers, codec tags and framing.
mod codec;
pub use codec::{CodecType, Header};

/// Per-connection negotiation record.
mod option;
pub use option::{MAGIC_NUMBER, Options};

/// The method registry services are built from.
mod service;
pub use service::{Method, Service};

/// The connection-serving side.
mod server;
pub use server::{Server, accept, default_server, register};

/// The call-issuing side.
mod client;
pub use client::{Call, Client, x_dial, x_dial_with};

/// HTTP CONNECT transport.
mod http;
pub use http::{DEFAULT_RPC_PATH, dial_http, dial_http_with};

/// Service discovery and load balancing.
pub mod xclient;
