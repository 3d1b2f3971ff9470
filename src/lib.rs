//! Streaming async HTTP 1.1 connection engine.
//!
//! At its core HTTP is a stateful RPC protocol, where a client and server
//! communicate with one another by encoding and decoding messages between
//! them. This crate implements the server half of that conversation as a
//! per-connection state machine: it decodes request heads and body chunks
//! from a byte transport, hands them to an application-supplied handler as
//! backpressured streams, and drains the handler's outbound stream back to
//! the transport while enforcing HTTP/1.1 framing rules.
//!
//! ```txt
//!           decode                      encode
//!                \                      /
//!                 -> head, body chunks ->
//! transport                               exchange <-> handler
//!                 <- head, body frames <-
//!                /                      \
//!           encode                      decode
//! ```
//!
//! The engine tracks, per exchange, what has already been written (headers
//! exactly once, before any body byte), decides between `Content-Length` and
//! `Transfer-Encoding: chunked` framing, negotiates connection persistence,
//! answers `Expect: 100-continue`, recovers from mid-stream handler errors,
//! and can hand a connection off to a duplex upgraded protocol (websocket).
//!
//! See also [`async-tls`](https://docs.rs/async-tls),
//! [`async-std`](https://docs.rs/async-std).

#![forbid(unsafe_code)]
#![deny(future_incompatible, rust_2018_idioms)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(missing_docs, unreachable_pub)]
#![cfg_attr(test, deny(warnings))]

/// The maximum amount of headers parsed on the server.
const MAX_HEADERS: usize = 128;

/// The maximum length of the head section we'll try to parse.
const MAX_HEAD_LENGTH: usize = 8 * 1024;

pub use connection::Connection;
pub use error::{Error, Result};

mod connection;
mod cookies;
mod error;

pub mod chunked_file;
pub mod message;
pub mod pipeline;
pub mod server;

/// A generic fallible type.
pub type Exception = Box<dyn std::error::Error + Send + Sync + 'static>;
