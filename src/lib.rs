#![deny(unsafe_code)]

//! Correlated RPC client for a flight-simulation ground station.
//!
//! This crate speaks a MessagePack request/response protocol over a single
//! long-lived TCP connection. Concurrent calls are multiplexed over that one
//! stream and matched back to their callers by a per-call identifier, so the
//! peer is free to answer out of order.
//!
//! # Architecture
//!
//! - [`wire`]: envelope types and the MessagePack codec, including incremental
//!   frame extraction from a byte stream.
//! - `correlation`: the table of in-flight calls, mapping a [`CallId`] to a
//!   single-assignment completion slot.
//! - `connection`: transport lifecycle: connect with a deadline, one receive
//!   loop per connection generation, a fire-once closed signal, teardown.
//! - `driver`: the receive loop draining the transport and resolving slots.
//! - [`Client`]: the facade callers touch: `call`, `call_void`, `connect`,
//!   `connected`, `closed`, `dispose`.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use simlink::{Client, TcpConnector};
//!
//! let client = Client::new();
//! client
//!     .connect(&TcpConnector::new("127.0.0.1:5760"), Duration::from_secs(1))
//!     .await?;
//!
//! let armed: bool = client.call("arm", ()).await?;
//! client.call_void("moveToPosition", (47.397742_f64, 8.545594_f64, 10.0_f64)).await?;
//! ```
//!
//! Every failure mode is a value: a call that cannot complete returns a
//! [`CallError`] describing whether the client was disposed, the link was
//! down, the transport dropped mid-call, or the peer rejected the command.
//! Nothing in the public surface panics on expected conditions.

mod client;
mod connection;
mod correlation;
mod driver;
mod errors;
pub mod wire;

pub use client::Client;
pub use connection::{Connector, TcpConnector};
pub use errors::{CallError, ConnectError, DecodeError, EncodeError};
pub use wire::{CallId, IntoParams, RequestEnvelope, ResponseEnvelope};
