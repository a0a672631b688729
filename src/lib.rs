//! duplexrpc library.
//!
//! A framed, full-duplex RPC channel over a single byte stream, plus a
//! small server wrapper that owns one channel per accepted connection.
//! Everything is single-threaded and event-driven.

#![deny(unused_must_use)]

pub mod config;
pub mod error;
pub mod rpc;

pub use error::{Error, Result};
