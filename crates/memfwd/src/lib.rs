//! This crate implements the memory forwarding channel of a hybrid firmware run. An emulator that
//! reaches an address inside a configured [MemoryRange] sends a forwarding [Request] over a
//! persistent connection and blocks until the matching [Response] arrives.
//!
//! ### Ranges
//!
//! Each range names the accesses it permits and the [BackingProvider] that services it: the real
//! hardware behind a debug probe, a peripheral model, or plain memory. Ranges marked
//! `concrete_value` or `concrete_address` are served from a [ConcreteCache] once a value has been
//! observed. Emulator writes only reach the provider when the range enables write-back.
//!
//! ### Ordering
//!
//! Every range is served by a single worker. Requests to the same range are answered in arrival
//! order while requests to different ranges proceed concurrently.

mod cache;
mod client;
mod error;
mod lane;
mod provider;
mod range;
mod server;

/// Line-delimited JSON encoding of forwarding requests and responses.
pub mod wire;

pub use cache::*;
pub use client::*;
pub use error::*;
pub use lane::*;
pub use provider::*;
pub use range::*;
pub use server::*;
pub use wire::{Operation, Request, Response, Status};

#[cfg(test)]
mod tests;
