//! Sequential ship-to-shore HTTP proxying over a single TCP link.
//!
//! Two processes share this crate. The ship side ([`ship::ShipCore`]) accepts
//! ordinary HTTP proxy traffic (absolute-form requests and `CONNECT`) from
//! local clients and funnels every request, strictly one at a time, through a
//! single TCP connection to the offshore side ([`offshore::OffshoreProxy`]),
//! which performs the actual egress to the public Internet.
//!
//! The link speaks the length-prefixed frame protocol of [`frame`]. Requests
//! never interleave on the wire: the ship's queue worker dispatches one job at
//! a time, and a `CONNECT` tunnel holds the link until both of its directions
//! are closed.

pub mod error;
pub mod frame;
pub mod offshore;
mod parse;
pub mod ship;
mod util;

pub use parse::Authority;

/// Hard cap on a single frame payload; larger bodies are split across frames.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// How much data to read for a request header section before it's considered invalid.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Default ship-side port for local proxy clients.
pub const DEFAULT_PROXY_PORT: u16 = 8080;
/// Default offshore port for the link.
pub const DEFAULT_LINK_PORT: u16 = 9999;

#[cfg(test)]
mod tests;
