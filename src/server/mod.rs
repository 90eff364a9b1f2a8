/// TCP server exposing a marketplace backend over the line protocol.
///
/// This module provides the [`Router`] which handles incoming TCP connections
/// and dispatches each request to a caller-bound backend surface.
pub mod router;

pub use router::Router;
