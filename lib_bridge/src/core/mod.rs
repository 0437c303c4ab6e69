//! # Core Engine
//!
//! State machines and loops that keep the bridge running through store
//! outages and transport drops.

/// Pure breaker transitions.
pub mod breaker;
/// Breaker plus offline buffer around the destination store.
pub mod circuit_breaker;
/// Wall-clock seam.
pub mod clock;
/// The single write entrypoint.
pub mod gateway;
/// Durable JSON-lines buffer of unacknowledged writes.
pub mod offline_buffer;
/// Start-up, periodic loops, and shutdown.
pub mod scheduler;
/// Liveness checks, backoff, and blackout deferral.
pub mod watchdog;
