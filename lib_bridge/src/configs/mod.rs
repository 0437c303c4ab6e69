//! # Configuration Modules
//!
//! Settings the bridge receives already resolved. Loading them from files,
//! environment, or flags is the caller's concern.

/// Bridge settings, transport selection, and retry/blackout policy.
pub mod settings;
