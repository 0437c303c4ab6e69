//! # Data Retrieval Module
//!
//! HTTP plumbing shared by request/response transports: URL joining,
//! JSON bodies, and transient-failure retries with exponential backoff.

/// Generic HTTP API client with retry middleware.
pub mod ky_http;
