//! # HTTP Retrieval Utilities
//!
//! This module provides an asynchronous API client wrapper around `reqwest`.
//! It includes middleware support for exponential backoff retries and standardized
//! JSON response handling.

use reqwest::{header::CONTENT_TYPE, Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by `ApiClient`.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Failed to build HTTP client: {0}")]
    Build(String),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Failed to decode response body: {0}")]
    Decode(String),
    #[error("Failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A standardized container for API responses.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
}

/// Options for building an `ApiClient`.
#[derive(Debug, Clone)]
pub struct ApiClientOptions {
    /// Transient-failure retries on top of the first attempt. Zero disables
    /// the retry middleware entirely.
    pub max_retries: u32,
    pub timeout: Duration,
    /// Accept self-signed certificates (local gateways).
    pub accept_invalid_certs: bool,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            timeout: Duration::from_secs(10),
            accept_invalid_certs: false,
        }
    }
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs and automatic
/// retries.
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
}

impl ApiClient {
    /// Creates a new `ApiClient` with the given retry and timeout options.
    ///
    /// # Arguments
    /// * `base_url` - The absolute base URL (e.g., "https://localhost:5000/v1/api/").
    pub fn new(base_url: &str, options: &ApiClientOptions) -> Result<Self, HttpError> {
        // A base URL without a trailing slash would drop its last segment on join.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let url = Url::parse(&normalized)?;

        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .user_agent("greeks-bridge/1.0")
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .map_err(|e| HttpError::Build(e.to_string()))?;

        let mut builder = ClientBuilder::new(http);
        if options.max_retries > 0 {
            let retry_policy = ExponentialBackoff::builder().build_with_max_retries(options.max_retries);
            builder = builder.with(RetryTransientMiddleware::new_with_policy(retry_policy));
        }

        Ok(Self {
            inner: builder.build(),
            base_url: url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs a generic HTTP request and handles the response.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb (GET, POST, etc.).
    /// * `path` - The relative path (with query string) to join to the base URL.
    /// * `body` - Optional serializable object to send as the JSON body.
    pub async fn request<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<ApiResponse<T>, HttpError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let full_url = self.base_url.join(path.trim_start_matches('/'))?;
        let mut req = self.inner.request(method, full_url);

        if let Some(b) = body {
            let json_body = serde_json::to_string(b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response = req.send().await.map_err(|e| HttpError::Request(e.to_string()))?;
        let status = response.status();

        if status.is_success() {
            let data = response.json::<T>().await.map_err(|e| HttpError::Decode(e.to_string()))?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
            })
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>, HttpError> {
        self.request::<T, serde_json::Value>(Method::GET, path, None).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>, HttpError> {
        self.request::<T, serde_json::Value>(Method::POST, path, Some(&serde_json::json!({}))).await
    }
}
