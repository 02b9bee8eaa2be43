//! Outbound HTTP client used to ship results onward.
//!
//! Connection failures are retried with exponential backoff; response bodies
//! are cut at a byte ceiling and flagged incomplete instead of failing.

pub mod client;
pub mod retry;

pub use client::{BoundedRetryingClient, ClientError, ClientRequest, ClientResponse};
pub use reqwest::Method;
pub use retry::RetryConfig;
