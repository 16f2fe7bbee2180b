//! ACK RAM Authenticator - Alibaba Cloud RAM authentication for Kubernetes
//!
//! Bridges the cloud identity service (`sts:GetCallerIdentity`) to the
//! Kubernetes authentication webhook. A client holding RAM credentials
//! presigns a `GetCallerIdentity` request bound to a cluster id and sends
//! it as a bearer token; the verifier replays that request against a
//! trusted STS endpoint, recovers the caller's principal, and maps it to a
//! Kubernetes username and groups.
//!
//! # Modules
//!
//! - [`arn`] - Canonicalization of RAM principal ARNs
//! - [`token`] - Bearer token codec, generator, and verifier
//! - [`credentials`] - Cloud credential providers (env, profile file, cache)
//! - [`mapper`] - Identity mapping backends (config, dynamic file, CRD)
//! - [`config`] - Authenticator configuration
//! - [`server`] - TokenReview webhook front-end
//! - [`retry`] - Backoff helper for transient failures
//! - [`error`] - Error types for the authenticator

#![deny(missing_docs)]

pub mod arn;
pub mod config;
pub mod credentials;
pub mod error;
pub mod mapper;
pub mod retry;
pub mod server;
pub mod token;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
