//! Error types for the ACK RAM authenticator

use thiserror::Error;

/// Main error type for authenticator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Caller supplied unusable parameters (empty cluster id, bad config)
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Token malformed; the message is safe to report to the verifier's caller
    #[error("input token was not properly formatted: {0}")]
    Format(String),

    /// A principal identifier did not parse as a RAM ARN
    #[error("invalid ARN: {0}")]
    InvalidArn(String),

    /// Ambient cloud credentials could not be resolved
    #[error("could not resolve credentials: {0}")]
    Credential(String),

    /// The AssumeRole exchange with the identity service failed
    #[error("failed to assume ram role: {0}")]
    AssumeRole(String),

    /// STS transport failure or upstream error while replaying a token
    #[error("sts getCallerIdentity failed: {message}")]
    Sts {
        /// Human-readable failure description
        message: String,
        /// HTTP status from STS, when a response was received
        status: Option<u16>,
        /// Raw response body, kept for webhook front-ends that propagate it
        body: Option<String>,
        /// Whether the upstream message is safe/useful to expose to the client
        raise_to_user: bool,
    },

    /// No mapper claimed the principal
    #[error("ARN is not mapped")]
    NotMapped,

    /// Per-record complaints accumulated while loading a mapping file
    #[error("error parsing mapping file: {0:?}")]
    ParseErrors(Vec<String>),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    /// Create an invalid-configuration error with the given message
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a token format error with the given message
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Create a credential resolution error with the given message
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential(msg.into())
    }

    /// Create an assume-role error with the given message
    pub fn assume_role(msg: impl Into<String>) -> Self {
        Self::AssumeRole(msg.into())
    }

    /// Create an STS error that masks the upstream message from clients
    pub fn sts(msg: impl Into<String>) -> Self {
        Self::Sts {
            message: msg.into(),
            status: None,
            body: None,
            raise_to_user: false,
        }
    }

    /// Create an STS error carrying the upstream HTTP status and body.
    ///
    /// 4xx responses are flagged `raise_to_user` so the webhook can surface
    /// obvious client mistakes; everything else stays masked.
    pub fn sts_response(status: u16, body: Option<String>) -> Self {
        Self::Sts {
            message: format!("expected 200, got {status}"),
            status: Some(status),
            body,
            raise_to_user: (400..500).contains(&status),
        }
    }

    /// Whether this error's upstream message may be shown to the client
    pub fn raise_to_user(&self) -> bool {
        matches!(self, Self::Sts { raise_to_user: true, .. })
    }
}
