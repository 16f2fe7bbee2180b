//! Authentication webhook server
//!
//! The Kubernetes API server posts a `TokenReview` carrying the bearer
//! token; the webhook verifies it against STS, resolves the canonical ARN
//! through the configured mappers, and answers with the mapped username and
//! groups. Every failure mode comes back as `authenticated: false`, which
//! the API server treats as anonymous.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewStatus, UserInfo};
use tracing::{info, warn};

use crate::config::IdentityMapping;
use crate::mapper::AggregateMapper;
use crate::token::{Identity, Verifier};
use crate::Error;

/// Shared state for webhook handlers
pub struct ServerState {
    /// Token verifier bound to this cluster
    pub verifier: Verifier,
    /// Ordered mapping backends
    pub mappers: AggregateMapper,
}

impl ServerState {
    /// Create webhook state
    pub fn new(verifier: Verifier, mappers: AggregateMapper) -> Self {
        Self { verifier, mappers }
    }
}

/// Create the webhook router
///
/// - `POST /authenticate` takes a TokenReview and answers with one
/// - `GET /healthz` is the liveness probe
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/authenticate", post(authenticate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

async fn authenticate_handler(
    State(state): State<Arc<ServerState>>,
    Json(review): Json<TokenReview>,
) -> Json<TokenReview> {
    let status = match review.spec.token.as_deref() {
        None | Some("") => unauthenticated("no token provided"),
        Some(token) => match state.verifier.verify(token).await {
            Ok(identity) => {
                info!(
                    canonical_arn = %identity.canonical_arn,
                    access_key_id = %identity.access_key_id,
                    "token verified"
                );
                status_for_identity(&state.mappers, &identity)
            }
            Err(e) => {
                warn!(error = %e, "token verification failed");
                unauthenticated(&client_message(&e))
            }
        },
    };

    Json(TokenReview {
        status: Some(status),
        ..Default::default()
    })
}

/// Resolve a verified identity through the mappers.
///
/// A mapping miss falls through to the account allow-list; principals of an
/// allowed account authenticate as their canonical ARN with no groups.
fn status_for_identity(mappers: &AggregateMapper, identity: &Identity) -> TokenReviewStatus {
    match mappers.map(&identity.canonical_arn) {
        Ok(mapping) => authenticated(identity, &mapping),
        Err(Error::NotMapped) => {
            if mappers.is_account_allowed(&identity.account_id) {
                let default_mapping = IdentityMapping {
                    identity_arn: identity.canonical_arn.clone(),
                    username: identity.canonical_arn.clone(),
                    groups: Vec::new(),
                };
                authenticated(identity, &default_mapping)
            } else {
                warn!(canonical_arn = %identity.canonical_arn, "principal is not mapped");
                unauthenticated("ARN is not mapped")
            }
        }
        Err(e) => {
            warn!(error = %e, "mapper lookup failed");
            unauthenticated("ARN is not mapped")
        }
    }
}

fn authenticated(identity: &Identity, mapping: &IdentityMapping) -> TokenReviewStatus {
    let (username, groups) = mapping.render(identity);
    let extra = [
        ("arn", &identity.arn),
        ("canonicalArn", &identity.canonical_arn),
        ("sessionName", &identity.session_name),
        ("accessKeyId", &identity.access_key_id),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), vec![value.clone()]))
    .collect();

    TokenReviewStatus {
        authenticated: Some(true),
        user: Some(UserInfo {
            username: Some(username),
            uid: Some(identity.user_id.clone()),
            groups: Some(groups),
            extra: Some(extra),
        }),
        ..Default::default()
    }
}

fn unauthenticated(message: &str) -> TokenReviewStatus {
    TokenReviewStatus {
        authenticated: Some(false),
        error: Some(message.to_string()),
        ..Default::default()
    }
}

/// What the client is allowed to learn about a verification failure.
///
/// Token format problems are the client's own doing and are reported
/// verbatim. STS failures are masked unless the upstream response was an
/// obvious client mistake.
fn client_message(error: &Error) -> String {
    match error {
        Error::Format(_) | Error::InvalidArn(_) => error.to_string(),
        Error::Sts {
            raise_to_user: true,
            body,
            message,
            ..
        } => body.clone().unwrap_or_else(|| message.clone()),
        _ => "authentication failed".to_string(),
    }
}
