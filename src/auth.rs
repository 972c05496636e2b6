//! Shared-secret gate for mutating endpoints.
//!
//! With no secret configured every request is allowed (open mode). Otherwise
//! the request must carry the secret in the configured header. Handlers opt in
//! by taking an [`OperatorAuth`] argument; axum runs extractors before the body
//! is read, so a rejected request never reaches the store.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};

use crate::server::ErrorResponse;

/// Configured secret and the header it is expected in
#[derive(Debug, Clone)]
pub struct OperatorGate {
    token: Option<String>,
    header: String,
}

impl OperatorGate {
    pub fn new(token: Option<String>, header: impl Into<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
            header: header.into(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.token.is_none()
    }

    pub fn header_name(&self) -> &str {
        &self.header
    }

    /// Check a presented token against the configured one.
    pub fn authorize(&self, presented: Option<&str>) -> bool {
        match &self.token {
            None => true,
            Some(expected) => presented == Some(expected.as_str()),
        }
    }

    pub fn authorize_headers(&self, headers: &HeaderMap) -> bool {
        let presented = headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok());
        self.authorize(presented)
    }
}

/// Extractor proving the request passed the operator gate
#[derive(Debug, Clone, Copy)]
pub struct OperatorAuth;

#[async_trait]
impl<S> FromRequestParts<S> for OperatorAuth
where
    OperatorGate: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let gate = OperatorGate::from_ref(state);
        if gate.authorize_headers(&parts.headers) {
            Ok(OperatorAuth)
        } else {
            log::warn!("Rejected {} {}: missing or wrong operator token", parts.method, parts.uri.path());
            Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("unauthorized")),
            ))
        }
    }
}
