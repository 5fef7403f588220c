//! Ingest Route Guard
//!
//! Edge agents and readers authenticate with a shared secret in the
//! `X-Rfidgate-Token` header. Without a configured secret the ingest routes
//! only accept connections from the loopback interface.

use crate::error::ApiError;
use axum::{
    extract::{connect_info::ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;

pub const INGEST_TOKEN_HEADER: &str = "x-rfidgate-token";

#[derive(Debug, Clone, Default)]
pub struct IngestAuthState {
    token: Option<Arc<str>>,
}

impl IngestAuthState {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .map(Arc::from),
        }
    }

    pub fn token_configured(&self) -> bool {
        self.token.is_some()
    }

    /// Decide whether a request may reach an ingest route.
    pub fn authorize(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Result<(), ApiError> {
        match self.token.as_deref() {
            Some(expected) => {
                let presented = headers
                    .get(INGEST_TOKEN_HEADER)
                    .and_then(|h| h.to_str().ok())
                    .map(str::trim)
                    .ok_or_else(|| ApiError::unauthorized("Missing ingest token"))?;
                if tokens_match(presented, expected) {
                    Ok(())
                } else {
                    Err(ApiError::unauthorized("Invalid ingest token"))
                }
            }
            None => match peer {
                Some(addr) if addr.ip().is_loopback() => Ok(()),
                _ => Err(ApiError::unauthorized(
                    "Ingest routes are restricted to loopback without a token",
                )),
            },
        }
    }
}

fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = presented.as_bytes();
    let b = expected.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Axum middleware enforcing [`IngestAuthState::authorize`].
///
/// The peer address comes from `ConnectInfo<SocketAddr>`, which is present
/// when the server runs with `into_make_service_with_connect_info`.
pub async fn ingest_auth_middleware(
    State(state): State<IngestAuthState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    if let Err(err) = state.authorize(request.headers(), peer) {
        tracing::warn!(
            path = %request.uri().path(),
            peer = ?peer,
            token_configured = state.token_configured(),
            "Rejected ingest request"
        );
        return Err(err);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use axum::http::HeaderValue;

    fn peer(ip: [u8; 4]) -> Option<SocketAddr> {
        Some(SocketAddr::from((ip, 40000)))
    }

    #[test]
    fn test_loopback_only_without_token() {
        let state = IngestAuthState::new(None);
        let headers = HeaderMap::new();
        assert!(state.authorize(&headers, peer([127, 0, 0, 1])).is_ok());

        let err = state
            .authorize(&headers, peer([10, 0, 0, 7]))
            .err()
            .map(|e| e.code);
        assert_eq!(err, Some(ErrorCode::Unauthorized));
        assert!(state.authorize(&headers, None).is_err());
    }

    #[test]
    fn test_ipv6_loopback_allowed() {
        let state = IngestAuthState::new(Some("  ".to_string()));
        assert!(!state.token_configured());
        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        assert!(state.authorize(&HeaderMap::new(), Some(addr)).is_ok());
    }

    #[test]
    fn test_token_required_when_configured() {
        let state = IngestAuthState::new(Some("s3cret".to_string()));
        let mut headers = HeaderMap::new();

        // Loopback does not bypass a configured token.
        assert!(state.authorize(&headers, peer([127, 0, 0, 1])).is_err());

        headers.insert(INGEST_TOKEN_HEADER, HeaderValue::from_static("wrong!"));
        assert!(state.authorize(&headers, peer([10, 0, 0, 7])).is_err());

        headers.insert(INGEST_TOKEN_HEADER, HeaderValue::from_static("s3cret"));
        assert!(state.authorize(&headers, peer([10, 0, 0, 7])).is_ok());
        assert!(state.authorize(&headers, None).is_ok());
    }
}
