// =============================================================================
// Bearer-token authentication for the control surface
// =============================================================================
//
// The expected token comes from the `MERIDIAN_ADMIN_TOKEN` environment
// variable; comparison is constant-time.  An unset token rejects every
// authenticated request (fail closed).
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

const TOKEN_ENV: &str = "MERIDIAN_ADMIN_TOKEN";

/// Constant-time byte comparison: every byte is examined even after the
/// first mismatch.
fn token_matches(candidate: &[u8], expected: &[u8]) -> bool {
    if candidate.len() != expected.len() {
        return false;
    }
    candidate
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Check `token` against the configured admin token.
pub fn validate_token(token: &str) -> bool {
    let expected = std::env::var(TOKEN_ENV).unwrap_or_default();
    !expected.is_empty() && token_matches(token.as_bytes(), expected.as_bytes())
}

/// Axum extractor: `Authorization: Bearer <token>` must match the admin
/// token or the request dies with 403 before the handler body runs.
pub struct AuthBearer(pub String);

pub struct AuthRejection(&'static str);

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.0 });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match header.and_then(|v| v.strip_prefix("Bearer ")) {
            Some(token) => token,
            None => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection("missing or invalid authorization token"));
            }
        };

        if !validate_token(token) {
            warn!("invalid admin token presented");
            return Err(AuthRejection("invalid authorization token"));
        }

        Ok(AuthBearer(token.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_comparison() {
        assert!(token_matches(b"secret", b"secret"));
        assert!(!token_matches(b"secret", b"secreT"));
        assert!(!token_matches(b"short", b"longer"));
        assert!(token_matches(b"", b""));
    }

    #[test]
    fn unset_token_rejects_everything() {
        std::env::remove_var(TOKEN_ENV);
        assert!(!validate_token(""));
        assert!(!validate_token("anything"));
    }
}
