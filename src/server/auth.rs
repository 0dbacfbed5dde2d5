// =============================================================================
// Admin Authentication — HTTP Basic against the stored Argon2id hash
// =============================================================================
//
// Admin endpoints require `admin:<password>` Basic credentials. A 401
// carries the `WWW-Authenticate` challenge so browsers raise their dialog;
// a 503 signals that no admin password has been configured yet. Password
// verification is constant-time (argon2).
// =============================================================================

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::warn;

use crate::db::admin::{get_admin_password_hash, verify_password};
use crate::server::state::SharedState;

pub const AUTH_REALM: &str = "verdant admin";
pub const AUTH_USERNAME: &str = "admin";

/// Extract the password from a Basic auth header when the username
/// matches.
fn parse_basic_auth(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    (username == AUTH_USERNAME).then(|| password.to_string())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            format!("Basic realm=\"{AUTH_REALM}\""),
        )],
        "Unauthorized",
    )
        .into_response()
}

/// Gate an admin request. `Err` carries the ready-to-send failure
/// response.
pub async fn require_admin(state: &SharedState, headers: &HeaderMap) -> Result<(), Response> {
    let stored_hash = {
        let mut conn = state.pool.acquire().await.map_err(|e| {
            warn!(error = %e, "admin auth: database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": "Database unavailable"})),
            )
                .into_response()
        })?;
        get_admin_password_hash(&mut conn).await.map_err(|e| {
            warn!(error = %e, "admin auth: hash lookup failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": "Database unavailable"})),
            )
                .into_response()
        })?
    };

    let Some(stored_hash) = stored_hash else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "Admin not configured"})),
        )
            .into_response());
    };

    match parse_basic_auth(headers) {
        Some(password) if verify_password(&password, &stored_hash) => Ok(()),
        _ => {
            warn!("admin auth: invalid credentials");
            Err(unauthorized())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn parses_admin_credentials() {
        let encoded = BASE64.encode("admin:secret");
        let headers = headers_with(&format!("Basic {encoded}"));
        assert_eq!(parse_basic_auth(&headers), Some("secret".to_string()));
    }

    #[test]
    fn password_may_contain_colons() {
        let encoded = BASE64.encode("admin:pa:ss:word");
        let headers = headers_with(&format!("Basic {encoded}"));
        assert_eq!(parse_basic_auth(&headers), Some("pa:ss:word".to_string()));
    }

    #[test]
    fn rejects_wrong_username_and_malformed_headers() {
        let encoded = BASE64.encode("root:secret");
        assert_eq!(parse_basic_auth(&headers_with(&format!("Basic {encoded}"))), None);
        assert_eq!(parse_basic_auth(&headers_with("Bearer token")), None);
        assert_eq!(parse_basic_auth(&headers_with("Basic not-base64!!")), None);
        assert_eq!(parse_basic_auth(&HeaderMap::new()), None);
    }

    #[test]
    fn unauthorized_response_carries_challenge() {
        let response = unauthorized();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(challenge.contains(AUTH_REALM));
    }
}
