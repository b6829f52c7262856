//! HTTP basic auth for the admin API.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use subtle::ConstantTimeEq as _;

/// Basic-auth credentials for the admin API.
#[derive(Clone)]
pub struct ApiAuth {
    username: String,
    password: String,
    realm: String,
}

impl ApiAuth {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: realm.into(),
        }
    }

    fn check(&self, header_value: &str) -> bool {
        let Some(encoded) = header_value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, pass)) = decoded.split_once(':') else {
            return false;
        };
        let user_ok: bool = user.as_bytes().ct_eq(self.username.as_bytes()).into();
        let pass_ok: bool = pass.as_bytes().ct_eq(self.password.as_bytes()).into();
        user_ok && pass_ok
    }
}

/// Require basic auth on the wrapped routes.
pub async fn basic_auth_middleware(
    State(auth): State<Arc<ApiAuth>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| auth.check(v))
        .unwrap_or(false);
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                format!(r#"Basic realm="{}""#, auth.realm),
            )],
        )
            .into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(user: &str, pass: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
        )
    }

    #[test]
    fn accepts_matching_credentials() {
        let auth = ApiAuth::new("aspen", "secret", "aspen");
        assert!(auth.check(&header_for("aspen", "secret")));
    }

    #[test]
    fn rejects_wrong_password_and_malformed_headers() {
        let auth = ApiAuth::new("aspen", "secret", "aspen");
        assert!(!auth.check(&header_for("aspen", "wrong")));
        assert!(!auth.check("Bearer token"));
        assert!(!auth.check("Basic !!!"));
    }
}
