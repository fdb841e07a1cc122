//! Bearer-token authentication for incoming connections
//!
//! Tokens are validated before the WebSocket upgrade; a connection pump is
//! only ever started for an identity the validator vouched for.

use async_trait::async_trait;
use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use relay_common::UserId;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No auth token found")]
    MissingToken,

    #[error("Auth token is invalid")]
    InvalidToken,

    #[error("Identity service unavailable: {0}")]
    Unavailable(#[from] reqwest::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MissingToken | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

/// Resolves an opaque bearer credential to a user identity
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Pull the credential out of the `Authorization` header.
///
/// Accepts both a raw token and `Bearer <token>` (scheme matched without
/// regard to case). A bare scheme with no token counts as missing.
pub fn extract_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::InvalidToken)?
        .trim();

    let token = match value.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ if value.eq_ignore_ascii_case("bearer") => "",
        _ => value,
    };

    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

#[derive(Deserialize)]
struct ValidateResponse {
    user_id: String,
    valid: bool,
}

/// Validates tokens against the external identity service
///
/// `GET {base_url}/validate` with the token in `Authorization`; the service
/// answers `{ "user_id": "...", "valid": true }`. Only a failure to reach the
/// service is `Unavailable`; every answer other than a valid grant is
/// `InvalidToken`.
pub struct HttpTokenValidator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenValidator {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(base_url: impl Into<String>) -> Result<Self, AuthError> {
        Self::with_timeout(base_url, Self::DEFAULT_TIMEOUT)
    }

    /// `timeout` bounds the whole exchange with the identity service.
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TokenValidator for HttpTokenValidator {
    async fn validate(&self, token: &str) -> Result<UserId, AuthError> {
        let resp = self
            .client
            .get(format!("{}/validate", self.base_url))
            .header(header::AUTHORIZATION, token)
            .send()
            .await?;

        if !resp.status().is_success() {
            debug!("Identity service rejected token: {}", resp.status());
            return Err(AuthError::InvalidToken);
        }

        let body: ValidateResponse = resp.json().await.map_err(|e| {
            if e.is_decode() {
                debug!("Unreadable identity service answer: {}", e);
                AuthError::InvalidToken
            } else {
                AuthError::Unavailable(e)
            }
        })?;

        if body.valid && !body.user_id.is_empty() {
            Ok(UserId::new(body.user_id))
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

/// Fixed token → identity table, for local development and tests
#[derive(Default, Clone)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<UserId>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }

    pub fn insert(&mut self, grant: TokenGrant) {
        self.tokens.insert(grant.token, grant.user_id);
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<UserId, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// A `TOKEN=USER` pair as given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    pub user_id: UserId,
}

impl FromStr for TokenGrant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((token, user)) if !token.is_empty() && !user.is_empty() => Ok(Self {
                token: token.to_string(),
                user_id: UserId::from(user),
            }),
            _ => Err(format!("expected TOKEN=USER, got {:?}", s)),
        }
    }
}

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
    fn test_extract_raw_and_bearer_tokens() {
        assert_eq!(extract_token(&headers_with("abc")).unwrap(), "abc");
        assert_eq!(extract_token(&headers_with("Bearer abc")).unwrap(), "abc");
        assert_eq!(extract_token(&headers_with("bearer  abc ")).unwrap(), "abc");
        // Only a whole scheme word is stripped
        assert_eq!(
            extract_token(&headers_with("Bearerabc")).unwrap(),
            "Bearerabc"
        );
    }

    #[test]
    fn test_extract_missing_token() {
        assert!(matches!(
            extract_token(&HeaderMap::new()),
            Err(AuthError::MissingToken)
        ));
        assert!(matches!(
            extract_token(&headers_with("Bearer ")),
            Err(AuthError::MissingToken)
        ));
        assert!(matches!(
            extract_token(&headers_with("Bearer")),
            Err(AuthError::MissingToken)
        ));
    }

    #[tokio::test]
    async fn test_static_validator() {
        let validator = StaticTokenValidator::new().with_token("t-alice", "alice");

        assert_eq!(
            validator.validate("t-alice").await.unwrap(),
            UserId::from("alice")
        );
        assert!(matches!(
            validator.validate("nope").await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_parse_token_grant() {
        let grant: TokenGrant = "secret=bob".parse().unwrap();
        assert_eq!(grant.token, "secret");
        assert_eq!(grant.user_id, UserId::from("bob"));
        assert!("no-separator".parse::<TokenGrant>().is_err());
        assert!("=bob".parse::<TokenGrant>().is_err());
    }

    #[test]
    fn test_unauthorized_response_status() {
        let resp = AuthError::InvalidToken.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    /// Stand-in identity service keyed on the presented token
    async fn fake_validate(headers: HeaderMap) -> Response {
        match headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            Some("t-alice") => Json(json!({ "user_id": "alice", "valid": true })).into_response(),
            Some("t-revoked") => {
                Json(json!({ "user_id": "alice", "valid": false })).into_response()
            }
            Some("t-garbled") => "not json".into_response(),
            Some("t-slow") => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({ "user_id": "slow", "valid": true })).into_response()
            }
            _ => StatusCode::FORBIDDEN.into_response(),
        }
    }

    async fn spawn_identity_service() -> String {
        let app = axum::Router::new().route("/validate", axum::routing::get(fake_validate));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_http_validator_accepts_valid_grant() {
        let validator = HttpTokenValidator::new(spawn_identity_service().await).unwrap();
        assert_eq!(
            validator.validate("t-alice").await.unwrap(),
            UserId::from("alice")
        );
    }

    #[tokio::test]
    async fn test_http_validator_rejections_answer_401() {
        let validator = HttpTokenValidator::new(spawn_identity_service().await).unwrap();

        for token in ["t-revoked", "t-unknown", "t-garbled"] {
            let err = validator.validate(token).await.unwrap_err();
            assert!(
                matches!(err, AuthError::InvalidToken),
                "{}: {:?}",
                token,
                err
            );
            assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn test_http_validator_unreachable_service_answers_503() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let validator = HttpTokenValidator::new(format!("http://{}", addr)).unwrap();
        let err = validator.validate("t-alice").await.unwrap_err();
        assert!(matches!(err, AuthError::Unavailable(_)));
        assert_eq!(
            err.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_http_validator_times_out_on_hung_service() {
        let validator = HttpTokenValidator::with_timeout(
            spawn_identity_service().await,
            Duration::from_millis(100),
        )
        .unwrap();

        let err = validator.validate("t-slow").await.unwrap_err();
        assert!(matches!(err, AuthError::Unavailable(_)));
    }
}
