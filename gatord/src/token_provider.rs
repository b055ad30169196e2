use gator_core::{OAuthClient, OAuthToken};
use thiserror::Error;

use crate::model::now_unix;

#[derive(Debug, Error)]
pub enum TokenProviderError {
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("oauth refresh failed: {0}")]
    OAuth(#[from] gator_core::OAuthError),
}

/// In-memory snapshot of the service credentials. Replaced wholesale on
/// refresh, never mutated field by field.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds; `None` means the token never expires locally.
    pub expires_at: Option<i64>,
    pub scope: Option<String>,
}

impl AuthState {
    pub fn from_oauth_token(token: &OAuthToken) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token
                .expires_in
                .map(|secs| now_unix().saturating_add(secs as i64)),
            scope: token.scope.clone(),
        }
    }
}

/// Hands out a usable access token, refreshing it lazily shortly before
/// expiry. Explicitly constructed and passed around; never a global.
pub struct TokenProvider {
    state: AuthState,
    oauth_client: OAuthClient,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    pub fn new(state: AuthState, oauth_client: OAuthClient) -> Self {
        Self {
            state,
            oauth_client,
            refresh_skew_secs: 60,
        }
    }

    pub async fn valid_access_token(&mut self) -> Result<String, TokenProviderError> {
        if self.should_refresh() {
            self.refresh().await?;
        }
        Ok(self.state.access_token.clone())
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub async fn refresh_now(&mut self) -> Result<String, TokenProviderError> {
        self.refresh().await?;
        Ok(self.state.access_token.clone())
    }

    fn should_refresh(&self) -> bool {
        if self.state.access_token.is_empty() {
            return true;
        }
        let Some(expires_at) = self.state.expires_at else {
            return false;
        };
        expires_at <= now_unix().saturating_add(self.refresh_skew_secs)
    }

    async fn refresh(&mut self) -> Result<(), TokenProviderError> {
        let refresh_token = self
            .state
            .refresh_token
            .clone()
            .ok_or(TokenProviderError::MissingRefreshToken)?;
        let token = self.oauth_client.refresh_token(&refresh_token).await?;
        let mut refreshed = AuthState::from_oauth_token(&token);
        // Refresh responses may omit the scope; keep the granted one.
        if refreshed.scope.is_none() {
            refreshed.scope = self.state.scope.clone();
        }
        self.state = refreshed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(uri: &str) -> OAuthClient {
        OAuthClient::with_base_url(uri, "client-id", "secret").unwrap()
    }

    #[tokio::test]
    async fn returns_current_token_when_not_expired() {
        let mut provider = TokenProvider::new(
            AuthState {
                access_token: "token-1".into(),
                refresh_token: Some("refresh-1".into()),
                expires_at: Some(i64::MAX),
                scope: None,
            },
            client("http://127.0.0.1:9"),
        );

        let token = provider.valid_access_token().await.unwrap();
        assert_eq!(token, "token-1");
    }

    #[tokio::test]
    async fn refreshes_token_when_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-token",
                "token_type": "Bearer",
                "expires_in": 3600,
                "scope": "drive"
            })))
            .mount(&server)
            .await;
        let mut provider = TokenProvider::new(
            AuthState {
                access_token: "old-token".into(),
                refresh_token: Some("refresh-1".into()),
                expires_at: Some(0),
                scope: Some("drive".into()),
            },
            client(&server.uri()),
        );

        let token = provider.valid_access_token().await.unwrap();
        assert_eq!(token, "new-token");
        // The omitted refresh token survives the refresh.
        assert_eq!(provider.state().refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn empty_access_token_forces_an_initial_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;
        let mut provider = TokenProvider::new(
            AuthState {
                refresh_token: Some("refresh-1".into()),
                ..AuthState::default()
            },
            client(&server.uri()),
        );

        assert_eq!(provider.valid_access_token().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn expired_without_refresh_token_is_an_error() {
        let mut provider = TokenProvider::new(
            AuthState {
                access_token: "old-token".into(),
                refresh_token: None,
                expires_at: Some(0),
                scope: None,
            },
            client("http://127.0.0.1:9"),
        );

        let err = provider.valid_access_token().await.unwrap_err();
        assert!(matches!(err, TokenProviderError::MissingRefreshToken));
    }
}
