use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://oauth2.googleapis.com";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    /// A structured rejection from the token endpoint, e.g. `invalid_grant`
    /// when a refresh token has been revoked.
    #[error("grant rejected: {error}")]
    Grant {
        error: String,
        description: Option<String>,
    },
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

/// Client for the Google OAuth2 token endpoint. Only the two server-side
/// grants the daemon needs are implemented; the browser consent step that
/// produces the initial authorization code happens out of band.
#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
}

impl OAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Self::with_base_url(DEFAULT_BASE_URL, client_id, client_secret)
    }

    pub fn with_base_url(
        base_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    /// Trades an authorization code for the initial token pair.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> Result<OAuthToken, OAuthError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
        ];
        if let Some(redirect_uri) = redirect_uri {
            form.push(("redirect_uri", redirect_uri));
        }
        self.token_request(form).await
    }

    /// Obtains a fresh access token. Google leaves `refresh_token` out of
    /// refresh responses, so the one just used is carried over into the
    /// returned token.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, OAuthError> {
        let form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        let mut token = self.token_request(form).await?;
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        Ok(token)
    }

    async fn token_request(
        &self,
        mut form: Vec<(&str, &str)>,
    ) -> Result<OAuthToken, OAuthError> {
        let url = self.base_url.join("/token")?;
        form.push(("client_id", &self.client_id));
        form.push(("client_secret", &self.client_secret));

        let response = self.http.post(url).form(&form).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<OAuthToken>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        if let Ok(rejection) = serde_json::from_str::<GrantRejection>(&body) {
            return Err(OAuthError::Grant {
                error: rejection.error,
                description: rejection.error_description,
            });
        }
        Err(OAuthError::Api { status, body })
    }
}

#[derive(Deserialize)]
struct GrantRejection {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}
