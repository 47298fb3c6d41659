//! Identity provider seam and its HTTP implementation.
//!
//! The upstream provider speaks the OAuth 2.0 device authorization grant
//! (RFC 8628): the core requests a device code, the user authorizes at a
//! verification URI, and the core polls the token endpoint until the grant
//! completes, the user denies it, or the code expires.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::CoreError;
use crate::profile::Profile;

/// The user-facing half of a device authorization, plus what the core needs
/// to keep polling.
#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub verification_uri: String,
    pub user_code: String,
    pub device_code: String,
    /// Seconds until the device code expires.
    pub expires_in: u64,
    /// Seconds the provider asks us to wait between polls.
    pub interval: u64,
}

/// A bearer token minted by the provider.
#[derive(Debug, Clone)]
pub struct ProviderToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires.
    pub expires_in: u64,
}

/// Outcome of one poll of the token endpoint.
#[derive(Debug)]
pub enum DevicePoll {
    /// User has not authorized yet; keep polling.
    Pending,
    /// Provider wants a longer poll interval.
    SlowDown,
    /// Grant complete.
    Complete(ProviderToken),
}

/// Upstream identity provider collaborator.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Starts a device authorization.
    async fn begin_device_flow(&self) -> Result<DeviceAuthorization, CoreError>;

    /// Polls the token endpoint once. Terminal denials (`access_denied`,
    /// `expired_token`) are errors; `Pending`/`SlowDown` are not.
    async fn poll_device_flow(&self, device_code: &str) -> Result<DevicePoll, CoreError>;

    /// Exchanges a refresh token for a fresh access token.
    async fn refresh(&self, refresh_token: &str) -> Result<ProviderToken, CoreError>;

    /// Resolves the profile behind an access token. Doubles as token
    /// validation: a rejected token is an `Auth` error.
    async fn fetch_profile(&self, access_token: &str) -> Result<Profile, CoreError>;
}

/// Endpoints and client identity for the HTTP provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub device_code_url: String,
    pub token_url: String,
    pub profile_url: String,
    pub client_id: String,
    pub scope: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            device_code_url:
                "https://login.microsoftonline.com/consumers/oauth2/v2.0/devicecode".to_string(),
            token_url: "https://login.microsoftonline.com/consumers/oauth2/v2.0/token".to_string(),
            profile_url: "https://api.minecraftservices.com/minecraft/profile".to_string(),
            client_id: "389b1b32-b5d5-43b2-bddc-84ce938d6737".to_string(),
            scope: "XboxLive.signin offline_access".to_string(),
        }
    }
}

/// [`IdentityProvider`] over plain HTTPS.
pub struct HttpIdentityProvider {
    http: reqwest::Client,
    config: ProviderConfig,
}

#[derive(Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Deserialize)]
struct ProfileResponse {
    id: String,
    name: String,
    #[serde(default)]
    skins: Vec<serde_json::Value>,
    #[serde(default)]
    capes: Vec<serde_json::Value>,
}

impl HttpIdentityProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
    ) -> Result<Result<TokenResponse, TokenErrorResponse>, CoreError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| CoreError::Auth(format!("token endpoint unreachable: {e}")))?;
        if response.status().is_success() {
            let token = response
                .json::<TokenResponse>()
                .await
                .map_err(|e| CoreError::Auth(format!("malformed token response: {e}")))?;
            Ok(Ok(token))
        } else {
            let err = response
                .json::<TokenErrorResponse>()
                .await
                .map_err(|e| CoreError::Auth(format!("malformed token error: {e}")))?;
            Ok(Err(err))
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn begin_device_flow(&self) -> Result<DeviceAuthorization, CoreError> {
        let response = self
            .http
            .post(&self.config.device_code_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("scope", self.config.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CoreError::Auth(format!("device code request failed: {e}")))?
            .error_for_status()
            .map_err(|e| CoreError::Auth(format!("device code request rejected: {e}")))?
            .json::<DeviceCodeResponse>()
            .await
            .map_err(|e| CoreError::Auth(format!("malformed device code response: {e}")))?;
        tracing::info!(code = %response.user_code, "device authorization issued");
        Ok(DeviceAuthorization {
            verification_uri: response.verification_uri,
            user_code: response.user_code,
            device_code: response.device_code,
            expires_in: response.expires_in,
            interval: response.interval,
        })
    }

    async fn poll_device_flow(&self, device_code: &str) -> Result<DevicePoll, CoreError> {
        let result = self
            .token_request(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("client_id", self.config.client_id.as_str()),
                ("device_code", device_code),
            ])
            .await?;
        match result {
            Ok(token) => Ok(DevicePoll::Complete(ProviderToken {
                access_token: token.access_token,
                refresh_token: token.refresh_token,
                expires_in: token.expires_in,
            })),
            Err(err) => match err.error.as_str() {
                "authorization_pending" => Ok(DevicePoll::Pending),
                "slow_down" => Ok(DevicePoll::SlowDown),
                _ => Err(CoreError::Auth(format!(
                    "device flow rejected: {} {}",
                    err.error, err.error_description
                ))),
            },
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<ProviderToken, CoreError> {
        let result = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.config.client_id.as_str()),
                ("refresh_token", refresh_token),
                ("scope", self.config.scope.as_str()),
            ])
            .await?;
        match result {
            Ok(token) => Ok(ProviderToken {
                access_token: token.access_token,
                refresh_token: token.refresh_token,
                expires_in: token.expires_in,
            }),
            Err(err) => Err(CoreError::Auth(format!(
                "token refresh rejected: {} {}",
                err.error, err.error_description
            ))),
        }
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<Profile, CoreError> {
        let response = self
            .http
            .get(&self.config.profile_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| CoreError::Auth(format!("profile request failed: {e}")))?
            .error_for_status()
            .map_err(|e| CoreError::Auth(format!("token rejected by provider: {e}")))?
            .json::<ProfileResponse>()
            .await
            .map_err(|e| CoreError::Auth(format!("malformed profile response: {e}")))?;
        let uuid = uuid::Uuid::parse_str(&response.id)
            .map_err(|e| CoreError::Auth(format!("provider returned invalid profile id: {e}")))?;
        Ok(Profile {
            uuid,
            username: response.name,
            skins: Some(response.skins),
            capes: Some(response.capes),
            authenticated: true,
        })
    }
}
