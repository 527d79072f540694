use std::time::Duration;

use tracing::{debug, info, instrument, trace};

use papaya_util::clock::now_ms;
use papaya_util::types::BearerToken;

use crate::config::PlatformConfig;
use crate::credentials::CredentialStore;
use crate::error::{ApiError, AuthError, TokenError};
use crate::platform::Platform;

/// Keeps a usable management API session.
///
/// A token the platform accepted less than `validity` ago is trusted as is,
/// otherwise it is probed and, if rejected, replaced through a fresh login.
pub struct TokenManager<'a, P: ?Sized> {
    platform: &'a P,
    credentials: CredentialStore,
    username: String,
    password: String,
    validity: Duration,
}

impl<'a, P: Platform + ?Sized> TokenManager<'a, P> {
    pub fn new(
        platform: &'a P,
        credentials: CredentialStore,
        config: &PlatformConfig,
        validity: Duration,
    ) -> Self {
        Self {
            platform,
            credentials,
            username: config.username.clone(),
            password: config.password.clone(),
            validity,
        }
    }

    /// Return a bearer token the platform currently accepts
    #[instrument(name = "auth", skip_all)]
    pub async fn ensure_valid_token(&self) -> Result<BearerToken, TokenError> {
        let current = self.credentials.get();
        let Some(token) = current.bearer_token else {
            debug!("no stored token");
            return self.login().await;
        };

        if let Some(validated_at) = current.last_validated_at {
            let elapsed = now_ms().saturating_sub(validated_at);
            if (0..self.validity.as_millis() as i64).contains(&elapsed) {
                trace!("token validated {elapsed}ms ago");
                return Ok(token);
            }
        }

        match self.platform.probe(&token).await {
            Ok(()) => {
                debug!("stored token is valid");
                self.credentials.mark_validated().await?;
                Ok(token)
            }
            Err(ApiError::Unauthorized) => {
                info!("stored token was rejected, logging in again");
                self.login().await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn login(&self) -> Result<BearerToken, TokenError> {
        let token = match self.platform.login(&self.username, &self.password).await {
            Ok(token) => token,
            Err(ApiError::Unauthorized) => {
                return Err(AuthError::InvalidCredentials(self.username.clone()).into());
            }
            Err(e) => return Err(e.into()),
        };

        self.credentials.set_bearer(token.clone()).await?;
        info!("logged in as {}", self.username);
        Ok(token)
    }
}
