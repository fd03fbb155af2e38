use anyhow::{bail, Context as _};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use super::Provider;
use crate::keychain::{Keychain, RegistryCredential, StaticKeychain};
use crate::secret_string::SecretString;

struct CachedToken {
    credential: RegistryCredential,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// Tokens are refreshed an hour ahead of the ECR-reported expiry so a
    /// probe never runs with a credential about to lapse.
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - Duration::hours(1)
    }
}

/// Mints registry credentials for ECR hosts via `GetAuthorizationToken`.
pub struct EcrProvider {
    client: OnceCell<aws_sdk_ecr::Client>,
    token: Mutex<Option<CachedToken>>,
}

impl EcrProvider {
    pub fn new() -> Self {
        Self {
            client: OnceCell::new(),
            token: Mutex::new(None),
        }
    }

    async fn client(&self) -> &aws_sdk_ecr::Client {
        self.client
            .get_or_init(|| async {
                let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
                aws_sdk_ecr::Client::new(&config)
            })
            .await
    }
}

#[async_trait]
impl Provider for EcrProvider {
    fn name(&self) -> &'static str {
        "amazon"
    }

    fn matches_registry(&self, registry: &str) -> bool {
        registry.contains("amazonaws.com")
    }

    async fn keychain(&self, _registry: &str) -> anyhow::Result<Box<dyn Keychain>> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(Box::new(StaticKeychain::new(token.credential.clone())));
            }
        }

        let output = self
            .client()
            .await
            .get_authorization_token()
            .send()
            .await
            .context("GetAuthorizationToken request failed")?;
        let data = output
            .authorization_data()
            .first()
            .context("no authorization data received from ECR")?;
        let token = data
            .authorization_token()
            .filter(|token| !token.is_empty())
            .context("authorization token is missing or empty")?;

        let decoded = BASE64
            .decode(token)
            .context("authorization token is not valid base64")?;
        let decoded =
            String::from_utf8(decoded).context("authorization token is not valid UTF-8")?;
        let Some((username, password)) = decoded.split_once(':') else {
            bail!("invalid authorization token format");
        };

        let credential = RegistryCredential::Basic {
            username: username.to_string(),
            password: SecretString::new(password),
        };
        let expires_at = data
            .expires_at()
            .and_then(|timestamp| Utc.timestamp_opt(timestamp.secs(), 0).single())
            .unwrap_or_else(|| Utc::now() + Duration::hours(12));
        debug!(%expires_at, "Minted ECR authorization token");

        *cached = Some(CachedToken {
            credential: credential.clone(),
            expires_at,
        });
        Ok(Box::new(StaticKeychain::new(credential)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_matching() {
        let provider = EcrProvider::new();
        assert!(provider.matches_registry("123456789012.dkr.ecr.eu-west-1.amazonaws.com"));
        assert!(!provider.matches_registry("registry.example.com"));
    }

    #[test]
    fn test_token_freshness_buffer() {
        let token = CachedToken {
            credential: RegistryCredential::Anonymous,
            expires_at: Utc::now() + Duration::hours(2),
        };
        assert!(token.is_fresh(Utc::now()));
        assert!(!token.is_fresh(Utc::now() + Duration::minutes(61)));
    }
}
