use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::keychain::Keychain;

pub mod amazon;

/// A cloud registry credential minter. Providers are matched on the registry
/// host and asked to produce a short-lived keychain.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this provider can mint credentials for `registry`.
    fn matches_registry(&self, registry: &str) -> bool;

    async fn keychain(&self, registry: &str) -> anyhow::Result<Box<dyn Keychain>>;
}

pub fn default_providers() -> Vec<Arc<dyn Provider>> {
    vec![Arc::new(amazon::EcrProvider::new())]
}

/// The first matching provider's keychain for `registry`, if any. Mint
/// failures downgrade with a warning so the remaining credential sources
/// still apply.
pub async fn provider_keychain(
    providers: &[Arc<dyn Provider>],
    registry: &str,
) -> Option<Box<dyn Keychain>> {
    for provider in providers {
        if !provider.matches_registry(registry) {
            continue;
        }
        match provider.keychain(registry).await {
            Ok(keychain) => return Some(keychain),
            Err(err) => warn!(
                provider = provider.name(),
                registry,
                error = %err,
                "Provider credential mint failed"
            ),
        }
    }
    None
}
