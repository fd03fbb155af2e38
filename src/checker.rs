use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::time::timeout;
use tracing::error;

use crate::config::{ImageFilter, MirrorMap};
use crate::image_reference::ImageReference;
use crate::indexers::ControllerIndexers;
use crate::keychain::{
    AnonymousKeychain, Keychain, MultiKeychain, RegistryCredential, RegistryTarget,
};
use crate::oci_registry::{RegistryClient, RegistryError};
use crate::projection::ControllerProjection;
use crate::providers::{provider_keychain, Provider};
use crate::store::{AvailabilityMode, ImageCheck, ImageStore};

/// Healthy-queue batch size per tick.
pub const CHECK_BATCH_SIZE: usize = 50;
/// Unhealthy-queue batch size per tick.
pub const FAILED_CHECK_BATCH_SIZE: usize = 20;

/// Deadline for one probe attempt, challenge round-trips included.
const ATTEMPT_DEADLINE: Duration = Duration::from_secs(15);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: u32 = 2;
const BACKOFF_STEPS: u32 = 2;

/// Bridges cluster state to the image store: filters and reconciles images
/// on workload events, and probes registries when the store ticks.
pub struct Checker {
    indexers: Arc<ControllerIndexers>,
    registry: RegistryClient,
    providers: Vec<Arc<dyn Provider>>,
    filter: ImageFilter,
    mirrors: MirrorMap,
    default_registry: Option<String>,
}

impl Checker {
    pub fn new(
        indexers: Arc<ControllerIndexers>,
        registry: RegistryClient,
        providers: Vec<Arc<dyn Provider>>,
        filter: ImageFilter,
        mirrors: MirrorMap,
        default_registry: Option<String>,
    ) -> Self {
        Self {
            indexers,
            registry,
            providers,
            filter,
            mirrors,
            default_registry,
        }
    }

    /// Reconciles every image of `projection` into the store: the current
    /// effective usages are re-derived from the indexes, so a delete (whose
    /// projection was already detached) ends up removing entries.
    pub fn reconcile_workload(&self, store: &ImageStore, projection: &ControllerProjection) {
        for image in projection.images() {
            if !self.filter.allows(image) {
                continue;
            }
            let usages = self.indexers.container_infos_for_image(image);
            store.reconcile_image(image, usages);
        }
    }

    /// Credential chain for one probe: provider-minted keychain first, then
    /// pull-secret credentials, then the anonymous fallback.
    async fn keychain_for(&self, reference: &ImageReference, image: &str) -> MultiKeychain {
        let mut chain: Vec<Box<dyn Keychain>> = Vec::new();
        if let Some(minted) = provider_keychain(&self.providers, &reference.registry).await {
            chain.push(minted);
        }
        if let Some(secrets) = self.indexers.keychain_for_image(image) {
            chain.push(Box::new(secrets));
        }
        chain.push(Box::new(AnonymousKeychain));
        MultiKeychain::new(chain)
    }

    async fn attempt(
        &self,
        reference: &ImageReference,
        credential: &RegistryCredential,
    ) -> (AvailabilityMode, Option<RegistryError>) {
        let outcome = self.head_with_deadline(reference, credential).await;
        let mode = classify(&outcome);

        // A misconfigured pull secret can mask a publicly pullable image;
        // retry anonymously before reporting an auth failure.
        if matches!(
            mode,
            AvailabilityMode::AuthnFailure | AvailabilityMode::AuthzFailure
        ) && !credential.is_anonymous()
        {
            let anonymous = self
                .head_with_deadline(reference, &RegistryCredential::Anonymous)
                .await;
            if classify(&anonymous) == AvailabilityMode::Available {
                return (AvailabilityMode::Available, None);
            }
        }

        (mode, outcome.err())
    }

    async fn head_with_deadline(
        &self,
        reference: &ImageReference,
        credential: &RegistryCredential,
    ) -> Result<(), RegistryError> {
        match timeout(
            ATTEMPT_DEADLINE,
            self.registry.head_manifest(reference, credential),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(RegistryError::DeadlineExceeded),
        }
    }
}

#[async_trait]
impl ImageCheck for Checker {
    async fn check(&self, image: &str) -> AvailabilityMode {
        let probe_target = self.mirrors.rewrite(image);

        let reference =
            match ImageReference::parse(&probe_target, self.default_registry.as_deref()) {
                Ok(reference) => reference,
                Err(err) => {
                    error!(
                        image_name = image,
                        availability_mode = %AvailabilityMode::BadImageName,
                        error = %err,
                        "Failed to parse image reference"
                    );
                    return AvailabilityMode::BadImageName;
                }
            };

        let keychain = self.keychain_for(&reference, image).await;
        let credential = keychain.resolve(RegistryTarget {
            registry: &reference.registry,
            repository: &reference.repository,
        });

        let mut mode = AvailabilityMode::UnknownError;
        let mut last_error = None;
        let mut delay = BACKOFF_BASE;
        for step in 0..BACKOFF_STEPS {
            let (attempt_mode, attempt_error) = self.attempt(&reference, &credential).await;
            mode = attempt_mode;
            last_error = attempt_error;
            if mode == AvailabilityMode::Available {
                break;
            }
            if step + 1 < BACKOFF_STEPS {
                tokio::time::sleep(delay).await;
                delay *= BACKOFF_FACTOR;
            }
        }

        if mode != AvailabilityMode::Available {
            error!(
                image_name = image,
                availability_mode = %mode,
                error = %last_error.map(|err| err.to_string()).unwrap_or_default(),
                "Image is not available"
            );
        }
        mode
    }
}

fn classify(outcome: &Result<(), RegistryError>) -> AvailabilityMode {
    let err = match outcome {
        Ok(()) => return AvailabilityMode::Available,
        Err(err) => err,
    };

    match err {
        RegistryError::ManifestStatus(status) | RegistryError::TokenStatus(status) => {
            match *status {
                StatusCode::NOT_FOUND => AvailabilityMode::Absent,
                StatusCode::UNAUTHORIZED => AvailabilityMode::AuthnFailure,
                StatusCode::FORBIDDEN => AvailabilityMode::AuthzFailure,
                status if status.is_server_error() => AvailabilityMode::RegistryUnavailable,
                _ => AvailabilityMode::UnknownError,
            }
        }
        RegistryError::Transport(_) | RegistryError::DeadlineExceeded => {
            AvailabilityMode::RegistryUnavailable
        }
        RegistryError::BadChallenge(_) => AvailabilityMode::UnknownError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ForceCheckKinds};
    use crate::oci_registry::create_http_client;
    use clap::Parser;

    fn test_checker(mirrors: MirrorMap) -> Checker {
        let config =
            Config::try_parse_from(["k8s-image-availability-exporter"]).expect("default args");
        let indexers = Arc::new(ControllerIndexers::new(None, ForceCheckKinds::default()));
        let http = create_http_client(&[], false).expect("client builds");
        Checker::new(
            indexers,
            RegistryClient::new(http, false),
            Vec::new(),
            config.image_filter().expect("empty filter compiles"),
            mirrors,
            None,
        )
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&Ok(())), AvailabilityMode::Available);
        assert_eq!(
            classify(&Err(RegistryError::ManifestStatus(StatusCode::NOT_FOUND))),
            AvailabilityMode::Absent
        );
        assert_eq!(
            classify(&Err(RegistryError::ManifestStatus(
                StatusCode::UNAUTHORIZED
            ))),
            AvailabilityMode::AuthnFailure
        );
        assert_eq!(
            classify(&Err(RegistryError::TokenStatus(StatusCode::FORBIDDEN))),
            AvailabilityMode::AuthzFailure
        );
        assert_eq!(
            classify(&Err(RegistryError::ManifestStatus(
                StatusCode::SERVICE_UNAVAILABLE
            ))),
            AvailabilityMode::RegistryUnavailable
        );
        assert_eq!(
            classify(&Err(RegistryError::DeadlineExceeded)),
            AvailabilityMode::RegistryUnavailable
        );
        assert_eq!(
            classify(&Err(RegistryError::ManifestStatus(StatusCode::GONE))),
            AvailabilityMode::UnknownError
        );
        assert_eq!(
            classify(&Err(RegistryError::BadChallenge("no realm".to_string()))),
            AvailabilityMode::UnknownError
        );
    }

    #[test]
    fn test_unusable_challenge_is_unknown_error_not_authn_failure() {
        // A 401 whose bearer challenge cannot be used surfaces as the
        // challenge error, never as an authentication verdict.
        let garbled =
            RegistryError::BadChallenge("bearer challenge missing required fields".to_string());
        assert_eq!(classify(&Err(garbled)), AvailabilityMode::UnknownError);

        let bad_token_body = RegistryError::BadChallenge(
            "token response is not valid JSON: expected value at line 1".to_string(),
        );
        assert_eq!(
            classify(&Err(bad_token_body)),
            AvailabilityMode::UnknownError
        );
    }

    #[tokio::test]
    async fn test_unparseable_image_is_bad_image_name() {
        let checker = test_checker(MirrorMap::default());
        assert_eq!(
            checker.check("te*^#@@st").await,
            AvailabilityMode::BadImageName
        );
    }
}
