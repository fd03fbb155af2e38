use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use crate::image_reference::ImageReference;
use crate::keychain::RegistryCredential;
use crate::secret_string::SecretString;

/// Accepted manifest media types. Schema 1 is listed so registries that only
/// speak the obsolete format still answer 200; the exporter does not police
/// schema versions.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.docker.distribution.manifest.v1+json";

/// Builds the shared registry HTTP client. System roots come from
/// rustls-tls-native-roots; `ca_paths` appends extra PEM bundles.
pub fn create_http_client(ca_paths: &[PathBuf], skip_verify: bool) -> Result<Client> {
    info!("Initializing OCI registry HTTP client");
    let mut builder = Client::builder().user_agent(concat!(
        "k8s-image-availability-exporter/",
        env!("CARGO_PKG_VERSION")
    ));

    if skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    for path in ca_paths {
        let contents = fs::read(path)
            .with_context(|| format!("Failed to read CA file {}", path.display()))?;
        let certificate = Certificate::from_pem(&contents)
            .with_context(|| format!("Failed to parse {} as a PEM certificate", path.display()))?;
        builder = builder.add_root_certificate(certificate);
    }

    builder.build().context("Failed to build HTTP client")
}

/// Failure of one manifest probe attempt, kept structured so the checker can
/// classify it into an availability mode.
#[derive(Debug)]
pub enum RegistryError {
    /// The manifest endpoint answered with a non-success status.
    ManifestStatus(StatusCode),
    /// The token endpoint answered with a non-success status.
    TokenStatus(StatusCode),
    /// The registry's authentication challenge could not be used.
    BadChallenge(String),
    Transport(reqwest::Error),
    DeadlineExceeded,
}

impl std::error::Error for RegistryError {}
impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::ManifestStatus(status) => {
                write!(f, "registry returned status {} for manifest request", status)
            }
            RegistryError::TokenStatus(status) => {
                write!(f, "token endpoint returned status {}", status)
            }
            RegistryError::BadChallenge(reason) => {
                write!(f, "unusable authentication challenge: {}", reason)
            }
            RegistryError::Transport(err) => write!(f, "registry transport error: {}", err),
            RegistryError::DeadlineExceeded => write!(f, "registry probe deadline exceeded"),
        }
    }
}

/// The host actually connected to for a registry. Docker Hub pulls go
/// through registry-1.docker.io, mimicking containerd.
fn connection_host(registry: &str) -> &str {
    if crate::image_reference::DOCKER_HUB_ALIASES.contains(&registry) {
        return "registry-1.docker.io";
    }
    registry
}

/// Parsed `WWW-Authenticate: Bearer` challenge.
/// Example: `Bearer realm="https://auth.docker.io/token",service="registry.docker.io"`.
#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Option<Self> {
        let params = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))?;

        let mut fields: std::collections::HashMap<&str, &str> = params
            .split(',')
            .filter_map(|field| {
                let mut parts = field.splitn(2, '=');
                let key = parts.next()?.trim();
                let value = parts.next()?.trim().trim_matches('"');
                Some((key, value))
            })
            .collect();

        Some(Self {
            realm: fields.remove("realm")?.to_string(),
            service: fields.remove("service").map(str::to_string),
            scope: fields.remove("scope").map(str::to_string),
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Metadata-only client against the registry v2 API.
pub struct RegistryClient {
    http: Client,
    plain_http: bool,
}

impl RegistryClient {
    pub fn new(http: Client, plain_http: bool) -> Self {
        Self { http, plain_http }
    }

    /// HEADs the manifest of `reference`, negotiating a bearer token when
    /// the registry demands one. Never downloads manifest bytes.
    pub async fn head_manifest(
        &self,
        reference: &ImageReference,
        credential: &RegistryCredential,
    ) -> Result<(), RegistryError> {
        match self.head_with_scheme("https", reference, credential).await {
            Err(RegistryError::Transport(err)) if self.plain_http => {
                debug!(
                    registry = %reference.registry,
                    error = %err,
                    "HTTPS probe failed, falling back to plain HTTP"
                );
                self.head_with_scheme("http", reference, credential).await
            }
            outcome => outcome,
        }
    }

    async fn head_with_scheme(
        &self,
        scheme: &str,
        reference: &ImageReference,
        credential: &RegistryCredential,
    ) -> Result<(), RegistryError> {
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme,
            connection_host(&reference.registry),
            reference.repository,
            reference.manifest_reference()
        );

        let response = self
            .send_head(&url, credential.authorization_header())
            .await?;
        if response.status().is_success() {
            return Ok(());
        }

        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(header) = response.headers().get(WWW_AUTHENTICATE) {
                let header = header.to_str().map_err(|_| {
                    RegistryError::BadChallenge("challenge header is not valid UTF-8".to_string())
                })?;
                debug!(
                    registry = %reference.registry,
                    challenge = header,
                    "Received auth challenge"
                );

                let is_bearer =
                    header.starts_with("Bearer ") || header.starts_with("bearer ");
                if let Some(challenge) = BearerChallenge::parse(header) {
                    let token = self.exchange_token(&challenge, reference, credential).await?;
                    let retry = self
                        .send_head(&url, Some(format!("Bearer {}", token.expose_secret())))
                        .await?;
                    if retry.status().is_success() {
                        return Ok(());
                    }
                    return Err(RegistryError::ManifestStatus(retry.status()));
                } else if is_bearer {
                    // A bearer challenge we cannot act on is not an auth
                    // verdict about the image.
                    return Err(RegistryError::BadChallenge(
                        "bearer challenge missing required fields".to_string(),
                    ));
                }
            }
        }

        Err(RegistryError::ManifestStatus(response.status()))
    }

    async fn send_head(
        &self,
        url: &str,
        authorization: Option<String>,
    ) -> Result<Response, RegistryError> {
        let mut request = self.http.head(url).header(ACCEPT, MANIFEST_ACCEPT);
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        request.send().await.map_err(RegistryError::Transport)
    }

    /// Fetches a bearer token from the challenge realm, presenting the
    /// resolved credential so private registries can authenticate the pull.
    async fn exchange_token(
        &self,
        challenge: &BearerChallenge,
        reference: &ImageReference,
        credential: &RegistryCredential,
    ) -> Result<SecretString, RegistryError> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", reference.repository));

        let mut request = self
            .http
            .get(&challenge.realm)
            .query(&[("scope", scope.as_str())]);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service.as_str())]);
        }
        if let Some(value) = credential.authorization_header() {
            request = request.header(AUTHORIZATION, value);
        }

        let response = request.send().await.map_err(RegistryError::Transport)?;
        if !response.status().is_success() {
            return Err(RegistryError::TokenStatus(response.status()));
        }

        let body: TokenResponse = response.json().await.map_err(|err| {
            RegistryError::BadChallenge(format!("token response is not valid JSON: {err}"))
        })?;
        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .map(SecretString::new)
            .ok_or_else(|| {
                RegistryError::BadChallenge("token response carried no token".to_string())
            })
    }
}
