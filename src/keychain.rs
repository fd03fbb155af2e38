use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;
use tracing::warn;

use crate::image_reference::DOCKER_HUB_ALIASES;
use crate::secret_string::SecretString;

pub const SECRET_TYPE_DOCKER_CONFIG_JSON: &str = "kubernetes.io/dockerconfigjson";
pub const SECRET_TYPE_DOCKER_CFG: &str = "kubernetes.io/dockercfg";

const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKER_CFG_KEY: &str = ".dockercfg";

/// Canonical Docker Hub key in legacy docker config files.
pub const DOCKER_HUB_CONFIG_KEY: &str = "https://index.docker.io/v1/";

/// One entry of a docker config `auths` map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DockerAuth {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub auth: Option<SecretString>,
    #[serde(default)]
    pub identitytoken: Option<SecretString>,
    #[serde(default)]
    pub registrytoken: Option<SecretString>,
}

impl DockerAuth {
    fn credential(&self) -> RegistryCredential {
        if let Some(auth) = self.auth.as_ref().filter(|auth| !auth.is_empty()) {
            return RegistryCredential::EncodedBasic(auth.clone());
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return RegistryCredential::Basic {
                username: username.clone(),
                password: password.clone(),
            };
        }
        if let Some(token) = self
            .registrytoken
            .as_ref()
            .or(self.identitytoken.as_ref())
            .filter(|token| !token.is_empty())
        {
            return RegistryCredential::Bearer(token.clone());
        }
        RegistryCredential::Anonymous
    }
}

/// Parsed docker config carried by a pull secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: BTreeMap<String, DockerAuth>,
}

impl DockerConfig {
    /// Returns a copy in which every Docker Hub alias key is renamed to the
    /// canonical `https://index.docker.io/v1/` form, preserving the
    /// credential blob. The receiver is left untouched.
    pub fn normalized(&self) -> DockerConfig {
        let auths = self
            .auths
            .iter()
            .map(|(key, auth)| {
                let key = if key.contains("docker.io") && key != DOCKER_HUB_CONFIG_KEY {
                    DOCKER_HUB_CONFIG_KEY.to_string()
                } else {
                    key.clone()
                };
                (key, auth.clone())
            })
            .collect();

        DockerConfig { auths }
    }
}

/// Extracts the docker config from a pull secret, accepting both the current
/// `kubernetes.io/dockerconfigjson` shape and the legacy
/// `kubernetes.io/dockercfg` bare-map shape. Non-pull secrets and garbled
/// payloads yield `None`.
pub fn parse_pull_secret(secret: &Secret) -> Option<DockerConfig> {
    let secret_type = secret.type_.as_deref()?;
    let data = secret.data.as_ref()?;

    let parsed = match secret_type {
        SECRET_TYPE_DOCKER_CONFIG_JSON => {
            let bytes = &data.get(DOCKER_CONFIG_JSON_KEY)?.0;
            serde_json::from_slice::<DockerConfig>(bytes)
        }
        SECRET_TYPE_DOCKER_CFG => {
            let bytes = &data.get(DOCKER_CFG_KEY)?.0;
            serde_json::from_slice::<BTreeMap<String, DockerAuth>>(bytes)
                .map(|auths| DockerConfig { auths })
        }
        _ => return None,
    };

    match parsed {
        Ok(config) => Some(config),
        Err(err) => {
            warn!(
                secret_name = secret.metadata.name.as_deref().unwrap_or_default(),
                error = %err,
                "Failed to parse docker config in pull secret"
            );
            None
        }
    }
}

/// The registry endpoint a credential is being resolved for.
#[derive(Debug, Clone, Copy)]
pub struct RegistryTarget<'a> {
    pub registry: &'a str,
    pub repository: &'a str,
}

/// A resolved registry credential, ready to become an Authorization header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCredential {
    Basic {
        username: String,
        password: SecretString,
    },
    /// Pre-encoded `user:password` blob from a docker config `auth` field.
    EncodedBasic(SecretString),
    Bearer(SecretString),
    Anonymous,
}

impl RegistryCredential {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, RegistryCredential::Anonymous)
    }

    pub fn authorization_header(&self) -> Option<String> {
        match self {
            RegistryCredential::Basic { username, password } => Some(format!(
                "Basic {}",
                BASE64.encode(format!("{}:{}", username, password.expose_secret()))
            )),
            RegistryCredential::EncodedBasic(auth) => {
                Some(format!("Basic {}", auth.expose_secret()))
            }
            RegistryCredential::Bearer(token) => Some(format!("Bearer {}", token.expose_secret())),
            RegistryCredential::Anonymous => None,
        }
    }
}

/// Maps a registry target to a credential. Implementations cover pull
/// secrets, provider-minted tokens, the anonymous fallback, and the
/// composition of all of them.
pub trait Keychain: Send + Sync {
    fn resolve(&self, target: RegistryTarget<'_>) -> RegistryCredential;
}

/// Terminal keychain: always anonymous.
pub struct AnonymousKeychain;

impl Keychain for AnonymousKeychain {
    fn resolve(&self, _target: RegistryTarget<'_>) -> RegistryCredential {
        RegistryCredential::Anonymous
    }
}

/// A single pre-resolved credential, e.g. minted by a cloud provider.
pub struct StaticKeychain {
    credential: RegistryCredential,
}

impl StaticKeychain {
    pub fn new(credential: RegistryCredential) -> Self {
        Self { credential }
    }
}

impl Keychain for StaticKeychain {
    fn resolve(&self, _target: RegistryTarget<'_>) -> RegistryCredential {
        self.credential.clone()
    }
}

/// Keychain assembled from the docker configs of dereferenced pull secrets.
pub struct SecretKeychain {
    auths: Vec<(String, DockerAuth)>,
}

impl SecretKeychain {
    pub fn new(configs: impl IntoIterator<Item = DockerConfig>) -> Self {
        let auths = configs
            .into_iter()
            .flat_map(|config| config.normalized().auths)
            .collect();
        Self { auths }
    }
}

impl Keychain for SecretKeychain {
    fn resolve(&self, target: RegistryTarget<'_>) -> RegistryCredential {
        // The most specific matching key (longest repository path) wins.
        self.auths
            .iter()
            .filter(|(key, _)| key_matches(key, target))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, auth)| auth.credential())
            .unwrap_or(RegistryCredential::Anonymous)
    }
}

fn key_matches(key: &str, target: RegistryTarget<'_>) -> bool {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key)
        .trim_end_matches('/');

    let (host, path) = match key.split_once('/') {
        Some((host, path)) => (host, path),
        None => (key, ""),
    };

    // Docker Hub keys match by host only; the /v1/ suffix on the canonical
    // key is protocol residue, not a repository path.
    if DOCKER_HUB_ALIASES.contains(&host) {
        return DOCKER_HUB_ALIASES.contains(&target.registry);
    }

    if host != target.registry {
        return false;
    }

    path.is_empty()
        || target.repository == path
        || target
            .repository
            .strip_prefix(path)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Iterates child keychains and returns the first non-anonymous credential.
pub struct MultiKeychain {
    chain: Vec<Box<dyn Keychain>>,
}

impl MultiKeychain {
    pub fn new(chain: Vec<Box<dyn Keychain>>) -> Self {
        Self { chain }
    }
}

impl Keychain for MultiKeychain {
    fn resolve(&self, target: RegistryTarget<'_>) -> RegistryCredential {
        for keychain in &self.chain {
            let credential = keychain.resolve(target);
            if !credential.is_anonymous() {
                return credential;
            }
        }
        RegistryCredential::Anonymous
    }
}
