use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Registry host implied for references that don't carry one.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Hosts that all name the Docker Hub registry.
pub const DOCKER_HUB_ALIASES: [&str; 3] = ["docker.io", "index.docker.io", "registry-1.docker.io"];

/// A parsed container image reference: registry host, repository path and
/// either a tag, a digest, or both. References without a tag or digest get
/// the conventional `latest` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    InvalidRegistry(String),
    InvalidRepository(String),
    InvalidTag(String),
    InvalidDigest(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty image reference"),
            ParseError::InvalidRegistry(r) => write!(f, "invalid registry host: {}", r),
            ParseError::InvalidRepository(r) => write!(f, "invalid repository: {}", r),
            ParseError::InvalidTag(t) => write!(f, "invalid tag: {}", t),
            ParseError::InvalidDigest(d) => write!(f, "invalid digest: {}", d),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").unwrap())
}

fn repository_component_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*$").unwrap())
}

fn digest_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[+._-][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}$")
            .unwrap()
    })
}

fn registry_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*(?::[0-9]+)?$").unwrap())
}

/// Whether the first path component of a reference names a registry host
/// rather than the start of a repository path. Same heuristic the container
/// runtimes use: a dot, a port, or the literal `localhost`.
fn is_registry_component(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

impl ImageReference {
    /// Parses `image`, qualifying unanchored names with `default_registry`
    /// (or Docker Hub when none is configured).
    pub fn parse(image: &str, default_registry: Option<&str>) -> Result<Self, ParseError> {
        if image.is_empty() {
            return Err(ParseError::Empty);
        }

        let (rest, digest) = match image.split_once('@') {
            Some((base, digest)) => {
                if !digest_regex().is_match(digest) {
                    return Err(ParseError::InvalidDigest(digest.to_string()));
                }
                (base, Some(digest.to_string()))
            }
            None => (image, None),
        };

        // A colon after the last slash separates the tag.
        let (rest, tag) = match rest.rfind(':') {
            Some(pos) if pos > rest.rfind('/').unwrap_or(0) => {
                (&rest[..pos], Some(rest[pos + 1..].to_string()))
            }
            _ => (rest, None),
        };

        let tag = match tag {
            Some(tag) => {
                if !tag_regex().is_match(&tag) {
                    return Err(ParseError::InvalidTag(tag));
                }
                tag
            }
            None => "latest".to_string(),
        };

        let (registry, mut repository) = match rest.split_once('/') {
            Some((first, remainder)) if is_registry_component(first) => {
                (first.to_string(), remainder.to_string())
            }
            _ => {
                let default = default_registry.unwrap_or(DEFAULT_REGISTRY);
                (default.to_string(), rest.to_string())
            }
        };

        if !registry_regex().is_match(&registry) {
            return Err(ParseError::InvalidRegistry(registry));
        }

        // Docker Hub official images live under the library/ namespace.
        if DOCKER_HUB_ALIASES.contains(&registry.as_str()) && !repository.contains('/') {
            repository = format!("library/{}", repository);
        }

        if repository.is_empty()
            || !repository
                .split('/')
                .all(|component| repository_component_regex().is_match(component))
        {
            return Err(ParseError::InvalidRepository(repository));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The tag or digest used on the registry's manifest endpoint; digests
    /// take precedence because they pin content exactly.
    pub fn manifest_reference(&self) -> &str {
        self.digest.as_deref().unwrap_or(&self.tag)
    }
}
