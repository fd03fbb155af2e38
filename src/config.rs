use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use regex::Regex;

use crate::projection::ControllerKind;

/// Command-line surface of the exporter.
#[derive(Parser, Debug)]
#[command(
    name = "k8s-image-availability-exporter",
    version,
    about = "Exports Prometheus metrics describing whether workload images are pullable"
)]
pub struct Config {
    /// Interval between image re-check ticks.
    #[arg(long = "check-interval", value_parser = humantime::parse_duration, default_value = "1m")]
    pub check_interval: Duration,

    /// address:port to bind the /metrics and /healthz endpoints to.
    #[arg(long = "bind-address", default_value = ":8080")]
    pub bind_address: String,

    /// Tilde-separated image regexes to ignore; any match skips the image.
    #[arg(long = "ignored-images", default_value = "")]
    pub ignored_images: String,

    /// Tilde-separated image regexes to allow; when non-empty, only matching
    /// images are tracked.
    #[arg(long = "allowed-images", default_value = "")]
    pub allowed_images: String,

    /// Restrict checks to namespaces carrying this label key.
    #[arg(long = "namespace-label")]
    pub namespace_label: Option<String>,

    /// Skip registry certificate verification.
    #[arg(long = "skip-registry-cert-verification")]
    pub skip_registry_cert_verification: bool,

    /// Fall back to plain HTTP for registries that don't support HTTPS.
    #[arg(long = "allow-plain-http")]
    pub allow_plain_http: bool,

    /// Registry host assumed for image names that don't carry one.
    #[arg(long = "default-registry")]
    pub default_registry: Option<String>,

    /// Path to a PEM-encoded CA bundle appended to the system pool; may be
    /// given multiple times.
    #[arg(long = "capath")]
    pub ca_paths: Vec<PathBuf>,

    /// Mirror repository in original=mirror form; may be given multiple
    /// times. Probes of images under `original` target `mirror` instead.
    #[arg(long = "image-mirror", value_parser = Mirror::parse)]
    pub image_mirrors: Vec<Mirror>,

    /// Comma-separated controller kinds checked even while disabled or
    /// suspended, or "*" for all kinds (case-insensitive).
    #[arg(long = "force-check-disabled-controllers", value_parser = ForceCheckKinds::parse, default_value = "")]
    pub force_check_disabled_controllers: ForceCheckKinds,
}

impl Config {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let address = if self.bind_address.starts_with(':') {
            format!("0.0.0.0{}", self.bind_address)
        } else {
            self.bind_address.clone()
        };
        address
            .parse()
            .with_context(|| format!("Invalid bind address {:?}", self.bind_address))
    }

    pub fn image_filter(&self) -> anyhow::Result<ImageFilter> {
        Ok(ImageFilter {
            allowed: compile_regex_list(&self.allowed_images)?,
            ignored: compile_regex_list(&self.ignored_images)?,
        })
    }

    pub fn mirror_map(&self) -> MirrorMap {
        MirrorMap {
            mirrors: self.image_mirrors.clone(),
        }
    }
}

/// Controller kinds whose `enabled` state is overridden to always-true.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForceCheckKinds(BTreeSet<ControllerKind>);

impl ForceCheckKinds {
    pub fn parse(value: &str) -> Result<Self, String> {
        if value.is_empty() {
            return Ok(Self::default());
        }
        if value == "*" {
            return Ok(Self(ControllerKind::ALL.into_iter().collect()));
        }

        let mut kinds = BTreeSet::new();
        for part in value.split(',') {
            let kind = part.parse::<ControllerKind>().map_err(|_| {
                "must be one of deployment, statefulset, daemonset, cronjob or * for all kinds"
                    .to_string()
            })?;
            kinds.insert(kind);
        }
        Ok(Self(kinds))
    }

    pub fn contains(&self, kind: ControllerKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One original=mirror substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    pub original: String,
    pub mirror: String,
}

impl Mirror {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.split_once('=') {
            Some((original, mirror)) if !original.is_empty() && !mirror.is_empty() => Ok(Self {
                original: original.to_string(),
                mirror: mirror.to_string(),
            }),
            _ => Err("invalid format for mirror, must be original=mirror".to_string()),
        }
    }
}

/// Ordered prefix substitutions applied to probe targets. The first
/// matching prefix wins; the reported image string is never rewritten.
#[derive(Debug, Clone, Default)]
pub struct MirrorMap {
    mirrors: Vec<Mirror>,
}

impl MirrorMap {
    pub fn rewrite(&self, image: &str) -> String {
        for mirror in &self.mirrors {
            if image.starts_with(&mirror.original) {
                return image.replacen(&mirror.original, &mirror.mirror, 1);
            }
        }
        image.to_string()
    }
}

/// Compiled allow/ignore regex lists, built once at startup.
pub struct ImageFilter {
    allowed: Vec<Regex>,
    ignored: Vec<Regex>,
}

impl ImageFilter {
    pub fn allows(&self, image: &str) -> bool {
        if !self.allowed.is_empty() && !self.allowed.iter().any(|regex| regex.is_match(image)) {
            return false;
        }
        !self.ignored.iter().any(|regex| regex.is_match(image))
    }
}

fn compile_regex_list(value: &str) -> anyhow::Result<Vec<Regex>> {
    value
        .split('~')
        .filter(|part| !part.is_empty())
        .map(|part| Regex::new(part).with_context(|| format!("Invalid image regex {:?}", part)))
        .collect()
}
