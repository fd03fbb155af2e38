use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::projection::ControllerKind;

/// How often the store reconciles its usage sets against the indexes.
pub const GC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Classification of the last probe of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AvailabilityMode {
    Available,
    Absent,
    BadImageName,
    RegistryUnavailable,
    AuthnFailure,
    AuthzFailure,
    UnknownError,
}

impl AvailabilityMode {
    pub const ALL: [AvailabilityMode; 7] = [
        AvailabilityMode::Available,
        AvailabilityMode::Absent,
        AvailabilityMode::BadImageName,
        AvailabilityMode::RegistryUnavailable,
        AvailabilityMode::AuthnFailure,
        AvailabilityMode::AuthzFailure,
        AvailabilityMode::UnknownError,
    ];

    /// Suffix of the per-kind gauge family carrying this mode. The suffix
    /// set is a stable contract with existing dashboards.
    pub fn metric_suffix(&self) -> &'static str {
        match self {
            AvailabilityMode::Available => "available",
            AvailabilityMode::Absent => "absent",
            AvailabilityMode::BadImageName => "bad_image_format",
            AvailabilityMode::RegistryUnavailable => "registry_unavailable",
            AvailabilityMode::AuthnFailure => "authentication_failure",
            AvailabilityMode::AuthzFailure => "authorization_failure",
            AvailabilityMode::UnknownError => "unknown_error",
        }
    }
}

impl fmt::Display for AvailabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric_suffix())
    }
}

/// One container-spec occurrence of an image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerUsage {
    pub namespace: String,
    pub kind: ControllerKind,
    pub controller_name: String,
    pub container: String,
}

struct ImageEntry {
    usages: HashSet<ContainerUsage>,
    mode: AvailabilityMode,
    /// Popped for probing and not yet written back; in neither queue.
    in_flight: bool,
}

/// A snapshot row for metrics emission.
#[derive(Debug, Clone)]
pub struct ImageStatus {
    pub image: String,
    pub usages: Vec<ContainerUsage>,
    pub mode: AvailabilityMode,
}

/// Probes one image and classifies the outcome. Implemented by the checker;
/// stubbed in tests.
#[async_trait]
pub trait ImageCheck: Send + Sync {
    async fn check(&self, image: &str) -> AvailabilityMode;
}

struct Inner {
    entries: HashMap<String, ImageEntry>,
    healthy: VecDeque<String>,
    unhealthy: VecDeque<String>,
}

/// The authoritative image table. Two FIFO queues pace rechecks: images
/// whose last probe failed sit on the `unhealthy` queue and are drained
/// ahead of the bulk `healthy` queue on every tick.
pub struct ImageStore {
    inner: RwLock<Inner>,
    healthy_batch: usize,
    unhealthy_batch: usize,
}

impl ImageStore {
    pub fn new(healthy_batch: usize, unhealthy_batch: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                healthy: VecDeque::new(),
                unhealthy: VecDeque::new(),
            }),
            healthy_batch,
            unhealthy_batch,
        }
    }

    /// Upserts the entry for `image`. An empty usage set deletes the entry;
    /// any queue occurrences become dead and are discarded on pop. Updates
    /// only union usages in and never re-enqueue, so an image appears at
    /// most once across both queues.
    pub fn reconcile_image(&self, image: &str, usages: Vec<ContainerUsage>) {
        let mut inner = self.lock_write();

        if usages.is_empty() {
            inner.entries.remove(image);
            return;
        }

        match inner.entries.get_mut(image) {
            Some(entry) => {
                entry.usages.extend(usages);
            }
            None => {
                inner.entries.insert(
                    image.to_string(),
                    ImageEntry {
                        usages: usages.into_iter().collect(),
                        mode: AvailabilityMode::Available,
                        in_flight: false,
                    },
                );
                inner.healthy.push_back(image.to_string());
            }
        }
    }

    /// One recheck pass: drains up to the unhealthy batch from the error
    /// queue, rolls any shortfall into the healthy budget, probes the popped
    /// images outside the lock, then writes modes back and re-enqueues each
    /// image on the queue matching its fresh mode.
    pub async fn tick<C: ImageCheck + ?Sized>(&self, checker: &C) {
        let batch = self.pop_batch();
        if batch.is_empty() {
            return;
        }

        let concurrency = batch.len();
        let results: Vec<(String, AvailabilityMode)> = stream::iter(batch)
            .map(|image| async move {
                let mode = checker.check(&image).await;
                (image, mode)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut inner = self.lock_write();
        for (image, mode) in results {
            let entry = match inner.entries.get_mut(&image) {
                // Deleted while the probe ran, or deleted and re-inserted
                // (a fresh entry is already queued). Drop the stale result.
                Some(entry) if entry.in_flight => entry,
                _ => continue,
            };

            entry.in_flight = false;
            entry.mode = mode;
            if mode == AvailabilityMode::Available {
                inner.healthy.push_back(image);
            } else {
                inner.unhealthy.push_back(image);
            }
        }
    }

    fn pop_batch(&self) -> Vec<String> {
        let mut inner = self.lock_write();
        let mut batch = Vec::new();

        let unhealthy_budget = self.unhealthy_batch.min(inner.unhealthy.len());
        for _ in 0..unhealthy_budget {
            let image = inner.unhealthy.pop_front().expect("budget bounded by len");
            if let Some(entry) = inner.entries.get_mut(&image) {
                entry.in_flight = true;
                batch.push(image);
            }
        }

        // Slack left by a short unhealthy queue goes to healthy rechecks.
        let rollover = self.unhealthy_batch - unhealthy_budget;
        let healthy_budget = (self.healthy_batch + rollover).min(inner.healthy.len());
        for _ in 0..healthy_budget {
            let image = inner.healthy.pop_front().expect("budget bounded by len");
            if let Some(entry) = inner.entries.get_mut(&image) {
                entry.in_flight = true;
                batch.push(image);
            }
        }

        batch
    }

    /// Re-derives every entry's usage set through `lookup` and deletes
    /// entries that no longer have any live referrer. This is the only path
    /// that shrinks a usage set.
    pub fn gc<F>(&self, lookup: F)
    where
        F: Fn(&str) -> Vec<ContainerUsage>,
    {
        let mut inner = self.lock_write();

        let images: Vec<String> = inner.entries.keys().cloned().collect();
        for image in images {
            let usages = lookup(&image);
            if usages.is_empty() {
                inner.entries.remove(&image);
                continue;
            }
            if let Some(entry) = inner.entries.get_mut(&image) {
                entry.usages = usages.into_iter().collect();
            }
        }
    }

    /// Periodic GC driver, cancelled by the process stop signal.
    pub async fn run_gc<F>(&self, lookup: F, token: CancellationToken)
    where
        F: Fn(&str) -> Vec<ContainerUsage>,
    {
        let mut interval = tokio::time::interval(GC_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    debug!("Running image store GC");
                    self.gc(&lookup);
                }
            }
        }
    }

    /// Consistent copy of the table for metrics emission.
    pub fn snapshot(&self) -> Vec<ImageStatus> {
        let inner = self.inner.read().expect("image store lock poisoned");

        let mut statuses: Vec<ImageStatus> = inner
            .entries
            .iter()
            .map(|(image, entry)| {
                let mut usages: Vec<ContainerUsage> = entry.usages.iter().cloned().collect();
                usages.sort();
                ImageStatus {
                    image: image.clone(),
                    usages,
                    mode: entry.mode,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.image.cmp(&b.image));
        statuses
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("image store lock poisoned")
    }
}
