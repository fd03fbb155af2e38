use std::collections::BTreeMap;

use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

use crate::store::{AvailabilityMode, ImageStatus, ImageStore};

pub const METRIC_PREFIX: &str = "k8s_image_availability_exporter";

/// Registry-backed counters owned by the bootstrap layer and injected where
/// they are incremented.
#[derive(Clone)]
pub struct ExporterMetrics {
    pub completed_rechecks: IntCounter,
    pub log_statements: IntCounterVec,
}

impl ExporterMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let completed_rechecks = IntCounter::with_opts(Opts::new(
            format!("{}_completed_rechecks_total", METRIC_PREFIX),
            "Number of image rechecks completed.",
        ))?;
        registry.register(Box::new(completed_rechecks.clone()))?;

        let log_statements = IntCounterVec::new(
            Opts::new(
                "log_statements_total",
                "Number of log statements, differentiated by log level.",
            ),
            &["level"],
        )?;
        registry.register(Box::new(log_statements.clone()))?;

        Ok(Self {
            completed_rechecks,
            log_statements,
        })
    }
}

/// Everything a scrape returns: the registered counters plus the gauge
/// families derived from a store snapshot, sorted by family name.
pub fn gather(registry: &Registry, store: &ImageStore) -> Vec<MetricFamily> {
    let mut families = registry.gather();
    families.extend(availability_metric_families(&store.snapshot()));
    families.sort_by(|a, b| a.get_name().cmp(b.get_name()));
    families
}

/// Builds one gauge per (usage, mode) pair: the gauge matching the entry's
/// current mode reads 1, the other six read 0. Family naming is
/// `k8s_image_availability_exporter_<kind>_<mode>` with the controller name
/// carried in a label named after the kind.
pub fn availability_metric_families(snapshot: &[ImageStatus]) -> Vec<MetricFamily> {
    let mut families: BTreeMap<String, Vec<Metric>> = BTreeMap::new();

    for status in snapshot {
        for usage in &status.usages {
            for mode in AvailabilityMode::ALL {
                let name = format!(
                    "{}_{}_{}",
                    METRIC_PREFIX,
                    usage.kind.metric_label(),
                    mode.metric_suffix()
                );

                let mut metric = Metric::default();
                metric
                    .mut_label()
                    .push(label_pair("namespace", &usage.namespace));
                metric
                    .mut_label()
                    .push(label_pair("container", &usage.container));
                metric.mut_label().push(label_pair("image", &status.image));
                metric
                    .mut_label()
                    .push(label_pair(usage.kind.metric_label(), &usage.controller_name));

                let mut gauge = Gauge::default();
                gauge.set_value(if mode == status.mode { 1.0 } else { 0.0 });
                metric.set_gauge(gauge);

                families.entry(name).or_default().push(metric);
            }
        }
    }

    families
        .into_iter()
        .map(|(name, metrics)| {
            let mut family = MetricFamily::default();
            family.set_name(name);
            family.set_field_type(MetricType::GAUGE);
            for metric in metrics {
                family.mut_metric().push(metric);
            }
            family
        })
        .collect()
}

fn label_pair(name: &str, value: &str) -> LabelPair {
    let mut pair = LabelPair::default();
    pair.set_name(name.to_string());
    pair.set_value(value.to_string());
    pair
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::ControllerKind;
    use crate::store::ContainerUsage;
    use prometheus::{Encoder, TextEncoder};

    fn status(image: &str, mode: AvailabilityMode) -> ImageStatus {
        ImageStatus {
            image: image.to_string(),
            usages: vec![ContainerUsage {
                namespace: "app".to_string(),
                kind: ControllerKind::Deployment,
                controller_name: "web".to_string(),
                container: "main".to_string(),
            }],
            mode,
        }
    }

    fn gauge_value(families: &[MetricFamily], name: &str, image: &str) -> Option<f64> {
        families
            .iter()
            .find(|family| family.get_name() == name)?
            .get_metric()
            .iter()
            .find(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|label| label.get_name() == "image" && label.get_value() == image)
            })
            .map(|metric| metric.get_gauge().get_value())
    }

    #[test]
    fn test_one_usage_emits_full_gauge_family_set() {
        let families =
            availability_metric_families(&[status("test_0", AvailabilityMode::Available)]);

        let total_metrics: usize = families.iter().map(|family| family.get_metric().len()).sum();
        assert_eq!(total_metrics, AvailabilityMode::ALL.len());

        assert_eq!(
            gauge_value(
                &families,
                "k8s_image_availability_exporter_deployment_available",
                "test_0"
            ),
            Some(1.0)
        );
        for mode in AvailabilityMode::ALL {
            if mode == AvailabilityMode::Available {
                continue;
            }
            assert_eq!(
                gauge_value(
                    &families,
                    &format!(
                        "k8s_image_availability_exporter_deployment_{}",
                        mode.metric_suffix()
                    ),
                    "test_0"
                ),
                Some(0.0)
            );
        }

        let available = families
            .iter()
            .find(|family| {
                family.get_name() == "k8s_image_availability_exporter_deployment_available"
            })
            .unwrap();
        let labels: Vec<(String, String)> = available.get_metric()[0]
            .get_label()
            .iter()
            .map(|label| (label.get_name().to_string(), label.get_value().to_string()))
            .collect();
        assert!(labels.contains(&("namespace".to_string(), "app".to_string())));
        assert!(labels.contains(&("container".to_string(), "main".to_string())));
        assert!(labels.contains(&("deployment".to_string(), "web".to_string())));
        assert!(labels.contains(&("image".to_string(), "test_0".to_string())));
    }

    #[test]
    fn test_mixed_outcomes_emit_one_high_gauge_each() {
        let snapshot = vec![
            status("test_0", AvailabilityMode::Available),
            status("test_1", AvailabilityMode::Available),
            status("test_2", AvailabilityMode::Available),
            status("fail_0", AvailabilityMode::UnknownError),
            status("fail_1", AvailabilityMode::UnknownError),
        ];
        let families = availability_metric_families(&snapshot);

        let total_metrics: usize = families.iter().map(|family| family.get_metric().len()).sum();
        assert_eq!(total_metrics, 35);

        for image in ["test_0", "test_1", "test_2"] {
            assert_eq!(
                gauge_value(
                    &families,
                    "k8s_image_availability_exporter_deployment_available",
                    image
                ),
                Some(1.0)
            );
        }
        for image in ["fail_0", "fail_1"] {
            assert_eq!(
                gauge_value(
                    &families,
                    "k8s_image_availability_exporter_deployment_unknown_error",
                    image
                ),
                Some(1.0)
            );
            assert_eq!(
                gauge_value(
                    &families,
                    "k8s_image_availability_exporter_deployment_available",
                    image
                ),
                Some(0.0)
            );
        }
    }

    #[test]
    fn test_families_encode_to_text_format() {
        let registry = Registry::new();
        let metrics = ExporterMetrics::register(&registry).unwrap();
        metrics.completed_rechecks.inc();

        let store = ImageStore::new(50, 20);
        store.reconcile_image(
            "test_0",
            vec![ContainerUsage {
                namespace: "app".to_string(),
                kind: ControllerKind::CronJob,
                controller_name: "backup".to_string(),
                container: "runner".to_string(),
            }],
        );

        let families = gather(&registry, &store);
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("k8s_image_availability_exporter_completed_rechecks_total 1"));
        assert!(text.contains("k8s_image_availability_exporter_cronjob_available"));
        assert!(text.contains("cronjob=\"backup\""));
    }
}
