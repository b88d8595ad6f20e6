//! Built-in catalog of query templates.
//!
//! Presets are parameterized APL bodies with `${DATASET}` and `${RANGE}`
//! placeholders. The Core pack applies to every dataset; the OTel, Stripe,
//! and Segment packs are attached by a name/kind substring match so, e.g., a
//! dataset named `stripe-events` picks up the payment views.

use serde_json::json;

use crate::client::Dataset;
use crate::compiler::Format;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    pub name: &'static str,
    pub description: &'static str,
    pub format: Format,
    pub template: &'static str,
    /// Overrides the configured default range when set.
    pub default_range: Option<&'static str>,
}

impl Preset {
    const fn csv(name: &'static str, description: &'static str, template: &'static str) -> Self {
        Self {
            name,
            description,
            format: Format::Csv,
            template,
            default_range: None,
        }
    }

    pub fn filename(&self) -> String {
        format!("{}.{}", self.name, self.format)
    }
}

pub struct Catalog {
    pub core: Vec<Preset>,
    pub otel: Vec<Preset>,
    pub stripe: Vec<Preset>,
    pub segment: Vec<Preset>,
}

pub fn default_catalog() -> Catalog {
    Catalog {
        core: vec![
            Preset::csv(
                "errors",
                "HTTP 500+ counts by service",
                "['${DATASET}']\n| where _time between (${RANGE})\n| where status >= 500\n| summarize count() by service",
            ),
            Preset::csv(
                "latency",
                "Latency p50/p95/p99 by service and endpoint",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize p50=percentile(duration, 50), p95=percentile(duration, 95), p99=percentile(duration, 99) by service, endpoint",
            ),
            Preset::csv(
                "traffic",
                "Request rate over time",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize count() by bin_auto(_time)",
            ),
            Preset::csv(
                "slow-requests",
                "Slow requests over threshold",
                "['${DATASET}']\n| where _time between (${RANGE})\n| where duration > 1s\n| project _time, service, endpoint, duration\n| order by duration desc",
            ),
            Preset::csv(
                "top-endpoints",
                "Top endpoints by request volume",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize count() by endpoint\n| order by count_ desc\n| take 50",
            ),
        ],
        otel: vec![
            Preset::csv(
                "dependencies",
                "Service-to-service call volume and latency",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize count(), p95=percentile(duration, 95) by service, peer_service",
            ),
            Preset::csv(
                "top-spans",
                "Slowest spans with attributes",
                "['${DATASET}']\n| where _time between (${RANGE})\n| project service, span_name, duration\n| order by duration desc\n| take 50",
            ),
            Preset::csv(
                "slo-burn",
                "Error budget burn over time",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize error_rate=100.0 * countif(status>=500)/count() by bin_auto(_time)",
            ),
        ],
        stripe: vec![
            Preset::csv(
                "payments",
                "Counts by payment status and method",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize count() by status, method",
            ),
            Preset::csv(
                "refunds",
                "Refund rate over time",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize refund_rate=100.0 * countif(type==\"refund\")/count() by bin_auto(_time)",
            ),
            Preset::csv(
                "disputes",
                "Dispute volume by reason",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize count() by dispute_reason",
            ),
            Preset::csv(
                "latency",
                "Processing latency percentiles",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize p50=percentile(duration, 50), p95=percentile(duration, 95), p99=percentile(duration, 99)",
            ),
            Preset::csv(
                "top-customers",
                "Top customers by volume",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize count() by customer_id\n| order by count_ desc\n| take 50",
            ),
        ],
        segment: vec![
            Preset::csv(
                "events",
                "Top event names over time",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize count() by bin_auto(_time), event",
            ),
            Preset::csv(
                "sources",
                "Volume by source and integration",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize count() by source, integration",
            ),
            Preset::csv(
                "schemas",
                "Top fields by event type",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize count() by event, field",
            ),
            Preset::csv(
                "errors",
                "Delivery failures by destination",
                "['${DATASET}']\n| where _time between (${RANGE})\n| where status >= 400\n| summarize count() by destination",
            ),
            Preset::csv(
                "latency",
                "Ingestion latency percentiles",
                "['${DATASET}']\n| where _time between (${RANGE})\n| summarize p50=percentile(duration, 50), p95=percentile(duration, 95) by source",
            ),
        ],
    }
}

/// Every preset across all packs, for the root `_presets/` listing.
pub fn all_presets() -> Vec<Preset> {
    let catalog = default_catalog();
    let mut list = catalog.core;
    list.extend(catalog.otel);
    list.extend(catalog.stripe);
    list.extend(catalog.segment);
    list
}

/// Packs applicable to a dataset: Core always, the rest by substring match
/// on the dataset's name and kind.
pub fn presets_for_dataset(dataset: &Dataset) -> Vec<Preset> {
    let catalog = default_catalog();
    let mut presets = catalog.core;

    let kind = dataset.kind.to_lowercase();
    let name = dataset.name.to_lowercase();

    if kind.contains("otel")
        || name.contains("otel")
        || name.contains("trace")
        || name.contains("metric")
        || name.contains("log")
    {
        presets.extend(catalog.otel);
    }
    if name.contains("stripe") {
        presets.extend(catalog.stripe);
    }
    if name.contains("segment") {
        presets.extend(catalog.segment);
    }

    presets
}

/// Substitutes placeholders into the preset body.
pub fn render(preset: &Preset, dataset: &str, default_range: &str) -> String {
    let range = preset
        .default_range
        .map(str::to_string)
        .unwrap_or_else(|| format!("ago({default_range}) .. now()"));
    preset
        .template
        .replace("${DATASET}", dataset)
        .replace("${RANGE}", &range)
}

/// Pretty JSON describing a preset, served under `_presets/<name>.json`.
pub fn metadata_json(preset: &Preset) -> Vec<u8> {
    let payload = json!({
        "name": preset.name,
        "description": preset.description,
        "format": preset.format.as_str(),
        "template": preset.template,
    });
    let mut data = serde_json::to_vec_pretty(&payload).unwrap_or_else(|_| b"{}".to_vec());
    data.push(b'\n');
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(name: &str, kind: &str) -> Dataset {
        Dataset {
            name: name.to_string(),
            kind: kind.to_string(),
            ..Dataset::default()
        }
    }

    #[test]
    fn render_substitutes_placeholders() {
        let preset = &default_catalog().core[0];
        let apl = render(preset, "logs", "1h");
        assert!(apl.starts_with("['logs']"));
        assert!(apl.contains("ago(1h) .. now()"));
        assert!(!apl.contains("${"));
    }

    #[test]
    fn core_pack_applies_everywhere() {
        let presets = presets_for_dataset(&dataset("billing", ""));
        assert!(presets.iter().any(|p| p.name == "errors"));
        assert!(!presets.iter().any(|p| p.name == "payments"));
    }

    #[test]
    fn packs_attach_by_substring() {
        let presets = presets_for_dataset(&dataset("stripe-events", ""));
        assert!(presets.iter().any(|p| p.name == "payments"));

        let presets = presets_for_dataset(&dataset("prod-traces", "otel"));
        assert!(presets.iter().any(|p| p.name == "dependencies"));

        let presets = presets_for_dataset(&dataset("segment-ingest", ""));
        assert!(presets.iter().any(|p| p.name == "sources"));
    }

    #[test]
    fn metadata_json_is_valid() {
        let preset = &default_catalog().core[0];
        let data = metadata_json(preset);
        assert!(data.ends_with(b"\n"));
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["name"], "errors");
        assert_eq!(value["format"], "csv");
    }
}
