//! Anomaly Detection
//!
//! Inspects one fully-assembled run and classifies it against the
//! configured thresholds. Every rule is evaluated independently, so several
//! kinds can fire for the same run; severity is the number of distinct
//! kinds that fired. An empty result means the run is healthy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::CollectorError;
use crate::metrics::PerformanceState;

/// One structured record returned by the collector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectedItem {
    pub fields: BTreeMap<String, Value>,
}

impl CollectedItem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// A field counts as present when it is non-null and not blank
    pub fn has(&self, name: &str) -> bool {
        match self.fields.get(name) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(_) => true,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Stable dedup key: the id in the listing URL, the URL itself, or a
    /// hash of region, description and price when there is no URL
    pub fn listing_id(&self) -> String {
        if let Some(url) = self.text("url").map(str::trim).filter(|u| !u.is_empty()) {
            return match url.rsplit_once('=') {
                Some((_, id)) if !id.is_empty() => id.to_string(),
                _ => url.to_string(),
            };
        }

        let field = |name: &str| match self.fields.get(name) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let mut hasher = Sha256::new();
        hasher.update(format!("{}_{}_{}", field("region"), field("description"), field("price")));
        let mut id = hex::encode(hasher.finalize());
        id.truncate(16);
        id
    }

    /// Numeric value of a field, accepting formatted strings like "250 000 DT"
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.fields.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => {
                let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
                if digits.is_empty() {
                    None
                } else {
                    digits.parse().ok()
                }
            }
            _ => None,
        }
    }
}

/// Output of executing one task via the collector
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub pages_attempted: u32,
    pub pages_succeeded: u32,
    pub items: Vec<CollectedItem>,
    /// Per-page errors that did not abort the run
    pub errors: Vec<CollectorError>,
    pub duration: Duration,
}

impl RunResult {
    pub fn items_per_page(&self) -> f64 {
        if self.pages_attempted == 0 {
            0.0
        } else {
            self.items.len() as f64 / self.pages_attempted as f64
        }
    }

    pub fn transient_errors(&self) -> usize {
        self.errors.iter().filter(|e| e.is_retryable()).count()
    }
}

/// Classification outcome kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnomalyKind {
    TooFewItems,
    LowQuality,
    OutlierValue,
    MissingFields,
    NoAnomaly,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooFewItems => "too_few_items",
            Self::LowQuality => "low_quality",
            Self::OutlierValue => "outlier_value",
            Self::MissingFields => "missing_fields",
            Self::NoAnomaly => "no_anomaly",
        }
    }

    /// Kinds that point at a change in the source's structure
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::TooFewItems | Self::MissingFields)
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected deviation from expected run health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    /// Number of distinct kinds fired in the same run
    pub severity: u32,
    /// Metric value that triggered the rule
    pub value: f64,
    pub detail: String,
}

/// Inclusive sane band for a numeric field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericBand {
    pub field: String,
    pub min: f64,
    pub max: f64,
}

impl NumericBand {
    pub fn new(field: &str, min: f64, max: f64) -> Self {
        Self {
            field: field.to_string(),
            min,
            max,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Thresholds used by the detector; cloned per cycle so healing
/// adjustments never outlive the cycle that made them
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorThresholds {
    pub min_items_per_page: f64,
    pub quality_threshold: f64,
    pub required_fields: Vec<String>,
    pub numeric_bands: Vec<NumericBand>,
    pub min_description_len: usize,
    /// Weights for the reporting completeness percentage
    pub field_weights: Vec<(String, u32)>,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            min_items_per_page: 10.0,
            quality_threshold: 0.80,
            required_fields: ["region", "nature", "type", "description", "price"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            numeric_bands: vec![NumericBand::new("price", 1_000.0, 100_000_000.0)],
            min_description_len: 10,
            field_weights: vec![
                ("region".to_string(), 15),
                ("nature".to_string(), 10),
                ("type".to_string(), 10),
                ("description".to_string(), 30),
                ("price".to_string(), 20),
                ("date_modified".to_string(), 10),
                ("url".to_string(), 5),
            ],
        }
    }
}

/// Per-item validation flags
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemCheck {
    pub missing: Vec<String>,
    pub outliers: Vec<String>,
    pub short_description: bool,
    /// Weighted completeness, 0-100
    pub completeness_pct: f64,
}

impl ItemCheck {
    pub fn passes(&self) -> bool {
        self.missing.is_empty() && self.outliers.is_empty() && !self.short_description
    }
}

/// Item-level inspection of a whole run
#[derive(Debug, Clone, Default)]
pub struct RunAssessment {
    pub checks: Vec<ItemCheck>,
    /// Fraction of items passing the completeness check
    pub quality: f64,
    pub items_per_page: f64,
}

impl RunAssessment {
    pub fn items_missing_fields(&self) -> usize {
        self.checks.iter().filter(|c| !c.missing.is_empty()).count()
    }

    pub fn items_with_outliers(&self) -> usize {
        self.checks.iter().filter(|c| !c.outliers.is_empty()).count()
    }

    pub fn mean_completeness(&self) -> f64 {
        if self.checks.is_empty() {
            return 0.0;
        }
        self.checks.iter().map(|c| c.completeness_pct).sum::<f64>() / self.checks.len() as f64
    }

    /// Required fields absent on at least one item, most frequent first
    pub fn missing_field_counts(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for check in &self.checks {
            for field in &check.missing {
                *counts.entry(field.as_str()).or_default() += 1;
            }
        }
        let mut counts: Vec<(String, usize)> =
            counts.into_iter().map(|(f, n)| (f.to_string(), n)).collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts
    }
}

/// Classifies completed runs
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    thresholds: DetectorThresholds,
}

impl AnomalyDetector {
    pub fn new(thresholds: DetectorThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &DetectorThresholds {
        &self.thresholds
    }

    pub fn thresholds_mut(&mut self) -> &mut DetectorThresholds {
        &mut self.thresholds
    }

    /// Validate a single item
    pub fn check_item(&self, item: &CollectedItem) -> ItemCheck {
        let t = &self.thresholds;

        let missing = t
            .required_fields
            .iter()
            .filter(|f| !item.has(f))
            .cloned()
            .collect();

        let outliers = t
            .numeric_bands
            .iter()
            .filter(|band| {
                item.number(&band.field)
                    .map(|v| !band.contains(v))
                    .unwrap_or(false)
            })
            .map(|band| band.field.clone())
            .collect();

        let short_description = item
            .text("description")
            .map(|d| d.trim().chars().count() < t.min_description_len)
            .unwrap_or(false);

        let (score, max_score) = t
            .field_weights
            .iter()
            .fold((0u32, 0u32), |(score, max), (field, weight)| {
                let gained = if item.has(field) { *weight } else { 0 };
                (score + gained, max + weight)
            });

        let completeness_pct = if max_score > 0 {
            score as f64 / max_score as f64 * 100.0
        } else {
            0.0
        };

        ItemCheck {
            missing,
            outliers,
            short_description,
            completeness_pct,
        }
    }

    /// Item-level flags and the run-level quality score
    pub fn assess(&self, result: &RunResult) -> RunAssessment {
        let checks: Vec<ItemCheck> = result.items.iter().map(|i| self.check_item(i)).collect();

        let quality = if checks.is_empty() {
            0.0
        } else {
            checks.iter().filter(|c| c.passes()).count() as f64 / checks.len() as f64
        };

        RunAssessment {
            checks,
            quality,
            items_per_page: result.items_per_page(),
        }
    }

    /// Classify a run; an empty vector means healthy
    pub fn classify(&self, result: &RunResult, state: &PerformanceState) -> Vec<Anomaly> {
        let assessment = self.assess(result);
        self.classify_assessed(result, &assessment, state)
    }

    /// Classify a run from an assessment already computed by [`assess`](Self::assess)
    pub fn classify_assessed(
        &self,
        result: &RunResult,
        assessment: &RunAssessment,
        state: &PerformanceState,
    ) -> Vec<Anomaly> {
        let t = &self.thresholds;
        let mut anomalies = Vec::new();

        if result.pages_attempted >= 1 && assessment.items_per_page < t.min_items_per_page {
            anomalies.push(Anomaly {
                kind: AnomalyKind::TooFewItems,
                severity: 0,
                value: assessment.items_per_page,
                detail: format!(
                    "Only {:.1} items per page over {} pages (expected >= {})",
                    assessment.items_per_page, result.pages_attempted, t.min_items_per_page
                ),
            });
        }

        if !assessment.checks.is_empty() && assessment.quality < t.quality_threshold {
            anomalies.push(Anomaly {
                kind: AnomalyKind::LowQuality,
                severity: 0,
                value: assessment.quality,
                detail: format!(
                    "Run quality {:.1}% below {:.1}% (rolling {:.1}%)",
                    assessment.quality * 100.0,
                    t.quality_threshold * 100.0,
                    state.quality_score * 100.0
                ),
            });
        }

        let outliers = assessment.items_with_outliers();
        if outliers > 0 {
            anomalies.push(Anomaly {
                kind: AnomalyKind::OutlierValue,
                severity: 0,
                value: outliers as f64,
                detail: format!("{} items with values outside the sane band", outliers),
            });
        }

        let missing = assessment.items_missing_fields();
        if missing > 0 {
            let fields: Vec<String> = assessment
                .missing_field_counts()
                .into_iter()
                .map(|(f, n)| format!("{}x{}", f, n))
                .collect();
            anomalies.push(Anomaly {
                kind: AnomalyKind::MissingFields,
                severity: 0,
                value: missing as f64,
                detail: format!(
                    "{} items missing required fields ({})",
                    missing,
                    fields.join(", ")
                ),
            });
        }

        let severity = anomalies.len() as u32;
        for anomaly in &mut anomalies {
            anomaly.severity = severity;
            warn!("Anomaly {}: {}", anomaly.kind, anomaly.detail);
        }

        if anomalies.is_empty() {
            debug!(
                "Run healthy: {} items, {:.1}/page, quality {:.1}%",
                result.items.len(),
                assessment.items_per_page,
                assessment.quality * 100.0
            );
        }

        anomalies
    }

    /// Anomalies standing in for a permanent collection error
    pub fn permanent_failure(error: &CollectorError) -> Vec<Anomaly> {
        let detail = format!("Collector failed permanently: {}", error.message());
        vec![
            Anomaly {
                kind: AnomalyKind::MissingFields,
                severity: 2,
                value: 0.0,
                detail: detail.clone(),
            },
            Anomaly {
                kind: AnomalyKind::LowQuality,
                severity: 2,
                value: 0.0,
                detail,
            },
        ]
    }
}

/// Most prominent kind in a set, NoAnomaly when empty
pub fn primary_kind(anomalies: &[Anomaly]) -> AnomalyKind {
    anomalies
        .iter()
        .map(|a| a.kind)
        .min()
        .unwrap_or(AnomalyKind::NoAnomaly)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn good_item(i: usize) -> CollectedItem {
        CollectedItem::new()
            .with("region", "Tunis")
            .with("nature", "Vente")
            .with("type", "Appartement")
            .with("description", format!("Appartement S+2 lumineux numero {}", i))
            .with("price", 250_000)
            .with("date_modified", "2026-10-01")
            .with("url", format!("http://example.com/annonce?id={}", i))
    }

    pub(crate) fn run_with(pages: u32, items: Vec<CollectedItem>) -> RunResult {
        RunResult {
            pages_attempted: pages,
            pages_succeeded: pages,
            items,
            errors: Vec::new(),
            duration: Duration::from_secs(3),
        }
    }

    fn kinds(anomalies: &[Anomaly]) -> Vec<AnomalyKind> {
        anomalies.iter().map(|a| a.kind).collect()
    }

    #[test]
    fn test_healthy_run_has_no_anomalies() {
        let detector = AnomalyDetector::default();
        let items = (0..35).map(good_item).collect();
        let result = run_with(3, items);

        let anomalies = detector.classify(&result, &PerformanceState::default());
        assert!(anomalies.is_empty());
        assert_eq!(primary_kind(&anomalies), AnomalyKind::NoAnomaly);
    }

    #[test]
    fn test_too_few_items() {
        let detector = AnomalyDetector::default();
        let items = (0..15).map(good_item).collect();
        let result = run_with(2, items);

        let anomalies = detector.classify(&result, &PerformanceState::default());
        assert_eq!(kinds(&anomalies), vec![AnomalyKind::TooFewItems]);
        assert_eq!(anomalies[0].value, 7.5);
        assert_eq!(anomalies[0].severity, 1);
    }

    #[test]
    fn test_too_few_items_skipped_without_pages() {
        let detector = AnomalyDetector::default();
        let result = run_with(0, Vec::new());
        assert!(detector
            .classify(&result, &PerformanceState::default())
            .is_empty());
    }

    #[test]
    fn test_multiple_kinds_fire_together() {
        let detector = AnomalyDetector::default();
        let mut items: Vec<CollectedItem> = (0..5).map(good_item).collect();
        items.push(good_item(5).with("price", 12));
        let mut bare = good_item(6);
        bare.fields.remove("region");
        items.push(bare);

        let result = run_with(1, items);
        let anomalies = detector.classify(&result, &PerformanceState::default());

        assert_eq!(
            kinds(&anomalies),
            vec![
                AnomalyKind::TooFewItems,
                AnomalyKind::LowQuality,
                AnomalyKind::OutlierValue,
                AnomalyKind::MissingFields
            ]
        );
        assert!(anomalies.iter().all(|a| a.severity == 4));
        assert_eq!(primary_kind(&anomalies), AnomalyKind::TooFewItems);
    }

    #[test]
    fn test_outlier_flags_item_not_run() {
        let detector = AnomalyDetector::default();
        let mut items: Vec<CollectedItem> = (0..20).map(good_item).collect();
        items[3] = good_item(3).with("price", "999 999 999 999");

        let result = run_with(2, items);
        let assessment = detector.assess(&result);
        assert_eq!(assessment.items_with_outliers(), 1);
        assert!(!assessment.checks[3].passes());
        assert!(assessment.checks[4].passes());

        let anomalies = detector.classify(&result, &PerformanceState::default());
        assert_eq!(kinds(&anomalies), vec![AnomalyKind::OutlierValue]);
    }

    #[test]
    fn test_completeness_weighting() {
        let detector = AnomalyDetector::default();
        let full = detector.check_item(&good_item(0));
        assert_eq!(full.completeness_pct, 100.0);

        let mut partial = good_item(1);
        partial.fields.remove("description");
        let check = detector.check_item(&partial);
        assert_eq!(check.completeness_pct, 70.0);
        assert_eq!(check.missing, vec!["description".to_string()]);
    }

    #[test]
    fn test_short_description_fails_completeness() {
        let detector = AnomalyDetector::default();
        let item = good_item(0).with("description", "S+1");
        let check = detector.check_item(&item);
        assert!(check.short_description);
        assert!(!check.passes());
    }

    #[test]
    fn test_blank_field_counts_as_missing() {
        let item = good_item(0).with("region", "   ");
        assert!(!item.has("region"));
        assert!(!item.has("unknown"));
        assert!(item.has("price"));
    }

    #[test]
    fn test_number_parsing() {
        let item = CollectedItem::new()
            .with("a", 1500)
            .with("b", "250 000 DT")
            .with("c", "prix a debattre");
        assert_eq!(item.number("a"), Some(1500.0));
        assert_eq!(item.number("b"), Some(250_000.0));
        assert_eq!(item.number("c"), None);
    }

    #[test]
    fn test_permanent_failure_maps_to_structural_kinds() {
        let err = CollectorError::Permanent("schema changed".into());
        let anomalies = AnomalyDetector::permanent_failure(&err);
        assert_eq!(
            kinds(&anomalies),
            vec![AnomalyKind::MissingFields, AnomalyKind::LowQuality]
        );
    }

    #[test]
    fn test_listing_id_prefers_url_id() {
        assert_eq!(good_item(7).listing_id(), "7");

        let item = CollectedItem::new().with("url", "http://example.com/villa/42");
        assert_eq!(item.listing_id(), "http://example.com/villa/42");
    }

    #[test]
    fn test_listing_id_hash_fallback_is_stable() {
        let item = CollectedItem::new()
            .with("region", "Sfax")
            .with("description", "Terrain constructible 500 m2")
            .with("price", 90_000);
        let same = item.clone().with("date_modified", "2026-10-02");
        let other = item.clone().with("price", 95_000);

        assert_eq!(item.listing_id().len(), 16);
        assert_eq!(item.listing_id(), same.listing_id());
        assert_ne!(item.listing_id(), other.listing_id());
    }

    #[test]
    fn test_classify_assessed_matches_classify() {
        let detector = AnomalyDetector::default();
        let mut items: Vec<CollectedItem> = (0..8).map(good_item).collect();
        items.push(good_item(8).with("price", 5));
        let result = run_with(1, items);
        let state = PerformanceState::default();

        let assessment = detector.assess(&result);
        assert_eq!(
            detector.classify_assessed(&result, &assessment, &state),
            detector.classify(&result, &state)
        );
    }
}
