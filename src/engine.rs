//! Conversion pipeline for procshift.
//!
//! This module drives one unit through classify → rewrite → emit → score
//! and returns a self-contained [`ConversionArtifact`]. Batches convert
//! each unit independently on the rayon pool.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::NaiveDate;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classifier::{self, ConversionPattern};
use crate::emitter::{self, ModelConfig};
use crate::error::{ConvertError, ConvertResult};
use crate::platform::{Platform, ProfileRegistry};
use crate::rewriter::{RewriteContext, RewriteEntry, RuleSet, ValidationGuard};
use crate::scorer::{DEFAULT_MANUAL_PENALTY, ScoreBreakdown, Scorer};
use crate::source::SourceUnit;

static REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*ref\('([^']+)'\)\s*\}\}").expect("ref regex"));
static SOURCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*source\('([^']+)',\s*'([^']+)'\)\s*\}\}").expect("source regex")
});

/// Values supplied for declared procedure parameters, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertOptions {
    vars: BTreeMap<String, String>,
}

impl ConvertOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply a value for parameter `name` (without `@`).
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars
            .insert(name.into().trim_start_matches('@').to_string(), value.into());
        self
    }

    /// Supply `start_date` and `end_date`. Both must be ISO dates and the
    /// range must not run backwards.
    pub fn with_date_range(self, start: &str, end: &str) -> ConvertResult<Self> {
        let parse = |name: &str, value: &str| {
            NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| {
                ConvertError::invalid_option(name, format!("'{value}' is not an ISO date: {e}"))
            })
        };
        let from = parse("start_date", start)?;
        let to = parse("end_date", end)?;
        if to < from {
            return Err(ConvertError::invalid_option(
                "date_range",
                format!("end {to} is before start {from}"),
            ));
        }
        Ok(self
            .with_var("start_date", from.to_string())
            .with_var("end_date", to.to_string()))
    }

    pub fn with_region(self, region: impl Into<String>) -> Self {
        self.with_var("region", region)
    }

    pub fn with_threshold(self, threshold: i64) -> Self {
        self.with_var("threshold", threshold.to_string())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Values for every parameter of `unit`: supplied, else declared default.
    ///
    /// Fails on the first required parameter with no supplied value.
    pub fn resolve(&self, unit: &SourceUnit) -> ConvertResult<BTreeMap<String, String>> {
        let mut resolved = BTreeMap::new();
        for param in &unit.params {
            match (self.get(&param.name), param.is_required()) {
                (Some(value), _) => {
                    resolved.insert(param.name.clone(), value.to_string());
                }
                (None, true) => return Err(ConvertError::unresolved(&unit.name, &param.name)),
                (None, false) => {
                    if let Some(default) = param.default_value() {
                        resolved.insert(param.name.clone(), default);
                    }
                }
            }
        }
        for name in self.vars.keys() {
            if unit.param(name).is_none() {
                warn!(unit = %unit.name, option = %name, "option does not match a declared parameter");
            }
        }
        Ok(resolved)
    }
}

/// A source table referenced through `source(...)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SourceTable {
    pub schema: String,
    pub name: String,
}

/// The result of converting one unit.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionArtifact {
    /// Model name, taken from the unit name.
    pub name: String,
    pub procedure_name: Option<String>,
    /// Complete model text.
    pub text: String,
    pub pattern: ConversionPattern,
    pub platform: Platform,
    /// Automation score, 0 to 100.
    pub score: u8,
    pub breakdown: ScoreBreakdown,
    pub config: ModelConfig,
    pub rules: Vec<RewriteEntry>,
    /// Resolved variable values for the project's `vars:`.
    pub vars: BTreeMap<String, String>,
    pub refs: Vec<String>,
    pub sources: Vec<SourceTable>,
    pub validations: Vec<ValidationGuard>,
    pub target_table: Option<String>,
    pub ctes: Vec<String>,
}

/// Converts source units against a profile registry.
///
/// A converter holds no per-conversion state, so one instance can serve
/// any number of threads.
pub struct Converter<'r> {
    registry: &'r ProfileRegistry,
    rules: RuleSet,
    scorer: Scorer,
}

impl<'r> Converter<'r> {
    pub fn new(registry: &'r ProfileRegistry) -> Self {
        Self {
            registry,
            rules: RuleSet::standard(),
            scorer: Scorer::new(DEFAULT_MANUAL_PENALTY),
        }
    }

    /// Points subtracted from the score for each manual-review marker.
    pub fn with_manual_penalty(mut self, penalty: u32) -> Self {
        self.scorer = Scorer::new(penalty);
        self
    }

    pub fn convert(
        &self,
        unit: &SourceUnit,
        platform: &str,
        options: &ConvertOptions,
    ) -> ConvertResult<ConversionArtifact> {
        let profile = self.registry.get(platform)?;
        let vars = options.resolve(unit)?;

        let pattern = classifier::classify(&unit.body);
        debug!(unit = %unit.name, %pattern, "classified");

        let ctx = RewriteContext {
            unit,
            pattern,
            profile,
        };
        let rewritten = self.rules.rewrite(&unit.body, &ctx);

        let config = ModelConfig::infer(&unit.name, &rewritten.body, pattern, profile, &rewritten.facts);
        let source_name = unit.procedure_name.as_deref().unwrap_or(&unit.name);
        let text = emitter::emit(&unit.name, source_name, &rewritten.body, pattern, profile, &config);
        let breakdown = self.scorer.score(&rewritten.log, &text);

        info!(
            unit = %unit.name,
            platform = profile.key(),
            %pattern,
            score = breakdown.score,
            "converted"
        );

        let refs: BTreeSet<String> = REF.captures_iter(&text).map(|c| c[1].to_string()).collect();
        let sources: BTreeSet<SourceTable> = SOURCE
            .captures_iter(&text)
            .map(|c| SourceTable {
                schema: c[1].to_string(),
                name: c[2].to_string(),
            })
            .collect();

        Ok(ConversionArtifact {
            name: unit.name.clone(),
            procedure_name: unit.procedure_name.clone(),
            text,
            pattern,
            platform: profile.platform,
            score: breakdown.score,
            breakdown,
            config,
            rules: rewritten.log.entries().to_vec(),
            vars,
            refs: refs.into_iter().collect(),
            sources: sources.into_iter().collect(),
            validations: rewritten.facts.validations,
            target_table: rewritten.facts.target_table,
            ctes: rewritten.facts.ctes,
        })
    }

    /// Parse procedure text, then convert it.
    pub fn convert_text(
        &self,
        text: &str,
        unit_name: &str,
        platform: &str,
        options: &ConvertOptions,
    ) -> ConvertResult<ConversionArtifact> {
        let unit = SourceUnit::parse(text, unit_name)?;
        self.convert(&unit, platform, options)
    }

    /// Convert every unit in parallel; one unit's failure leaves the others alone.
    pub fn convert_batch(
        &self,
        units: &[SourceUnit],
        platform: &str,
        options: &ConvertOptions,
    ) -> Vec<ConvertResult<ConversionArtifact>> {
        units
            .par_iter()
            .map(|unit| self.convert(unit, platform, options))
            .collect()
    }
}

/// Convert procedure text with the built-in platform profiles.
pub fn convert(
    text: &str,
    unit_name: &str,
    platform: &str,
    options: &ConvertOptions,
) -> ConvertResult<ConversionArtifact> {
    Converter::new(ProfileRegistry::shared()).convert_text(text, unit_name, platform, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Parameter;

    fn unit() -> SourceUnit {
        SourceUnit::new(
            "orders_daily",
            vec![
                Parameter::required("start_date", "DATE"),
                Parameter::optional("region", "VARCHAR(50)", "NULL"),
                Parameter::optional("threshold", "INT", "100"),
            ],
            "SELECT order_id, order_date FROM orders WHERE order_date >= @start_date",
        )
    }

    #[test]
    fn test_resolve_uses_defaults() {
        let vars = ConvertOptions::new()
            .with_var("@start_date", "2024-01-01")
            .resolve(&unit())
            .unwrap();
        assert_eq!(vars.get("start_date").map(String::as_str), Some("2024-01-01"));
        assert_eq!(vars.get("threshold").map(String::as_str), Some("100"));
        assert!(!vars.contains_key("region"));
    }

    #[test]
    fn test_missing_required_param() {
        let err = ConvertOptions::new().with_region("EU").resolve(&unit()).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::UnresolvedRequiredParameter { ref parameter, .. } if parameter == "start_date"
        ));
    }

    #[test]
    fn test_date_range_validation() {
        let options = ConvertOptions::new().with_date_range("2024-01-01", "2024-01-31").unwrap();
        assert_eq!(options.get("end_date"), Some("2024-01-31"));
        assert!(ConvertOptions::new().with_date_range("2024-13-01", "2024-01-31").is_err());
        assert!(ConvertOptions::new().with_date_range("2024-02-01", "2024-01-31").is_err());
    }

    #[test]
    fn test_unknown_platform_fails_before_resolution() {
        let registry = ProfileRegistry::builtin();
        let err = Converter::new(&registry)
            .convert(&unit(), "bigquery", &ConvertOptions::new())
            .unwrap_err();
        assert!(matches!(err, ConvertError::UnknownPlatform(_)));
    }

    #[test]
    fn test_artifact_collects_references() {
        let registry = ProfileRegistry::builtin();
        let options = ConvertOptions::new().with_var("start_date", "2024-01-01");
        let artifact = Converter::new(&registry)
            .convert(&unit(), "glue", &options)
            .unwrap();
        assert_eq!(artifact.refs, vec!["orders".to_string()]);
        assert!(artifact.sources.is_empty());
        assert_eq!(artifact.pattern, ConversionPattern::FullLoad);
        assert_eq!(artifact.score, 100);
        assert!(artifact.text.contains("order_date >= {{ var('start_date') }}"));
    }
}
