//! Indicator pipeline: pre-computes every enabled indicator over a candle
//! series and answers point lookups and readiness queries.

pub mod catalog;
pub mod custom;

use crate::domain::agent::AgentMode;
use crate::domain::errors::IndicatorError;
use crate::domain::events::IndicatorMap;
use crate::domain::market::Candle;
use custom::CustomRuleEngine;
use std::collections::BTreeMap;
use tracing::debug;

/// Fraction of indicators that must be non-null before the first LLM call.
pub const INITIAL_READINESS_THRESHOLD: f64 = 0.8;
/// Runtime guard threshold applied before each individual LLM call.
pub const RUNTIME_READINESS_THRESHOLD: f64 = 0.7;

#[derive(Debug)]
pub struct IndicatorPipeline {
    mode: AgentMode,
    /// Canonical enabled names, aliases expanded, order preserved.
    enabled: Vec<String>,
    custom_names: Vec<String>,
    series: BTreeMap<String, Vec<f64>>,
    len: usize,
}

impl IndicatorPipeline {
    /// Builds the pipeline, computing every enabled series up front.
    ///
    /// Monk mode admits only RSI and MACD; any other enabled name is a
    /// construction error, as is an unknown name in either mode.
    pub fn new(
        candles: &[Candle],
        enabled_indicators: &[String],
        mode: AgentMode,
        custom_rules: &[serde_json::Value],
    ) -> Result<Self, IndicatorError> {
        let enabled = catalog::expand_aliases(enabled_indicators);

        let unknown: Vec<String> = enabled
            .iter()
            .filter(|name| !catalog::is_known(name))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(IndicatorError::UnknownIndicators(unknown));
        }

        if mode == AgentMode::Monk {
            let restricted: Vec<String> = enabled
                .iter()
                .filter(|name| !catalog::MONK_MODE_INDICATORS.contains(&name.as_str()))
                .cloned()
                .collect();
            if !restricted.is_empty() {
                return Err(IndicatorError::ModeRestricted {
                    mode: mode.to_string(),
                    allowed: catalog::MONK_MODE_INDICATORS
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                    restricted,
                });
            }
        }

        let len = candles.len();
        let mut series: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for name in &enabled {
            series.insert(name.clone(), catalog::compute_series(name, candles));
        }

        let mut custom_names = Vec::new();
        if !custom_rules.is_empty() && len > 0 {
            // Custom rules may reference raw OHLCV alongside computed series.
            let mut available = series.clone();
            available.insert("open".to_string(), candles.iter().map(|c| c.open).collect());
            available.insert("high".to_string(), candles.iter().map(|c| c.high).collect());
            available.insert("low".to_string(), candles.iter().map(|c| c.low).collect());
            available.insert("close".to_string(), candles.iter().map(|c| c.close).collect());
            available.insert(
                "volume".to_string(),
                candles.iter().map(|c| c.volume).collect(),
            );

            let engine = CustomRuleEngine::new(custom_rules, &available, len)?;
            for (name, values) in engine.evaluate_all(&available)? {
                custom_names.push(name.clone());
                series.insert(name, values);
            }
        }

        debug!(
            enabled = enabled.len(),
            custom = custom_names.len(),
            candles = len,
            "indicator pipeline built"
        );

        Ok(Self {
            mode,
            enabled,
            custom_names,
            series,
            len,
        })
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn enabled_indicators(&self) -> &[String] {
        &self.enabled
    }

    pub fn custom_indicator_names(&self) -> &[String] {
        &self.custom_names
    }

    /// All reported names: enabled standard indicators then custom ones.
    fn reported_names(&self) -> impl Iterator<Item = &String> {
        self.enabled.iter().chain(self.custom_names.iter())
    }

    /// Indicator values for the candle at `index`. NaN and non-finite values
    /// surface as `None`, never as a substituted number.
    pub fn values_at(&self, index: usize) -> Result<IndicatorMap, IndicatorError> {
        if index >= self.len {
            return Err(IndicatorError::IndexOutOfRange {
                index,
                len: self.len,
            });
        }
        let mut map = IndicatorMap::new();
        for name in self.reported_names() {
            let value = self.series.get(name).and_then(|s| {
                let v = s[index];
                if v.is_finite() { Some(v) } else { None }
            });
            map.insert(name.clone(), value);
        }
        Ok(map)
    }

    /// Count of non-null indicators at `index`, over the total reported.
    pub fn readiness_at(&self, index: usize) -> (usize, usize) {
        let total = self.enabled.len() + self.custom_names.len();
        if index >= self.len {
            return (0, total);
        }
        let ready = self
            .reported_names()
            .filter(|name| {
                self.series
                    .get(*name)
                    .map(|s| s[index].is_finite())
                    .unwrap_or(false)
            })
            .count();
        (ready, total)
    }

    /// Whether at least `threshold` of the reported indicators are non-null.
    pub fn is_ready(&self, index: usize, threshold: f64) -> bool {
        let (ready, total) = self.readiness_at(index);
        if total == 0 {
            return true;
        }
        (ready as f64 / total as f64) >= threshold
    }

    /// First candle index at which the readiness fraction reaches
    /// `threshold`. Returns the series length when it never does.
    pub fn first_ready_index(&self, threshold: f64) -> usize {
        (0..self.len)
            .find(|&i| self.is_ready(i, threshold))
            .unwrap_or(self.len)
    }

    /// Largest lookback among the enabled indicators; sizes forward warm-up.
    pub fn max_enabled_lookback(enabled_indicators: &[String]) -> usize {
        catalog::max_lookback(&catalog::expand_aliases(enabled_indicators))
    }
}
