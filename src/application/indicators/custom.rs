//! JSON-rule custom indicator engine.
//!
//! Users define indicators without uploading code: a rule is a JSON tree
//! whose leaves are `{"indicator": name}` or `{"value": number}` and whose
//! inner nodes are `{"operator": "+|-|*|/", "left": ..., "right": ...}`.
//! Rules may reference base OHLCV series, computed standard indicators, and
//! each other; reference cycles are rejected before evaluation.

use crate::domain::errors::IndicatorError;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

const ALLOWED_OPERATORS: &[&str] = &["+", "-", "*", "/"];
const VALID_TYPES: &[&str] = &["composite", "derived"];

#[derive(Debug)]
struct CustomRule {
    name: String,
    formula: Value,
}

/// Validates and evaluates custom indicator rules against the series already
/// computed by the pipeline.
#[derive(Debug)]
pub struct CustomRuleEngine {
    rules: Vec<CustomRule>,
    len: usize,
}

impl CustomRuleEngine {
    /// Parses and validates the rule list. `available` holds every name a
    /// rule may reference besides other rules.
    pub fn new(
        rule_defs: &[Value],
        available: &BTreeMap<String, Vec<f64>>,
        len: usize,
    ) -> Result<Self, IndicatorError> {
        let mut rules: Vec<CustomRule> = Vec::new();

        for def in rule_defs {
            let rule = parse_rule(def)?;
            if rules.iter().any(|r| r.name == rule.name) {
                return Err(IndicatorError::invalid_rule(
                    "DUPLICATE_INDICATOR_NAME",
                    format!("Custom indicator '{}' already exists", rule.name),
                    rule.name.clone(),
                ));
            }
            if available.contains_key(&rule.name) {
                return Err(IndicatorError::invalid_rule(
                    "INDICATOR_NAME_CONFLICT",
                    format!("Name '{}' conflicts with existing indicator", rule.name),
                    rule.name.clone(),
                ));
            }
            rules.push(rule);
        }

        let engine = Self { rules, len };
        for rule in &engine.rules {
            engine.check_cycles(&rule.name, &mut HashSet::new(), &mut Vec::new())?;
        }
        Ok(engine)
    }

    pub fn names(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.name.clone()).collect()
    }

    /// Evaluates every rule in definition order. Returned series are aligned
    /// to the candle index; earlier rules are visible to later ones.
    pub fn evaluate_all(
        &self,
        available: &BTreeMap<String, Vec<f64>>,
    ) -> Result<Vec<(String, Vec<f64>)>, IndicatorError> {
        let mut computed: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut out = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let series = self.evaluate(&rule.name, available, &mut computed)?;
            out.push((rule.name.clone(), series));
        }
        Ok(out)
    }

    fn rule(&self, name: &str) -> Option<&CustomRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    fn evaluate(
        &self,
        name: &str,
        available: &BTreeMap<String, Vec<f64>>,
        computed: &mut BTreeMap<String, Vec<f64>>,
    ) -> Result<Vec<f64>, IndicatorError> {
        if let Some(series) = computed.get(name) {
            return Ok(series.clone());
        }
        let rule = self.rule(name).ok_or_else(|| {
            IndicatorError::invalid_rule(
                "INDICATOR_NOT_FOUND",
                format!("Custom indicator '{}' not found", name),
                name.to_string(),
            )
        })?;
        let series = self.eval_formula(&rule.formula, &rule.name, available, computed)?;
        computed.insert(name.to_string(), series.clone());
        Ok(series)
    }

    fn eval_formula(
        &self,
        formula: &Value,
        rule_name: &str,
        available: &BTreeMap<String, Vec<f64>>,
        computed: &mut BTreeMap<String, Vec<f64>>,
    ) -> Result<Vec<f64>, IndicatorError> {
        if let Some(reference) = formula.get("indicator") {
            let target = reference.as_str().unwrap_or_default();
            if let Some(series) = available.get(target) {
                return Ok(series.clone());
            }
            if self.rule(target).is_some() {
                return self.evaluate(target, available, computed);
            }
            return Err(IndicatorError::invalid_rule(
                "INDICATOR_NOT_FOUND",
                format!("Referenced indicator '{}' does not exist", target),
                rule_name.to_string(),
            ));
        }

        if let Some(constant) = formula.get("value") {
            let v = constant.as_f64().unwrap_or(f64::NAN);
            return Ok(vec![v; self.len]);
        }

        let operator = formula
            .get("operator")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let left = self.eval_formula(&formula["left"], rule_name, available, computed)?;
        let right = self.eval_formula(&formula["right"], rule_name, available, computed)?;

        let combined = left
            .iter()
            .zip(right.iter())
            .map(|(&l, &r)| match operator {
                "+" => l + r,
                "-" => l - r,
                "*" => l * r,
                // Division by zero is a null indicator value, not a crash.
                "/" => {
                    if r == 0.0 {
                        f64::NAN
                    } else {
                        l / r
                    }
                }
                _ => f64::NAN,
            })
            .collect();
        Ok(combined)
    }

    /// Depth-first cycle check with an on-stack set.
    fn check_cycles(
        &self,
        name: &str,
        on_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Result<(), IndicatorError> {
        if on_stack.contains(name) {
            let start = path.iter().position(|p| p == name).unwrap_or(0);
            let mut cycle: Vec<&str> = path[start..].iter().map(String::as_str).collect();
            cycle.push(name);
            return Err(IndicatorError::CircularDependency(cycle.join(" -> ")));
        }
        let Some(rule) = self.rule(name) else {
            return Ok(());
        };

        on_stack.insert(name.to_string());
        path.push(name.to_string());
        for reference in referenced_indicators(&rule.formula) {
            self.check_cycles(&reference, on_stack, path)?;
        }
        path.pop();
        on_stack.remove(name);
        Ok(())
    }
}

fn parse_rule(def: &Value) -> Result<CustomRule, IndicatorError> {
    let Some(object) = def.as_object() else {
        return Err(IndicatorError::invalid_rule(
            "INVALID_RULE_STRUCTURE",
            "Rule must be a JSON object",
            "<unnamed>",
        ));
    };

    let name = object
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if name.is_empty() {
        return Err(IndicatorError::invalid_rule(
            "INVALID_RULE_STRUCTURE",
            "Field 'name' must be a non-empty string",
            "<unnamed>",
        ));
    }

    let rule_type = object.get("type").and_then(Value::as_str).unwrap_or_default();
    if !VALID_TYPES.contains(&rule_type) {
        return Err(IndicatorError::invalid_rule(
            "INVALID_INDICATOR_TYPE",
            format!("Type must be one of {:?}, got '{}'", VALID_TYPES, rule_type),
            name,
        ));
    }

    let Some(formula) = object.get("formula") else {
        return Err(IndicatorError::invalid_rule(
            "INVALID_RULE_STRUCTURE",
            "Missing required field: formula",
            name,
        ));
    };
    validate_formula(formula, &name)?;

    Ok(CustomRule {
        name,
        formula: formula.clone(),
    })
}

fn validate_formula(formula: &Value, rule_name: &str) -> Result<(), IndicatorError> {
    let Some(object) = formula.as_object() else {
        return Err(IndicatorError::invalid_rule(
            "INVALID_FORMULA_STRUCTURE",
            "Formula must be a JSON object",
            rule_name.to_string(),
        ));
    };

    if let Some(reference) = object.get("indicator") {
        if reference.as_str().map(|s| !s.trim().is_empty()) != Some(true) {
            return Err(IndicatorError::invalid_rule(
                "INVALID_OPERAND_TYPE",
                "Indicator reference must be a non-empty string",
                rule_name.to_string(),
            ));
        }
        // Existence is checked at evaluation time so rules may reference
        // rules defined later in the list.
        return Ok(());
    }

    if let Some(constant) = object.get("value") {
        let Some(v) = constant.as_f64() else {
            return Err(IndicatorError::invalid_rule(
                "INVALID_OPERAND_TYPE",
                format!("Value must be numeric, got {}", constant),
                rule_name.to_string(),
            ));
        };
        if !v.is_finite() {
            return Err(IndicatorError::invalid_rule(
                "INVALID_OPERAND_VALUE",
                format!("Value must be finite, got {}", v),
                rule_name.to_string(),
            ));
        }
        return Ok(());
    }

    let Some(operator) = object.get("operator").and_then(Value::as_str) else {
        return Err(IndicatorError::invalid_rule(
            "INVALID_FORMULA_STRUCTURE",
            "Formula must have 'operator', 'indicator', or 'value' field",
            rule_name.to_string(),
        ));
    };
    if !ALLOWED_OPERATORS.contains(&operator) {
        return Err(IndicatorError::invalid_rule(
            "INVALID_OPERATOR",
            format!(
                "Operator '{}' is not allowed. Use one of: {}",
                operator,
                ALLOWED_OPERATORS.join(", ")
            ),
            rule_name.to_string(),
        ));
    }
    for operand in ["left", "right"] {
        let Some(child) = object.get(operand) else {
            return Err(IndicatorError::invalid_rule(
                "INVALID_FORMULA_STRUCTURE",
                format!("Operator formula must have '{}' operand", operand),
                rule_name.to_string(),
            ));
        };
        validate_formula(child, rule_name)?;
    }
    Ok(())
}

fn referenced_indicators(formula: &Value) -> Vec<String> {
    let mut references = Vec::new();
    collect_references(formula, &mut references);
    references
}

fn collect_references(formula: &Value, out: &mut Vec<String>) {
    if let Some(reference) = formula.get("indicator").and_then(Value::as_str) {
        out.push(reference.to_string());
        return;
    }
    if formula.get("value").is_some() {
        return;
    }
    if formula.get("operator").is_some() {
        collect_references(&formula["left"], out);
        collect_references(&formula["right"], out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_series() -> BTreeMap<String, Vec<f64>> {
        let mut map = BTreeMap::new();
        map.insert("close".to_string(), vec![10.0, 20.0, 30.0]);
        map.insert("rsi".to_string(), vec![f64::NAN, 50.0, 60.0]);
        map
    }

    #[test]
    fn test_simple_composite_rule() {
        let rules = vec![json!({
            "name": "half_rsi",
            "type": "composite",
            "formula": {"operator": "*", "left": {"indicator": "rsi"}, "right": {"value": 0.5}}
        })];
        let available = base_series();
        let engine = CustomRuleEngine::new(&rules, &available, 3).unwrap();
        let result = engine.evaluate_all(&available).unwrap();
        assert_eq!(result[0].0, "half_rsi");
        assert!(result[0].1[0].is_nan());
        assert_eq!(result[0].1[1], 25.0);
        assert_eq!(result[0].1[2], 30.0);
    }

    #[test]
    fn test_division_by_zero_yields_nan() {
        let rules = vec![json!({
            "name": "doomed",
            "type": "composite",
            "formula": {"operator": "/", "left": {"indicator": "close"}, "right": {"value": 0.0}}
        })];
        let available = base_series();
        let engine = CustomRuleEngine::new(&rules, &available, 3).unwrap();
        let result = engine.evaluate_all(&available).unwrap();
        assert!(result[0].1.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_invalid_operator_rejected() {
        let rules = vec![json!({
            "name": "modulo",
            "type": "composite",
            "formula": {"operator": "%", "left": {"value": 1.0}, "right": {"value": 2.0}}
        })];
        let err = CustomRuleEngine::new(&rules, &base_series(), 3).unwrap_err();
        assert!(err.to_string().contains("INVALID_OPERATOR"));
    }

    #[test]
    fn test_name_conflict_rejected() {
        let rules = vec![json!({
            "name": "rsi",
            "type": "composite",
            "formula": {"value": 1.0}
        })];
        let err = CustomRuleEngine::new(&rules, &base_series(), 3).unwrap_err();
        assert!(err.to_string().contains("INDICATOR_NAME_CONFLICT"));
    }

    #[test]
    fn test_cycle_detected() {
        let rules = vec![
            json!({
                "name": "a",
                "type": "derived",
                "formula": {"operator": "+", "left": {"indicator": "b"}, "right": {"value": 1.0}}
            }),
            json!({
                "name": "b",
                "type": "derived",
                "formula": {"operator": "+", "left": {"indicator": "a"}, "right": {"value": 1.0}}
            }),
        ];
        let err = CustomRuleEngine::new(&rules, &base_series(), 3).unwrap_err();
        assert!(matches!(err, IndicatorError::CircularDependency(_)));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let rules = vec![json!({
            "name": "ouroboros",
            "type": "derived",
            "formula": {"operator": "+", "left": {"indicator": "ouroboros"}, "right": {"value": 1.0}}
        })];
        let err = CustomRuleEngine::new(&rules, &base_series(), 3).unwrap_err();
        assert!(matches!(err, IndicatorError::CircularDependency(_)));
    }

    #[test]
    fn test_rule_may_reference_later_rule() {
        let rules = vec![
            json!({
                "name": "first",
                "type": "derived",
                "formula": {"operator": "*", "left": {"indicator": "second"}, "right": {"value": 2.0}}
            }),
            json!({
                "name": "second",
                "type": "composite",
                "formula": {"operator": "+", "left": {"indicator": "close"}, "right": {"value": 1.0}}
            }),
        ];
        let available = base_series();
        let engine = CustomRuleEngine::new(&rules, &available, 3).unwrap();
        let result = engine.evaluate_all(&available).unwrap();
        assert_eq!(result[0].1, vec![22.0, 42.0, 62.0]);
        assert_eq!(result[1].1, vec![11.0, 21.0, 31.0]);
    }

    #[test]
    fn test_non_finite_constant_rejected() {
        let rules = vec![json!({
            "name": "inf",
            "type": "composite",
            // JSON cannot express infinity directly; a string must fail the
            // numeric check.
            "formula": {"value": "oops"}
        })];
        let err = CustomRuleEngine::new(&rules, &base_series(), 3).unwrap_err();
        assert!(err.to_string().contains("INVALID_OPERAND_TYPE"));
    }
}
