use crate::domain::trading::Side;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four actions an agent can emit for a candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionAction {
    Long,
    Short,
    Close,
    Hold,
}

impl DecisionAction {
    /// The position side this action opens, if any.
    pub fn side(&self) -> Option<Side> {
        match self {
            DecisionAction::Long => Some(Side::Long),
            DecisionAction::Short => Some(Side::Short),
            _ => None,
        }
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionAction::Long => "LONG",
            DecisionAction::Short => "SHORT",
            DecisionAction::Close => "CLOSE",
            DecisionAction::Hold => "HOLD",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DecisionAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "LONG" => Ok(DecisionAction::Long),
            "SHORT" => Ok(DecisionAction::Short),
            "CLOSE" => Ok(DecisionAction::Close),
            "HOLD" => Ok(DecisionAction::Hold),
            _ => Err(anyhow!("Invalid decision action: '{}'", s)),
        }
    }
}

/// Structured trading decision produced by the LLM client (or council).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub reasoning: String,
    /// When set, the decision becomes a pending order filled only when price
    /// actually reaches this level on a later candle.
    pub entry_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    /// Fraction of equity to commit, in [0, 1].
    pub size_pct: f64,
    pub leverage: u8,
    pub candle_index: Option<usize>,
    /// Free-form context. The council uses this to carry its deliberation
    /// transcript under the `council_deliberation` key.
    pub context: Option<serde_json::Value>,
}

impl Decision {
    /// A do-nothing decision with diagnostic reasoning. The decision client
    /// contract requires this instead of an error on unrecoverable failure.
    pub fn hold(reasoning: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Hold,
            reasoning: reasoning.into(),
            entry_price: None,
            stop_loss_price: None,
            take_profit_price: None,
            size_pct: 0.0,
            leverage: 1,
            candle_index: None,
            context: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parse_is_case_insensitive() {
        assert_eq!(DecisionAction::from_str("long").unwrap(), DecisionAction::Long);
        assert_eq!(DecisionAction::from_str("HOLD").unwrap(), DecisionAction::Hold);
        assert!(DecisionAction::from_str("BUY").is_err());
    }

    #[test]
    fn test_action_serializes_uppercase() {
        let json = serde_json::to_string(&DecisionAction::Short).unwrap();
        assert_eq!(json, "\"SHORT\"");
    }

    #[test]
    fn test_hold_defaults() {
        let d = Decision::hold("warming up");
        assert_eq!(d.action, DecisionAction::Hold);
        assert_eq!(d.size_pct, 0.0);
        assert_eq!(d.leverage, 1);
        assert!(d.entry_price.is_none());
    }
}
