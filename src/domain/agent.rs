use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Information-access mode an agent trades under.
///
/// Monk mode deprives the agent of everything except RSI and MACD; omni mode
/// permits the full indicator catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Monk,
    Omni,
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentMode::Monk => write!(f, "monk"),
            AgentMode::Omni => write!(f, "omni"),
        }
    }
}

impl FromStr for AgentMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "monk" => Ok(AgentMode::Monk),
            "omni" => Ok(AgentMode::Omni),
            _ => Err(anyhow!("Invalid agent mode: '{}'. Must be monk or omni", s)),
        }
    }
}

/// Configuration snapshot of a trading agent.
///
/// The runtime reloads this from persistence at phase boundaries rather than
/// trusting a handed-in copy, so a stale caller can never resurrect deleted
/// or edited agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: Uuid,
    pub name: String,
    pub mode: AgentMode,
    /// Remote model identifier, e.g. "anthropic/claude-3.5-sonnet".
    pub model: String,
    pub strategy_prompt: String,
    /// Enabled standard indicator names (aliases allowed, expanded by the
    /// indicator pipeline).
    pub indicators: Vec<String>,
    /// Custom indicator rule trees, stored verbatim as JSON.
    pub custom_indicators: Vec<serde_json::Value>,
    pub api_key_id: Option<Uuid>,
}

/// Stored external API credential: an opaque encrypted blob plus the public
/// prefix shown in listings. Decryption happens through the `ApiKeyCipher`
/// collaborator just before client construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub encrypted_key: String,
    pub key_prefix: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip() {
        assert_eq!(AgentMode::from_str("monk").unwrap(), AgentMode::Monk);
        assert_eq!(AgentMode::from_str("OMNI").unwrap(), AgentMode::Omni);
        assert_eq!(AgentMode::Monk.to_string(), "monk");
        assert!(AgentMode::from_str("zen").is_err());
    }
}
