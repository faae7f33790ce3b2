//! Three-stage LLM council: independent decisions, anonymized peer ranking,
//! chairman synthesis. Stage failures degrade the output, never the process.

use crate::domain::agent::AgentMode;
use crate::domain::decision::Decision;
use crate::domain::ports::{DecisionProvider, DecisionRequest};
use crate::infrastructure::core::retry::parse_rate_limit_reset;
use crate::infrastructure::core::throttle::throttle_request_start;
use crate::infrastructure::openrouter::LlmSettings;
use crate::infrastructure::openrouter::client::{build_system_message, build_user_message, parse_decision};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Cooldown between stages when free-tier models are involved.
const FREE_TIER_STAGE_COOLDOWN: Duration = Duration::from_millis(2000);
const PAID_TIER_STAGE_COOLDOWN: Duration = Duration::from_millis(500);
/// Stagger between Stage-1 request starts for free-tier models.
const FREE_TIER_STAGGER_DELAY: Duration = Duration::from_millis(300);
/// Minimum gap between two full deliberations, process-wide.
const DELIBERATION_COOLDOWN: Duration = Duration::from_millis(3000);

const FREE_TIER_MAX_RETRIES: usize = 5;
const PAID_TIER_MAX_RETRIES: usize = 3;
const FREE_TIER_BASE_DELAY: Duration = Duration::from_millis(2000);
const PAID_TIER_BASE_DELAY: Duration = Duration::from_millis(1000);

static LAST_DELIBERATION: LazyLock<Mutex<Option<Instant>>> = LazyLock::new(|| Mutex::new(None));

pub fn is_free_tier_model(model: &str) -> bool {
    model.ends_with(":free")
}

async fn apply_deliberation_cooldown() {
    let mut last = LAST_DELIBERATION.lock().await;
    if let Some(previous) = *last {
        let elapsed = previous.elapsed();
        if elapsed < DELIBERATION_COOLDOWN {
            let delay = DELIBERATION_COOLDOWN - elapsed;
            info!("Applying deliberation cooldown: {:?}", delay);
            sleep(delay).await;
        }
    }
    *last = Some(Instant::now());
}

#[derive(Debug, Clone, Serialize)]
pub struct Stage1Entry {
    pub model: String,
    pub response: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stage2Entry {
    pub model: String,
    pub ranking: String,
    pub parsed_ranking: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateRank {
    pub model: String,
    pub average_rank: f64,
    pub rankings_count: usize,
}

pub struct CouncilTrader {
    http: reqwest::Client,
    api_key: String,
    council_models: Vec<String>,
    chairman_model: String,
    strategy_prompt: String,
    mode: AgentMode,
    settings: LlmSettings,
}

impl CouncilTrader {
    pub fn new(
        api_key: String,
        council_models: Vec<String>,
        chairman_model: String,
        strategy_prompt: String,
        mode: AgentMode,
        settings: LlmSettings,
    ) -> Self {
        info!(
            "CouncilTrader initialized: {} members, chairman={}",
            council_models.len(),
            chairman_model
        );
        Self {
            http: reqwest::Client::new(),
            api_key,
            council_models,
            chairman_model,
            strategy_prompt,
            mode,
            settings,
        }
    }

    /// Queries one model with 429-aware backoff. Failures return None; a
    /// missing voice degrades the deliberation instead of aborting it.
    async fn query_model(&self, model: &str, prompt: &str) -> Option<String> {
        let free = is_free_tier_model(model);
        let max_retries = if free { FREE_TIER_MAX_RETRIES } else { PAID_TIER_MAX_RETRIES };
        let base_delay = if free { FREE_TIER_BASE_DELAY } else { PAID_TIER_BASE_DELAY };

        for attempt in 0..max_retries {
            throttle_request_start(self.settings.request_min_interval).await;

            let body = json!({
                "model": model,
                "messages": [{ "role": "user", "content": prompt }],
            });
            let request = self
                .http
                .post(format!("{}/chat/completions", self.settings.base_url))
                .bearer_auth(&self.api_key)
                .header("HTTP-Referer", &self.settings.http_referer)
                .header("X-Title", &self.settings.x_title)
                .json(&body)
                .send();

            let response = match tokio::time::timeout(self.settings.council_model_timeout, request).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    error!("Error querying model {}: {}", model, e);
                    return None;
                }
                Err(_) => {
                    warn!(
                        "Timeout querying model {} (attempt {}/{})",
                        model,
                        attempt + 1,
                        max_retries
                    );
                    continue;
                }
            };

            if response.status().as_u16() == 429 {
                if attempt + 1 == max_retries {
                    error!(
                        "Rate limit exceeded for model {} after {} attempts",
                        model, max_retries
                    );
                    return None;
                }
                let jitter = rand::rng().random_range(0.5..1.5);
                let mut delay = Duration::from_millis(
                    (base_delay.as_millis() as f64 * 2f64.powi(attempt as i32) * jitter) as u64,
                );
                if let Some(value) = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    && let Some(reset_ms) = parse_rate_limit_reset(&format!("retry-after: {value}"))
                {
                    let wait = reset_ms - Utc::now().timestamp_millis();
                    if wait > 0 {
                        delay = delay.max(Duration::from_millis(wait as u64));
                    }
                }
                warn!(
                    "Rate limit hit for model {}, retrying in {:?} (attempt {}/{})",
                    model,
                    delay,
                    attempt + 1,
                    max_retries
                );
                sleep(delay).await;
                continue;
            }

            if !response.status().is_success() {
                error!("HTTP error querying model {}: {}", model, response.status());
                return None;
            }

            let payload: Value = match response.json().await {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Unreadable response from model {}: {}", model, e);
                    return None;
                }
            };
            return payload
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .map(|s| s.to_string());
        }
        None
    }

    /// Stage 1: independent decisions from every member, staggered for
    /// free-tier models to dodge burst rate limits.
    async fn stage1_collect(&self, prompt: &str) -> Vec<Stage1Entry> {
        let has_free = self.council_models.iter().any(|m| is_free_tier_model(m));
        let queries = self.council_models.iter().enumerate().map(|(i, model)| {
            let stagger = if has_free {
                FREE_TIER_STAGGER_DELAY * i as u32
            } else {
                Duration::ZERO
            };
            async move {
                if !stagger.is_zero() {
                    sleep(stagger).await;
                }
                let response = self.query_model(model, prompt).await;
                (model.clone(), response)
            }
        });

        let results = join_all(queries).await;
        let entries: Vec<Stage1Entry> = results
            .into_iter()
            .filter_map(|(model, response)| response.map(|r| Stage1Entry { model, response: r }))
            .collect();
        info!(
            "Council Stage 1: collected {}/{} responses",
            entries.len(),
            self.council_models.len()
        );
        entries
    }

    /// Stage 2: each member ranks the anonymized Stage-1 decisions.
    async fn stage2_rank(
        &self,
        prompt: &str,
        stage1: &[Stage1Entry],
    ) -> (Vec<Stage2Entry>, BTreeMap<String, String>) {
        // Fresh label mapping per deliberation; models never see it.
        let labels: Vec<char> = (0..stage1.len()).map(|i| (b'A' + i as u8) as char).collect();
        let label_to_model: BTreeMap<String, String> = labels
            .iter()
            .zip(stage1)
            .map(|(label, entry)| (format!("Decision {label}"), entry.model.clone()))
            .collect();

        let decisions_text = labels
            .iter()
            .zip(stage1)
            .map(|(label, entry)| format!("Decision {label}:\n{}", entry.response))
            .collect::<Vec<_>>()
            .join("\n\n");

        let ranking_prompt = build_ranking_prompt(prompt, &decisions_text);

        let queries = self.council_models.iter().map(|model| async {
            let response = self.query_model(model, &ranking_prompt).await;
            (model.clone(), response)
        });
        let results = join_all(queries).await;

        let entries: Vec<Stage2Entry> = results
            .into_iter()
            .filter_map(|(model, response)| {
                response.map(|full_text| Stage2Entry {
                    model,
                    parsed_ranking: parse_ranking(&full_text),
                    ranking: full_text,
                })
            })
            .collect();
        info!(
            "Council Stage 2: collected {}/{} rankings",
            entries.len(),
            self.council_models.len()
        );
        (entries, label_to_model)
    }

    /// Stage 3: the chairman synthesizes one decision in the Stage-1 schema.
    async fn stage3_synthesize(
        &self,
        prompt: &str,
        stage1: &[Stage1Entry],
        stage2: &[Stage2Entry],
    ) -> Option<String> {
        let stage1_text = stage1
            .iter()
            .map(|e| format!("Model: {}\nDecision: {}", e.model, e.response))
            .collect::<Vec<_>>()
            .join("\n\n");
        let stage2_text = stage2
            .iter()
            .map(|e| format!("Model: {}\nRanking: {}", e.model, e.ranking))
            .collect::<Vec<_>>()
            .join("\n\n");

        let chairman_prompt = build_chairman_prompt(prompt, &stage1_text, &stage2_text);
        let response = self.query_model(&self.chairman_model, &chairman_prompt).await;
        if response.is_some() {
            info!("Council Stage 3: chairman synthesized final decision");
        } else {
            error!("Council Stage 3: chairman model failed to respond");
        }
        response
    }
}

#[async_trait]
impl DecisionProvider for CouncilTrader {
    async fn decide(&self, request: DecisionRequest) -> Decision {
        let allow_leverage = request
            .context
            .get("allow_leverage")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let prompt = format!(
            "{}\n\n{}",
            build_system_message(self.mode, &self.strategy_prompt),
            build_user_message(&request)
        );

        apply_deliberation_cooldown().await;

        let has_free = self.council_models.iter().any(|m| is_free_tier_model(m));
        let stage_cooldown = if has_free {
            FREE_TIER_STAGE_COOLDOWN
        } else {
            PAID_TIER_STAGE_COOLDOWN
        };

        info!("Council Stage 1: collecting individual decisions...");
        let stage1 = self.stage1_collect(&prompt).await;
        if stage1.is_empty() {
            let mut decision = Decision::hold(
                "All council models failed to respond - rate limited. Try using fewer models or paid tier.",
            );
            decision.context = Some(json!({
                "council_deliberation": {
                    "stage1": [],
                    "stage2": [],
                    "aggregate_rankings": [],
                    "label_to_model": {},
                    "rate_limited": true,
                }
            }));
            return decision;
        }

        sleep(stage_cooldown).await;

        info!("Council Stage 2: collecting rankings...");
        let (stage2, label_to_model) = self.stage2_rank(&prompt, &stage1).await;
        let aggregate = aggregate_rankings(&stage2, &label_to_model);

        sleep(stage_cooldown).await;

        info!("Council Stage 3: chairman synthesizing final decision...");
        let chairman_response = self.stage3_synthesize(&prompt, &stage1, &stage2).await;

        let mut decision = match &chairman_response {
            Some(text) => match parse_decision(text, allow_leverage) {
                Ok(decision) => decision,
                Err(e) => {
                    error!("Council chairman response unusable: {}", e);
                    Decision::hold(format!("Council deliberation failed - chairman response unusable: {e}"))
                }
            },
            None => Decision::hold(
                "Council deliberation failed - chairman unable to synthesize decision",
            ),
        };

        decision.context = Some(json!({
            "council_deliberation": {
                "stage1": stage1,
                "stage2": stage2,
                "stage3": {
                    "model": self.chairman_model,
                    "response": chairman_response.unwrap_or_default(),
                },
                "aggregate_rankings": aggregate,
                "label_to_model": label_to_model,
            }
        }));
        decision
    }
}

fn build_ranking_prompt(trading_prompt: &str, decisions_text: &str) -> String {
    format!(
        "You are evaluating different trading decisions for the following scenario:\n\
         \n\
         ORIGINAL TRADING SCENARIO:\n\
         {trading_prompt}\n\
         \n\
         Here are the decisions from different AI models (anonymized):\n\
         \n\
         {decisions_text}\n\
         \n\
         Your task:\n\
         1. First, evaluate each decision individually: risk assessment accuracy, position sizing,\n\
         \x20  stop-loss and take-profit levels, reasoning quality, and alignment with market conditions.\n\
         2. Then, at the very end of your response, provide a final ranking.\n\
         \n\
         IMPORTANT: Your final ranking MUST be formatted EXACTLY as follows:\n\
         - Start with the line \"FINAL RANKING:\" (all caps, with colon)\n\
         - Then list the decisions from best to worst as a numbered list\n\
         - Each line should be: number, period, space, then ONLY the decision label (e.g., \"1. Decision A\")\n\
         - Do not add any other text or explanations in the ranking section\n\
         \n\
         Example of the correct format:\n\
         \n\
         Decision A provides good risk management but the position size may be too aggressive...\n\
         Decision B has conservative stops but may miss the opportunity...\n\
         \n\
         FINAL RANKING:\n\
         1. Decision B\n\
         2. Decision A\n\
         \n\
         Now provide your evaluation and ranking:"
    )
}

fn build_chairman_prompt(trading_prompt: &str, stage1_text: &str, stage2_text: &str) -> String {
    format!(
        "You are the Chairman of an AI Trading Council. Multiple AI models have provided trading\n\
         decisions for a scenario, and then ranked each other's decisions.\n\
         \n\
         ORIGINAL TRADING SCENARIO:\n\
         {trading_prompt}\n\
         \n\
         STAGE 1 - Individual Trading Decisions:\n\
         {stage1_text}\n\
         \n\
         STAGE 2 - Peer Rankings:\n\
         {stage2_text}\n\
         \n\
         Your task as Chairman is to synthesize all of this information into a single, optimal\n\
         trading decision. Consider the individual decisions and their risk/reward profiles, the\n\
         peer rankings and what they reveal about decision quality, patterns of agreement or\n\
         disagreement, and market conditions.\n\
         \n\
         CRITICAL: Your response MUST be in the EXACT SAME JSON FORMAT as the individual decisions\n\
         above. Include:\n\
         - \"action\": one of [\"LONG\", \"SHORT\", \"CLOSE\", \"HOLD\"]\n\
         - \"reasoning\": your comprehensive analysis incorporating council wisdom\n\
         - \"size_percentage\": position size as decimal (0.0 to 1.0)\n\
         - \"leverage\": leverage multiplier (1 for no leverage)\n\
         - \"stop_loss_price\": stop loss price level (or null)\n\
         - \"take_profit_price\": take profit price level (or null)\n\
         \n\
         Provide your final synthesized trading decision as a JSON object:"
    )
}

/// Parses the trailing `FINAL RANKING:` section into ordered decision
/// labels. Falls back to scanning the whole text for `Decision X` patterns.
pub fn parse_ranking(text: &str) -> Vec<String> {
    let section = match text.rfind("FINAL RANKING:") {
        Some(position) => &text[position + "FINAL RANKING:".len()..],
        None => text,
    };

    let mut labels = Vec::new();
    let bytes = section.as_bytes();
    let needle = b"Decision ";
    let mut i = 0;
    while i + needle.len() < bytes.len() {
        if &bytes[i..i + needle.len()] == needle {
            let next = bytes[i + needle.len()];
            if next.is_ascii_uppercase() {
                labels.push(format!("Decision {}", next as char));
                i += needle.len() + 1;
                continue;
            }
        }
        i += 1;
    }
    labels
}

/// Borda-style aggregation: average peer-assigned position per model, lower
/// is better. Reported in metadata, never authoritative over the chairman.
pub fn aggregate_rankings(
    stage2: &[Stage2Entry],
    label_to_model: &BTreeMap<String, String>,
) -> Vec<AggregateRank> {
    let mut positions: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for entry in stage2 {
        for (position, label) in entry.parsed_ranking.iter().enumerate() {
            if let Some(model) = label_to_model.get(label) {
                positions.entry(model.clone()).or_default().push(position + 1);
            }
        }
    }

    let mut aggregate: Vec<AggregateRank> = positions
        .into_iter()
        .map(|(model, ranks)| {
            let average = ranks.iter().sum::<usize>() as f64 / ranks.len() as f64;
            AggregateRank {
                model,
                average_rank: (average * 100.0).round() / 100.0,
                rankings_count: ranks.len(),
            }
        })
        .collect();
    aggregate.sort_by(|a, b| a.average_rank.partial_cmp(&b.average_rank).unwrap());
    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranking_trailing_section() {
        let text = "Decision A is bold. Decision B is careful.\n\nFINAL RANKING:\n1. Decision B\n2. Decision A\n";
        assert_eq!(parse_ranking(text), vec!["Decision B", "Decision A"]);
    }

    #[test]
    fn test_parse_ranking_fallback_scans_whole_text() {
        let text = "I prefer Decision C then Decision A.";
        assert_eq!(parse_ranking(text), vec!["Decision C", "Decision A"]);
    }

    #[test]
    fn test_parse_ranking_empty() {
        assert!(parse_ranking("no rankings here").is_empty());
    }

    #[test]
    fn test_aggregate_rankings_borda() {
        let mut label_to_model = BTreeMap::new();
        label_to_model.insert("Decision A".to_string(), "model-a".to_string());
        label_to_model.insert("Decision B".to_string(), "model-b".to_string());
        label_to_model.insert("Decision C".to_string(), "model-c".to_string());

        // All three voters agree: B > A > C.
        let stage2: Vec<Stage2Entry> = (0..3)
            .map(|i| Stage2Entry {
                model: format!("model-{i}"),
                ranking: String::new(),
                parsed_ranking: vec![
                    "Decision B".to_string(),
                    "Decision A".to_string(),
                    "Decision C".to_string(),
                ],
            })
            .collect();

        let aggregate = aggregate_rankings(&stage2, &label_to_model);
        assert_eq!(aggregate.len(), 3);
        assert_eq!(aggregate[0].model, "model-b");
        assert_eq!(aggregate[0].average_rank, 1.0);
        assert_eq!(aggregate[1].model, "model-a");
        assert_eq!(aggregate[2].model, "model-c");
        assert_eq!(aggregate[2].rankings_count, 3);
    }

    #[test]
    fn test_aggregate_ignores_unknown_labels() {
        let mut label_to_model = BTreeMap::new();
        label_to_model.insert("Decision A".to_string(), "model-a".to_string());

        let stage2 = vec![Stage2Entry {
            model: "model-a".to_string(),
            ranking: String::new(),
            parsed_ranking: vec!["Decision Z".to_string(), "Decision A".to_string()],
        }];

        let aggregate = aggregate_rankings(&stage2, &label_to_model);
        assert_eq!(aggregate.len(), 1);
        assert_eq!(aggregate[0].average_rank, 2.0);
    }

    #[test]
    fn test_free_tier_detection() {
        assert!(is_free_tier_model("google/gemini-flash-1.5:free"));
        assert!(!is_free_tier_model("openai/gpt-4o"));
    }
}
