//! The forward driver: warm-up streaming, an opening analysis on the last
//! warm-up candle, the live candle-close loop, and auto-stop handling.
//! Forward sessions have no fast-forward path; every live candle is a full
//! step.

use crate::application::indicators::{IndicatorPipeline, RUNTIME_READINESS_THRESHOLD};
use crate::application::results::ResultFinalizer;
use crate::application::session::overrides::{force_decision_reason, low_volatility_skip_reason};
use crate::application::session::state::SessionState;
use crate::application::session::{ActiveSessionMap, SessionHandle};
use crate::domain::decision::{Decision, DecisionAction};
use crate::domain::events::{Event, EventKind, IndicatorMap, StatsUpdatePayload};
use crate::domain::market::Candle;
use crate::domain::ports::{DecisionRequest, MarketDataGateway};
use crate::domain::repositories::{RuntimeStatsUpdate, SessionStatus, ThoughtRecord};
use crate::domain::trading::{CloseReason, PendingOrder, Trade};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::persistence::Repositories;
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::auto_stop::AutoStopPolicy;
use super::timing::{stream_prices, wait_for_candle_close};

const WARMUP_BATCH_SIZE: usize = 50;
const WARMUP_BATCH_DELAY: Duration = Duration::from_millis(100);

pub(crate) struct ForwardRun {
    pub state: SessionState,
    pub warmup_len: usize,
    pub auto_stop: AutoStopPolicy,
    pub handle: Arc<SessionHandle>,
    pub gateway: Arc<dyn MarketDataGateway>,
    pub repos: Repositories,
    pub bus: EventBus,
    pub active: ActiveSessionMap,
    pub finalizer: Arc<ResultFinalizer>,
}

impl ForwardRun {
    pub async fn run(mut self) {
        let session_id = self.state.session_id.clone();
        info!("Starting forward test processing: session_id={session_id}");

        if let Err(e) = self.drive().await {
            error!("Error processing forward test: {e:#}");
            let _ = self
                .repos
                .sessions
                .update_status(&session_id, SessionStatus::Failed)
                .await;
            self.bus
                .publish(
                    &session_id,
                    EventKind::Error {
                        message: format!("{e:#}"),
                        error_code: None,
                    },
                )
                .await;
            self.handle.controls.publish_result("");
        }

        self.active.remove(&session_id).await;
    }

    async fn drive(&mut self) -> Result<()> {
        self.stream_warmup().await;

        // Seed decision on the last warm-up candle so the agent has an
        // opening analysis before the first live candle arrives.
        let last_warmup_index = self.state.candles.len() - 1;
        if last_warmup_index >= self.state.decision_start_index {
            info!(
                "Processing last warm-up candle (index {}) for initial analysis",
                last_warmup_index
            );
            self.full_step(last_warmup_index, None).await?;
        } else {
            info!(
                "Skipping initial analysis: indicators not ready (decision_start_index={}, warm-up={})",
                self.state.decision_start_index, last_warmup_index
            );
        }

        self.broadcast_preview_candle().await;

        tokio::spawn(stream_prices(
            self.bus.clone(),
            self.state.session_id.clone(),
            self.handle.clone(),
            self.gateway.clone(),
            self.state.asset.clone(),
        ));

        loop {
            self.handle.controls.wait_if_paused().await;
            if self.handle.controls.is_stopped() {
                break;
            }

            let last_candle_at = self.state.candles.last().map(|c| c.timestamp);
            let Some(candle) = wait_for_candle_close(
                &self.bus,
                &self.state.session_id,
                &self.handle.controls,
                &self.gateway,
                &self.state.asset,
                self.state.timeframe,
                last_candle_at,
            )
            .await?
            else {
                break; // stopped during the wait
            };

            if self.handle.controls.is_stopped() {
                break;
            }

            let index = self.append_candle(candle);
            self.full_step(index, None).await?;

            let stats = self.state.positions.stats();
            if self.auto_stop.should_stop(&stats) {
                info!("Auto-stop triggered: session_id={}", self.state.session_id);
                self.handle_auto_stop(candle).await?;
                return Ok(());
            }
        }

        // Manual stop path.
        if self.handle.controls.close_position_on_stop()
            && self.state.positions.has_open_position()
            && let Some(candle) = self.state.candles.last().copied()
        {
            let index = self.state.candles.len() - 1;
            if let Some(trade) =
                self.state
                    .positions
                    .close_position(candle.close, CloseReason::Manual, candle.timestamp)
            {
                self.on_position_closed(index, &trade).await?;
            }
        }
        let result_id = self.finalize(true, false).await?;
        self.handle.controls.publish_result(&result_id);
        Ok(())
    }

    /// Streams warm-up candles (with indicators) in batches. Warm-up candles
    /// are numbered so the last one is 0 and live candles count up from 1.
    async fn stream_warmup(&mut self) {
        info!(
            "Broadcasting {} warm-up candles with indicators",
            self.state.candles.len()
        );
        let total = self.state.candles.len();
        for batch_start in (0..total).step_by(WARMUP_BATCH_SIZE) {
            let batch_end = (batch_start + WARMUP_BATCH_SIZE).min(total);
            for index in batch_start..batch_end {
                let candle = self.state.candles[index];
                let indicators = self.state.indicators_at(index);
                self.emit_candle(candle, indicators, self.candle_number(index))
                    .await;
            }
            if batch_end < total {
                tokio::time::sleep(WARMUP_BATCH_DELAY).await;
            }
        }
        self.state.current_index = total.saturating_sub(1);
        self.handle.controls.set_current_index(self.state.current_index);
    }

    fn candle_number(&self, index: usize) -> i64 {
        index as i64 - (self.warmup_len as i64 - 1)
    }

    /// Display-only broadcast of the vendor's newest candle so consumers see
    /// something immediately instead of waiting for the first close. Not
    /// processed, not buffered for replay.
    async fn broadcast_preview_candle(&self) {
        let Ok(Some(preview)) = self
            .gateway
            .latest_closed(&self.state.asset, self.state.timeframe)
            .await
        else {
            return;
        };
        let newer = self
            .state
            .candles
            .last()
            .is_none_or(|last| preview.timestamp > last.timestamp);
        if !newer {
            return;
        }
        let event = Event::new(EventKind::Candle {
            candle: preview,
            indicators: IndicatorMap::new(),
            candle_number: self.candle_number(self.state.candles.len()),
        });
        self.bus
            .broadcast_to_session(&self.state.session_id, event)
            .await;
        info!(
            "Displayed current candle preview: session_id={}, timestamp={}",
            self.state.session_id,
            preview.timestamp.to_rfc3339()
        );
    }

    /// Appends a freshly closed live candle and rebuilds the indicator
    /// pipeline over the full buffer.
    fn append_candle(&mut self, candle: Candle) -> usize {
        self.state.candles.push(candle);
        let index = self.state.candles.len() - 1;
        self.state.current_index = index;
        self.handle.controls.set_current_index(index);

        match IndicatorPipeline::new(
            &self.state.candles,
            &self.state.agent.indicators,
            self.state.agent.mode,
            &self.state.agent.custom_indicators,
        ) {
            Ok(pipeline) => self.state.pipeline = pipeline,
            Err(e) => {
                // Construction was validated at init; a failure here would
                // mean corrupt candle data. Keep the stale pipeline.
                warn!("Failed to rebuild indicator pipeline: {e}");
            }
        }
        index
    }

    /// One full decision step over the candle at `index`.
    async fn full_step(&mut self, index: usize, preknown_force: Option<String>) -> Result<()> {
        let candle = self.state.candles[index];
        let indicators = self.state.indicators_at(index);

        let (ready_count, total_count) = self.state.pipeline.readiness_at(index);
        let ready_pct = if total_count > 0 {
            ready_count as f64 / total_count as f64 * 100.0
        } else {
            100.0
        };
        let indicators_ready = self
            .state
            .pipeline
            .is_ready(index, RUNTIME_READINESS_THRESHOLD);
        self.bus
            .publish(
                &self.state.session_id,
                EventKind::IndicatorReadiness {
                    ready_count,
                    total_count,
                    ready_pct,
                    is_ready: indicators_ready,
                },
            )
            .await;

        // Warm-up already broadcast historical candles; only live candles
        // (and the seed candle re-processed for analysis) skip re-emission.
        if index >= self.warmup_len {
            self.emit_candle(candle, indicators.clone(), self.candle_number(index))
                .await;
        }

        self.update_open_position(index, candle).await?;
        self.try_fill_pending_order(index, candle).await?;

        let force_reason = preknown_force
            .or_else(|| force_decision_reason(&self.state, index, &candle));
        let decision = self
            .resolve_decision(index, candle, &indicators, indicators_ready, force_reason)
            .await;

        self.journal_thought(index, candle, &indicators, &decision);
        self.emit_decision(index, &decision).await;
        self.execute_decision(index, candle, &decision).await?;

        let stats = self.state.positions.stats();
        self.state.record_equity(candle.timestamp, stats.current_equity);
        self.bus
            .publish(
                &self.state.session_id,
                EventKind::StatsUpdate(StatsUpdatePayload {
                    stats,
                    current_candle: Some(index),
                    total_candles: None,
                }),
            )
            .await;
        self.flush_runtime_stats(index).await?;
        Ok(())
    }

    async fn resolve_decision(
        &mut self,
        index: usize,
        candle: Candle,
        indicators: &IndicatorMap,
        indicators_ready: bool,
        force_reason: Option<String>,
    ) -> Decision {
        let forced = force_reason.is_some();
        let scheduled = self
            .state
            .cadence
            .is_decision_candle(self.state.decision_start_index, index);

        let mut skip_reason: Option<String> = None;
        let should_run_ai = if forced {
            true
        } else if index < self.state.decision_start_index {
            skip_reason = Some(format!(
                "Skipping AI decision for candle {} because indicators are still warming up (decision_start_index={}).",
                index, self.state.decision_start_index
            ));
            false
        } else if !indicators_ready {
            let (ready, total) = self.state.pipeline.readiness_at(index);
            skip_reason = Some(format!(
                "Skipping AI decision for candle {index} because insufficient indicators are ready ({ready}/{total} ready)."
            ));
            false
        } else if !scheduled {
            skip_reason = Some(format!("Decision cadence skipped candle {index}"));
            false
        } else if !self.state.positions.has_open_position()
            && let Some(reason) = low_volatility_skip_reason(&self.state, index, indicators)
        {
            skip_reason = Some(format!("SKIPPED (volatility): {reason}"));
            false
        } else {
            true
        };

        if !should_run_ai {
            let mut decision = Decision::hold(skip_reason.unwrap_or_default());
            decision.candle_index = Some(index);
            return decision;
        }

        self.bus
            .publish(
                &self.state.session_id,
                EventKind::AiThinking {
                    session_id: self.state.session_id.clone(),
                },
            )
            .await;

        let (recent_candles, recent_indicators) =
            self.state.build_decision_history(index, forced);
        let context = json!({
            "mode": "forward",
            "candle_index": index,
            "allow_leverage": self.state.allow_leverage,
            "max_leverage": if self.state.allow_leverage { 5 } else { 1 },
            "forced_decision": forced,
            "force_reason": force_reason,
        });

        let mut decision = self
            .state
            .provider
            .decide(DecisionRequest {
                candle,
                indicators: indicators.clone(),
                position: self.state.positions.position().cloned(),
                equity: self.state.positions.total_equity(),
                recent_candles,
                recent_indicators,
                context,
            })
            .await;
        decision.candle_index = Some(index);
        decision
    }

    async fn update_open_position(&mut self, index: usize, candle: Candle) -> Result<()> {
        if !self.state.positions.has_open_position() {
            return Ok(());
        }
        let closed = self.state.positions.update_position(
            candle.high,
            candle.low,
            candle.close,
            candle.timestamp,
        );
        if closed.is_some() {
            let trade = self
                .state
                .positions
                .closed_trades()
                .last()
                .cloned()
                .expect("a close reason implies a recorded trade");
            self.on_position_closed(index, &trade).await?;
        }
        Ok(())
    }

    async fn try_fill_pending_order(&mut self, index: usize, candle: Candle) -> Result<()> {
        if self.state.positions.has_open_position() {
            return Ok(());
        }
        let Some(pending) = self.state.pending_order.clone() else {
            return Ok(());
        };
        if !candle.brackets(pending.entry_price) {
            return Ok(());
        }

        info!(
            "Filling pending {} order at {} on candle {}",
            pending.side, pending.entry_price, index
        );
        let opened = self.state.positions.open_position(
            pending.side,
            pending.entry_price,
            pending.size_pct,
            pending.stop_loss,
            pending.take_profit,
            pending.leverage,
            candle.timestamp,
        );
        if opened {
            self.on_position_opened(index).await;
        }
        self.state.pending_order = None;
        Ok(())
    }

    async fn execute_decision(
        &mut self,
        index: usize,
        candle: Candle,
        decision: &Decision,
    ) -> Result<()> {
        match decision.action {
            DecisionAction::Hold => Ok(()),
            DecisionAction::Close => {
                self.state.pending_order = None;
                if self.state.positions.has_open_position() {
                    if let Some(trade) = self.state.positions.close_position(
                        candle.close,
                        CloseReason::AiDecision,
                        candle.timestamp,
                    ) {
                        self.on_position_closed(index, &trade).await?;
                    }
                }
                Ok(())
            }
            DecisionAction::Long | DecisionAction::Short => {
                if self.state.positions.has_open_position() {
                    warn!(
                        "Cannot open {} position: position already exists",
                        decision.action
                    );
                    return Ok(());
                }
                let side = decision.action.side().expect("LONG/SHORT maps to a side");
                let leverage = if self.state.allow_leverage {
                    decision.leverage.clamp(1, 5)
                } else {
                    1
                };

                if let Some(entry_price) = decision.entry_price {
                    self.state.pending_order = Some(PendingOrder {
                        side,
                        entry_price,
                        size_pct: decision.size_pct,
                        stop_loss: decision.stop_loss_price,
                        take_profit: decision.take_profit_price,
                        leverage,
                        reasoning: decision.reasoning.clone(),
                        decision_candle: decision.candle_index,
                    });
                    info!(
                        "Registered pending {} order at {} for session {} on candle {}",
                        side, entry_price, self.state.session_id, index
                    );
                    return Ok(());
                }

                let opened = self.state.positions.open_position(
                    side,
                    candle.close,
                    decision.size_pct,
                    decision.stop_loss_price,
                    decision.take_profit_price,
                    leverage,
                    candle.timestamp,
                );
                if opened {
                    self.on_position_opened(index).await;
                }
                Ok(())
            }
        }
    }

    async fn handle_auto_stop(&mut self, candle: Candle) -> Result<()> {
        let index = self.state.candles.len() - 1;
        if self.state.positions.has_open_position()
            && let Some(trade) = self.state.positions.close_position(
                candle.close,
                CloseReason::AutoStop,
                candle.timestamp,
            )
        {
            self.on_position_closed(index, &trade).await?;
        }
        let result_id = self.finalize(false, true).await?;
        self.handle.controls.publish_result(&result_id);
        Ok(())
    }

    fn journal_thought(
        &mut self,
        index: usize,
        candle: Candle,
        indicators: &IndicatorMap,
        decision: &Decision,
    ) {
        let order_data = matches!(
            decision.action,
            DecisionAction::Long | DecisionAction::Short
        )
        .then(|| {
            json!({
                "entry_price": decision.entry_price,
                "stop_loss_price": decision.stop_loss_price,
                "take_profit_price": decision.take_profit_price,
                "size_percentage": decision.size_pct,
                "leverage": decision.leverage,
            })
        });
        let council = decision
            .context
            .as_ref()
            .and_then(|c| c.get("council_deliberation"))
            .cloned();

        self.state.thoughts.push(ThoughtRecord {
            candle_number: self.candle_number(index),
            timestamp: candle.timestamp,
            candle,
            indicators: indicators.clone(),
            reasoning: decision.reasoning.clone(),
            decision: decision.action.to_string(),
            order_data,
            council,
        });
    }

    async fn on_position_opened(&self, index: usize) {
        let Some(position) = self.state.positions.position() else {
            return;
        };
        self.bus
            .publish(
                &self.state.session_id,
                EventKind::PositionOpened {
                    candle_number: self.candle_number(index),
                    side: position.side.to_string(),
                    entry_price: position.entry_price,
                    size: position.size,
                    stop_loss: position.stop_loss,
                    take_profit: position.take_profit,
                    leverage: position.leverage,
                },
            )
            .await;
    }

    async fn on_position_closed(&self, index: usize, trade: &Trade) -> Result<()> {
        let trade_number = self.state.positions.closed_trades().len() as i64;
        self.repos
            .trades
            .append(&self.state.session_id, trade_number, trade)
            .await?;
        self.bus
            .publish(
                &self.state.session_id,
                EventKind::PositionClosed {
                    candle_number: self.candle_number(index),
                    side: trade.side.to_string(),
                    entry_price: trade.entry_price,
                    exit_price: trade.exit_price,
                    size: trade.size,
                    pnl: trade.pnl,
                    pnl_pct: trade.pnl_pct,
                    reason: trade.reason.to_string(),
                    leverage: trade.leverage,
                },
            )
            .await;
        Ok(())
    }

    async fn emit_candle(&self, candle: Candle, indicators: IndicatorMap, candle_number: i64) {
        let event = Event::new(EventKind::Candle {
            candle,
            indicators,
            candle_number,
        });
        self.handle.replay.push_candle(event.clone()).await;
        self.bus
            .broadcast_to_session(&self.state.session_id, event)
            .await;
    }

    async fn emit_decision(&self, index: usize, decision: &Decision) {
        let event = Event::new(EventKind::AiDecision {
            candle_number: self.candle_number(index),
            action: decision.action.to_string(),
            reasoning: decision.reasoning.clone(),
            entry_price: decision.entry_price,
            stop_loss_price: decision.stop_loss_price,
            take_profit_price: decision.take_profit_price,
            size_percentage: decision.size_pct,
            leverage: decision.leverage,
            council_deliberation: decision
                .context
                .as_ref()
                .and_then(|c| c.get("council_deliberation"))
                .cloned(),
        });
        self.handle.replay.push_decision(event.clone()).await;
        self.bus
            .broadcast_to_session(&self.state.session_id, event)
            .await;
    }

    async fn flush_runtime_stats(&self, index: usize) -> Result<()> {
        let stats = self.state.positions.stats();
        self.repos
            .sessions
            .update_runtime_stats(
                &self.state.session_id,
                &RuntimeStatsUpdate {
                    current_equity: stats.current_equity,
                    current_pnl_pct: stats.equity_change_pct,
                    max_drawdown_pct: self.state.max_drawdown_pct,
                    elapsed_seconds: self.state.elapsed_seconds(),
                    open_position: self.state.open_position_json(),
                    current_candle: index as i64,
                },
            )
            .await
    }

    async fn finalize(&mut self, forced_stop: bool, auto_stop: bool) -> Result<String> {
        info!("Completing forward test: session_id={}", self.state.session_id);

        self.repos
            .sessions
            .update_status(&self.state.session_id, SessionStatus::Completed)
            .await?;
        self.repos
            .sessions
            .update_completed_at(&self.state.session_id, chrono::Utc::now())
            .await?;
        self.repos
            .thoughts
            .append_all(&self.state.session_id, &self.state.thoughts)
            .await?;

        let stats = self.state.positions.stats();
        self.repos
            .sessions
            .update_runtime_stats(
                &self.state.session_id,
                &RuntimeStatsUpdate {
                    current_equity: stats.current_equity,
                    current_pnl_pct: stats.equity_change_pct,
                    max_drawdown_pct: self.state.max_drawdown_pct,
                    elapsed_seconds: self.state.elapsed_seconds(),
                    open_position: None,
                    current_candle: self.state.current_index as i64,
                },
            )
            .await?;

        let result_id = self
            .finalizer
            .finalize(
                &self.state.session_id,
                &stats,
                self.state.max_drawdown_pct,
                Some(self.state.equity_curve_json()),
                forced_stop,
                auto_stop,
            )
            .await?;

        self.bus
            .publish(
                &self.state.session_id,
                EventKind::SessionCompleted {
                    session_id: self.state.session_id.clone(),
                    result_id: result_id.clone(),
                    final_equity: stats.current_equity,
                    total_pnl: stats.total_pnl,
                    total_pnl_pct: stats.total_pnl_pct,
                    total_trades: stats.total_trades,
                    win_rate: stats.win_rate,
                    forced_stop,
                    auto_stop,
                },
            )
            .await;

        info!(
            "Forward test completed: session_id={}, final_equity={}, pnl={}%",
            self.state.session_id, stats.current_equity, stats.total_pnl_pct
        );
        Ok(result_id)
    }
}
