//! The backtest driver: candle-by-candle processing with pre-computed LLM
//! call points, fast-forward handling, decision execution, and finalization.

use crate::application::indicators::RUNTIME_READINESS_THRESHOLD;
use crate::application::results::ResultFinalizer;
use crate::application::session::overrides::{force_decision_reason, low_volatility_skip_reason};
use crate::application::session::state::SessionState;
use crate::application::session::{ActiveSessionMap, DecisionCadence, SessionHandle};
use crate::domain::decision::{Decision, DecisionAction};
use crate::domain::events::{Event, EventKind, IndicatorMap, StatsUpdatePayload};
use crate::domain::market::{Candle, PlaybackSpeed};
use crate::domain::ports::DecisionRequest;
use crate::domain::repositories::{RuntimeStatsUpdate, SessionStatus, ThoughtRecord};
use crate::domain::trading::{CloseReason, PendingOrder, Trade};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::persistence::Repositories;
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Runtime-stat flush cadence during fast-forward stretches.
const FAST_FORWARD_FLUSH_INTERVAL: usize = 20;

pub(crate) struct BacktestRun {
    pub state: SessionState,
    pub handle: Arc<SessionHandle>,
    pub repos: Repositories,
    pub bus: EventBus,
    pub active: ActiveSessionMap,
    pub finalizer: Arc<ResultFinalizer>,
}

impl BacktestRun {
    pub async fn run(mut self) {
        let session_id = self.state.session_id.clone();
        info!("Starting backtest processing: session_id={session_id}");

        if let Err(e) = self.drive().await {
            error!("Error processing backtest: {e:#}");
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
            // Unblock anyone awaiting a stop result on the failed session.
            self.handle.controls.publish_result("");
        }

        self.active.remove(&session_id).await;
    }

    async fn drive(&mut self) -> Result<()> {
        let call_points = self
            .state
            .cadence
            .call_points(self.state.decision_start_index, self.state.candles.len());
        info!(
            "Pre-computed {} LLM call points (start_index={}, total_candles={})",
            call_points.len(),
            self.state.decision_start_index,
            self.state.candles.len()
        );

        while self.state.current_index < self.state.candles.len() {
            if self.handle.controls.is_stopped() {
                info!("Backtest stopped: session_id={}", self.state.session_id);
                break;
            }

            // Cooperative suspension point: a cleared pause gate parks the
            // loop here until resume (or stop) releases it.
            self.handle.controls.wait_if_paused().await;
            if self.handle.controls.is_stopped() {
                break;
            }

            let index = self.state.current_index;
            let candle = self.state.candles[index];
            self.handle.controls.set_current_index(index);

            let scheduled = call_points.contains(&index);
            // Force conditions depend on live position state, so they cannot
            // be pre-computed with the call points.
            let force_reason = force_decision_reason(&self.state, index, &candle);
            let full_step = scheduled || force_reason.is_some();

            if full_step {
                self.process_candle(index, candle, force_reason).await?;
            } else {
                self.fast_forward_candle(index, candle).await?;
            }

            self.state.current_index += 1;
            self.repos
                .sessions
                .update_current_candle(&self.state.session_id, self.state.current_index as i64)
                .await?;

            // Playback pacing applies to decision candles only; fast-forward
            // stretches must run as fast as possible.
            if full_step && self.state.playback_speed != PlaybackSpeed::Instant {
                let delay = self.state.playback_speed.delay_ms();
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }

        let forced_stop = self.handle.controls.is_stopped();
        if forced_stop
            && self.handle.controls.close_position_on_stop()
            && self.state.positions.has_open_position()
        {
            let index = self.state.current_index.min(self.state.candles.len() - 1);
            let candle = self.state.candles[index];
            if let Some(trade) =
                self.state
                    .positions
                    .close_position(candle.close, CloseReason::Manual, candle.timestamp)
            {
                self.on_position_closed(index, &trade).await?;
            }
        }

        let result_id = self.finalize(forced_stop).await?;
        self.handle.controls.publish_result(&result_id);
        Ok(())
    }

    /// Full step: indicators, position upkeep, pending-order fill, decision,
    /// execution, stats.
    async fn process_candle(
        &mut self,
        index: usize,
        candle: Candle,
        force_reason: Option<String>,
    ) -> Result<()> {
        debug!(
            "Processing candle {}/{}: timestamp={}, close={}",
            index + 1,
            self.state.candles.len(),
            candle.timestamp,
            candle.close
        );

        let indicators = self.state.indicators_at(index);
        self.emit_candle(candle, indicators.clone(), index as i64).await;

        self.update_open_position(index, candle).await?;
        self.try_fill_pending_order(index, candle).await?;

        let decision = self.resolve_decision(index, candle, &indicators, force_reason).await;

        self.journal_thought(index, candle, &indicators, &decision);
        self.emit_decision(index, &decision).await;
        self.execute_decision(index, candle, &decision).await?;

        let stats = self.state.positions.stats();
        self.state.record_equity(candle.timestamp, stats.current_equity);
        self.bus
            .publish(
                &self.state.session_id,
                EventKind::StatsUpdate(StatsUpdatePayload {
                    stats: stats.clone(),
                    current_candle: Some(index + 1),
                    total_candles: Some(self.state.candles.len()),
                }),
            )
            .await;
        self.flush_runtime_stats(index).await?;
        Ok(())
    }

    /// Fast-forward: SL/TP and pending-order upkeep only. The candle is
    /// still broadcast (without indicators) so charts progress smoothly, and
    /// runtime stats are flushed in batches.
    async fn fast_forward_candle(&mut self, index: usize, candle: Candle) -> Result<()> {
        self.update_open_position(index, candle).await?;
        self.try_fill_pending_order(index, candle).await?;

        let stats = self.state.positions.stats();
        self.state.record_equity(candle.timestamp, stats.current_equity);

        self.emit_candle(candle, IndicatorMap::new(), index as i64).await;

        if index % FAST_FORWARD_FLUSH_INTERVAL == 0 {
            self.flush_runtime_stats(index).await?;
            self.bus
                .publish(
                    &self.state.session_id,
                    EventKind::StatsUpdate(StatsUpdatePayload {
                        stats,
                        current_candle: Some(index + 1),
                        total_candles: Some(self.state.candles.len()),
                    }),
                )
                .await;
        }
        Ok(())
    }

    /// Applies SL/TP checks for the open position, persisting and
    /// broadcasting the close when one triggers.
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

    /// Path-aware pending-order fill: the order fills on the first candle
    /// whose range brackets the entry price.
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

    /// Chooses between a real LLM call and a synthesized HOLD for this full
    /// step, honoring force overrides, runtime readiness, and the
    /// low-volatility skip.
    async fn resolve_decision(
        &mut self,
        index: usize,
        candle: Candle,
        indicators: &IndicatorMap,
        force_reason: Option<String>,
    ) -> Decision {
        let indicators_ready = self
            .state
            .pipeline
            .is_ready(index, RUNTIME_READINESS_THRESHOLD);
        let forced = force_reason.is_some();

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
        } else if !self.state.positions.has_open_position()
            && let Some(reason) = low_volatility_skip_reason(&self.state, index, indicators)
        {
            skip_reason = Some(format!("SKIPPED (volatility): {reason}"));
            false
        } else {
            true
        };

        if !should_run_ai {
            let reasoning = skip_reason.unwrap_or_else(|| {
                format!("Decision cadence skipped candle {index}")
            });
            let mut decision = Decision::hold(reasoning);
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
            "mode": cadence_name(self.state.cadence),
            "interval": cadence_interval(self.state.cadence),
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
            candle_number: index as i64,
            timestamp: candle.timestamp,
            candle,
            indicators: indicators.clone(),
            reasoning: decision.reasoning.clone(),
            decision: decision.action.to_string(),
            order_data,
            council,
        });
    }

    /// Applies one decision per the execution semantics: CLOSE closes at the
    /// candle close, LONG/SHORT either registers a pending order (explicit
    /// entry price) or opens at the close, HOLD does nothing. A new non-HOLD
    /// decision replaces any parked pending order.
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

    async fn on_position_opened(&self, index: usize) {
        let Some(position) = self.state.positions.position() else {
            return;
        };
        self.bus
            .publish(
                &self.state.session_id,
                EventKind::PositionOpened {
                    candle_number: index as i64,
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
                    candle_number: index as i64,
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
            candle_number: index as i64,
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
                    current_candle: index as i64 + 1,
                },
            )
            .await
    }

    async fn finalize(&mut self, forced_stop: bool) -> Result<String> {
        info!("Completing backtest: session_id={}", self.state.session_id);

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
                false,
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
                    auto_stop: false,
                },
            )
            .await;

        info!(
            "Backtest completed: session_id={}, final_equity={}, pnl={}%",
            self.state.session_id, stats.current_equity, stats.total_pnl_pct
        );
        Ok(result_id)
    }
}

fn cadence_name(cadence: DecisionCadence) -> &'static str {
    match cadence {
        DecisionCadence::EveryCandle => "every_candle",
        DecisionCadence::EveryNCandles(_) => "every_n_candles",
    }
}

fn cadence_interval(cadence: DecisionCadence) -> usize {
    match cadence {
        DecisionCadence::EveryCandle => 1,
        DecisionCadence::EveryNCandles(interval) => interval.max(1),
    }
}
