//! Backtest session orchestration: validation, data loading, service wiring,
//! pause/resume/stop control, and stop-from-database recovery.

use crate::application::indicators::IndicatorPipeline;
use crate::application::position_manager::PositionManager;
use crate::application::results::ResultFinalizer;
use crate::application::session::recovery::stop_from_db;
use crate::application::session::state::SessionState;
use crate::application::session::{
    ActiveSessionMap, DecisionCadence, SessionHandle, replay_to_connection,
};
use crate::domain::errors::EngineError;
use crate::domain::events::EventKind;
use crate::domain::market::{Candle, PlaybackSpeed, Timeframe};
use crate::domain::ports::{
    ApiKeyCipher, CouncilSpec, DecisionProviderFactory, MarketDataGateway,
};
use crate::domain::repositories::{SessionRow, SessionStatus, SessionType};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::market_data::exchange_symbol;
use crate::infrastructure::persistence::Repositories;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::processor::BacktestRun;

/// Parameters of one backtest session.
#[derive(Debug, Clone)]
pub struct BacktestRequest {
    pub session_id: String,
    pub agent_id: Uuid,
    pub asset: String,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub starting_capital: f64,
    pub safety_mode: bool,
    pub allow_leverage: bool,
    pub playback_speed: PlaybackSpeed,
    pub cadence: DecisionCadence,
    /// Fraction of indicators that must be ready before the first LLM call.
    pub readiness_threshold: f64,
    pub council: Option<CouncilSpec>,
}

pub struct BacktestEngine {
    repos: Repositories,
    bus: EventBus,
    gateway: Arc<dyn MarketDataGateway>,
    cipher: Arc<dyn ApiKeyCipher>,
    providers: Arc<dyn DecisionProviderFactory>,
    finalizer: Arc<ResultFinalizer>,
    active: ActiveSessionMap,
}

impl BacktestEngine {
    pub fn new(
        repos: Repositories,
        bus: EventBus,
        gateway: Arc<dyn MarketDataGateway>,
        cipher: Arc<dyn ApiKeyCipher>,
        providers: Arc<dyn DecisionProviderFactory>,
    ) -> Self {
        let finalizer = Arc::new(ResultFinalizer::new(repos.results.clone()));
        info!("BacktestEngine initialized");
        Self {
            repos,
            bus,
            gateway,
            cipher,
            providers,
            finalizer,
            active: ActiveSessionMap::new(),
        }
    }

    pub fn active_sessions(&self) -> &ActiveSessionMap {
        &self.active
    }

    pub async fn is_session_active(&self, session_id: &str) -> bool {
        self.active.contains(session_id).await
    }

    /// Validates, initializes, and launches a backtest driver task.
    pub async fn start(&self, request: BacktestRequest) -> Result<()> {
        info!(
            "Starting backtest: session_id={}, agent_id={}, asset={}, timeframe={}, start={}, end={}",
            request.session_id,
            request.agent_id,
            request.asset,
            request.timeframe,
            request.start.date_naive(),
            request.end.date_naive()
        );

        match self.initialize(&request).await {
            Ok(run) => {
                tokio::spawn(run.run());
                info!("Backtest started successfully: session_id={}", request.session_id);
                Ok(())
            }
            Err(e) => {
                error!("Error starting backtest: {e:#}");
                let _ = self
                    .repos
                    .sessions
                    .update_status(&request.session_id, SessionStatus::Failed)
                    .await;
                self.bus
                    .publish(
                        &request.session_id,
                        EventKind::Error {
                            message: format!("{e:#}"),
                            error_code: None,
                        },
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn initialize(&self, request: &BacktestRequest) -> Result<BacktestRun> {
        validate_parameters(request)?;

        // Never trust the handed-in agent snapshot: reload it so a stale
        // caller cannot resurrect edited or deleted configuration.
        let agent = self
            .repos
            .agents
            .find_by_id(request.agent_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Agent not found: {}", request.agent_id)))?;

        let api_key_id = agent.api_key_id.ok_or_else(|| {
            EngineError::Validation(format!(
                "Agent '{}' does not have an API key configured",
                agent.name
            ))
        })?;
        let api_key_record = self
            .repos
            .api_keys
            .find_by_id(api_key_id)
            .await?
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "Agent '{}' references API key {} which no longer exists",
                    agent.name, api_key_id
                ))
            })?;

        // Make sure a session row exists before the lifecycle updates start.
        if self.repos.sessions.find_by_id(&request.session_id).await?.is_none() {
            let mut row = SessionRow::new(
                &request.session_id,
                agent.id,
                SessionType::Backtest,
                &request.asset,
                request.timeframe.to_string(),
                request.starting_capital,
            );
            row.status = SessionStatus::Configuring;
            self.repos.sessions.create(&row).await?;
        }
        self.repos
            .sessions
            .update_status(&request.session_id, SessionStatus::Initializing)
            .await?;

        info!("Loading historical data for {} {}", request.asset, request.timeframe);
        let candles = self
            .load_candles_with_backoff(&request.asset, request.timeframe, request.start, request.end)
            .await?;
        if candles.is_empty() {
            return Err(EngineError::Validation(format!(
                "No historical data available for {} {} from {} to {}",
                request.asset,
                request.timeframe,
                request.start.date_naive(),
                request.end.date_naive()
            ))
            .into());
        }
        info!("Loaded {} candles for backtest", candles.len());
        self.repos
            .sessions
            .update_total_candles(&request.session_id, candles.len() as i64)
            .await?;

        let pipeline = IndicatorPipeline::new(
            &candles,
            &agent.indicators,
            agent.mode,
            &agent.custom_indicators,
        )
        .context("Failed to build indicator pipeline")?;
        let decision_start_index = pipeline.first_ready_index(request.readiness_threshold);
        info!(
            "Decision start index: {} (readiness threshold {:.0}%)",
            decision_start_index,
            request.readiness_threshold * 100.0
        );

        let positions = PositionManager::new(request.starting_capital, request.safety_mode);

        // Decrypt the credential only now, immediately before client
        // construction.
        let api_key = self.cipher.decrypt(&api_key_record.encrypted_key)?;
        let provider = self
            .providers
            .create(&agent, api_key, request.council.as_ref())
            .await?;
        provider.prepare().await?;

        let handle = SessionHandle::new(SessionType::Backtest);
        self.active.insert(&request.session_id, handle.clone()).await;

        let started_at = Utc::now();
        self.repos
            .sessions
            .update_status(&request.session_id, SessionStatus::Running)
            .await?;
        self.repos
            .sessions
            .update_started_at(&request.session_id, started_at)
            .await?;

        self.bus
            .publish(
                &request.session_id,
                EventKind::SessionInitialized {
                    session_id: request.session_id.clone(),
                    agent_name: agent.name.clone(),
                    agent_mode: agent.mode.to_string(),
                    asset: request.asset.clone(),
                    timeframe: request.timeframe.to_string(),
                    total_candles: Some(candles.len()),
                },
            )
            .await;

        let state = SessionState {
            session_id: request.session_id.clone(),
            council_mode: request.council.is_some(),
            agent,
            asset: request.asset.clone(),
            timeframe: request.timeframe,
            candles,
            current_index: 0,
            positions,
            pipeline,
            provider,
            decision_start_index,
            allow_leverage: request.allow_leverage,
            cadence: request.cadence,
            playback_speed: request.playback_speed,
            thoughts: Vec::new(),
            equity_curve: Vec::new(),
            peak_equity: request.starting_capital,
            max_drawdown_pct: 0.0,
            pending_order: None,
            started_at: Some(started_at),
        };

        Ok(BacktestRun {
            state,
            handle,
            repos: self.repos.clone(),
            bus: self.bus.clone(),
            active: self.active.clone(),
            finalizer: self.finalizer.clone(),
        })
    }

    /// The engine retries gateway fetches with its own exponential backoff
    /// over whatever the gateway throws.
    async fn load_candles_with_backoff(
        &self,
        asset: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let mut delay = Duration::from_millis(500);
        let mut last_error = None;
        for attempt in 0..3 {
            match self.gateway.historical(asset, timeframe, start, end).await {
                Ok(candles) => return Ok(candles),
                Err(e) => {
                    warn!("Historical fetch attempt {} failed: {e:#}", attempt + 1);
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("historical fetch failed")))
    }

    /// Pause a running backtest. Legal only from `running`.
    pub async fn pause(&self, session_id: &str) -> Result<()> {
        let handle = self
            .active
            .get(session_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("Session not found: {session_id}")))?;

        if handle.controls.is_stopped() {
            return Err(EngineError::Validation("Session is already stopping".to_string()).into());
        }
        if handle.controls.is_paused() {
            warn!("Session already paused: {session_id}");
            return Ok(());
        }

        handle.controls.pause();
        self.repos
            .sessions
            .update_status(session_id, SessionStatus::Paused)
            .await?;
        self.repos
            .sessions
            .update_paused_at(session_id, Utc::now())
            .await?;
        self.bus
            .publish(
                session_id,
                EventKind::SessionPaused {
                    session_id: session_id.to_string(),
                    current_index: handle.controls.current_index(),
                },
            )
            .await;
        info!("Backtest paused: session_id={session_id}");
        Ok(())
    }

    /// Resume a paused backtest. Legal only from `paused`.
    pub async fn resume(&self, session_id: &str) -> Result<()> {
        let handle = self
            .active
            .get(session_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("Session not found: {session_id}")))?;

        if !handle.controls.is_paused() {
            warn!("Session not paused: {session_id}");
            return Ok(());
        }

        handle.controls.resume();
        self.repos
            .sessions
            .update_status(session_id, SessionStatus::Running)
            .await?;
        self.bus
            .publish(
                session_id,
                EventKind::SessionResumed {
                    session_id: session_id.to_string(),
                    current_index: handle.controls.current_index(),
                },
            )
            .await;
        info!("Backtest resumed: session_id={session_id}");
        Ok(())
    }

    /// Stop a backtest and return the persisted result id. Works for both
    /// in-memory sessions (the driver finalizes) and database-only state.
    pub async fn stop(&self, session_id: &str, close_position: bool) -> Result<String> {
        if let Some(handle) = self.active.get(session_id).await {
            info!(
                "Stopping backtest: session_id={session_id}, close_position={close_position}"
            );
            handle.controls.stop(close_position);
            let result_id = handle
                .controls
                .wait_for_result()
                .await
                .ok_or_else(|| anyhow!("backtest driver exited without a result"))?;
            if result_id.is_empty() {
                return Err(anyhow!("session {session_id} failed before finalization"));
            }
            return Ok(result_id);
        }
        stop_from_db(&self.repos, &self.bus, &self.finalizer, session_id).await
    }

    /// Catch a reconnecting consumer up with the session's processed
    /// history.
    pub async fn send_history_to_connection(&self, session_id: &str, connection_id: &str) {
        if let Some(handle) = self.active.get(session_id).await {
            replay_to_connection(&self.bus, &handle, connection_id).await;
        }
    }
}

fn validate_parameters(request: &BacktestRequest) -> Result<()> {
    if exchange_symbol(&request.asset).is_none() {
        return Err(EngineError::Validation(format!(
            "Unsupported asset '{}'",
            request.asset
        ))
        .into());
    }
    if request.start >= request.end {
        return Err(EngineError::Validation(format!(
            "start_date ({}) must be before end_date ({})",
            request.start.date_naive(),
            request.end.date_naive()
        ))
        .into());
    }
    if request.start > Utc::now() {
        return Err(EngineError::Validation(format!(
            "start_date ({}) cannot be in the future",
            request.start.date_naive()
        ))
        .into());
    }
    if !request.starting_capital.is_finite() || request.starting_capital < 100.0 {
        return Err(EngineError::Validation(format!(
            "starting_capital must be at least $100, got ${}",
            request.starting_capital
        ))
        .into());
    }
    if !(0.0..=1.0).contains(&request.readiness_threshold) {
        return Err(EngineError::Validation(format!(
            "readiness threshold must be within [0, 1], got {}",
            request.readiness_threshold
        ))
        .into());
    }
    Ok(())
}

