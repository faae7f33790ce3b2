//! Forward session orchestration: warm-up sizing and fetch, service wiring,
//! and pause/resume/stop control over the live loop.

use crate::application::indicators::{INITIAL_READINESS_THRESHOLD, IndicatorPipeline};
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
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::auto_stop::AutoStopPolicy;
use super::processor::ForwardRun;

/// Parameters of one forward test session.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub session_id: String,
    pub agent_id: Uuid,
    pub asset: String,
    pub timeframe: Timeframe,
    pub starting_capital: f64,
    pub safety_mode: bool,
    pub allow_leverage: bool,
    pub cadence: DecisionCadence,
    pub auto_stop: AutoStopPolicy,
    pub council: Option<CouncilSpec>,
}

pub struct ForwardEngine {
    repos: Repositories,
    bus: EventBus,
    gateway: Arc<dyn MarketDataGateway>,
    cipher: Arc<dyn ApiKeyCipher>,
    providers: Arc<dyn DecisionProviderFactory>,
    finalizer: Arc<ResultFinalizer>,
    active: ActiveSessionMap,
}

impl ForwardEngine {
    pub fn new(
        repos: Repositories,
        bus: EventBus,
        gateway: Arc<dyn MarketDataGateway>,
        cipher: Arc<dyn ApiKeyCipher>,
        providers: Arc<dyn DecisionProviderFactory>,
    ) -> Self {
        let finalizer = Arc::new(ResultFinalizer::new(repos.results.clone()));
        info!("ForwardEngine initialized");
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

    pub async fn start(&self, request: ForwardRequest) -> Result<()> {
        info!(
            "Starting forward test: session_id={}, agent_id={}, asset={}, timeframe={}",
            request.session_id, request.agent_id, request.asset, request.timeframe
        );

        match self.initialize(&request).await {
            Ok(run) => {
                tokio::spawn(run.run());
                info!(
                    "Forward test started successfully: session_id={}",
                    request.session_id
                );
                Ok(())
            }
            Err(e) => {
                error!("Error starting forward test: {e:#}");
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

    async fn initialize(&self, request: &ForwardRequest) -> Result<ForwardRun> {
        validate_parameters(request)?;

        let agent = self
            .repos
            .agents
            .find_by_id(request.agent_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Agent not found: {}", request.agent_id)))?;
        let api_key_id = agent.api_key_id.ok_or_else(|| {
            EngineError::Validation(format!(
                "Agent '{}' does not have a valid API key",
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

        if self.repos.sessions.find_by_id(&request.session_id).await?.is_none() {
            let row = SessionRow::new(
                &request.session_id,
                agent.id,
                SessionType::Forward,
                &request.asset,
                request.timeframe.to_string(),
                request.starting_capital,
            );
            self.repos.sessions.create(&row).await?;
        }
        self.repos
            .sessions
            .update_status(&request.session_id, SessionStatus::Initializing)
            .await?;

        // Warm-up window sized from the slowest enabled indicator, with a
        // 1.5x stability buffer, clamped per timeframe.
        let max_lookback = IndicatorPipeline::max_enabled_lookback(&agent.indicators);
        let required_candles = request.timeframe.warmup_candles(max_lookback);
        info!(
            "Fetching {} warm-up candles for {} {} (max_lookback={})",
            required_candles, request.asset, request.timeframe, max_lookback
        );

        let end = Utc::now();
        let span_seconds = request.timeframe.to_seconds() * (required_candles as i64 + 2);
        let start = end - ChronoDuration::seconds(span_seconds);
        let mut candles = self
            .load_candles_with_backoff(&request.asset, request.timeframe, start, end)
            .await?;
        if candles.len() > required_candles {
            candles.drain(..candles.len() - required_candles);
        }
        if candles.is_empty() {
            return Err(EngineError::Validation(format!(
                "No warm-up data available for {} {}",
                request.asset, request.timeframe
            ))
            .into());
        }
        info!("Fetched {} warm-up candles", candles.len());

        let pipeline = IndicatorPipeline::new(
            &candles,
            &agent.indicators,
            agent.mode,
            &agent.custom_indicators,
        )
        .context("Failed to build indicator pipeline")?;
        let decision_start_index = pipeline.first_ready_index(INITIAL_READINESS_THRESHOLD);
        info!(
            "Decision start index: {} (warm-up candles: {})",
            decision_start_index,
            candles.len()
        );

        let positions = PositionManager::new(request.starting_capital, request.safety_mode);
        let api_key = self.cipher.decrypt(&api_key_record.encrypted_key)?;
        let provider = self
            .providers
            .create(&agent, api_key, request.council.as_ref())
            .await?;
        provider.prepare().await?;

        let handle = SessionHandle::new(SessionType::Forward);
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
                    total_candles: None,
                },
            )
            .await;

        let warmup_len = candles.len();
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
            playback_speed: PlaybackSpeed::Instant,
            thoughts: Vec::new(),
            equity_curve: Vec::new(),
            peak_equity: request.starting_capital,
            max_drawdown_pct: 0.0,
            pending_order: None,
            started_at: Some(started_at),
        };

        Ok(ForwardRun {
            state,
            warmup_len,
            auto_stop: request.auto_stop,
            handle,
            gateway: self.gateway.clone(),
            repos: self.repos.clone(),
            bus: self.bus.clone(),
            active: self.active.clone(),
            finalizer: self.finalizer.clone(),
        })
    }

    async fn load_candles_with_backoff(
        &self,
        asset: &str,
        timeframe: Timeframe,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let mut delay = Duration::from_millis(500);
        let mut last_error = None;
        for attempt in 0..3 {
            match self.gateway.historical(asset, timeframe, start, end).await {
                Ok(candles) => return Ok(candles),
                Err(e) => {
                    warn!("Warm-up fetch attempt {} failed: {e:#}", attempt + 1);
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("warm-up fetch failed")))
    }

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
        Ok(())
    }

    pub async fn resume(&self, session_id: &str) -> Result<()> {
        let handle = self
            .active
            .get(session_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("Session not found: {session_id}")))?;
        if !handle.controls.is_paused() {
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
        Ok(())
    }

    pub async fn stop(&self, session_id: &str, close_position: bool) -> Result<String> {
        if let Some(handle) = self.active.get(session_id).await {
            info!(
                "Stopping forward test: session_id={session_id}, close_position={close_position}"
            );
            handle.controls.stop(close_position);
            let result_id = handle
                .controls
                .wait_for_result()
                .await
                .ok_or_else(|| anyhow!("forward driver exited without a result"))?;
            if result_id.is_empty() {
                return Err(anyhow!("session {session_id} failed before finalization"));
            }
            return Ok(result_id);
        }
        stop_from_db(&self.repos, &self.bus, &self.finalizer, session_id).await
    }

    pub async fn send_history_to_connection(&self, session_id: &str, connection_id: &str) {
        if let Some(handle) = self.active.get(session_id).await {
            replay_to_connection(&self.bus, &handle, connection_id).await;
        }
    }
}

fn validate_parameters(request: &ForwardRequest) -> Result<()> {
    if exchange_symbol(&request.asset).is_none() {
        return Err(EngineError::Validation(format!(
            "Unsupported asset '{}'",
            request.asset
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
    Ok(())
}
