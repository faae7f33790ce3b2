pub mod database;
pub mod repositories;

pub use database::Database;

use crate::domain::repositories::{
    AgentRepository, ApiKeyRepository, ResultRepository, SessionRepository, ThoughtRepository,
    TradeRepository,
};
use repositories::{
    SqliteAgentRepository, SqliteApiKeyRepository, SqliteResultRepository, SqliteSessionRepository,
    SqliteThoughtRepository, SqliteTradeRepository,
};
use std::sync::Arc;

/// Bundle of repository handles the engines consume. Everything is
/// trait-object based so tests can substitute fakes per repository.
#[derive(Clone)]
pub struct Repositories {
    pub agents: Arc<dyn AgentRepository>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub trades: Arc<dyn TradeRepository>,
    pub thoughts: Arc<dyn ThoughtRepository>,
    pub results: Arc<dyn ResultRepository>,
}

impl Repositories {
    pub fn sqlite(db: &Database) -> Self {
        Self {
            agents: Arc::new(SqliteAgentRepository::new(db.pool.clone())),
            api_keys: Arc::new(SqliteApiKeyRepository::new(db.pool.clone())),
            sessions: Arc::new(SqliteSessionRepository::new(db.pool.clone())),
            trades: Arc::new(SqliteTradeRepository::new(db.pool.clone())),
            thoughts: Arc::new(SqliteThoughtRepository::new(db.pool.clone())),
            results: Arc::new(SqliteResultRepository::new(db.pool.clone())),
        }
    }
}
