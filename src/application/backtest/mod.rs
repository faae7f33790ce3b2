pub mod engine;
pub mod processor;

pub use engine::{BacktestEngine, BacktestRequest};
