pub mod candle;
pub mod timeframe;

pub use candle::{Candle, PriceTicker};
pub use timeframe::{PlaybackSpeed, Timeframe};
