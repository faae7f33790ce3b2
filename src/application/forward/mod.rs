pub mod auto_stop;
pub mod engine;
pub mod processor;
pub mod timing;

pub use auto_stop::AutoStopPolicy;
pub use engine::{ForwardEngine, ForwardRequest};
