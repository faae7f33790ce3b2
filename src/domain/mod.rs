pub mod agent;
pub mod decision;
pub mod errors;
pub mod events;
pub mod market;
pub mod ports;
pub mod repositories;
pub mod trading;
