// Core types and execution engine for Dagflow task graphs

pub mod config;
pub mod error;
pub mod events;
pub mod operator;
pub mod scheduler;
pub mod storage;
pub mod types;
pub mod workflow;

pub use types::*;
