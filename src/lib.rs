//! NewsFlow — asynchronous multi-provider job orchestration.

pub mod classify;
pub mod config;
pub mod error;
pub mod http;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod store;
