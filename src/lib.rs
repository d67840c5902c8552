pub mod backoff;
pub mod constants;
pub mod decoder;
pub mod filter;
pub mod grounding;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod orchestrator;
pub mod parser;
pub mod prompts;
pub mod redaction;
pub mod relay;
pub mod server;
pub mod str_utils;
pub mod tracker;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
