pub mod api;
pub mod broadcaster;
pub mod constants;
pub mod debug_state;
pub mod hub;
pub mod kv;
pub mod log_store;
pub mod logging;
pub mod main_helper;
pub mod protocol;
pub mod proxy;
pub mod sanitizer;
pub mod str_utils;
pub mod types;
pub mod ws;

pub use types::*;

pub use main_helper::{AppState, Args};
