use crate::constants::{
    DEFAULT_ENTRY_BUDGET_BYTES, DEFAULT_LOG_TTL_SECS, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_LOGS,
};
use crate::hub::DebugHub;
use crate::log_store::LogStoreConfig;
use crate::proxy::ProxyForwarder;
use crate::types::DebugState;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "PORT", default_value_t = 8787)]
    pub port: u16,
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, env = "TARGET_URL", default_value = "https://httpbin.org")]
    pub target_url: String,
    #[arg(
        long,
        env = "DEBUG",
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub debug: bool,
    #[arg(long, env = "KV_REST_API_URL")]
    pub kv_rest_url: Option<String>,
    #[arg(long, env = "KV_REST_API_TOKEN", hide_env_values = true)]
    pub kv_rest_token: Option<String>,
    #[arg(long, env = "MAX_LOGS", default_value_t = DEFAULT_MAX_LOGS)]
    pub max_logs: usize,
    #[arg(long, env = "LOG_TTL_SECS", default_value_t = DEFAULT_LOG_TTL_SECS)]
    pub log_ttl_secs: u64,
    #[arg(long, env = "ENTRY_BUDGET_BYTES", default_value_t = DEFAULT_ENTRY_BUDGET_BYTES)]
    pub entry_budget_bytes: usize,
    #[arg(long, env = "MAX_BODY_SIZE", default_value_t = DEFAULT_MAX_BODY_SIZE)]
    pub max_body_size: usize,
    #[arg(long, env = "REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(
        long,
        env = "FOLLOW_REDIRECTS",
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub follow_redirects: bool,
    #[arg(
        long,
        env = "ALWAYS_CAPTURE",
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub always_capture: bool,
    #[arg(long, env = "LOG_DIR", default_value = "logs")]
    pub log_dir: String,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            port: 8787,
            host: "127.0.0.1".to_string(),
            target_url: "https://httpbin.org".to_string(),
            debug: false,
            kv_rest_url: None,
            kv_rest_token: None,
            max_logs: DEFAULT_MAX_LOGS,
            log_ttl_secs: DEFAULT_LOG_TTL_SECS,
            entry_budget_bytes: DEFAULT_ENTRY_BUDGET_BYTES,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            request_timeout_secs: None,
            connect_timeout_secs: 10,
            follow_redirects: true,
            always_capture: false,
            log_dir: "logs".to_string(),
        }
    }
}

impl Args {
    pub fn initial_state(&self) -> DebugState {
        DebugState {
            enabled: self.debug,
            target_url: self.target_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn log_store_config(&self) -> LogStoreConfig {
        LogStoreConfig {
            max_logs: self.max_logs.max(1),
            ttl_secs: self.log_ttl_secs,
            entry_budget_bytes: self.entry_budget_bytes,
        }
    }

    /// Both URL and token are needed to talk to the external store.
    pub fn kv_credentials(&self) -> Option<(&str, &str)> {
        match (self.kv_rest_url.as_deref(), self.kv_rest_token.as_deref()) {
            (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => Some((url, token)),
            _ => None,
        }
    }

    pub fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        let redirect = if self.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let mut builder = reqwest::Client::builder()
            .redirect(redirect)
            .connect_timeout(std::time::Duration::from_secs(self.connect_timeout_secs))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_keepalive(Some(std::time::Duration::from_secs(60)));
        if let Some(secs) = self.request_timeout_secs {
            builder = builder.timeout(std::time::Duration::from_secs(secs));
        }
        builder.build()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<DebugHub>,
    pub forwarder: Arc<ProxyForwarder>,
    pub args: Arc<Args>,
}

impl AppState {
    pub fn new(hub: DebugHub, client: reqwest::Client, args: Args) -> Self {
        let forwarder = ProxyForwarder::new(client, args.always_capture, args.max_body_size);
        Self {
            hub: Arc::new(hub),
            forwarder: Arc::new(forwarder),
            args: Arc::new(args),
        }
    }
}
