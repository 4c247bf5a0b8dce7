/// Ring buffer capacity when `MAX_LOGS` is not configured.
pub const DEFAULT_MAX_LOGS: usize = 100;

/// Shared expiry for mirrored log entries and the id list (12 hours).
pub const DEFAULT_LOG_TTL_SECS: u64 = 12 * 60 * 60;

/// Expiry for the mirrored debug flag while debug mode is on.
pub const DEBUG_ON_TTL_SECS: u64 = DEFAULT_LOG_TTL_SECS;

/// Expiry for the mirrored debug flag while debug mode is off.
pub const DEBUG_OFF_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Expiry for the mirrored upstream target.
pub const PROXY_CONFIG_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// External store keys
pub const DEBUG_STATE_KEY: &str = "debugState";
pub const PROXY_CONFIG_KEY: &str = "proxyConfig";
pub const LOG_IDS_KEY: &str = "logIds";
pub const LOG_ENTRY_PREFIX: &str = "logs:";

/// Upper bound for a single mirrored entry (external store value limit).
pub const DEFAULT_ENTRY_BUDGET_BYTES: usize = 1_000_000;

/// Space kept free in the entry budget for everything except the two bodies.
pub const ENTRY_HEADROOM_BYTES: usize = 16 * 1024;

/// Shortest run of base64 alphabet characters that gets collapsed.
pub const BASE64_RUN_MIN: usize = 80;

/// Default body read limit while capturing.
pub const DEFAULT_MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

/// Outbound queue depth per viewer; messages beyond it are dropped for that viewer.
pub const VIEWER_QUEUE_DEPTH: usize = 256;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// CORS overlay applied to every proxied response.
pub const CORS_ALLOW_ORIGIN: &str = "*";
pub const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
pub const CORS_ALLOW_HEADERS: &str = "*";
