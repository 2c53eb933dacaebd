pub mod calendar;
pub mod domain;
pub mod index;
pub mod ingest;
pub mod reconcile;
pub mod stats;
pub mod storage;

pub mod config {
    use anyhow::Context;

    pub const DEFAULT_CALLS_PER_WINDOW: u32 = 8;
    pub const DEFAULT_WINDOW_SECS: u64 = 60;
    pub const DEFAULT_DAILY_CALL_LIMIT: u32 = 800;
    pub const DEFAULT_DAILY_CALL_BUFFER: u32 = 25;
    pub const DEFAULT_PROBE_SYMBOL: &str = "SPY";
    pub const DEFAULT_INDEX_CODE: &str = "TRTOP25";

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub provider_api_key: Option<String>,
        pub provider_base_url: Option<String>,
        pub provider_name: String,
        pub calls_per_window: u32,
        pub window_secs: u64,
        pub daily_call_limit: u32,
        pub daily_call_buffer: u32,
        pub probe_symbol: String,
        pub index_code: String,
        pub primary_provider: String,
        pub divergence_tolerance: f64,
        pub pipeline_state_dir: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            let provider_name =
                std::env::var("PROVIDER_NAME").unwrap_or_else(|_| "twelvedata".to_string());
            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                provider_api_key: std::env::var("PROVIDER_API_KEY").ok(),
                provider_base_url: std::env::var("PROVIDER_BASE_URL").ok(),
                primary_provider: std::env::var("PRIMARY_PROVIDER")
                    .unwrap_or_else(|_| provider_name.clone()),
                provider_name,
                calls_per_window: env_parse("PROVIDER_CALLS_PER_WINDOW", DEFAULT_CALLS_PER_WINDOW),
                window_secs: env_parse("PROVIDER_WINDOW_SECS", DEFAULT_WINDOW_SECS),
                daily_call_limit: env_parse("PROVIDER_DAILY_CALL_LIMIT", DEFAULT_DAILY_CALL_LIMIT),
                daily_call_buffer: env_parse(
                    "PROVIDER_DAILY_CALL_BUFFER",
                    DEFAULT_DAILY_CALL_BUFFER,
                ),
                probe_symbol: std::env::var("CALENDAR_PROBE_SYMBOL")
                    .unwrap_or_else(|_| DEFAULT_PROBE_SYMBOL.to_string()),
                index_code: std::env::var("INDEX_CODE")
                    .unwrap_or_else(|_| DEFAULT_INDEX_CODE.to_string()),
                divergence_tolerance: env_parse("RECONCILE_DIVERGENCE_TOLERANCE", 0.005_f64),
                pipeline_state_dir: std::env::var("PIPELINE_STATE_DIR").ok(),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_provider_api_key(&self) -> anyhow::Result<&str> {
            self.provider_api_key
                .as_deref()
                .context("PROVIDER_API_KEY is required")
        }

        pub fn require_provider_base_url(&self) -> anyhow::Result<&str> {
            self.provider_base_url
                .as_deref()
                .context("PROVIDER_BASE_URL is required")
        }
    }

    fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
        std::env::var(key)
            .ok()
            .and_then(|s| s.parse::<T>().ok())
            .unwrap_or(default)
    }
}
