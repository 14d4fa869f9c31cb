// ===============================
// src/config.rs
// ===============================
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Where stream events come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMode {
    /// Random-walk generator, no backend required.
    Mock,
    /// Live `/ws/quotes` + `/ws/ai-trading` off the configured base URL.
    Live,
}

impl FeedMode {
    pub fn from_env(key: &str, default_mode: FeedMode) -> FeedMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => FeedMode::Mock,
            "live" => FeedMode::Live,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Live => "live",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // backend endpoints
    pub rest_base_url: String,
    pub ws_base_url: String,

    // feed selection + mock symbols
    pub feed_mode: FeedMode,
    pub mock_symbols: Vec<String>,

    // cadence
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub flash_duration: Duration,
    pub banner_dismiss: Duration,

    // bounded diagnostics
    pub event_log_capacity: usize,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        env::var(key)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default_secs),
    )
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(
        env::var(key)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default_ms),
    )
}

pub fn load() -> Args {
    // read .env so REST_BASE_URL, RECORD_FILE etc. are picked up
    let _ = dotenv();

    let rest_base_url =
        env::var("REST_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".to_string());
    let ws_base_url = env::var("WS_BASE_URL").unwrap_or_else(|_| {
        // derive ws:// from the REST base when not set explicitly
        rest_base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    });

    let feed_mode = FeedMode::from_env("FEED_MODE", FeedMode::Live);

    // MOCK_SYMBOLS=AAPL.US,TSLA.US
    let mock_symbols: Vec<String> = env::var("MOCK_SYMBOLS")
        .ok()
        .map(|s| {
            s.split(',')
                .map(|x| x.trim())
                .filter(|x| !x.is_empty())
                .map(|x| x.to_ascii_uppercase())
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| vec!["AAPL.US".to_string(), "TSLA.US".to_string()]);

    let poll_interval = env_secs("POLL_INTERVAL_SECS", 10);
    let reconnect_delay = env_secs("RECONNECT_DELAY_SECS", 3);
    let flash_duration = env_millis("FLASH_DURATION_MS", 1_000);
    let banner_dismiss = env_secs("BANNER_DISMISS_SECS", 5);

    let event_log_capacity = env::var("EVENT_LOG_CAPACITY")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    let record_file = env::var("RECORD_FILE").ok();
    let metrics_port = env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9898);

    Args {
        rest_base_url,
        ws_base_url,
        feed_mode,
        mock_symbols,
        poll_interval,
        reconnect_delay,
        flash_duration,
        banner_dismiss,
        event_log_capacity,
        record_file,
        metrics_port,
    }
}
