use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub directory_url: String,
    pub directory_api_key: String,
    pub redis_url: Option<String>,
    pub response_deadline_hours: i64,
    pub reservation_ttl_seconds: i64,
    pub reschedule_hold_hours: i64,
    pub max_reschedules: u32,
    pub sweep_interval_seconds: u64,
    pub max_retry_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            directory_url: String::new(),
            directory_api_key: String::new(),
            redis_url: None,
            response_deadline_hours: 24,
            reservation_ttl_seconds: 300,
            reschedule_hold_hours: 24,
            max_reschedules: 2,
            sweep_interval_seconds: 60,
            max_retry_attempts: 3,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            directory_url: env::var("DIRECTORY_URL")
                .unwrap_or_else(|_| {
                    warn!("DIRECTORY_URL not set, using empty value");
                    String::new()
                }),
            directory_api_key: env::var("DIRECTORY_API_KEY")
                .unwrap_or_else(|_| {
                    warn!("DIRECTORY_API_KEY not set, using empty value");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            response_deadline_hours: parse_or("BOOKING_RESPONSE_DEADLINE_HOURS", defaults.response_deadline_hours),
            reservation_ttl_seconds: parse_or("BOOKING_RESERVATION_TTL_SECONDS", defaults.reservation_ttl_seconds),
            reschedule_hold_hours: parse_or("BOOKING_RESCHEDULE_HOLD_HOURS", defaults.reschedule_hold_hours),
            max_reschedules: parse_or("BOOKING_MAX_RESCHEDULES", defaults.max_reschedules),
            sweep_interval_seconds: parse_or("BOOKING_SWEEP_INTERVAL_SECONDS", defaults.sweep_interval_seconds),
            max_retry_attempts: parse_or("BOOKING_MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts),
        };

        if !config.is_directory_configured() {
            warn!("Provider directory not configured - missing environment variables");
        }

        config
    }

    pub fn is_directory_configured(&self) -> bool {
        !self.directory_url.is_empty() && !self.directory_api_key.is_empty()
    }
}

fn parse_or<T: FromStr + std::fmt::Display + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value {:?}, using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
