use std::time::Duration;

use crate::ResolveError;

pub const DEFAULT_PROFILE_URL: &str = "https://sessionserver.mojang.com/session/minecraft/profile";
pub const DEFAULT_HISTORY_URL: &str = "https://api.mojang.com/user/profiles";

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Overrides the active run.
    pub run_id: Option<i64>,
    pub refresh_days: u32,
    pub max_requests: usize,
    pub sleep: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub profile_url: String,
    pub history_url: String,
    pub dry_run: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            refresh_days: 30,
            max_requests: 1500,
            sleep: Duration::from_millis(150),
            http_timeout: Duration::from_secs(12),
            user_agent: "mcstats-name-resolver/0.1".to_string(),
            profile_url: DEFAULT_PROFILE_URL.to_string(),
            history_url: DEFAULT_HISTORY_URL.to_string(),
            dry_run: false,
        }
    }
}

impl ResolverConfig {
    pub fn from_env() -> Result<Self, ResolveError> {
        let defaults = Self::default();
        Ok(Self {
            run_id: None,
            refresh_days: env_parse("MCSTATS_REFRESH_DAYS", defaults.refresh_days)?,
            max_requests: env_parse("MCSTATS_MAX_REQUESTS", defaults.max_requests)?,
            sleep: Duration::from_millis(env_parse("MCSTATS_SLEEP_MS", 150u64)?),
            http_timeout: Duration::from_secs(env_parse("MCSTATS_HTTP_TIMEOUT_SECS", 12u64)?.max(1)),
            user_agent: std::env::var("MCSTATS_USER_AGENT").unwrap_or(defaults.user_agent),
            profile_url: std::env::var("MCSTATS_PROFILE_URL").unwrap_or(defaults.profile_url),
            history_url: std::env::var("MCSTATS_HISTORY_URL").unwrap_or(defaults.history_url),
            dry_run: std::env::var("MCSTATS_DRY_RUN")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(false),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ResolveError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ResolveError::Config(format!("{key} has an invalid value: {raw:?}"))),
        _ => Ok(default),
    }
}
