use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::motivation::engine::{
    DEFAULT_RESOURCE_COST, DEFAULT_SUCCESS_PROBABILITY, MOTIVATION_MAX_VALUE,
};
use crate::motivation::{MotivationSettings, DEFAULT_MOTIVATION_THRESHOLD};
use crate::needs::NeedType;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotivationConfig {
    #[serde(default = "default_motivation_threshold")]
    pub threshold: f64,
    #[serde(default = "default_success_probability")]
    pub success_probability: f64,
    #[serde(default = "default_resource_cost")]
    pub resource_cost: f64,
    /// Lifetime of new motivations. Unset means they never expire.
    #[serde(default)]
    pub ttl_hours: Option<u64>,
    #[serde(default = "default_accumulation_interval_minutes")]
    pub accumulation_interval_minutes: i64,
    /// Overrides of the per-need accumulation rate, keyed by need type name.
    #[serde(default)]
    pub accumulation_rates: BTreeMap<String, f64>,
}

fn default_motivation_threshold() -> f64 {
    DEFAULT_MOTIVATION_THRESHOLD
}

fn default_success_probability() -> f64 {
    DEFAULT_SUCCESS_PROBABILITY
}

fn default_resource_cost() -> f64 {
    DEFAULT_RESOURCE_COST
}

fn default_accumulation_interval_minutes() -> i64 {
    5
}

impl Default for MotivationConfig {
    fn default() -> Self {
        Self {
            threshold: default_motivation_threshold(),
            success_probability: default_success_probability(),
            resource_cost: default_resource_cost(),
            ttl_hours: None,
            accumulation_interval_minutes: default_accumulation_interval_minutes(),
            accumulation_rates: BTreeMap::new(),
        }
    }
}

impl MotivationConfig {
    /// Threshold on the 0-100 motivation scale. Values above the cap could
    /// never be reached, so they are lowered to it; non-positive or
    /// non-finite values fall back to the default.
    pub fn effective_threshold(&self) -> f64 {
        let threshold = self.threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            tracing::warn!(
                "Invalid motivation threshold {}, using {}",
                threshold,
                DEFAULT_MOTIVATION_THRESHOLD
            );
            return DEFAULT_MOTIVATION_THRESHOLD;
        }
        if threshold > MOTIVATION_MAX_VALUE {
            tracing::warn!(
                "Motivation threshold {} exceeds the maximum value, using {}",
                threshold,
                MOTIVATION_MAX_VALUE
            );
            return MOTIVATION_MAX_VALUE;
        }
        threshold
    }

    /// Lifetime of new motivations, or `None` when unset or too large to
    /// represent.
    pub fn ttl(&self) -> Option<ChronoDuration> {
        let hours = self.ttl_hours?;
        let ttl = i64::try_from(hours).ok().and_then(ChronoDuration::try_hours);
        if ttl.is_none() {
            tracing::warn!("Motivation ttl_hours {} is out of range; motivations will not expire", hours);
        }
        ttl
    }

    /// Typed rate overrides. Unknown need names are logged and dropped.
    pub fn rate_overrides(&self) -> HashMap<NeedType, f64> {
        let mut rates = HashMap::new();
        for (name, rate) in &self.accumulation_rates {
            match NeedType::from_db(name) {
                Some(need_type) if rate.is_finite() && *rate >= 0.0 => {
                    rates.insert(need_type, *rate);
                }
                Some(_) => tracing::warn!("Ignoring invalid accumulation rate {} for {}", rate, name),
                None => tracing::warn!("Ignoring accumulation rate for unknown need '{}'", name),
            }
        }
        rates
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CharacterConfig {
    #[serde(default)]
    pub motivation: MotivationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Chat that receives motivation notices.
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    #[serde(default = "default_telegram_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_telegram_timeout_secs() -> u64 {
    15
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            api_base: default_telegram_api_base(),
            timeout_secs: default_telegram_timeout_secs(),
        }
    }
}

impl TelegramConfig {
    pub fn is_enabled(&self) -> bool {
        self.bot_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
            && self.chat_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_delay_ms: default_retry_initial_delay_ms(),
            factor: default_retry_factor(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            factor: self.factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Needs simulation
    #[serde(default = "default_needs_tick_minutes")]
    pub needs_tick_minutes: i64,
    #[serde(default = "default_growth_batch_size")]
    pub growth_batch_size: usize,

    // Scheduler and caches
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,
    #[serde(default = "default_character_cache_ttl_secs")]
    pub character_cache_ttl_secs: u64,

    #[serde(default)]
    pub character: CharacterConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_database_path() -> String {
    "companion.db".to_string()
}

fn default_needs_tick_minutes() -> i64 {
    60
}

fn default_growth_batch_size() -> usize {
    10
}

fn default_scheduler_tick_ms() -> u64 {
    1000
}

fn default_character_cache_ttl_secs() -> u64 {
    300
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            needs_tick_minutes: default_needs_tick_minutes(),
            growth_batch_size: default_growth_batch_size(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
            character_cache_ttl_secs: default_character_cache_ttl_secs(),
            character: CharacterConfig::default(),
            telegram: TelegramConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl CompanionConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("companion_config.toml")
    }

    /// Load companion_config.toml from next to the executable, falling back to
    /// defaults + env vars when it is missing or unparseable.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<CompanionConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for the known keys.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("COMPANION_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Some(threshold) = lookup("COMPANION_MOTIVATION_THRESHOLD") {
            if let Ok(value) = threshold.trim().parse() {
                config.character.motivation.threshold = value;
            }
        }

        if let Some(minutes) = lookup("COMPANION_NEEDS_TICK_MINUTES") {
            if let Ok(value) = minutes.trim().parse() {
                config.needs_tick_minutes = value;
            }
        }

        if let Some(hours) = lookup("COMPANION_MOTIVATION_TTL_HOURS") {
            if let Ok(value) = hours.trim().parse() {
                config.character.motivation.ttl_hours = Some(value);
            }
        }

        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            if !token.trim().is_empty() {
                config.telegram.bot_token = Some(token);
            }
        }

        if let Some(chat_id) = lookup("TELEGRAM_CHAT_ID") {
            if let Ok(value) = chat_id.trim().parse() {
                config.telegram.chat_id = Some(value);
            }
        }

        config
    }

    pub fn needs_tick(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.needs_tick_minutes.max(1))
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(10))
    }

    pub fn character_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.character_cache_ttl_secs)
    }

    pub fn motivation_settings(&self) -> MotivationSettings {
        let motivation = &self.character.motivation;
        MotivationSettings {
            threshold: motivation.effective_threshold(),
            accumulation_rates: motivation.rate_overrides(),
            success_probability: motivation.success_probability.clamp(0.0, 100.0),
            resource_cost: motivation.resource_cost,
            ttl: motivation.ttl(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_is_filled_with_defaults() {
        let config: CompanionConfig = toml::from_str(
            r#"
            database_path = "/var/lib/companion/state.db"

            [character.motivation]
            threshold = 80.0
            ttl_hours = 48

            [character.motivation.accumulation_rates]
            fun = 5.0
            boredom = 2.0
            "#,
        )
        .expect("parse");

        assert_eq!(config.database_path, "/var/lib/companion/state.db");
        assert_eq!(config.needs_tick_minutes, 60);
        assert_eq!(config.growth_batch_size, 10);
        assert!(!config.telegram.is_enabled());

        let settings = config.motivation_settings();
        assert_eq!(settings.threshold, 80.0);
        assert_eq!(settings.success_probability, DEFAULT_SUCCESS_PROBABILITY);
        assert_eq!(settings.ttl, Some(ChronoDuration::hours(48)));
        assert_eq!(settings.accumulation_rates.get(&NeedType::Fun), Some(&5.0));
        assert_eq!(settings.accumulation_rates.len(), 1);
    }

    #[test]
    fn env_lookup_overrides_defaults() {
        let vars = HashMap::from([
            ("COMPANION_DATABASE_PATH", "other.db"),
            ("COMPANION_MOTIVATION_THRESHOLD", "65.5"),
            ("COMPANION_NEEDS_TICK_MINUTES", "not a number"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_CHAT_ID", "-100200300"),
        ]);
        let config = CompanionConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.database_path, "other.db");
        assert_eq!(config.character.motivation.threshold, 65.5);
        assert_eq!(config.needs_tick_minutes, 60);
        assert_eq!(config.telegram.chat_id, Some(-100200300));
        assert!(config.telegram.is_enabled());
    }

    #[test]
    fn threshold_is_kept_on_the_motivation_scale() {
        let mut config = CompanionConfig::default();
        for (raw, expected) in [
            (150.0, 100.0),
            (100.0, 100.0),
            (42.5, 42.5),
            (0.0, DEFAULT_MOTIVATION_THRESHOLD),
            (-5.0, DEFAULT_MOTIVATION_THRESHOLD),
            (f64::NAN, DEFAULT_MOTIVATION_THRESHOLD),
        ] {
            config.character.motivation.threshold = raw;
            assert_eq!(config.motivation_settings().threshold, expected, "raw {}", raw);
        }

        let vars = HashMap::from([("COMPANION_MOTIVATION_THRESHOLD", "250")]);
        let from_env = CompanionConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(from_env.motivation_settings().threshold, 100.0);
    }

    #[test]
    fn out_of_range_ttl_disables_expiry() {
        let mut config = CompanionConfig::default();
        config.character.motivation.ttl_hours = Some(u64::MAX);
        assert_eq!(config.motivation_settings().ttl, None);
        config.character.motivation.ttl_hours = Some(i64::MAX as u64);
        assert_eq!(config.motivation_settings().ttl, None);
        config.character.motivation.ttl_hours = Some(72);
        assert_eq!(config.motivation_settings().ttl, Some(ChronoDuration::hours(72)));
    }

    #[test]
    fn serialized_form_parses_back() {
        let mut config = CompanionConfig::default();
        config
            .character
            .motivation
            .accumulation_rates
            .insert("rest".to_string(), 0.75);
        let text = toml::to_string_pretty(&config).expect("serialize");
        let parsed: CompanionConfig = toml::from_str(&text).expect("parse");
        assert_eq!(
            parsed.character.motivation.rate_overrides().get(&NeedType::Rest),
            Some(&0.75)
        );
    }
}
