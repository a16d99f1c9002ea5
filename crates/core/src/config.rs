use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `TABLETALK__` and TOML config files.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub blackout: BlackoutConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Hours after the visit at which the feedback request is targeted.
    #[serde(default = "default_send_offset_hours")]
    pub send_offset_hours: i64,
    /// The resolved send time is clamped into [min, max] hours after the
    /// visit.
    #[serde(default = "default_min_delay_hours")]
    pub min_delay_hours: i64,
    #[serde(default = "default_max_delay_hours")]
    pub max_delay_hours: i64,
    #[serde(default = "default_scheduler_sweep_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlackoutConfig {
    /// Minutes of padding applied before and after each blackout interval.
    #[serde(default = "default_blackout_buffer_minutes")]
    pub buffer_minutes: i64,
    /// When no window table is available: fail open (allow the send) or
    /// fail closed (treat unknown as blackout). Default closed.
    #[serde(default)]
    pub fail_open: bool,
    /// How far ahead to probe for a permissible instant when the table is
    /// missing and the provider fails closed.
    #[serde(default = "default_unknown_probe_minutes")]
    pub unknown_probe_minutes: i64,
    /// Window tables are re-derived this often (daily in production).
    #[serde(default = "default_window_refresh_secs")]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Global outbound cap, messages per second.
    #[serde(default = "default_max_per_second")]
    pub max_per_second: u64,
    #[serde(default = "default_burst_allowance")]
    pub burst_allowance: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_cap_secs")]
    pub retry_cap_secs: u64,
    /// Jitter applied to each backoff delay, as a fraction of the delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    /// Assistant turns below this confidence escalate the conversation.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Sentiment scores at or below this escalate the conversation.
    #[serde(default = "default_negative_sentiment_threshold")]
    pub negative_sentiment_threshold: f64,
    /// Active conversations with no customer activity for this long are
    /// abandoned by the periodic sweep.
    #[serde(default = "default_inactivity_timeout_hours")]
    pub inactivity_timeout_hours: i64,
    #[serde(default = "default_conversation_sweep_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Cool-down for alert deduplication when the triggering event has no
    /// campaign window to derive one from.
    #[serde(default = "default_dedup_cooldown_hours")]
    pub dedup_cooldown_hours: i64,
}

fn default_send_offset_hours() -> i64 {
    3
}
fn default_min_delay_hours() -> i64 {
    2
}
fn default_max_delay_hours() -> i64 {
    4
}
fn default_scheduler_sweep_secs() -> u64 {
    300
}
fn default_blackout_buffer_minutes() -> i64 {
    10
}
fn default_unknown_probe_minutes() -> i64 {
    30
}
fn default_window_refresh_secs() -> u64 {
    86_400
}
fn default_max_per_second() -> u64 {
    80
}
fn default_burst_allowance() -> u64 {
    20
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_base_secs() -> u64 {
    1
}
fn default_retry_cap_secs() -> u64 {
    30
}
fn default_jitter_ratio() -> f64 {
    0.2
}
fn default_call_timeout_secs() -> u64 {
    10
}
fn default_claim_batch_size() -> usize {
    32
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_confidence_threshold() -> f64 {
    0.5
}
fn default_negative_sentiment_threshold() -> f64 {
    -0.5
}
fn default_inactivity_timeout_hours() -> i64 {
    36
}
fn default_conversation_sweep_secs() -> u64 {
    600
}
fn default_dedup_cooldown_hours() -> i64 {
    24
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            send_offset_hours: default_send_offset_hours(),
            min_delay_hours: default_min_delay_hours(),
            max_delay_hours: default_max_delay_hours(),
            sweep_interval_secs: default_scheduler_sweep_secs(),
        }
    }
}

impl Default for BlackoutConfig {
    fn default() -> Self {
        Self {
            buffer_minutes: default_blackout_buffer_minutes(),
            fail_open: false,
            unknown_probe_minutes: default_unknown_probe_minutes(),
            refresh_interval_secs: default_window_refresh_secs(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_per_second: default_max_per_second(),
            burst_allowance: default_burst_allowance(),
            max_attempts: default_max_attempts(),
            retry_base_secs: default_retry_base_secs(),
            retry_cap_secs: default_retry_cap_secs(),
            jitter_ratio: default_jitter_ratio(),
            call_timeout_secs: default_call_timeout_secs(),
            claim_batch_size: default_claim_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            negative_sentiment_threshold: default_negative_sentiment_threshold(),
            inactivity_timeout_hours: default_inactivity_timeout_hours(),
            sweep_interval_secs: default_conversation_sweep_secs(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            dedup_cooldown_hours: default_dedup_cooldown_hours(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            blackout: BlackoutConfig::default(),
            dispatch: DispatchConfig::default(),
            conversation: ConversationConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("TABLETALK")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
