use serde::Deserialize;
use std::time::Duration;

/// Which enrichment stages run. Skip-trace always runs; the downstream
/// stages are independently toggleable. A disabled stage passes contacts
/// through with its flags left unknown.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StageToggles {
    pub phone_verification: bool,
    pub dnc: bool,
    pub tcpa: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        StageToggles {
            phone_verification: true,
            dnc: true,
            tcpa: true,
        }
    }
}

/// Exponential backoff settings for chunk submission retries.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt numbered `attempt` (0-based, after the
    /// first failure).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        self.base_delay.mul_f64(factor)
    }
}

/// Polling cadence for asynchronous jobs. Exhausting `max_attempts`
/// transitions the job to TimedOut.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PollPolicy {
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            interval: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

/// Dedup safety thresholds. When the population rate of a grouping field
/// falls below `min_population_rate`, or any group grows past
/// `max_group_size`, dedup degrades to identity mapping rather than risking
/// cross-assignment of contacts between unrelated people.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DedupSafety {
    pub min_population_rate: f64,
    pub max_group_size: usize,
}

impl Default for DedupSafety {
    fn default() -> Self {
        DedupSafety {
            min_population_rate: 0.8,
            max_group_size: 100,
        }
    }
}

/// Per-unit billing rates in dollars. One table shared by the dry-run and
/// post-hoc estimators so the two can never drift.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CostTable {
    /// Billed per matched skip-trace record.
    pub skip_trace_per_match: f64,
    /// Billed per phone passed through verification.
    pub verification_per_phone: f64,
    /// Billed per phone checked against the DNC registry.
    pub dnc_per_phone: f64,
    /// Billed per phone checked for TCPA litigation risk.
    pub tcpa_per_phone: f64,
}

impl Default for CostTable {
    fn default() -> Self {
        CostTable {
            skip_trace_per_match: 0.07,
            verification_per_phone: 0.01,
            dnc_per_phone: 0.005,
            tcpa_per_phone: 0.01,
        }
    }
}

/// How results come back from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Submit returns results inline.
    Sync,
    /// Submit returns a job id; the tracker polls until terminal.
    Poll,
    /// Submit returns a job id; the provider POSTs the payload back.
    Webhook,
}

/// Immutable engine configuration, injected at construction. No
/// process-wide mutable state.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub provider_base_url: String,
    pub provider_api_key: String,
    pub delivery_mode: DeliveryMode,
    /// Records per provider request, provider caps this at 100.
    pub batch_size: usize,
    /// Concurrent chunk submissions in flight.
    pub max_in_flight: usize,
    pub stages: StageToggles,
    /// When true, TCPA-flagged numbers stay in the callable projection.
    pub include_tcpa_blacklisted: bool,
    pub phone_slot_cap: usize,
    pub email_slot_cap: usize,
    pub unmatched_name_cap: usize,
    /// Jaro-Winkler similarity threshold for name matching, 0..1.
    pub name_match_threshold: f64,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
    /// Per-call HTTP timeout, distinct from the job-level polling budget.
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    pub dedup_safety: DedupSafety,
    pub costs: CostTable,
    /// Assumed phones per matched record, used only by dry-run estimates.
    pub assumed_phones_per_match: f64,
    /// Assumed match rate for dry-run estimates, 0..1.
    pub assumed_match_rate: f64,
    /// TTL for the cross-run result cache; zero disables caching.
    #[serde(with = "duration_millis")]
    pub result_cache_ttl: Duration,
    /// Shared secret expected in webhook deliveries, if configured.
    pub webhook_secret: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            provider_base_url: "https://api.skiptrace.example.com".to_string(),
            provider_api_key: String::new(),
            delivery_mode: DeliveryMode::Sync,
            batch_size: 100,
            max_in_flight: 4,
            stages: StageToggles::default(),
            include_tcpa_blacklisted: false,
            phone_slot_cap: 10,
            email_slot_cap: 10,
            unmatched_name_cap: 8,
            name_match_threshold: 0.85,
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            request_timeout: Duration::from_secs(30),
            dedup_safety: DedupSafety::default(),
            costs: CostTable::default(),
            assumed_phones_per_match: 3.0,
            assumed_match_rate: 0.7,
            result_cache_ttl: Duration::ZERO,
            webhook_secret: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = EngineConfig {
            provider_base_url: std::env::var("SKIPTRACE_BASE_URL")
                .map_err(|_| anyhow::anyhow!("SKIPTRACE_BASE_URL environment variable required"))
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("SKIPTRACE_BASE_URL cannot be empty");
                    }
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        anyhow::bail!("SKIPTRACE_BASE_URL must start with http:// or https://");
                    }
                    Ok(url)
                })?,
            provider_api_key: std::env::var("SKIPTRACE_API_KEY")
                .map_err(|_| anyhow::anyhow!("SKIPTRACE_API_KEY environment variable required"))
                .and_then(|key| {
                    if key.trim().is_empty() {
                        anyhow::bail!("SKIPTRACE_API_KEY cannot be empty");
                    }
                    Ok(key)
                })?,
            ..EngineConfig::default()
        };

        if let Ok(mode) = std::env::var("SKIPTRACE_DELIVERY_MODE") {
            config.delivery_mode = match mode.to_lowercase().as_str() {
                "sync" => DeliveryMode::Sync,
                "poll" => DeliveryMode::Poll,
                "webhook" => DeliveryMode::Webhook,
                other => anyhow::bail!(
                    "SKIPTRACE_DELIVERY_MODE must be sync|poll|webhook, got '{}'",
                    other
                ),
            };
        }

        if let Ok(size) = std::env::var("SKIPTRACE_BATCH_SIZE") {
            config.batch_size = size
                .parse()
                .map_err(|_| anyhow::anyhow!("SKIPTRACE_BATCH_SIZE must be a number"))?;
        }

        config.webhook_secret = std::env::var("SKIPTRACE_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());

        config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;

        tracing::info!("Engine configuration loaded successfully");
        tracing::debug!("Provider base URL: {}", config.provider_base_url);
        tracing::debug!(
            "Delivery mode: {:?}, batch size: {}, max in flight: {}",
            config.delivery_mode,
            config.batch_size,
            config.max_in_flight
        );

        Ok(config)
    }

    /// Rejects configurations the provider or the engine cannot honor.
    pub fn validate(&self) -> Result<(), crate::errors::EngineError> {
        use crate::errors::EngineError;

        if url::Url::parse(&self.provider_base_url).is_err() {
            return Err(EngineError::Config(format!(
                "provider_base_url is not a valid URL: {}",
                self.provider_base_url
            )));
        }
        if self.batch_size == 0 || self.batch_size > 100 {
            return Err(EngineError::Config(format!(
                "batch_size must be 1..=100, got {}",
                self.batch_size
            )));
        }
        if self.max_in_flight == 0 {
            return Err(EngineError::Config("max_in_flight must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.name_match_threshold) {
            return Err(EngineError::Config(format!(
                "name_match_threshold must be within 0..=1, got {}",
                self.name_match_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.dedup_safety.min_population_rate) {
            return Err(EngineError::Config(
                "dedup_safety.min_population_rate must be within 0..=1".into(),
            ));
        }
        if self.phone_slot_cap == 0 || self.email_slot_cap == 0 {
            return Err(EngineError::Config("slot caps must be >= 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.assumed_match_rate) {
            return Err(EngineError::Config(format!(
                "assumed_match_rate must be within 0..=1, got {}",
                self.assumed_match_rate
            )));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
