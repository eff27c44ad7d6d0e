//! Batch enrichment orchestration: validate -> dedup -> submit chunks with
//! bounded concurrency -> drain jobs -> compliance chain -> rejoin ->
//! summary.
//!
//! Chunk submission, polling, and retrieval run as independent tasks; only
//! the final rejoin is order-sensitive and it runs after every job is
//! terminal, so chunk completion order never affects output row order.

use crate::breaker::{create_provider_circuit_breaker, ProviderBreaker};
use crate::compliance::ComplianceChain;
use crate::config::{DeliveryMode, EngineConfig, PollPolicy};
use crate::cost::{self, CostReport};
use crate::dedup::deduplicate;
use crate::errors::EngineError;
use crate::jobs::{CancelHandle, JobTracker};
use crate::models::{
    IdentityKey, InputRecord, JobState, LookupJob, LookupResult, OutputRow, RecordStatus,
};
use crate::provider::{SkipTraceClient, SubmitRow};
use crate::rejoin::{rejoin, RejoinSettings};
use crate::webhook::{DeliveryRegistry, WebhookState};
use failsafe::futures::CircuitBreaker;
use moka::future::Cache;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Coverage and spend accounting for one run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSummary {
    /// Engine-assigned identifier correlating this run's log lines.
    pub run_id: String,
    pub total_records: usize,
    pub matched: usize,
    pub no_match: usize,
    pub invalid: usize,
    /// Unique identities after dedup (submitted plus cache-served).
    pub unique_lookups: usize,
    /// Input rows served by another row's lookup.
    pub duplicates_reused: usize,
    /// Unique identities served from the cross-run cache at zero cost.
    pub cache_hits: usize,
    pub dedup_degraded: bool,
    pub estimated_cost: CostReport,
    pub actual_cost: CostReport,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RunOutcome {
    pub rows: Vec<OutputRow>,
    pub summary: RunSummary,
}

/// The batch enrichment engine. Construct once with an immutable config;
/// `run` may be called repeatedly and concurrently.
pub struct EnrichmentEngine {
    config: EngineConfig,
    client: Arc<SkipTraceClient>,
    breaker: Arc<ProviderBreaker>,
    registry: Arc<DeliveryRegistry>,
    result_cache: Option<Cache<String, LookupResult>>,
    cancel: CancelHandle,
}

impl EnrichmentEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let client = Arc::new(SkipTraceClient::new(&config)?);

        let result_cache = if config.result_cache_ttl.is_zero() {
            None
        } else {
            Some(
                Cache::builder()
                    .time_to_live(config.result_cache_ttl)
                    .max_capacity(100_000)
                    .build(),
            )
        };

        Ok(EnrichmentEngine {
            config,
            client,
            breaker: Arc::new(create_provider_circuit_breaker()),
            registry: Arc::new(DeliveryRegistry::new()),
            result_cache,
            cancel: CancelHandle::new(),
        })
    }

    /// Handle the caller can use to cancel the run between chunks and
    /// between poll cycles. In-flight calls drain rather than abort.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// State for mounting the webhook receiver router when running in
    /// webhook delivery mode.
    pub fn webhook_state(&self) -> WebhookState {
        WebhookState {
            registry: Arc::clone(&self.registry),
            secret: self.config.webhook_secret.clone(),
        }
    }

    /// Pre-flight spend estimate for a record count, using the configured
    /// match-rate and phones-per-match assumptions.
    pub fn estimate_cost(&self, record_count: usize) -> CostReport {
        cost::dry_run(
            &self.config.costs,
            &self.config.stages,
            record_count,
            self.config.assumed_match_rate,
            self.config.assumed_phones_per_match,
        )
    }

    /// Run the full pipeline over a batch of input records.
    ///
    /// Record-level failures land in the output rows; only pipeline-level
    /// failures (auth, fatal config) return `Err`, after letting
    /// already-submitted work drain.
    pub async fn run(&self, records: Vec<InputRecord>) -> Result<RunOutcome, EngineError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let total = records.len();
        tracing::info!("Starting enrichment run {} for {} record(s)", run_id, total);

        // Step 1: validate addresses; failures surface as Invalid rows and
        // are never sent to the provider.
        let mut invalid: HashMap<usize, String> = HashMap::new();
        for (idx, record) in records.iter().enumerate() {
            if !record.address.is_submittable() {
                invalid.insert(
                    idx,
                    "address must provide street+zip or street+city+state".to_string(),
                );
            }
        }
        if !invalid.is_empty() {
            tracing::warn!("{} record(s) failed address validation", invalid.len());
        }

        // Step 2: collapse to unique identities.
        let dedup = deduplicate(&records, &self.config.dedup_safety);

        // Step 3: build the submission set, serving repeat identities from
        // the cross-run cache where enabled.
        let results: Arc<Mutex<HashMap<IdentityKey, LookupResult>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let job_ids: Arc<Mutex<HashMap<IdentityKey, String>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut cache_hits: HashSet<IdentityKey> = HashSet::new();
        let mut to_submit: Vec<(IdentityKey, SubmitRow)> = Vec::new();

        for (idx, key) in dedup.keys.iter().enumerate() {
            if dedup.representative.get(key) != Some(&idx) || invalid.contains_key(&idx) {
                continue;
            }
            if let Some(cache) = &self.result_cache {
                if let Some(hit) = cache.get(&key.token()).await {
                    tracing::debug!("Cache hit for identity {}", key);
                    results
                        .lock()
                        .expect("results map poisoned")
                        .insert(key.clone(), hit);
                    cache_hits.insert(key.clone());
                    continue;
                }
            }
            to_submit.push((key.clone(), SubmitRow::from_record(&records[idx], key)));
        }

        let unique_lookups = to_submit.len() + cache_hits.len();
        let estimated_cost = self.estimate_cost(to_submit.len());
        tracing::info!(
            "Submitting {} unique lookup(s) ({} duplicates reused, {} cache hits); estimated cost ${:.2}",
            to_submit.len(),
            dedup.duplicate_count(),
            cache_hits.len(),
            estimated_cost.total
        );

        // Step 4: submit chunks with bounded concurrency.
        let chunks: Vec<Vec<(IdentityKey, SubmitRow)>> = to_submit
            .chunks(self.config.batch_size)
            .map(|c| c.to_vec())
            .collect();
        let fatal: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));
        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight));

        let mut handles = Vec::new();
        let mut skipped: Vec<Vec<(IdentityKey, SubmitRow)>> = Vec::new();
        for chunk in chunks {
            // Cancellation and fatal errors are observed between chunks;
            // work already in flight drains.
            if self.cancel.is_cancelled() || fatal.lock().expect("fatal flag poisoned").is_some() {
                skipped.push(chunk);
                continue;
            }

            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Internal("submission semaphore closed".into()))?;

            let client = Arc::clone(&self.client);
            let breaker = Arc::clone(&self.breaker);
            let registry = Arc::clone(&self.registry);
            let results = Arc::clone(&results);
            let job_ids = Arc::clone(&job_ids);
            let fatal = Arc::clone(&fatal);
            let cancel = self.cancel.clone();
            let mode = self.config.delivery_mode;
            let include_tcpa = self.config.include_tcpa_blacklisted;
            let poll = self.config.poll;

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                process_chunk(
                    client, breaker, registry, mode, include_tcpa, poll, chunk, cancel, results,
                    job_ids, fatal,
                )
                .await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Chunk task panicked: {}", e);
            }
        }

        // A pipeline-fatal error stops the run after the drain; per-record
        // statuses would be indistinguishable from legitimate no-matches.
        if let Some(e) = fatal.lock().expect("fatal flag poisoned").take() {
            tracing::error!("Enrichment run aborted: {}", e);
            return Err(e);
        }

        // Chunks skipped after cancellation still yield rows.
        if !skipped.is_empty() {
            let mut map = results.lock().expect("results map poisoned");
            for chunk in skipped {
                for (key, _) in chunk {
                    map.insert(key, LookupResult::failed("cancelled before submission"));
                }
            }
        }

        let mut results_map = match Arc::try_unwrap(results) {
            Ok(mutex) => mutex.into_inner().expect("results map poisoned"),
            Err(arc) => arc.lock().expect("results map poisoned").clone(),
        };
        let job_ids_map = match Arc::try_unwrap(job_ids) {
            Ok(mutex) => mutex.into_inner().expect("job id map poisoned"),
            Err(arc) => arc.lock().expect("job id map poisoned").clone(),
        };

        // Step 5: compliance chain over the full annotated set. Stages are
        // pure, so cache-served results annotate to the same flags.
        let chain = ComplianceChain::from_toggles(&self.config.stages);
        tracing::info!("Applying compliance stages: {:?}", chain.stage_names());
        for result in results_map.values_mut() {
            chain.apply(result);
        }

        if let Some(cache) = &self.result_cache {
            for (key, result) in &results_map {
                if result.matched && !cache_hits.contains(key) {
                    cache.insert(key.token(), result.clone()).await;
                }
            }
        }

        // Step 6: rejoin onto the original rows, in original order.
        let settings = RejoinSettings {
            phone_slot_cap: self.config.phone_slot_cap,
            email_slot_cap: self.config.email_slot_cap,
            unmatched_name_cap: self.config.unmatched_name_cap,
            name_match_threshold: self.config.name_match_threshold,
        };
        let rows = rejoin(&records, &dedup, &results_map, &job_ids_map, &invalid, &settings);

        // Step 7: post-hoc cost from billed units only; cache hits cost
        // nothing.
        let billed: Vec<&LookupResult> = results_map
            .iter()
            .filter(|(key, result)| result.matched && !cache_hits.contains(*key))
            .map(|(_, result)| result)
            .collect();
        let billed_phones: u64 = billed
            .iter()
            .map(|r| r.persons.iter().map(|p| p.phones.len() as u64).sum::<u64>())
            .sum();
        let actual_cost = cost::actual(
            &self.config.costs,
            &self.config.stages,
            billed.len() as u64,
            billed_phones,
        );

        let matched = rows.iter().filter(|r| r.status == RecordStatus::Matched).count();
        let no_match = rows.iter().filter(|r| r.status == RecordStatus::NoMatch).count();
        let invalid_count = rows.iter().filter(|r| r.status == RecordStatus::Invalid).count();

        tracing::info!(
            "Run {} complete: {} in, {} matched, {} no-match, {} invalid; actual cost ${:.2}",
            run_id,
            total,
            matched,
            no_match,
            invalid_count,
            actual_cost.total
        );

        Ok(RunOutcome {
            rows,
            summary: RunSummary {
                run_id,
                total_records: total,
                matched,
                no_match,
                invalid: invalid_count,
                unique_lookups,
                duplicates_reused: dedup.duplicate_count(),
                cache_hits: cache_hits.len(),
                dedup_degraded: dedup.degraded,
                estimated_cost,
                actual_cost,
            },
        })
    }
}

/// Resolve one chunk to results and record them, or degrade the chunk's
/// records on failure. Pipeline-fatal errors are raised to the shared flag
/// instead of being folded into rows.
#[allow(clippy::too_many_arguments)]
async fn process_chunk(
    client: Arc<SkipTraceClient>,
    breaker: Arc<ProviderBreaker>,
    registry: Arc<DeliveryRegistry>,
    mode: DeliveryMode,
    include_tcpa: bool,
    poll: PollPolicy,
    chunk: Vec<(IdentityKey, SubmitRow)>,
    cancel: CancelHandle,
    results: Arc<Mutex<HashMap<IdentityKey, LookupResult>>>,
    job_ids: Arc<Mutex<HashMap<IdentityKey, String>>>,
    fatal: Arc<Mutex<Option<EngineError>>>,
) {
    let outcome = lookup_chunk(
        &client, &breaker, &registry, mode, include_tcpa, poll, &chunk, &cancel, &job_ids,
    )
    .await;

    match outcome {
        Ok(by_token) => {
            let mut map = results.lock().expect("results map poisoned");
            for (key, row) in &chunk {
                match by_token.get(&row.token) {
                    Some(result) => {
                        map.insert(key.clone(), result.clone());
                    }
                    None => {
                        // Leave the key unanswered; the rejoiner marks it.
                        tracing::warn!("Provider echoed no result for token {}", row.token);
                    }
                }
            }
        }
        Err(e) if e.is_pipeline_fatal() => {
            tracing::error!("Pipeline-fatal error on chunk: {}", e);
            let mut flag = fatal.lock().expect("fatal flag poisoned");
            if flag.is_none() {
                *flag = Some(e);
            }
        }
        // Envelope-level drift: the chunk's rows must come back Invalid,
        // not NoMatch, so callers can tell a decode failure from a miss.
        Err(e) if e.is_schema_drift() => {
            tracing::error!("Chunk of {} record(s) hit schema drift: {}", chunk.len(), e);
            let diagnostic = e.to_string();
            let mut map = results.lock().expect("results map poisoned");
            for (key, _) in chunk {
                map.insert(
                    key,
                    LookupResult::schema_drift(diagnostic.clone(), serde_json::Value::Null),
                );
            }
        }
        Err(e) => {
            tracing::warn!(
                "Chunk of {} record(s) degraded to NoMatch: {}",
                chunk.len(),
                e
            );
            let diagnostic = e.to_string();
            let mut map = results.lock().expect("results map poisoned");
            for (key, _) in chunk {
                map.insert(key, LookupResult::failed(diagnostic.clone()));
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn lookup_chunk(
    client: &SkipTraceClient,
    breaker: &ProviderBreaker,
    registry: &DeliveryRegistry,
    mode: DeliveryMode,
    include_tcpa: bool,
    poll: PollPolicy,
    chunk: &[(IdentityKey, SubmitRow)],
    cancel: &CancelHandle,
    job_ids: &Mutex<HashMap<IdentityKey, String>>,
) -> Result<HashMap<String, LookupResult>, EngineError> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let rows: Vec<SubmitRow> = chunk.iter().map(|(_, row)| row.clone()).collect();

    match mode {
        DeliveryMode::Sync => breaker
            .call(client.submit_sync(&rows, include_tcpa))
            .await
            .map_err(flatten_breaker_error),
        DeliveryMode::Poll => {
            let job_id = breaker
                .call(client.submit_async(&rows, include_tcpa))
                .await
                .map_err(flatten_breaker_error)?;
            record_job_id(job_ids, chunk, &job_id);

            let mut job = submitted_job(chunk, &job_id);
            JobTracker::new(client, poll).drive(&mut job, cancel).await
        }
        DeliveryMode::Webhook => {
            let job_id = breaker
                .call(client.submit_async(&rows, include_tcpa))
                .await
                .map_err(flatten_breaker_error)?;
            record_job_id(job_ids, chunk, &job_id);

            let tokens = rows.iter().map(|r| r.token.clone()).collect();
            let delivery = registry.register(&job_id, tokens);

            let mut job = submitted_job(chunk, &job_id);
            let result = JobTracker::new(client, poll)
                .await_delivery(&mut job, delivery)
                .await;
            if result.is_err() {
                registry.forget(&job_id);
            }
            result
        }
    }
}

fn submitted_job(chunk: &[(IdentityKey, SubmitRow)], job_id: &str) -> LookupJob {
    let mut job = LookupJob::new(chunk.iter().map(|(key, _)| key.clone()).collect());
    job.job_id = Some(job_id.to_string());
    job.state = JobState::Submitted;
    job
}

fn record_job_id(
    job_ids: &Mutex<HashMap<IdentityKey, String>>,
    chunk: &[(IdentityKey, SubmitRow)],
    job_id: &str,
) {
    let mut map = job_ids.lock().expect("job id map poisoned");
    for (key, _) in chunk {
        map.insert(key.clone(), job_id.to_string());
    }
}

fn flatten_breaker_error(err: failsafe::Error<EngineError>) -> EngineError {
    match err {
        failsafe::Error::Inner(e) => e,
        failsafe::Error::Rejected => EngineError::TransientProvider(
            "provider circuit open, submission rejected".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn engine_rejects_invalid_config() {
        let config = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        assert!(EnrichmentEngine::new(config).is_err());
    }

    #[test]
    fn estimate_uses_configured_assumptions() {
        let config = EngineConfig::default();
        let engine = EnrichmentEngine::new(config.clone()).unwrap();
        let report = engine.estimate_cost(100);

        let expected = crate::cost::dry_run(
            &config.costs,
            &config.stages,
            100,
            config.assumed_match_rate,
            config.assumed_phones_per_match,
        );
        assert_eq!(report, expected);
    }

    #[test]
    fn breaker_rejection_maps_to_transient() {
        let mapped = flatten_breaker_error(failsafe::Error::Rejected);
        assert!(mapped.is_retryable());
    }
}
