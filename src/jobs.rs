//! Asynchronous job lifecycle: `Pending -> Submitted -> (poll)* ->
//! Completed | Failed | TimedOut`.
//!
//! A job that ends Failed or TimedOut still yields its original records,
//! tagged NoMatch with a diagnostic; the tracker never loses records.

use crate::config::PollPolicy;
use crate::errors::{EngineError, ResultExt};
use crate::models::{JobState, LookupJob, LookupResult};
use crate::provider::{parse_result_payload, PollStatus, SkipTraceClient};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Caller-level cancellation signal, observed between chunks and between
/// poll cycles. In-flight network calls are allowed to complete so the
/// provider-side job state stays known.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct JobTracker<'a> {
    client: &'a SkipTraceClient,
    policy: PollPolicy,
}

impl<'a> JobTracker<'a> {
    pub fn new(client: &'a SkipTraceClient, policy: PollPolicy) -> Self {
        JobTracker { client, policy }
    }

    /// Drive a submitted job to a terminal state by polling.
    ///
    /// Sleeps between polls (never busy-spins) and gives up after the
    /// configured attempt budget, transitioning the job to TimedOut. The
    /// error carries the provider job id for later manual reconciliation.
    pub async fn drive(
        &self,
        job: &mut LookupJob,
        cancel: &CancelHandle,
    ) -> Result<HashMap<String, LookupResult>, EngineError> {
        debug_assert_eq!(job.state, JobState::Submitted);
        let job_id = job
            .job_id
            .clone()
            .ok_or_else(|| EngineError::Internal("cannot poll a job without a job id".into()))?;

        while job.attempts < self.policy.max_attempts {
            tokio::time::sleep(self.policy.interval).await;

            if cancel.is_cancelled() {
                tracing::warn!("Job {} abandoned: cancellation requested", job_id);
                job.state = JobState::Failed;
                job.diagnostic = Some("cancelled by caller".to_string());
                return Err(EngineError::Cancelled);
            }

            job.attempts += 1;
            job.last_polled_at = Some(Utc::now());

            match self.client.poll(&job_id).await {
                Ok(PollStatus::Pending { progress }) => {
                    tracing::debug!(
                        "Job {} still pending (attempt {}/{}, progress {:?})",
                        job_id,
                        job.attempts,
                        self.policy.max_attempts,
                        progress
                    );
                }
                Ok(PollStatus::Completed) => {
                    tracing::info!("Job {} completed after {} poll(s)", job_id, job.attempts);
                    let results = self
                        .client
                        .retrieve(&job_id)
                        .await
                        .with_context(|| format!("retrieving results for job {}", job_id))?;
                    job.state = JobState::Completed;
                    return Ok(results);
                }
                Ok(PollStatus::Failed(reason)) => {
                    tracing::error!("Job {} failed at provider: {}", job_id, reason);
                    job.state = JobState::Failed;
                    job.diagnostic = Some(reason.clone());
                    return Err(EngineError::ExternalApi(reason));
                }
                Err(e) if e.is_retryable() => {
                    // A flaky poll burns an attempt but does not kill the job.
                    tracing::warn!("Poll for job {} failed transiently: {}", job_id, e);
                }
                Err(e) => {
                    job.state = JobState::Failed;
                    job.diagnostic = Some(e.to_string());
                    return Err(e);
                }
            }
        }

        tracing::warn!(
            "Job {} exhausted {} poll attempts, marking TimedOut",
            job_id,
            self.policy.max_attempts
        );
        job.state = JobState::TimedOut;
        job.diagnostic = Some(format!(
            "no completion after {} polls",
            self.policy.max_attempts
        ));
        Err(EngineError::JobTimeout {
            job_id,
            attempts: job.attempts,
        })
    }

    /// Webhook mode: await push delivery of the result payload instead of
    /// polling. Terminal states are identical to the polling path; the
    /// elapsed budget is interval x max_attempts.
    pub async fn await_delivery(
        &self,
        job: &mut LookupJob,
        delivery: oneshot::Receiver<Value>,
    ) -> Result<HashMap<String, LookupResult>, EngineError> {
        debug_assert_eq!(job.state, JobState::Submitted);
        let job_id = job
            .job_id
            .clone()
            .ok_or_else(|| EngineError::Internal("cannot await a job without a job id".into()))?;
        let budget = self.policy.interval * self.policy.max_attempts;

        match tokio::time::timeout(budget, delivery).await {
            Ok(Ok(payload)) => {
                tracing::info!("Job {} delivered via webhook", job_id);
                job.last_polled_at = Some(Utc::now());
                match parse_result_payload(&payload) {
                    Ok(results) => {
                        job.state = JobState::Completed;
                        Ok(results)
                    }
                    Err(e) => {
                        job.state = JobState::Failed;
                        job.diagnostic = Some(e.to_string());
                        Err(e)
                    }
                }
            }
            Ok(Err(_)) => {
                job.state = JobState::Failed;
                job.diagnostic = Some("delivery channel closed".to_string());
                Err(EngineError::Internal(format!(
                    "delivery channel for job {} closed before payload arrived",
                    job_id
                )))
            }
            Err(_) => {
                tracing::warn!("Job {} webhook delivery timed out after {:?}", job_id, budget);
                job.state = JobState::TimedOut;
                job.diagnostic = Some(format!("no webhook delivery within {:?}", budget));
                Err(EngineError::JobTimeout {
                    job_id,
                    attempts: self.policy.max_attempts,
                })
            }
        }
    }
}
