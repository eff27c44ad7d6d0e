//! HTTP client for the skip-trace provider: Submit (sync or async), Poll,
//! and Retrieve, with exponential-backoff retry and per-record
//! schema-drift-tolerant decoding.

use crate::config::{EngineConfig, RetryPolicy};
use crate::errors::EngineError;
use crate::models::{
    EmailContact, IdentityKey, InputRecord, LineType, LookupResult, Person, PhoneContact,
};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;

/// One row of a submission request. `token` is the IdentityKey digest; the
/// provider echoes it on the matching result so responses are mapped back
/// by key, never by array position.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitRow {
    pub token: String,
    pub street: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl SubmitRow {
    pub fn from_record(record: &InputRecord, key: &IdentityKey) -> Self {
        SubmitRow {
            token: key.token(),
            street: record.address.street.clone(),
            city: record.address.city.clone(),
            state: record.address.state.clone(),
            zip: record.address.zip.clone(),
            first_name: record.name.as_ref().map(|n| n.first.clone()),
            last_name: record.name.as_ref().map(|n| n.last.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
struct SubmitPayload<'a> {
    rows: &'a [SubmitRow],
    options: SubmitOptions,
}

#[derive(Debug, Serialize)]
struct SubmitOptions {
    include_tcpa_blacklisted: bool,
}

/// Poll response status for an asynchronous job.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending { progress: Option<f64> },
    Completed,
    Failed(String),
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobCreatedResponse {
    job_id: String,
}

// Wire shapes for result decoding. Decoded per record so one malformed
// record cannot sink the rest of the batch.

#[derive(Debug, Deserialize)]
struct WireRecord {
    token: String,
    #[serde(default)]
    matched: bool,
    #[serde(default)]
    persons: Vec<WirePerson>,
}

#[derive(Debug, Deserialize)]
struct WirePerson {
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    is_property_owner: bool,
    #[serde(default)]
    phones: Vec<WirePhone>,
    #[serde(default)]
    emails: Vec<WireEmail>,
}

#[derive(Debug, Deserialize)]
struct WirePhone {
    number: String,
    #[serde(default)]
    line_type: Option<String>,
    #[serde(default)]
    carrier: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    connected: Option<bool>,
    #[serde(default)]
    dnc: Option<bool>,
    #[serde(default)]
    litigator: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct WireEmail {
    address: String,
    #[serde(default)]
    tested: Option<bool>,
}

impl From<WirePerson> for Person {
    fn from(w: WirePerson) -> Self {
        Person {
            first_name: w.first_name,
            last_name: w.last_name,
            is_property_owner: w.is_property_owner,
            phones: w
                .phones
                .into_iter()
                .map(|p| PhoneContact {
                    number: p.number,
                    line_type: LineType::Unknown,
                    carrier: p.carrier,
                    confidence: p.confidence,
                    is_connected: None,
                    dnc: None,
                    litigator: None,
                    reported_line_type: p.line_type,
                    reported_dnc: p.dnc,
                    reported_litigator: p.litigator,
                    reported_connected: p.connected,
                })
                .collect(),
            emails: w
                .emails
                .into_iter()
                .map(|e| EmailContact {
                    address: e.address,
                    tested: e.tested,
                })
                .collect(),
        }
    }
}

pub struct SkipTraceClient {
    client: Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl SkipTraceClient {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(SkipTraceClient {
            client,
            base_url: config.provider_base_url.trim_end_matches('/').to_string(),
            api_key: config.provider_api_key.clone(),
            retry: config.retry,
        })
    }

    /// Submit a chunk in synchronous mode; results come back inline, keyed
    /// by correlation token.
    pub async fn submit_sync(
        &self,
        rows: &[SubmitRow],
        include_tcpa_blacklisted: bool,
    ) -> Result<HashMap<String, LookupResult>, EngineError> {
        let url = format!("{}/v1/lookups", self.base_url);
        let payload = SubmitPayload {
            rows,
            options: SubmitOptions {
                include_tcpa_blacklisted,
            },
        };

        tracing::info!("Submitting sync lookup chunk of {} rows", rows.len());

        let response = self
            .execute_with_retry("sync submission", || {
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .json(&payload)
                    .send()
            })
            .await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::SchemaDrift(format!("submit response not JSON: {}", e)))?;

        parse_result_payload(&body)
    }

    /// Submit a chunk in asynchronous mode; returns the provider-assigned
    /// job id.
    pub async fn submit_async(
        &self,
        rows: &[SubmitRow],
        include_tcpa_blacklisted: bool,
    ) -> Result<String, EngineError> {
        let url = format!("{}/v1/jobs", self.base_url);
        let payload = SubmitPayload {
            rows,
            options: SubmitOptions {
                include_tcpa_blacklisted,
            },
        };

        tracing::info!("Submitting async lookup chunk of {} rows", rows.len());

        let response = self
            .execute_with_retry("async submission", || {
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .json(&payload)
                    .send()
            })
            .await?;

        let created: JobCreatedResponse = response.json().await.map_err(|e| {
            EngineError::SchemaDrift(format!("job creation response missing job_id: {}", e))
        })?;

        tracing::info!("Provider accepted job {}", created.job_id);
        Ok(created.job_id)
    }

    /// Poll one job. Poll calls are not retried with backoff; the tracker
    /// owns the cadence and attempt budget.
    pub async fn poll(&self, job_id: &str) -> Result<PollStatus, EngineError> {
        let url = format!("{}/v1/jobs/{}", self.base_url, job_id);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;
        let response = classify_response(response).await?;

        let poll: PollResponse = response
            .json()
            .await
            .map_err(|e| EngineError::SchemaDrift(format!("poll response malformed: {}", e)))?;

        match poll.status.as_str() {
            "pending" | "processing" => Ok(PollStatus::Pending {
                progress: poll.progress,
            }),
            "completed" => Ok(PollStatus::Completed),
            "failed" => Ok(PollStatus::Failed(
                poll.error.unwrap_or_else(|| "provider reported failure".to_string()),
            )),
            other => Err(EngineError::SchemaDrift(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }

    /// Retrieve the full result payload for a completed job. Shape is
    /// identical to the sync submission response.
    pub async fn retrieve(
        &self,
        job_id: &str,
    ) -> Result<HashMap<String, LookupResult>, EngineError> {
        let url = format!("{}/v1/jobs/{}/results", self.base_url, job_id);

        tracing::info!("Retrieving results for job {}", job_id);

        let response = self
            .execute_with_retry("result retrieval", || {
                self.client
                    .get(&url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .send()
            })
            .await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::SchemaDrift(format!("results payload not JSON: {}", e)))?;

        parse_result_payload(&body)
    }

    /// Run one request with exponential backoff on transient failures.
    /// Permission errors abort immediately; they indicate systemic
    /// misconfiguration, not a flaky call.
    async fn execute_with_retry<F, Fut>(
        &self,
        what: &str,
        send: F,
    ) -> Result<Response, EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Response, reqwest::Error>>,
    {
        let mut last_err = None;
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.delay_for(attempt - 1);
                tracing::warn!(
                    "Retrying {} (attempt {}/{}) after {:?}",
                    what,
                    attempt + 1,
                    self.retry.max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            match send().await {
                Ok(response) => match classify_response(response).await {
                    Ok(ok) => return Ok(ok),
                    Err(e) if e.is_retryable() => last_err = Some(e),
                    Err(e) => return Err(e),
                },
                Err(e) => {
                    let e = EngineError::from(e);
                    if e.is_retryable() {
                        last_err = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            EngineError::Internal(format!("{} retry loop exited without an error", what))
        }))
    }
}

/// Map an HTTP response onto the error taxonomy: 401/403 are permission
/// failures, 429 and 5xx are transient, other non-2xx are terminal.
async fn classify_response(response: Response) -> Result<Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(EngineError::Permission(format!(
            "provider returned {}: {}",
            status, body
        ))),
        StatusCode::TOO_MANY_REQUESTS => Err(EngineError::TransientProvider(format!(
            "provider rate limited: {}",
            body
        ))),
        s if s.is_server_error() => Err(EngineError::TransientProvider(format!(
            "provider returned {}: {}",
            status, body
        ))),
        _ => Err(EngineError::ExternalApi(format!(
            "provider returned {}: {}",
            status, body
        ))),
    }
}

/// Decode a result payload, record by record. A record that fails to decode
/// becomes a schema-drift result carrying its raw payload; it never sinks
/// the rest of the batch. Records without a recoverable token are skipped
/// (the engine later marks the unanswered keys). A payload without a
/// `results` array at all is drift at the envelope level and errors out;
/// an empty map here would be indistinguishable from a legitimate
/// all-no-match response.
pub fn parse_result_payload(body: &Value) -> Result<HashMap<String, LookupResult>, EngineError> {
    let mut results = HashMap::new();

    let records = body.get("results").and_then(Value::as_array).ok_or_else(|| {
        tracing::error!("Result payload missing 'results' array");
        EngineError::SchemaDrift("result payload missing 'results' array".to_string())
    })?;

    for raw in records {
        match serde_json::from_value::<WireRecord>(raw.clone()) {
            Ok(wire) => {
                let result = LookupResult {
                    matched: wire.matched && !wire.persons.is_empty(),
                    persons: wire.persons.into_iter().map(Person::from).collect(),
                    diagnostic: None,
                    raw: None,
                };
                results.insert(wire.token, result);
            }
            Err(e) => {
                // Salvage the token so the record can still be attributed.
                if let Some(token) = raw.get("token").and_then(Value::as_str) {
                    tracing::warn!("Record for token {} failed to decode: {}", token, e);
                    results.insert(
                        token.to_string(),
                        LookupResult::schema_drift(
                            format!("response record failed to decode: {}", e),
                            raw.clone(),
                        ),
                    );
                } else {
                    tracing::error!("Unattributable record in response: {}", e);
                }
            }
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_maps_records_by_token_not_position() {
        let body = json!({
            "results": [
                { "token": "bbb", "matched": true, "persons": [
                    { "first_name": "Ann", "last_name": "Lee",
                      "phones": [ { "number": "5165550100", "line_type": "mobile" } ] }
                ]},
                { "token": "aaa", "matched": false, "persons": [] }
            ]
        });

        let results = parse_result_payload(&body).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results["bbb"].matched);
        assert!(!results["aaa"].matched);
        assert_eq!(results["bbb"].persons[0].phones[0].number, "5165550100");
        assert_eq!(
            results["bbb"].persons[0].phones[0].reported_line_type.as_deref(),
            Some("mobile")
        );
    }

    #[test]
    fn malformed_record_becomes_schema_drift_with_raw_payload() {
        let body = json!({
            "results": [
                { "token": "good", "matched": false },
                { "token": "bad", "matched": "not-a-bool", "persons": 7 },
            ]
        });

        let results = parse_result_payload(&body).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results["bad"].is_schema_drift());
        assert!(results["bad"].raw.is_some());
        assert!(!results["good"].is_schema_drift());
    }

    #[test]
    fn tokenless_record_is_skipped_not_fatal() {
        let body = json!({
            "results": [
                { "matched": [], "persons": "x" },
                { "token": "ok", "matched": true, "persons": [
                    { "first_name": "Bo", "last_name": "Chen" }
                ]},
            ]
        });

        let results = parse_result_payload(&body).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results.contains_key("ok"));
    }

    #[test]
    fn payload_without_results_array_is_envelope_drift() {
        let err = parse_result_payload(&json!({ "records": [] })).unwrap_err();
        assert!(matches!(err, EngineError::SchemaDrift(_)));

        // An empty array is a legitimate response, not drift.
        assert!(parse_result_payload(&json!({ "results": [] })).unwrap().is_empty());
    }

    #[test]
    fn matched_without_persons_is_demoted() {
        let body = json!({
            "results": [ { "token": "t", "matched": true, "persons": [] } ]
        });
        let results = parse_result_payload(&body).unwrap();
        assert!(!results["t"].matched);
    }

    #[test]
    fn submit_row_carries_token_and_address() {
        use crate::models::{Address, InputRecord};
        use serde_json::Map;

        let record = InputRecord {
            correlation_id: "r1".into(),
            address: Address {
                street: "1011 Rosegold St".into(),
                city: Some("Franklin Square".into()),
                state: Some("NY".into()),
                zip: Some("11010".into()),
            },
            name: None,
            passthrough: Map::new(),
        };
        let key = IdentityKey::new(&record);
        let row = SubmitRow::from_record(&record, &key);

        assert_eq!(row.token, key.token());
        assert_eq!(row.street, "1011 Rosegold St");
        assert!(row.first_name.is_none());
    }
}
