use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Physical address of a lookup target.
///
/// Zip is optional when city+state are both present; the provider accepts
/// street+zip, street+city+state, or all four.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

impl Address {
    /// Whether this address satisfies one of the combinations the provider
    /// accepts: street+zip | street+city+state | street+city+state+zip.
    pub fn is_submittable(&self) -> bool {
        if self.street.trim().is_empty() {
            return false;
        }
        let has_zip = self.zip.as_deref().map_or(false, |z| !z.trim().is_empty());
        let has_city_state = self.city.as_deref().map_or(false, |c| !c.trim().is_empty())
            && self.state.as_deref().map_or(false, |s| !s.trim().is_empty());
        has_zip || has_city_state
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonName {
    pub first: String,
    pub last: String,
}

impl PersonName {
    pub fn full(&self) -> String {
        format!("{} {}", self.first, self.last).trim().to_string()
    }
}

/// One physical lookup target as handed to the engine by the caller.
///
/// `correlation_id` is caller-assigned, opaque, and round-trips unchanged to
/// the matching `OutputRow`. `passthrough` carries columns the engine does
/// not interpret; they are copied verbatim onto the output row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRecord {
    pub correlation_id: String,
    pub address: Address,
    #[serde(default)]
    pub name: Option<PersonName>,
    #[serde(default)]
    pub passthrough: Map<String, Value>,
}

/// Derived deduplication key: normalized address + normalized name.
///
/// Two records with equal keys must receive byte-identical enrichment
/// results. The provider never sees the key itself; it sees the sha256
/// `token()`, which it echoes back so results can be mapped without
/// positional assumptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(record: &InputRecord) -> Self {
        let name_part = record
            .name
            .as_ref()
            .map(|n| normalize_component(&n.full()))
            .unwrap_or_default();
        let addr = &record.address;
        let addr_part = [
            normalize_component(&addr.street),
            normalize_component(addr.city.as_deref().unwrap_or("")),
            normalize_component(addr.state.as_deref().unwrap_or("")),
            normalize_component(addr.zip.as_deref().unwrap_or("")),
        ]
        .join(" ");
        IdentityKey(format!(
            "{}|{}",
            addr_part.split_whitespace().collect::<Vec<_>>().join(" "),
            name_part
        ))
    }

    /// Per-record key used when dedup degrades to identity mapping. The
    /// ordinal suffix guarantees no two records share a key.
    pub fn degraded(record: &InputRecord, index: usize) -> Self {
        let base = IdentityKey::new(record);
        IdentityKey(format!("{}#{}", base.0, index))
    }

    /// Opaque correlation token submitted to the provider.
    pub fn token(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, collapse runs of whitespace, strip punctuation that varies
/// between data sources (periods and commas in street lines).
pub fn normalize_component(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c == '.' || c == ',' { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineType {
    Mobile,
    Landline,
    Voip,
    #[default]
    Unknown,
}

/// One discovered phone channel.
///
/// The `reported_*` fields hold what the provider claimed; the unprefixed
/// flags are set by the compliance chain. A disabled stage leaves its flag
/// `None` (unknown), never `Some(true)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneContact {
    pub number: String,
    #[serde(default)]
    pub line_type: LineType,
    #[serde(default)]
    pub carrier: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub is_connected: Option<bool>,
    #[serde(default)]
    pub dnc: Option<bool>,
    #[serde(default)]
    pub litigator: Option<bool>,
    #[serde(default)]
    pub reported_line_type: Option<String>,
    #[serde(default)]
    pub reported_dnc: Option<bool>,
    #[serde(default)]
    pub reported_litigator: Option<bool>,
    #[serde(default)]
    pub reported_connected: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailContact {
    pub address: String,
    #[serde(default)]
    pub tested: Option<bool>,
}

/// One person recovered for an identity, owning its contact channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub is_property_owner: bool,
    #[serde(default)]
    pub phones: Vec<PhoneContact>,
    #[serde(default)]
    pub emails: Vec<EmailContact>,
}

/// Enrichment result for one IdentityKey. Shared read-only by every input
/// record carrying that key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupResult {
    pub matched: bool,
    #[serde(default)]
    pub persons: Vec<Person>,
    #[serde(default)]
    pub diagnostic: Option<String>,
    /// Raw payload retained when the response shape did not decode.
    #[serde(default)]
    pub raw: Option<Value>,
}

impl LookupResult {
    pub fn no_match() -> Self {
        LookupResult {
            matched: false,
            persons: Vec::new(),
            diagnostic: None,
            raw: None,
        }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        LookupResult {
            matched: false,
            persons: Vec::new(),
            diagnostic: Some(diagnostic.into()),
            raw: None,
        }
    }

    pub fn schema_drift(diagnostic: impl Into<String>, raw: Value) -> Self {
        LookupResult {
            matched: false,
            persons: Vec::new(),
            diagnostic: Some(diagnostic.into()),
            raw: Some(raw),
        }
    }

    /// True when the result represents a response that could not be decoded
    /// rather than a legitimate empty match.
    pub fn is_schema_drift(&self) -> bool {
        self.raw.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Matched,
    NoMatch,
    Invalid,
}

/// Name-match confidence for one output row. `Surplus` renders as "100+":
/// every known principal matched and extra contact names remained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameMatchScore {
    Percent(u8),
    Surplus,
}

impl fmt::Display for NameMatchScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameMatchScore::Percent(p) => write!(f, "{}", p),
            NameMatchScore::Surplus => f.write_str("100+"),
        }
    }
}

/// One populated phone slot, with the owning person's name denormalized on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneSlot {
    pub number: String,
    pub line_type: LineType,
    pub carrier: Option<String>,
    pub confidence: Option<f64>,
    pub dnc: Option<bool>,
    pub litigator: Option<bool>,
    pub owner_first: String,
    pub owner_last: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSlot {
    pub address: String,
    pub tested: Option<bool>,
    pub owner_first: String,
    pub owner_last: String,
}

/// One output row per input row, duplicates preserved, input order preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRow {
    pub correlation_id: String,
    pub address: Address,
    pub name: Option<PersonName>,
    pub passthrough: Map<String, Value>,
    pub status: RecordStatus,
    /// Fixed-capacity slot arrays; `None` entries are empty slots.
    pub phone_slots: Vec<Option<PhoneSlot>>,
    pub email_slots: Vec<Option<EmailSlot>>,
    /// True when this row's result was copied from another row with the
    /// same IdentityKey, i.e. no provider spend happened for this row.
    pub shared_from_dedup: bool,
    pub name_match_score: Option<NameMatchScore>,
    pub unmatched_names: Vec<String>,
    pub diagnostic: Option<String>,
    /// Provider job id retained for manual reconciliation of timeouts.
    pub job_id: Option<String>,
}

/// Lifecycle of one provider interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Submitted,
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct LookupJob {
    /// Provider-assigned identifier, present once submitted in async mode.
    pub job_id: Option<String>,
    /// Ordered identity keys carried by this job's chunk.
    pub keys: Vec<IdentityKey>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub diagnostic: Option<String>,
}

impl LookupJob {
    pub fn new(keys: Vec<IdentityKey>) -> Self {
        LookupJob {
            job_id: None,
            keys,
            state: JobState::Pending,
            created_at: Utc::now(),
            last_polled_at: None,
            attempts: 0,
            diagnostic: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            JobState::Completed | JobState::Failed | JobState::TimedOut
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn record(street: &str, zip: Option<&str>, name: Option<(&str, &str)>) -> InputRecord {
        InputRecord {
            correlation_id: "r1".to_string(),
            address: Address {
                street: street.to_string(),
                city: None,
                state: None,
                zip: zip.map(String::from),
            },
            name: name.map(|(f, l)| PersonName {
                first: f.to_string(),
                last: l.to_string(),
            }),
            passthrough: Map::new(),
        }
    }

    #[test]
    fn address_combinations() {
        let full = Address {
            street: "1011 Rosegold St".into(),
            city: Some("Franklin Square".into()),
            state: Some("NY".into()),
            zip: Some("11010".into()),
        };
        assert!(full.is_submittable());

        let street_zip = Address {
            street: "1011 Rosegold St".into(),
            city: None,
            state: None,
            zip: Some("11010".into()),
        };
        assert!(street_zip.is_submittable());

        let city_no_state = Address {
            street: "1011 Rosegold St".into(),
            city: Some("Franklin Square".into()),
            state: None,
            zip: None,
        };
        assert!(!city_no_state.is_submittable());

        let no_street = Address {
            street: "  ".into(),
            city: Some("Franklin Square".into()),
            state: Some("NY".into()),
            zip: Some("11010".into()),
        };
        assert!(!no_street.is_submittable());
    }

    #[test]
    fn identity_key_is_case_and_whitespace_insensitive() {
        let a = IdentityKey::new(&record(
            "1011  Rosegold St.",
            Some("11010"),
            Some(("Ann", "Lee")),
        ));
        let b = IdentityKey::new(&record(
            "1011 rosegold st",
            Some("11010"),
            Some(("ANN", "LEE")),
        ));
        assert_eq!(a, b);
        assert_eq!(a.token(), b.token());
    }

    #[test]
    fn identity_key_distinguishes_names() {
        let a = IdentityKey::new(&record(
            "1011 Rosegold St",
            Some("11010"),
            Some(("Ann", "Lee")),
        ));
        let b = IdentityKey::new(&record("1011 Rosegold St", Some("11010"), None));
        assert_ne!(a, b);
    }

    #[test]
    fn degraded_keys_are_unique_per_record() {
        let rec = record("1011 Rosegold St", Some("11010"), None);
        assert_ne!(
            IdentityKey::degraded(&rec, 0),
            IdentityKey::degraded(&rec, 1)
        );
    }

    #[test]
    fn name_match_score_display() {
        assert_eq!(NameMatchScore::Percent(50).to_string(), "50");
        assert_eq!(NameMatchScore::Surplus.to_string(), "100+");
    }
}
