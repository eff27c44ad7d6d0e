//! Identity deduplication: collapse input records to the unique
//! (person-identity, address) pairs that need a paid provider lookup.

use crate::config::DedupSafety;
use crate::models::{IdentityKey, InputRecord};
use std::collections::HashMap;

/// Outcome of grouping a record set by IdentityKey.
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    /// One representative record per key, first occurrence, stable order.
    pub unique: Vec<InputRecord>,
    /// IdentityKey for every original record index, parallel to the input.
    pub keys: Vec<IdentityKey>,
    /// Every original record index sharing each key.
    pub mapping: HashMap<IdentityKey, Vec<usize>>,
    /// The record index submitted on behalf of each key.
    pub representative: HashMap<IdentityKey, usize>,
    /// True when the safety check forced identity mapping (no grouping).
    pub degraded: bool,
}

impl DedupOutcome {
    pub fn duplicate_count(&self) -> usize {
        self.keys.len() - self.unique.len()
    }
}

/// Group records by IdentityKey, subject to the safety check.
///
/// When the population rate of a grouping field is below the configured
/// threshold, or any group exceeds the size ceiling, grouping silently
/// degrades to identity mapping: every record keeps its own key and gets
/// its own lookup. Paying for duplicates is preferred over cross-assigning
/// contacts between unrelated people.
pub fn deduplicate(records: &[InputRecord], safety: &DedupSafety) -> DedupOutcome {
    if records.is_empty() {
        return DedupOutcome {
            unique: Vec::new(),
            keys: Vec::new(),
            mapping: HashMap::new(),
            representative: HashMap::new(),
            degraded: false,
        };
    }

    if !grouping_fields_populated(records, safety.min_population_rate) {
        tracing::warn!(
            "Dedup degraded: grouping field population below {:.0}%",
            safety.min_population_rate * 100.0
        );
        return identity_mapping(records);
    }

    let keys: Vec<IdentityKey> = records.iter().map(IdentityKey::new).collect();

    let mut mapping: HashMap<IdentityKey, Vec<usize>> = HashMap::new();
    let mut representative: HashMap<IdentityKey, usize> = HashMap::new();
    let mut unique: Vec<InputRecord> = Vec::new();

    for (idx, key) in keys.iter().enumerate() {
        let members = mapping.entry(key.clone()).or_default();
        if members.is_empty() {
            representative.insert(key.clone(), idx);
            unique.push(records[idx].clone());
        }
        members.push(idx);
    }

    if let Some(largest) = mapping.values().map(Vec::len).max() {
        if largest > safety.max_group_size {
            tracing::warn!(
                "Dedup degraded: largest group has {} records (ceiling {})",
                largest,
                safety.max_group_size
            );
            return identity_mapping(records);
        }
    }

    tracing::info!(
        "Dedup: {} records collapsed to {} unique lookups",
        records.len(),
        unique.len()
    );

    DedupOutcome {
        unique,
        keys,
        mapping,
        representative,
        degraded: false,
    }
}

/// Fraction of records with each grouping field populated. Name is not
/// counted; it is optional by contract and its absence folds into the key
/// as a blank component rather than weakening the grouping.
fn grouping_fields_populated(records: &[InputRecord], threshold: f64) -> bool {
    let total = records.len() as f64;

    let street_rate = records
        .iter()
        .filter(|r| !r.address.street.trim().is_empty())
        .count() as f64
        / total;

    let locality_rate = records
        .iter()
        .filter(|r| {
            let a = &r.address;
            a.zip.as_deref().map_or(false, |z| !z.trim().is_empty())
                || (a.city.as_deref().map_or(false, |c| !c.trim().is_empty())
                    && a.state.as_deref().map_or(false, |s| !s.trim().is_empty()))
        })
        .count() as f64
        / total;

    street_rate >= threshold && locality_rate >= threshold
}

fn identity_mapping(records: &[InputRecord]) -> DedupOutcome {
    let keys: Vec<IdentityKey> = records
        .iter()
        .enumerate()
        .map(|(i, r)| IdentityKey::degraded(r, i))
        .collect();

    let mut mapping = HashMap::new();
    let mut representative = HashMap::new();
    for (idx, key) in keys.iter().enumerate() {
        mapping.insert(key.clone(), vec![idx]);
        representative.insert(key.clone(), idx);
    }

    DedupOutcome {
        unique: records.to_vec(),
        keys,
        mapping,
        representative,
        degraded: true,
    }
}
