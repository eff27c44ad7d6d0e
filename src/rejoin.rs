//! Result rejoining: copy each IdentityKey's enrichment result back onto
//! every original input row, duplicates included, in the original row
//! order. Submission batching and async completion order never reorder the
//! output.

use crate::dedup::DedupOutcome;
use crate::flatten::{flatten, into_fixed};
use crate::models::{
    IdentityKey, InputRecord, LookupResult, NameMatchScore, OutputRow, RecordStatus,
};
use crate::name_match::score_names;
use std::collections::HashMap;

/// Shape of the output table and the name-match diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct RejoinSettings {
    pub phone_slot_cap: usize,
    pub email_slot_cap: usize,
    pub unmatched_name_cap: usize,
    pub name_match_threshold: f64,
}

/// Build one output row per input record.
///
/// `results` holds one entry per unique key; `job_ids` maps keys to the
/// provider job that carried them, retained on failed rows for manual
/// reconciliation. `invalid` carries pre-submission validation failures by
/// record index.
pub fn rejoin(
    records: &[InputRecord],
    dedup: &DedupOutcome,
    results: &HashMap<IdentityKey, LookupResult>,
    job_ids: &HashMap<IdentityKey, String>,
    invalid: &HashMap<usize, String>,
    settings: &RejoinSettings,
) -> Vec<OutputRow> {
    let mut rows = Vec::with_capacity(records.len());

    for (idx, record) in records.iter().enumerate() {
        if let Some(reason) = invalid.get(&idx) {
            rows.push(empty_row(
                record,
                RecordStatus::Invalid,
                Some(reason.clone()),
                None,
                false,
                settings,
            ));
            continue;
        }

        let key = &dedup.keys[idx];
        let shared = dedup.representative.get(key).map_or(false, |rep| *rep != idx);
        let job_id = job_ids.get(key).cloned();

        let Some(result) = results.get(key) else {
            rows.push(empty_row(
                record,
                RecordStatus::NoMatch,
                Some("no result returned for lookup".to_string()),
                job_id,
                shared,
                settings,
            ));
            continue;
        };

        if result.is_schema_drift() {
            rows.push(empty_row(
                record,
                RecordStatus::Invalid,
                result.diagnostic.clone(),
                job_id,
                shared,
                settings,
            ));
            continue;
        }

        if !result.matched {
            rows.push(empty_row(
                record,
                RecordStatus::NoMatch,
                result.diagnostic.clone(),
                job_id,
                shared,
                settings,
            ));
            continue;
        }

        let slots = flatten(result, settings.phone_slot_cap, settings.email_slot_cap);

        let (name_match_score, unmatched_names) =
            score_row_names(record, &slots, settings);

        rows.push(OutputRow {
            correlation_id: record.correlation_id.clone(),
            address: record.address.clone(),
            name: record.name.clone(),
            passthrough: record.passthrough.clone(),
            status: RecordStatus::Matched,
            phone_slots: into_fixed(slots.phones, settings.phone_slot_cap),
            email_slots: into_fixed(slots.emails, settings.email_slot_cap),
            shared_from_dedup: shared,
            name_match_score,
            unmatched_names,
            diagnostic: result.diagnostic.clone(),
            job_id,
        });
    }

    debug_assert_eq!(rows.len(), records.len());
    rows
}

fn score_row_names(
    record: &InputRecord,
    slots: &crate::flatten::FlattenedSlots,
    settings: &RejoinSettings,
) -> (Option<NameMatchScore>, Vec<String>) {
    let principals: Vec<String> = record.name.iter().map(|n| n.full()).collect();

    let mut recovered: Vec<String> = Vec::new();
    for slot in &slots.phones {
        recovered.push(format!("{} {}", slot.owner_first, slot.owner_last));
    }
    for slot in &slots.emails {
        recovered.push(format!("{} {}", slot.owner_first, slot.owner_last));
    }
    recovered.dedup();

    match score_names(
        &principals,
        &recovered,
        settings.name_match_threshold,
        settings.unmatched_name_cap,
    ) {
        Some(outcome) => (Some(outcome.score), outcome.unmatched),
        None => (None, Vec::new()),
    }
}

fn empty_row(
    record: &InputRecord,
    status: RecordStatus,
    diagnostic: Option<String>,
    job_id: Option<String>,
    shared: bool,
    settings: &RejoinSettings,
) -> OutputRow {
    OutputRow {
        correlation_id: record.correlation_id.clone(),
        address: record.address.clone(),
        name: record.name.clone(),
        passthrough: record.passthrough.clone(),
        status,
        phone_slots: into_fixed(Vec::new(), settings.phone_slot_cap),
        email_slots: into_fixed(Vec::new(), settings.email_slot_cap),
        shared_from_dedup: shared,
        name_match_score: None,
        unmatched_names: Vec::new(),
        diagnostic,
        job_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupSafety;
    use crate::dedup::deduplicate;
    use crate::models::{Address, LineType, Person, PersonName, PhoneContact};
    use serde_json::Map;

    fn settings() -> RejoinSettings {
        RejoinSettings {
            phone_slot_cap: 10,
            email_slot_cap: 10,
            unmatched_name_cap: 8,
            name_match_threshold: 0.85,
        }
    }

    fn record(id: &str, street: &str, name: Option<(&str, &str)>) -> InputRecord {
        InputRecord {
            correlation_id: id.to_string(),
            address: Address {
                street: street.to_string(),
                city: None,
                state: None,
                zip: Some("11010".to_string()),
            },
            name: name.map(|(f, l)| PersonName {
                first: f.to_string(),
                last: l.to_string(),
            }),
            passthrough: Map::new(),
        }
    }

    fn matched_result(first: &str, last: &str, numbers: &[&str]) -> LookupResult {
        LookupResult {
            matched: true,
            persons: vec![Person {
                first_name: first.to_string(),
                last_name: last.to_string(),
                is_property_owner: true,
                phones: numbers
                    .iter()
                    .map(|n| PhoneContact {
                        number: n.to_string(),
                        line_type: LineType::Mobile,
                        carrier: None,
                        confidence: None,
                        is_connected: Some(true),
                        dnc: Some(false),
                        litigator: Some(false),
                        reported_line_type: None,
                        reported_dnc: None,
                        reported_litigator: None,
                        reported_connected: None,
                    })
                    .collect(),
                emails: Vec::new(),
            }],
            diagnostic: None,
            raw: None,
        }
    }

    #[test]
    fn duplicates_get_identical_slots_and_shared_marker() {
        let records = vec![
            record("a", "1011 Rosegold St", Some(("Ann", "Lee"))),
            record("b", "1011 Rosegold St", Some(("Ann", "Lee"))),
        ];
        let dedup = deduplicate(&records, &DedupSafety::default());
        assert_eq!(dedup.unique.len(), 1);

        let mut results = HashMap::new();
        results.insert(
            dedup.keys[0].clone(),
            matched_result("Ann", "Lee", &["+15165550100"]),
        );

        let rows = rejoin(
            &records,
            &dedup,
            &results,
            &HashMap::new(),
            &HashMap::new(),
            &settings(),
        );

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].phone_slots, rows[1].phone_slots);
        assert!(!rows[0].shared_from_dedup);
        assert!(rows[1].shared_from_dedup);
        assert_eq!(rows[0].status, RecordStatus::Matched);
        assert_eq!(rows[1].status, RecordStatus::Matched);
    }

    #[test]
    fn output_order_matches_input_order() {
        let records = vec![
            record("first", "1 A St", None),
            record("second", "2 B St", None),
            record("third", "1 A St", None),
        ];
        let dedup = deduplicate(&records, &DedupSafety::default());

        let mut results = HashMap::new();
        for key in dedup.mapping.keys() {
            results.insert(key.clone(), matched_result("Bo", "Chen", &["+15165550100"]));
        }

        let rows = rejoin(
            &records,
            &dedup,
            &results,
            &HashMap::new(),
            &HashMap::new(),
            &settings(),
        );

        let ids: Vec<&str> = rows.iter().map(|r| r.correlation_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn invalid_record_surfaces_with_diagnostic() {
        let records = vec![record("bad", "", None)];
        let dedup = deduplicate(&records, &DedupSafety::default());

        let mut invalid = HashMap::new();
        invalid.insert(0usize, "address missing street".to_string());

        let rows = rejoin(
            &records,
            &dedup,
            &HashMap::new(),
            &HashMap::new(),
            &invalid,
            &settings(),
        );

        assert_eq!(rows[0].status, RecordStatus::Invalid);
        assert_eq!(rows[0].diagnostic.as_deref(), Some("address missing street"));
        assert!(rows[0].phone_slots.iter().all(Option::is_none));
    }

    #[test]
    fn missing_result_is_no_match_with_retained_job_id() {
        let records = vec![record("a", "1011 Rosegold St", None)];
        let dedup = deduplicate(&records, &DedupSafety::default());

        let mut job_ids = HashMap::new();
        job_ids.insert(dedup.keys[0].clone(), "job-42".to_string());

        let rows = rejoin(
            &records,
            &dedup,
            &HashMap::new(),
            &job_ids,
            &HashMap::new(),
            &settings(),
        );

        assert_eq!(rows[0].status, RecordStatus::NoMatch);
        assert_eq!(rows[0].job_id.as_deref(), Some("job-42"));
    }

    #[test]
    fn schema_drift_result_marks_row_invalid() {
        let records = vec![record("a", "1011 Rosegold St", None)];
        let dedup = deduplicate(&records, &DedupSafety::default());

        let mut results = HashMap::new();
        results.insert(
            dedup.keys[0].clone(),
            LookupResult::schema_drift("bad shape", serde_json::json!({"persons": 7})),
        );

        let rows = rejoin(
            &records,
            &dedup,
            &results,
            &HashMap::new(),
            &HashMap::new(),
            &settings(),
        );

        assert_eq!(rows[0].status, RecordStatus::Invalid);
        assert_eq!(rows[0].diagnostic.as_deref(), Some("bad shape"));
    }

    #[test]
    fn name_score_computed_against_slot_owners() {
        let records = vec![record("a", "1011 Rosegold St", Some(("Ann", "Lee")))];
        let dedup = deduplicate(&records, &DedupSafety::default());

        let mut results = HashMap::new();
        results.insert(
            dedup.keys[0].clone(),
            matched_result("Ann", "Lee", &["+15165550100"]),
        );

        let rows = rejoin(
            &records,
            &dedup,
            &results,
            &HashMap::new(),
            &HashMap::new(),
            &settings(),
        );

        assert_eq!(rows[0].name_match_score, Some(NameMatchScore::Percent(100)));
        assert!(rows[0].unmatched_names.is_empty());
    }

    #[test]
    fn mismatched_principal_collected_as_unmatched() {
        let records = vec![record("a", "1011 Rosegold St", Some(("Zoe", "Quinn")))];
        let dedup = deduplicate(&records, &DedupSafety::default());

        let mut results = HashMap::new();
        results.insert(
            dedup.keys[0].clone(),
            matched_result("Ann", "Lee", &["+15165550100"]),
        );

        let rows = rejoin(
            &records,
            &dedup,
            &results,
            &HashMap::new(),
            &HashMap::new(),
            &settings(),
        );

        assert_eq!(rows[0].name_match_score, Some(NameMatchScore::Percent(0)));
        assert_eq!(rows[0].unmatched_names, vec!["Zoe Quinn".to_string()]);
    }
}
