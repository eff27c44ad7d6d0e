//! Billable-unit accounting. One cost-table path serves both the
//! pre-flight dry run (assumed match/phone counts) and the post-hoc actual
//! report (observed counts), so the two can never drift.

use crate::config::{CostTable, StageToggles};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CostMode {
    DryRun,
    Actual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostLine {
    pub stage: &'static str,
    pub unit_count: u64,
    pub unit_cost: f64,
    pub subtotal: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostReport {
    pub mode: CostMode,
    pub lines: Vec<CostLine>,
    pub total: f64,
}

/// Unit counts feeding the cost table: skip-trace bills per matched record,
/// the downstream stages bill per phone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageUnits {
    pub matched_records: u64,
    pub phones: u64,
}

/// The single shared lookup over the cost table. Both entry points funnel
/// here; only the unit counts differ between modes.
fn build_report(
    table: &CostTable,
    toggles: &StageToggles,
    units: StageUnits,
    mode: CostMode,
) -> CostReport {
    let mut lines = vec![line(
        "skip_trace",
        units.matched_records,
        table.skip_trace_per_match,
    )];

    if toggles.phone_verification {
        lines.push(line(
            "phone_verification",
            units.phones,
            table.verification_per_phone,
        ));
    }
    if toggles.dnc {
        lines.push(line("dnc", units.phones, table.dnc_per_phone));
    }
    if toggles.tcpa {
        lines.push(line("tcpa", units.phones, table.tcpa_per_phone));
    }

    let total = lines.iter().map(|l| l.subtotal).sum();
    CostReport { mode, lines, total }
}

fn line(stage: &'static str, unit_count: u64, unit_cost: f64) -> CostLine {
    CostLine {
        stage,
        unit_count,
        unit_cost,
        subtotal: unit_count as f64 * unit_cost,
    }
}

/// Pre-flight estimate from the input record count and configured
/// assumptions about match rate and phones per match.
pub fn dry_run(
    table: &CostTable,
    toggles: &StageToggles,
    record_count: usize,
    assumed_match_rate: f64,
    assumed_phones_per_match: f64,
) -> CostReport {
    let matched = (record_count as f64 * assumed_match_rate).round() as u64;
    let phones = (matched as f64 * assumed_phones_per_match).round() as u64;
    build_report(
        table,
        toggles,
        StageUnits {
            matched_records: matched,
            phones,
        },
        CostMode::DryRun,
    )
}

/// Post-hoc report from the observed match and phone counts.
pub fn actual(
    table: &CostTable,
    toggles: &StageToggles,
    matched_records: u64,
    phones: u64,
) -> CostReport {
    build_report(
        table,
        toggles,
        StageUnits {
            matched_records,
            phones,
        },
        CostMode::Actual,
    )
}
