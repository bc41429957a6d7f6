//! Timestamp-based conflict policy.
//!
//! Each side is judged against its own tolerance window: a side has changed
//! since its last sync when `last_changed_for_sync - last_synced` exceeds
//! the window, or when either timestamp is missing. Ties in the both-changed
//! case are measured with the sheet tolerance and resolved for the source.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tolerances {
    pub supabase_ms: i64,
    pub airtable_ms: i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Supabase,
    Airtable
}

/// The sync markers of one side of a record pair. A missing target record
/// is represented by the default state (both markers absent).
#[derive(Debug, Clone, Copy, Default)]
pub struct SideState {
    pub last_changed: Option<DateTime<Utc>>,
    pub last_synced: Option<DateTime<Utc>>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Unchanged,
    DestinationNewer,
    BothChangedDestinationNewer
}

impl Decision {
    pub fn proceeds(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

pub fn has_changed(state: &SideState, tolerance_ms: i64) -> bool {
    match (state.last_changed, state.last_synced) {
        (Some(lc), Some(ls)) => lc - ls > Duration::milliseconds(tolerance_ms),
        _ => true
    }
}

/// Decide whether a source record propagates to its target.
///
/// `source_forced_changed` lets the caller flag a difference no timestamp
/// captures (the aggregated assignment list of a load).
pub fn resolve(
    source: &SideState,
    target: &SideState,
    source_side: Side,
    tolerances: &Tolerances,
    source_forced_changed: bool
) -> Decision {
    let (source_tol, target_tol) = match source_side {
        Side::Supabase => (tolerances.supabase_ms, tolerances.airtable_ms),
        Side::Airtable => (tolerances.airtable_ms, tolerances.supabase_ms)
    };

    let source_changed = source_forced_changed || has_changed(source, source_tol);
    let target_changed = has_changed(target, target_tol);

    match (source_changed, target_changed) {
        (false, false) => Decision::Unchanged,
        (true, false) => Decision::Proceed,
        (false, true) => Decision::DestinationNewer,
        (true, true) => {
            let epoch = DateTime::<Utc>::MIN_UTC;
            let source_lc = source.last_changed.unwrap_or(epoch);
            let target_lc = target.last_changed.unwrap_or(epoch);
            let delta = source_lc - target_lc;
            let epsilon = Duration::milliseconds(tolerances.airtable_ms);
            if delta.abs() <= epsilon || delta > Duration::zero() {
                Decision::Proceed
            } else {
                Decision::BothChangedDestinationNewer
            }
        }
    }
}

/// Marker written to the source's `last_synced` after a successful
/// propagation: the source's own change timestamp when it is ahead of the
/// previous marker, otherwise the current time. Stamping the change time
/// rather than "now" keeps two stores that keep ticking their own change
/// markers from chasing each other forever.
pub fn sync_marker(source: &SideState, now: DateTime<Utc>) -> DateTime<Utc> {
    match (source.last_changed, source.last_synced) {
        (Some(lc), Some(ls)) if lc > ls => lc,
        (Some(lc), None) => lc,
        _ => now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn state(lc: &str, ls: &str) -> SideState {
        SideState {
            last_changed: Some(ts(lc)),
            last_synced: Some(ts(ls))
        }
    }

    const TOL: Tolerances = Tolerances {
        supabase_ms: 1000,
        airtable_ms: 60000
    };

    #[test]
    fn test_within_tolerance_is_unchanged() {
        // Change and sync 800ms apart, inside the 1s relational window.
        let source = state("2024-01-02T10:00:00.800Z", "2024-01-02T10:00:00Z");
        let target = state("2024-01-02T09:00:00Z", "2024-01-02T09:30:00Z");
        let decision = resolve(&source, &target, Side::Supabase, &TOL, false);
        assert_eq!(decision, Decision::Unchanged);
    }

    #[test]
    fn test_only_source_changed_proceeds() {
        let source = state("2024-01-02T10:00:00Z", "2024-01-02T09:00:00Z");
        let target = state("2024-01-02T08:00:00Z", "2024-01-02T08:30:00Z");
        let decision = resolve(&source, &target, Side::Supabase, &TOL, false);
        assert_eq!(decision, Decision::Proceed);
    }

    #[test]
    fn test_only_target_changed_skips() {
        let source = state("2024-01-02T09:00:00Z", "2024-01-02T09:30:00Z");
        let target = state("2024-01-02T10:00:00Z", "2024-01-02T09:00:00Z");
        let decision = resolve(&source, &target, Side::Supabase, &TOL, false);
        assert_eq!(decision, Decision::DestinationNewer);
    }

    #[test]
    fn test_both_changed_runs_each_direction() {
        // Relational changed at 10:00, sheet at 10:30; 30min apart, well past
        // the 1min tie window, so the sheet side wins both comparisons.
        let relational = state("2024-01-02T10:00:00Z", "2024-01-02T09:00:00Z");
        let sheet = state("2024-01-02T10:30:00Z", "2024-01-02T09:30:00Z");

        let sheet_to_rel = resolve(&sheet, &relational, Side::Airtable, &TOL, false);
        assert_eq!(sheet_to_rel, Decision::Proceed);

        let rel_to_sheet = resolve(&relational, &sheet, Side::Supabase, &TOL, false);
        assert_eq!(rel_to_sheet, Decision::BothChangedDestinationNewer);
    }

    #[test]
    fn test_both_changed_tie_goes_to_source() {
        let source = state("2024-01-02T10:00:30Z", "2024-01-02T09:00:00Z");
        let target = state("2024-01-02T10:00:00Z", "2024-01-02T09:00:00Z");
        // 30s apart, inside the 1min sheet epsilon.
        let decision = resolve(&source, &target, Side::Supabase, &TOL, false);
        assert_eq!(decision, Decision::Proceed);

        let reversed = resolve(&target, &source, Side::Airtable, &TOL, false);
        assert_eq!(reversed, Decision::Proceed);
    }

    #[test]
    fn test_missing_timestamps_count_as_changed() {
        let fresh = SideState {
            last_changed: Some(ts("2024-01-02T10:00:00Z")),
            last_synced: None
        };
        assert!(has_changed(&fresh, TOL.supabase_ms));

        // A new source record against a missing target must proceed.
        let decision = resolve(&fresh, &SideState::default(), Side::Airtable, &TOL, false);
        assert_eq!(decision, Decision::Proceed);
    }

    #[test]
    fn test_forced_change_overrides_quiet_timestamps() {
        let quiet = state("2024-01-02T09:00:00Z", "2024-01-02T09:30:00Z");
        let target = state("2024-01-02T08:00:00Z", "2024-01-02T08:30:00Z");
        assert_eq!(
            resolve(&quiet, &target, Side::Supabase, &TOL, false),
            Decision::Unchanged
        );
        assert_eq!(
            resolve(&quiet, &target, Side::Supabase, &TOL, true),
            Decision::Proceed
        );
    }

    #[test]
    fn test_sync_marker_prefers_change_time() {
        let now = ts("2024-01-02T12:00:00Z");
        let advanced = state("2024-01-02T10:00:00Z", "2024-01-02T09:00:00Z");
        assert_eq!(sync_marker(&advanced, now), ts("2024-01-02T10:00:00Z"));

        let settled = state("2024-01-02T09:00:00Z", "2024-01-02T10:00:00Z");
        assert_eq!(sync_marker(&settled, now), now);

        assert_eq!(sync_marker(&SideState::default(), now), now);
    }
}
