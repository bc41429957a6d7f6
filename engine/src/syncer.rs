//! Per-entity, per-direction reconciliation.
//!
//! One invocation fetches both sides (plus any link parents) in parallel,
//! builds the cross-ref indexes, then walks the source records one by one:
//! locate the twin, gate through the conflict policy, map, diff, write,
//! back-link, stamp. Writes are strictly sequential; the sheet API's rate
//! limiting does not tolerate concurrent record writes.

use crate::airtable::{EntityFieldMap, SheetRecord, SheetStore};
use crate::conflict::{self, Decision, Side, SideState, Tolerances};
use crate::entity::{Direction, EntityKind, EntitySpec, LOAD_CARS_TABLE, MatchKey};
use crate::error::{SyncError, SyncResult};
use crate::mapper::{self, MapContext};
use crate::payload::{self, Record, SyncRules};
use crate::supabase::RelationalStore;
use crate::value::{as_trimmed_str, is_blank, linked_ids, parse_timestamp};
use crate::xref::{self, CrossRef};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EntityStats {
    pub processed: u32,
    pub created: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub skipped: u32,
    pub errors: u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Updated,
    Unchanged,
    Skipped
}

/// Run-level error aggregation keyed by (entity, direction, error kind,
/// normalized message), with the set of affected record ids.
#[derive(Debug, Default)]
pub struct ErrorSummary {
    entries: BTreeMap<SummaryKey, SummaryEntry>
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SummaryKey {
    entity: &'static str,
    direction: Direction,
    kind: &'static str,
    message: String
}

#[derive(Debug, Default)]
struct SummaryEntry {
    count: usize,
    record_ids: BTreeSet<String>
}

impl ErrorSummary {
    pub fn record(
        &mut self,
        entity: EntityKind,
        direction: Direction,
        error: &SyncError,
        record_id: &str
    ) {
        let key = SummaryKey {
            entity: entity.table(),
            direction,
            kind: error.kind_label(),
            message: normalize_message(&error.to_string())
        };
        let entry = self.entries.entry(key).or_default();
        entry.count += 1;
        entry.record_ids.insert(record_id.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total(&self) -> usize {
        self.entries.values().map(|e| e.count).sum()
    }

    /// One line per error category.
    pub fn log_report(&self) {
        for (key, entry) in &self.entries {
            warn!(
                entity = key.entity,
                direction = %key.direction,
                kind = key.kind,
                count = entry.count,
                records = ?entry.record_ids,
                message = %key.message,
                "sync error category"
            );
        }
    }
}

fn normalize_message(message: &str) -> String {
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(200).collect()
}

enum Fetched {
    Pair(EntityKind, Vec<Record>, Vec<SheetRecord>),
    Assignments(Vec<Record>)
}

pub struct EntitySyncer {
    relational: Arc<dyn RelationalStore>,
    sheet: Arc<dyn SheetStore>,
    tolerances: Tolerances,
    rules: SyncRules,
    shutdown: Arc<AtomicBool>
}

impl EntitySyncer {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        sheet: Arc<dyn SheetStore>,
        tolerances: Tolerances,
        rules: SyncRules,
        shutdown: Arc<AtomicBool>
    ) -> Self {
        Self {
            relational,
            sheet,
            tolerances,
            rules,
            shutdown
        }
    }

    pub async fn sync_entity(
        &self,
        kind: EntityKind,
        direction: Direction,
        stats: &mut EntityStats,
        summary: &mut ErrorSummary
    ) -> SyncResult<()> {
        let spec = kind.spec();
        info!(entity = %kind, direction = %direction, "syncing entity");

        let mut needed = vec![kind];
        for link in spec.links {
            if !needed.contains(&link.target) {
                needed.push(link.target);
            }
        }
        let wants_assignments =
            kind == EntityKind::Load && direction == Direction::SupabaseToAirtable;
        if wants_assignments && !needed.contains(&EntityKind::Car) {
            needed.push(EntityKind::Car);
        }

        // All reads go out together; per-record work starts once every list
        // is in.
        let mut tasks: JoinSet<SyncResult<Fetched>> = JoinSet::new();
        for entity in needed {
            let relational = Arc::clone(&self.relational);
            let sheet = Arc::clone(&self.sheet);
            tasks.spawn(async move {
                let (rows, records) = tokio::try_join!(
                    relational.fetch_table(entity.table()),
                    sheet.fetch_table(entity)
                )?;
                Ok(Fetched::Pair(entity, rows, records))
            });
        }
        if wants_assignments {
            let relational = Arc::clone(&self.relational);
            tasks.spawn(async move {
                Ok(Fetched::Assignments(
                    relational.fetch_table(LOAD_CARS_TABLE).await?
                ))
            });
        }

        let mut pairs: HashMap<EntityKind, (Vec<Record>, Vec<SheetRecord>)> = HashMap::new();
        let mut join_rows: Vec<Record> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| SyncError::Internal(e.to_string()))?? {
                Fetched::Pair(entity, rows, records) => {
                    pairs.insert(entity, (rows, records));
                }
                Fetched::Assignments(rows) => join_rows = rows
            }
        }

        let mut xrefs: HashMap<EntityKind, CrossRef> = pairs
            .iter()
            .map(|(entity, (rows, records))| (*entity, CrossRef::build(records, rows)))
            .collect();

        let assignments = wants_assignments
            .then(|| xref::load_cars_index(&join_rows, &xrefs[&EntityKind::Car]));
        let assignment_changes = assignment_change_times(&join_rows);

        let (rows, records) = pairs
            .remove(&kind)
            .ok_or_else(|| SyncError::Internal(format!("no fetch result for {kind}")))?;
        let field_map = self.sheet.field_map(kind).clone();

        match direction {
            Direction::AirtableToSupabase => {
                self.import_records(spec, records, rows, &mut xrefs, &field_map, stats, summary)
                    .await
            }
            Direction::SupabaseToAirtable => {
                self.export_records(
                    spec,
                    rows,
                    records,
                    &mut xrefs,
                    &field_map,
                    assignments.as_ref(),
                    &assignment_changes,
                    stats,
                    summary
                )
                .await
            }
        }
    }

    /// Sheet -> relational pass over one entity.
    #[allow(clippy::too_many_arguments)]
    async fn import_records(
        &self,
        spec: &'static EntitySpec,
        records: Vec<SheetRecord>,
        rows: Vec<Record>,
        xrefs: &mut HashMap<EntityKind, CrossRef>,
        field_map: &EntityFieldMap,
        stats: &mut EntityStats,
        summary: &mut ErrorSummary
    ) -> SyncResult<()> {
        let mut row_by_id: HashMap<String, Record> = HashMap::new();
        let mut secondary: HashMap<String, String> = HashMap::new();
        for row in rows {
            let Some(id) = row.get("id").and_then(as_trimmed_str) else {
                continue;
            };
            if let Some(key) = relational_match_value(spec.match_key, &row) {
                secondary.entry(key).or_insert_with(|| id.clone());
            }
            row_by_id.insert(id, row);
        }

        for record in &records {
            if self.shutdown.load(Ordering::Relaxed) {
                info!(entity = %spec.kind, "shutdown requested, stopping entity loop");
                break;
            }
            stats.processed += 1;
            let outcome = self
                .import_one(spec, record, &row_by_id, &secondary, xrefs, field_map)
                .await;
            match outcome {
                Ok(Outcome::Created) => stats.created += 1,
                Ok(Outcome::Updated) => stats.updated += 1,
                Ok(Outcome::Unchanged) => stats.unchanged += 1,
                Ok(Outcome::Skipped) => stats.skipped += 1,
                Err(err) => {
                    stats.errors += 1;
                    warn!(
                        entity = %spec.kind,
                        record = %record.airtable_id,
                        error = %err,
                        "record import failed"
                    );
                    summary.record(
                        spec.kind,
                        Direction::AirtableToSupabase,
                        &err,
                        &record.airtable_id
                    );
                }
            }
        }
        Ok(())
    }

    async fn import_one(
        &self,
        spec: &'static EntitySpec,
        record: &SheetRecord,
        row_by_id: &HashMap<String, Record>,
        secondary: &HashMap<String, String>,
        xrefs: &mut HashMap<EntityKind, CrossRef>,
        field_map: &EntityFieldMap
    ) -> SyncResult<Outcome> {
        let kind = spec.kind;
        let target_id = xrefs[&kind]
            .relational_id(&record.airtable_id)
            .map(str::to_string)
            .or_else(|| {
                sheet_match_value(spec.match_key, record, field_map)
                    .and_then(|key| secondary.get(&key).cloned())
            });
        let target = target_id.as_ref().and_then(|id| row_by_id.get(id));

        let source_state = record.side_state(field_map);
        let target_state = target.map(relational_side_state).unwrap_or_default();
        match conflict::resolve(
            &source_state,
            &target_state,
            Side::Airtable,
            &self.tolerances,
            false
        ) {
            Decision::Unchanged => return Ok(Outcome::Unchanged),
            Decision::DestinationNewer => {
                debug!(record = %record.airtable_id, "destination is newer, skipping");
                return Ok(Outcome::Skipped);
            }
            Decision::BothChangedDestinationNewer => {
                debug!(record = %record.airtable_id, "both changed, destination is newer, skipping");
                return Ok(Outcome::Skipped);
            }
            Decision::Proceed => {}
        }

        let candidate = {
            let ctx = MapContext {
                xrefs,
                load_cars: None
            };
            mapper::map_sheet_to_relational(spec, record, field_map, &ctx)
        };
        let prepared = payload::prepare(
            candidate,
            target,
            Direction::AirtableToSupabase,
            spec.table,
            &self.rules
        );

        let (relational_id, outcome) = match target {
            Some(row) => {
                let id = row
                    .get("id")
                    .and_then(as_trimmed_str)
                    .ok_or_else(|| SyncError::MissingRecordId(record.airtable_id.clone()))?;
                if prepared.is_empty() {
                    (id, Outcome::Unchanged)
                } else {
                    self.relational.update(spec.table, &id, &prepared).await?;
                    (id, Outcome::Updated)
                }
            }
            None => {
                ensure_required(spec, &prepared)?;
                let mut insert_payload = prepared;
                // A sheet record that already carries a relational id keeps it.
                let new_id = record
                    .value("supabase_id", field_map)
                    .and_then(as_trimmed_str)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                insert_payload.insert("id".to_string(), json!(new_id));
                let row = self.relational.insert(spec.table, &insert_payload).await?;
                let id = row
                    .get("id")
                    .and_then(as_trimmed_str)
                    .ok_or_else(|| SyncError::MissingRecordId(record.airtable_id.clone()))?;
                if let Some(self_xref) = xrefs.get_mut(&kind) {
                    self_xref.insert_pair(&id, &record.airtable_id);
                }
                (id, Outcome::Created)
            }
        };

        let marker = conflict::sync_marker(&source_state, Utc::now());
        let mut patch = Record::new();
        let backlink = record.value("supabase_id", field_map).and_then(as_trimmed_str);
        if backlink.as_deref() != Some(relational_id.as_str()) {
            patch.insert("supabase_id".to_string(), json!(relational_id));
        }
        patch.insert(
            "last_synced".to_string(),
            json!(marker.to_rfc3339_opts(SecondsFormat::Millis, true))
        );
        self.sheet.update(kind, &record.airtable_id, &patch).await?;

        Ok(outcome)
    }

    /// Relational -> sheet pass over one entity.
    #[allow(clippy::too_many_arguments)]
    async fn export_records(
        &self,
        spec: &'static EntitySpec,
        rows: Vec<Record>,
        records: Vec<SheetRecord>,
        xrefs: &mut HashMap<EntityKind, CrossRef>,
        field_map: &EntityFieldMap,
        assignments: Option<&HashMap<String, Vec<String>>>,
        assignment_changes: &HashMap<String, DateTime<Utc>>,
        stats: &mut EntityStats,
        summary: &mut ErrorSummary
    ) -> SyncResult<()> {
        let mut record_by_id: HashMap<String, SheetRecord> = HashMap::new();
        let mut secondary: HashMap<String, String> = HashMap::new();
        for record in records {
            if let Some(key) = sheet_match_value(spec.match_key, &record, field_map) {
                secondary
                    .entry(key)
                    .or_insert_with(|| record.airtable_id.clone());
            }
            record_by_id.insert(record.airtable_id.clone(), record);
        }

        for row in &rows {
            if self.shutdown.load(Ordering::Relaxed) {
                info!(entity = %spec.kind, "shutdown requested, stopping entity loop");
                break;
            }
            stats.processed += 1;
            let row_id = row
                .get("id")
                .and_then(as_trimmed_str)
                .unwrap_or_else(|| "(missing id)".to_string());
            let outcome = self
                .export_one(
                    spec,
                    row,
                    &record_by_id,
                    &secondary,
                    xrefs,
                    field_map,
                    assignments,
                    assignment_changes
                )
                .await;
            match outcome {
                Ok(Outcome::Created) => stats.created += 1,
                Ok(Outcome::Updated) => stats.updated += 1,
                Ok(Outcome::Unchanged) => stats.unchanged += 1,
                Ok(Outcome::Skipped) => stats.skipped += 1,
                Err(err) => {
                    stats.errors += 1;
                    warn!(
                        entity = %spec.kind,
                        record = %row_id,
                        error = %err,
                        "record export failed"
                    );
                    summary.record(spec.kind, Direction::SupabaseToAirtable, &err, &row_id);
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn export_one(
        &self,
        spec: &'static EntitySpec,
        row: &Record,
        record_by_id: &HashMap<String, SheetRecord>,
        secondary: &HashMap<String, String>,
        xrefs: &mut HashMap<EntityKind, CrossRef>,
        field_map: &EntityFieldMap,
        assignments: Option<&HashMap<String, Vec<String>>>,
        assignment_changes: &HashMap<String, DateTime<Utc>>
    ) -> SyncResult<Outcome> {
        let kind = spec.kind;
        let relational_id = row
            .get("id")
            .and_then(as_trimmed_str)
            .ok_or_else(|| SyncError::MissingRecordId(format!("{} row without id", spec.table)))?;

        let target_id = xrefs[&kind]
            .sheet_id(&relational_id)
            .map(str::to_string)
            .or_else(|| {
                relational_match_value(spec.match_key, row)
                    .and_then(|key| secondary.get(&key).cloned())
            });
        let target = target_id.as_ref().and_then(|id| record_by_id.get(id));

        let mut source_state = relational_side_state(row);
        let mut forced = false;
        if kind == EntityKind::Load {
            // The load's change marker covers its assignment rows, and the
            // computed car list differing from the sheet forces a write even
            // when no timestamp moved.
            if let Some(join_lc) = assignment_changes.get(&relational_id) {
                source_state.last_changed = Some(match source_state.last_changed {
                    Some(lc) => lc.max(*join_lc),
                    None => *join_lc
                });
            }
            let computed: BTreeSet<String> = assignments
                .and_then(|index| index.get(&relational_id))
                .map(|list| list.iter().map(|id| id.trim().to_string()).collect())
                .unwrap_or_default();
            let current: BTreeSet<String> = target
                .and_then(|t| t.value("load_cars", field_map))
                .map(|v| linked_ids(v).into_iter().collect())
                .unwrap_or_default();
            forced = computed != current;
        }
        let target_state = target.map(|t| t.side_state(field_map)).unwrap_or_default();

        match conflict::resolve(
            &source_state,
            &target_state,
            Side::Supabase,
            &self.tolerances,
            forced
        ) {
            Decision::Unchanged => return Ok(Outcome::Unchanged),
            Decision::DestinationNewer => {
                debug!(record = %relational_id, "destination is newer, skipping");
                return Ok(Outcome::Skipped);
            }
            Decision::BothChangedDestinationNewer => {
                debug!(record = %relational_id, "both changed, destination is newer, skipping");
                return Ok(Outcome::Skipped);
            }
            Decision::Proceed => {}
        }

        let candidate = {
            let ctx = MapContext {
                xrefs,
                load_cars: assignments
            };
            mapper::map_relational_to_sheet(spec, row, &ctx)
        };
        let target_view: Option<Record> = target.map(|t| {
            candidate
                .keys()
                .filter_map(|key| t.value(key, field_map).map(|v| (key.clone(), v.clone())))
                .collect()
        });
        let prepared = payload::prepare(
            candidate,
            target_view.as_ref(),
            Direction::SupabaseToAirtable,
            spec.table,
            &self.rules
        );

        let (applied, outcome) = match target {
            Some(existing) => {
                if prepared.is_empty() {
                    (None, Outcome::Unchanged)
                } else {
                    let updated = self
                        .sheet
                        .update(kind, &existing.airtable_id, &prepared)
                        .await?;
                    (Some(updated), Outcome::Updated)
                }
            }
            None => {
                ensure_required(spec, &prepared)?;
                let created = self.sheet.create(kind, &prepared).await?;
                if let Some(self_xref) = xrefs.get_mut(&kind) {
                    self_xref.insert_pair(&relational_id, &created.airtable_id);
                }
                (Some(created), Outcome::Created)
            }
        };

        let marker = conflict::sync_marker(&source_state, Utc::now());
        let mut patch = Record::new();
        if let Some(sheet_record) = applied.as_ref().or(target) {
            if row.get("airtable_id").and_then(as_trimmed_str).as_deref()
                != Some(sheet_record.airtable_id.as_str())
            {
                patch.insert("airtable_id".to_string(), json!(sheet_record.airtable_id));
            }
            let label = mapper::name_label(sheet_record, field_map);
            if row
                .get("airtable_id_name_label")
                .and_then(as_trimmed_str)
                .as_deref()
                != Some(label.as_str())
            {
                patch.insert("airtable_id_name_label".to_string(), json!(label));
            }
        }
        patch.insert(
            "last_synced".to_string(),
            json!(marker.to_rfc3339_opts(SecondsFormat::Millis, true))
        );
        self.relational.update(spec.table, &relational_id, &patch).await?;

        Ok(outcome)
    }
}

fn relational_side_state(row: &Record) -> SideState {
    SideState {
        last_changed: row.get("last_changed_for_sync").and_then(parse_timestamp),
        last_synced: row.get("last_synced").and_then(parse_timestamp)
    }
}

fn assignment_change_times(rows: &[Record]) -> HashMap<String, DateTime<Utc>> {
    let mut changes: HashMap<String, DateTime<Utc>> = HashMap::new();
    for row in rows {
        let Some(load_id) = row.get("load_id").and_then(as_trimmed_str) else {
            continue;
        };
        let Some(lc) = row.get("last_changed_for_sync").and_then(parse_timestamp) else {
            continue;
        };
        changes
            .entry(load_id)
            .and_modify(|current| {
                if lc > *current {
                    *current = lc;
                }
            })
            .or_insert(lc);
    }
    changes
}

fn ensure_required(spec: &EntitySpec, payload: &Record) -> SyncResult<()> {
    for field in spec.required {
        let present = payload.get(*field).is_some_and(|v| !is_blank(v));
        if !present {
            return Err(SyncError::MissingRequiredField {
                entity: spec.table.to_string(),
                field: (*field).to_string()
            });
        }
    }
    Ok(())
}

fn relational_match_value(key: MatchKey, row: &Record) -> Option<String> {
    match key {
        MatchKey::Field(field) | MatchKey::Trimmed(field) => {
            row.get(field).and_then(as_trimmed_str)
        }
        MatchKey::Folded(field) => row
            .get(field)
            .and_then(as_trimmed_str)
            .map(|s| s.to_lowercase()),
        MatchKey::AirtableId => row.get("airtable_id").and_then(as_trimmed_str)
    }
}

fn sheet_match_value(
    key: MatchKey,
    record: &SheetRecord,
    field_map: &EntityFieldMap
) -> Option<String> {
    match key {
        MatchKey::Field(field) | MatchKey::Trimmed(field) => {
            record.value(field, field_map).and_then(as_trimmed_str)
        }
        MatchKey::Folded(field) => record
            .value(field, field_map)
            .and_then(as_trimmed_str)
            .map(|s| s.to_lowercase()),
        MatchKey::AirtableId => Some(record.airtable_id.clone())
    }
}
