//! Full-run orchestration.
//!
//! Drives every (entity, direction) pair in dependency order, records one
//! `system_sync_runs` row per pair on the relational side, and aggregates
//! the run-level error summary. Bookkeeping failures never abort the run,
//! and an entity-level failure is recorded only after its run row is
//! closed, then the next entity proceeds.

use crate::airtable::{AirtableClient, SheetStore};
use crate::config::EngineConfig;
use crate::entity::{Direction, EntityKind, RUN_ORDER};
use crate::error::{SyncError, SyncResult};
use crate::payload::Record;
use crate::supabase::{RelationalStore, SupabaseClient};
use crate::syncer::{EntityStats, EntitySyncer, ErrorSummary};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

const SYNC_RUNS_TABLE: &str = "system_sync_runs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Manual,
    Scheduled
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled"
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRunReport {
    pub entity: EntityKind,
    pub direction: Direction,
    pub stats: EntityStats
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_type: RunType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub entities: Vec<EntityRunReport>
}

impl RunReport {
    fn new(run_type: RunType) -> Self {
        Self {
            run_type,
            started_at: Utc::now(),
            finished_at: None,
            entities: Vec::new()
        }
    }

    pub fn created(&self) -> u32 {
        self.entities.iter().map(|e| e.stats.created).sum()
    }

    pub fn updated(&self) -> u32 {
        self.entities.iter().map(|e| e.stats.updated).sum()
    }

    pub fn errors(&self) -> u32 {
        self.entities.iter().map(|e| e.stats.errors).sum()
    }
}

pub struct RunCoordinator {
    relational: Arc<dyn RelationalStore>,
    syncer: EntitySyncer,
    shutdown: Arc<AtomicBool>
}

impl RunCoordinator {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        sheet: Arc<dyn SheetStore>,
        config: &EngineConfig
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let syncer = EntitySyncer::new(
            Arc::clone(&relational),
            sheet,
            config.tolerances,
            config.rules.clone(),
            Arc::clone(&shutdown)
        );
        Self {
            relational,
            syncer,
            shutdown
        }
    }

    pub fn from_config(config: &EngineConfig) -> SyncResult<Self> {
        let relational: Arc<dyn RelationalStore> = Arc::new(SupabaseClient::new(
            config.supabase_url.clone(),
            config.supabase_service_key.clone()
        )?);
        let sheet: Arc<dyn SheetStore> = Arc::new(AirtableClient::new(
            config.airtable_token.clone(),
            config.airtable_base_id.clone(),
            config.tables.clone(),
            config.field_maps.clone()
        )?);
        Ok(Self::new(relational, sheet, config))
    }

    /// Flag checked between records and between entities; setting it stops
    /// the run after the in-flight record completes.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run the ordered pipeline: every sheet -> relational pass completes
    /// before any relational -> sheet pass begins. `entities` empty means
    /// the full default order.
    pub async fn run(&self, entities: &[EntityKind], run_type: RunType) -> SyncResult<RunReport> {
        let ordered: Vec<EntityKind> = RUN_ORDER
            .iter()
            .copied()
            .filter(|kind| entities.is_empty() || entities.contains(kind))
            .collect();

        let mut report = RunReport::new(run_type);
        let mut summary = ErrorSummary::default();
        info!(run_type = run_type.as_str(), entities = ?ordered, "starting sync run");

        'directions: for direction in [Direction::AirtableToSupabase, Direction::SupabaseToAirtable]
        {
            for kind in &ordered {
                if self.shutdown.load(Ordering::Relaxed) {
                    info!("shutdown requested, ending run early");
                    break 'directions;
                }

                let run_id = self.open_sync_run(*kind, direction, run_type).await;
                let mut stats = EntityStats::default();
                let result = self
                    .syncer
                    .sync_entity(*kind, direction, &mut stats, &mut summary)
                    .await;
                self.close_sync_run(run_id.as_deref(), &stats).await;

                if let Err(err) = result {
                    error!(
                        entity = %kind,
                        direction = %direction,
                        error = %err,
                        "entity sync failed"
                    );
                    stats.errors += 1;
                    summary.record(*kind, direction, &err, "-");
                }

                info!(
                    entity = %kind,
                    direction = %direction,
                    processed = stats.processed,
                    created = stats.created,
                    updated = stats.updated,
                    unchanged = stats.unchanged,
                    skipped = stats.skipped,
                    errors = stats.errors,
                    "entity sync finished"
                );
                report.entities.push(EntityRunReport {
                    entity: *kind,
                    direction,
                    stats
                });
            }
        }

        report.finished_at = Some(Utc::now());
        if summary.is_empty() {
            info!(
                created = report.created(),
                updated = report.updated(),
                "sync run completed"
            );
        } else {
            warn!(
                created = report.created(),
                updated = report.updated(),
                errors = summary.total(),
                "sync run completed with errors"
            );
            summary.log_report();
        }
        Ok(report)
    }

    async fn open_sync_run(
        &self,
        kind: EntityKind,
        direction: Direction,
        run_type: RunType
    ) -> Option<String> {
        let mut row = Record::new();
        row.insert("table_name".to_string(), json!(kind.table()));
        row.insert("direction".to_string(), json!(direction.as_str()));
        row.insert("type".to_string(), json!(run_type.as_str()));
        row.insert(
            "started_at".to_string(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
        );
        row.insert("processed".to_string(), json!(0));
        row.insert("updated".to_string(), json!(0));
        row.insert("errors".to_string(), json!(0));

        match self.relational.insert(SYNC_RUNS_TABLE, &row).await {
            Ok(created) => row_id_string(&created),
            Err(err) => {
                warn!(entity = %kind, error = %err, "could not open sync_run row");
                None
            }
        }
    }

    async fn close_sync_run(&self, run_id: Option<&str>, stats: &EntityStats) {
        let Some(run_id) = run_id else {
            return;
        };
        let mut patch = Record::new();
        patch.insert("processed".to_string(), json!(stats.processed));
        patch.insert("updated".to_string(), json!(stats.updated));
        patch.insert("errors".to_string(), json!(stats.errors));
        patch.insert(
            "finished_at".to_string(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
        );
        if let Err(err) = self.relational.update(SYNC_RUNS_TABLE, run_id, &patch).await {
            warn!(run_id = %run_id, error = %err, "could not close sync_run row");
        }
    }
}

fn row_id_string(row: &Record) -> Option<String> {
    match row.get("id")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None
    }
}

/// Parse and validate CLI entity arguments against the known table names.
pub fn parse_entities(names: &[String]) -> Result<Vec<EntityKind>, SyncError> {
    let mut kinds = Vec::new();
    for name in names {
        match EntityKind::parse(name) {
            Some(kind) => {
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
            }
            None => {
                return Err(SyncError::Config(format!(
                    "unknown entity '{name}', valid entities: {}",
                    EntityKind::valid_names().join(", ")
                )));
            }
        }
    }
    Ok(kinds)
}
