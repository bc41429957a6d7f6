//! Environment configuration.
//!
//! Every logical setting resolves through environment-suffixed variants
//! before the base name, so one process environment can carry several
//! deployments side by side. With `ENV=prod`, `SUPABASE_URL` resolves by
//! trying `SUPABASE_URL_PROD`, `SUPABASE_URL_prod`, `PROD_SUPABASE_URL`,
//! `prod_SUPABASE_URL`, then `SUPABASE_URL`. `ENV` defaults to `dev`.

use crate::airtable::{EntityFieldMap, FieldMapEntry, TableRef};
use crate::conflict::Tolerances;
use crate::entity::{EntityKind, RUN_ORDER};
use crate::error::{SyncError, SyncResult};
use crate::payload::SyncRules;
use crate::value::deep_merge;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

const DEFAULT_INTERVAL_MINUTES: u64 = 15;
const DEFAULT_SUPABASE_TOLERANCE_MS: i64 = 1000;
const DEFAULT_AIRTABLE_TOLERANCE_MS: i64 = 60000;
/// Floor applied to tolerance defaults when the variable is unset.
const MIN_TOLERANCE_MS: i64 = 5000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub env_name: String,
    pub supabase_url: String,
    pub supabase_service_key: String,
    pub airtable_token: String,
    pub airtable_base_id: String,
    pub tables: HashMap<EntityKind, TableRef>,
    pub field_maps: HashMap<EntityKind, EntityFieldMap>,
    pub interval_minutes: u64,
    pub tolerances: Tolerances,
    pub rules: SyncRules
}

impl EngineConfig {
    pub fn from_env() -> SyncResult<Self> {
        let env_name = env::var("ENV")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "dev".to_string());

        let supabase_url = require(&env_name, "SUPABASE_URL")?;
        let supabase_service_key = require(&env_name, "SUPABASE_SERVICE_KEY")?;
        let airtable_token = require(&env_name, "AIRTABLE_TOKEN")?;
        let airtable_base_id = require(&env_name, "AIRTABLE_BASE_ID")?;

        let mut tables = HashMap::new();
        for kind in RUN_ORDER {
            let suffix = kind.table().to_uppercase();
            let table = TableRef {
                id: resolve(&env_name, &format!("AIRTABLE_TABLE_ID_{suffix}")),
                name: resolve(&env_name, &format!("AIRTABLE_TABLE_NAME_{suffix}"))
            };
            if table.id.is_none() && table.name.is_none() {
                return Err(SyncError::Config(format!(
                    "no Airtable table configured for {kind}: set AIRTABLE_TABLE_ID_{suffix} or \
                     AIRTABLE_TABLE_NAME_{suffix}"
                )));
            }
            tables.insert(kind, table);
        }

        let interval_minutes = resolve_parsed(&env_name, "SYNC_INTERVAL_MINUTES")?
            .unwrap_or(DEFAULT_INTERVAL_MINUTES);
        if interval_minutes == 0 {
            return Err(SyncError::Config(
                "SYNC_INTERVAL_MINUTES must be at least 1".to_string()
            ));
        }

        Ok(Self {
            field_maps: load_field_maps(&env_name)?,
            interval_minutes,
            tolerances: Tolerances {
                supabase_ms: tolerance(&env_name, "SYNC_TOLERANCE_SUPABASE_MS", DEFAULT_SUPABASE_TOLERANCE_MS)?,
                airtable_ms: tolerance(&env_name, "SYNC_TOLERANCE_AIRTABLE_MS", DEFAULT_AIRTABLE_TOLERANCE_MS)?
            },
            rules: load_rules(&env_name)?,
            env_name,
            supabase_url,
            supabase_service_key,
            airtable_token,
            airtable_base_id,
            tables
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

/// Resolve a setting by its environment-suffixed variants, then the base
/// name. Empty values count as unset.
fn resolve(env_name: &str, name: &str) -> Option<String> {
    let upper = env_name.to_uppercase();
    let lower = env_name.to_lowercase();
    let candidates = [
        format!("{name}_{upper}"),
        format!("{name}_{lower}"),
        format!("{upper}_{name}"),
        format!("{lower}_{name}"),
        name.to_string()
    ];
    candidates
        .iter()
        .filter_map(|key| env::var(key).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn require(env_name: &str, name: &str) -> SyncResult<String> {
    resolve(env_name, name)
        .ok_or_else(|| SyncError::Config(format!("missing required setting {name}")))
}

fn resolve_parsed<T: std::str::FromStr>(env_name: &str, name: &str) -> SyncResult<Option<T>> {
    match resolve(env_name, name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("invalid value for {name}: {raw}"))),
        None => Ok(None)
    }
}

fn tolerance(env_name: &str, name: &str, default_ms: i64) -> SyncResult<i64> {
    Ok(match resolve_parsed::<i64>(env_name, name)? {
        Some(ms) => ms,
        None => default_ms.max(MIN_TOLERANCE_MS)
    })
}

/// Per-entity field maps come from an optional JSON file shaped
/// `{env: {entity: {key: {id, name}}}}` plus inline
/// `AIRTABLE_FIELD_MAP_<ENTITY>` overrides (`key=fieldId[|fieldName],…`),
/// inline entries winning on conflict.
fn load_field_maps(env_name: &str) -> SyncResult<HashMap<EntityKind, EntityFieldMap>> {
    let mut merged = Value::Object(serde_json::Map::new());

    if let Some(path) = resolve(env_name, "AIRTABLE_FIELD_MAP_FILE") {
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| SyncError::Config(format!("cannot read field map file {path}: {e}")))?;
        let file: Value = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("invalid field map file {path}: {e}")))?;
        let section = file
            .get(env_name)
            .or_else(|| file.get(env_name.to_lowercase()))
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        deep_merge(&mut merged, &section);
    }

    for kind in RUN_ORDER {
        let var = format!("AIRTABLE_FIELD_MAP_{}", kind.table().to_uppercase());
        if let Some(inline) = resolve(env_name, &var) {
            let parsed = parse_inline_field_map(&inline)
                .map_err(|reason| SyncError::Config(format!("invalid {var}: {reason}")))?;
            let mut overlay = serde_json::Map::new();
            overlay.insert(kind.table().to_string(), parsed);
            deep_merge(&mut merged, &Value::Object(overlay));
        }
    }

    let mut maps = HashMap::new();
    for kind in RUN_ORDER {
        let entity_map: EntityFieldMap = match merged.get(kind.table()) {
            Some(section) => serde_json::from_value(section.clone()).map_err(|e| {
                SyncError::Config(format!("invalid field map for {kind}: {e}"))
            })?,
            None => EntityFieldMap::new()
        };
        maps.insert(kind, entity_map);
    }
    Ok(maps)
}

fn parse_inline_field_map(raw: &str) -> Result<Value, String> {
    let mut map = serde_json::Map::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("entry without '=': {entry}"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("entry with empty key: {entry}"));
        }
        let (id, name) = match value.split_once('|') {
            Some((id, name)) => (id.trim(), Some(name.trim())),
            None => (value.trim(), None)
        };
        let entry = FieldMapEntry {
            id: (!id.is_empty()).then(|| id.to_string()),
            name: name.filter(|n| !n.is_empty()).map(|n| n.to_string())
        };
        map.insert(key.to_string(), serde_json::to_value(entry).unwrap_or(Value::Null));
    }
    Ok(Value::Object(map))
}

fn load_rules(env_name: &str) -> SyncResult<SyncRules> {
    match resolve(env_name, "SYNC_RULES_FILE") {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| SyncError::Config(format!("cannot read sync rules file {path}: {e}")))?;
            serde_json::from_str(&raw)
                .map_err(|e| SyncError::Config(format!("invalid sync rules file {path}: {e}")))
        }
        None => Ok(SyncRules::default())
    }
}
