//! Sheet-side store adapter.
//!
//! Fetch normalizes records to `{airtable_id, last_modified, fields,
//! fields_by_id}`; when a field map carries field ids, a parallel
//! `returnFieldsByFieldId` fetch fills `fields_by_id` so keys renamed in the
//! base still resolve. Writes address fields by their configured name first
//! and degrade to field ids on `UNKNOWN_FIELD_NAME`; value rejections are
//! recovered by scanning the error message for the offending field names,
//! dropping them from both payload variants and retrying once.

use crate::conflict::SideState;
use crate::entity::EntityKind;
use crate::error::{SyncError, SyncResult};
use crate::payload::Record;
use crate::value::parse_timestamp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

const DEFAULT_API_URL: &str = "https://api.airtable.com/v0";
const PAGE_SIZE: usize = 100;

/// Keys the fetch normalization owns; they are never written back.
const RESERVED_KEYS: [&str; 4] = ["airtable_id", "last_modified", "raw_fields", "raw_fields_by_id"];

/// Sheet table addressing: a table id, a display name, or both. The id is
/// preferred when present because display names get renamed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableRef {
    pub id: Option<String>,
    pub name: Option<String>
}

impl TableRef {
    pub fn path(&self) -> &str {
        self.id.as_deref().or(self.name.as_deref()).unwrap_or_default()
    }
}

/// One configured field: the stable field id and/or the display name the
/// base currently uses for a canonical key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMapEntry {
    pub id: Option<String>,
    pub name: Option<String>
}

pub type EntityFieldMap = HashMap<String, FieldMapEntry>;

/// A sheet record normalized for the engine.
#[derive(Debug, Clone)]
pub struct SheetRecord {
    pub airtable_id: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub fields: Record,
    pub fields_by_id: Record
}

impl SheetRecord {
    /// Look a canonical key up under its candidate names (configured name,
    /// then the key itself), falling back to the field-id variant.
    pub fn value<'a>(&'a self, key: &str, map: &EntityFieldMap) -> Option<&'a Value> {
        let entry = map.get(key);
        if let Some(name) = entry.and_then(|e| e.name.as_deref()) {
            if let Some(value) = self.fields.get(name) {
                return Some(value);
            }
        }
        if let Some(value) = self.fields.get(key) {
            return Some(value);
        }
        let id = entry.and_then(|e| e.id.as_deref())?;
        self.fields_by_id.get(id)
    }

    /// Sync markers of the sheet side. The change marker falls back to the
    /// record-level modification time when the base carries no explicit
    /// `last_changed_for_sync` field.
    pub fn side_state(&self, map: &EntityFieldMap) -> SideState {
        SideState {
            last_changed: self
                .value("last_changed_for_sync", map)
                .and_then(parse_timestamp)
                .or(self.last_modified),
            last_synced: self.value("last_synced", map).and_then(parse_timestamp)
        }
    }
}

#[async_trait]
pub trait SheetStore: Send + Sync {
    async fn fetch_table(&self, entity: EntityKind) -> SyncResult<Vec<SheetRecord>>;
    async fn create(&self, entity: EntityKind, payload: &Record) -> SyncResult<SheetRecord>;
    async fn update(
        &self,
        entity: EntityKind,
        record_id: &str,
        payload: &Record
    ) -> SyncResult<SheetRecord>;
    async fn delete(&self, entity: EntityKind, record_id: &str) -> SyncResult<()>;
    fn field_map(&self, entity: EntityKind) -> &EntityFieldMap;
}

pub struct AirtableClient {
    client: Client,
    api_url: String,
    token: String,
    base_id: String,
    tables: HashMap<EntityKind, TableRef>,
    field_maps: HashMap<EntityKind, EntityFieldMap>
}

impl AirtableClient {
    pub fn new(
        token: String,
        base_id: String,
        tables: HashMap<EntityKind, TableRef>,
        field_maps: HashMap<EntityKind, EntityFieldMap>
    ) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(SyncError::Http)?;
        Ok(Self {
            client,
            api_url: DEFAULT_API_URL.to_string(),
            token,
            base_id,
            tables,
            field_maps
        })
    }

    /// Point the client at a different API root. Test hook.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn table_url(&self, entity: EntityKind) -> String {
        let table = self
            .tables
            .get(&entity)
            .map(TableRef::path)
            .unwrap_or_default();
        format!(
            "{}/{}/{}",
            self.api_url,
            self.base_id,
            urlencoding::encode(table)
        )
    }

    async fn fetch_pages(&self, entity: EntityKind, by_field_id: bool) -> SyncResult<Vec<ApiRecord>> {
        let url = self.table_url(entity);
        let mut records = Vec::new();
        let mut offset: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = vec![("pageSize", PAGE_SIZE.to_string())];
            if by_field_id {
                query.push(("returnFieldsByFieldId", "true".to_string()));
            }
            if let Some(cursor) = &offset {
                query.push(("offset", cursor.clone()));
            }

            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .query(&query)
                .send()
                .await?;
            let page: ListResponse = Self::parse_response(response).await?;

            records.extend(page.records);
            offset = page.offset;
            if offset.is_none() {
                break;
            }
        }
        Ok(records)
    }

    async fn parse_response<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response
    ) -> SyncResult<T> {
        let status = response.status();
        match status {
            s if s.is_success() => Ok(response.json::<T>().await?),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(30);
                Err(SyncError::RateLimited {
                    retry_after_seconds: retry_after
                })
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(SyncError::AirtableApi {
                    status: status.as_u16(),
                    message: body
                })
            }
        }
    }

    /// Split a canonical payload into the name-addressed and id-addressed
    /// variants, skipping reserved keys.
    fn build_payloads(&self, entity: EntityKind, payload: &Record) -> (Record, Record) {
        let map = self.field_map(entity);
        let mut by_name = Record::new();
        let mut by_id = Record::new();
        for (key, value) in payload {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            let entry = map.get(key);
            let name_key = entry
                .and_then(|e| e.name.as_deref())
                .unwrap_or(key.as_str());
            let id_key = entry.and_then(|e| e.id.as_deref()).unwrap_or(name_key);
            by_name.insert(name_key.to_string(), value.clone());
            by_id.insert(id_key.to_string(), value.clone());
        }
        (by_name, by_id)
    }

    async fn send_fields(
        &self,
        entity: EntityKind,
        record_id: Option<&str>,
        fields: &Record
    ) -> SyncResult<SheetRecord> {
        let body = serde_json::json!({ "fields": fields });
        let request = match record_id {
            Some(id) => self
                .client
                .patch(format!("{}/{}", self.table_url(entity), id)),
            None => self.client.post(self.table_url(entity))
        };
        let response = request.bearer_auth(&self.token).json(&body).send().await?;
        let api: ApiRecord = Self::parse_response(response).await?;
        Ok(normalize(api, None))
    }

    /// Write with the full degradation ladder: name payload, field-id
    /// payload on unknown field names, then one sanitized retry with the
    /// rejected fields dropped.
    async fn write(
        &self,
        entity: EntityKind,
        record_id: Option<&str>,
        payload: &Record
    ) -> SyncResult<SheetRecord> {
        let (by_name, by_id) = self.build_payloads(entity, payload);

        let mut used_ids = false;
        let mut last_err = match self.send_fields(entity, record_id, &by_name).await {
            Ok(record) => return Ok(record),
            Err(err) => err
        };

        if is_unknown_field_error(&last_err) && by_id != by_name {
            debug!(entity = %entity, "unknown field name, retrying with field-id payload");
            match self.send_fields(entity, record_id, &by_id).await {
                Ok(record) => return Ok(record),
                Err(err) => {
                    used_ids = true;
                    last_err = err;
                }
            }
        }

        let offending = match &last_err {
            SyncError::AirtableApi { status: 422, message } => extract_field_names(message),
            _ => Vec::new()
        };
        if offending.is_empty() {
            return Err(last_err);
        }

        let map = self.field_map(entity);
        let mut sanitized_by_name = by_name;
        let mut sanitized_by_id = by_id;
        let mut dropped = Vec::new();
        for field in &offending {
            for key in payload_keys_for(field, map) {
                if sanitized_by_name.remove(&key).is_some() | sanitized_by_id.remove(&key).is_some()
                {
                    dropped.push(key);
                }
            }
        }
        if dropped.is_empty() {
            return Err(last_err);
        }
        dropped.sort();
        dropped.dedup();
        warn!(
            entity = %entity,
            dropped = ?dropped,
            "sheet rejected field values, retrying without them"
        );

        let retry = if used_ids {
            &sanitized_by_id
        } else {
            &sanitized_by_name
        };
        if retry.is_empty() {
            return Err(SyncError::InvalidFieldValue { fields: offending });
        }
        self.send_fields(entity, record_id, retry).await
    }
}

#[async_trait]
impl SheetStore for AirtableClient {
    async fn fetch_table(&self, entity: EntityKind) -> SyncResult<Vec<SheetRecord>> {
        let map_has_ids = self
            .field_map(entity)
            .values()
            .any(|entry| entry.id.is_some());

        let records = self.fetch_pages(entity, false).await?;
        let by_id: Option<HashMap<String, Record>> = if map_has_ids {
            let pages = self.fetch_pages(entity, true).await?;
            Some(pages.into_iter().map(|r| (r.id.clone(), r.fields)).collect())
        } else {
            None
        };

        Ok(records
            .into_iter()
            .map(|api| {
                let fields_by_id = by_id
                    .as_ref()
                    .and_then(|m| m.get(&api.id).cloned())
                    .unwrap_or_default();
                normalize(api, Some(fields_by_id))
            })
            .collect())
    }

    async fn create(&self, entity: EntityKind, payload: &Record) -> SyncResult<SheetRecord> {
        self.write(entity, None, payload).await
    }

    async fn update(
        &self,
        entity: EntityKind,
        record_id: &str,
        payload: &Record
    ) -> SyncResult<SheetRecord> {
        self.write(entity, Some(record_id), payload).await
    }

    async fn delete(&self, entity: EntityKind, record_id: &str) -> SyncResult<()> {
        let response = self
            .client
            .delete(format!("{}/{}", self.table_url(entity), record_id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let _: Value = Self::parse_response(response).await?;
        Ok(())
    }

    fn field_map(&self, entity: EntityKind) -> &EntityFieldMap {
        static EMPTY: OnceLock<EntityFieldMap> = OnceLock::new();
        self.field_maps
            .get(&entity)
            .unwrap_or_else(|| EMPTY.get_or_init(EntityFieldMap::new))
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    records: Vec<ApiRecord>,
    offset: Option<String>
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    id: String,
    #[serde(rename = "createdTime")]
    created_time: Option<String>,
    #[serde(default)]
    fields: Record
}

fn normalize(api: ApiRecord, fields_by_id: Option<Record>) -> SheetRecord {
    let last_modified = api
        .fields
        .get("last_modified")
        .and_then(parse_timestamp)
        .or_else(|| {
            api.created_time
                .as_deref()
                .and_then(|s| parse_timestamp(&Value::String(s.to_string())))
        });
    SheetRecord {
        airtable_id: api.id,
        last_modified,
        fields: api.fields,
        fields_by_id: fields_by_id.unwrap_or_default()
    }
}

fn is_unknown_field_error(err: &SyncError) -> bool {
    match err {
        SyncError::AirtableApi { status: 422, message } => {
            message.contains("UNKNOWN_FIELD_NAME") || message.contains("Unknown field name")
        }
        _ => false
    }
}

/// The sheet API reports per-field rejections only inside human-readable
/// messages; these are the shapes it is known to produce.
fn field_error_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"Field \\?"([^"\\]+)\\?" cannot accept the provided value"#,
            r#"Field \\?"([^"\\]+)\\?" cannot accept a value"#,
            r#"Invalid value for field \\?"([^"\\]+)\\?""#,
            r#"Unknown field name: \\?"([^"\\]+)\\?""#
        ]
        .iter()
        .map(|p| Regex::new(p).expect("invalid field error pattern"))
        .collect()
    })
}

pub fn extract_field_names(message: &str) -> Vec<String> {
    let mut names = Vec::new();
    for pattern in field_error_patterns() {
        for captures in pattern.captures_iter(message) {
            if let Some(name) = captures.get(1) {
                let name = name.as_str().to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    names
}

/// All payload keys an offending field name could be addressed by: the name
/// itself, plus the canonical key / display name / field id of any mapped
/// entry it matches.
fn payload_keys_for(field: &str, map: &EntityFieldMap) -> Vec<String> {
    let mut keys = vec![field.to_string()];
    for (key, entry) in map {
        let matches = key == field
            || entry.name.as_deref() == Some(field)
            || entry.id.as_deref() == Some(field);
        if matches {
            keys.push(key.clone());
            if let Some(name) = &entry.name {
                keys.push(name.clone());
            }
            if let Some(id) = &entry.id {
                keys.push(id.clone());
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map_with(key: &str, id: Option<&str>, name: Option<&str>) -> EntityFieldMap {
        let mut map = EntityFieldMap::new();
        map.insert(
            key.to_string(),
            FieldMapEntry {
                id: id.map(str::to_string),
                name: name.map(str::to_string)
            }
        );
        map
    }

    #[test]
    fn test_record_value_resolution_order() {
        let mut fields = Record::new();
        fields.insert("Make".to_string(), json!("Ford"));
        fields.insert("model".to_string(), json!("F150"));
        let mut fields_by_id = Record::new();
        fields_by_id.insert("fldColor".to_string(), json!("blue"));

        let record = SheetRecord {
            airtable_id: "recA".to_string(),
            last_modified: None,
            fields,
            fields_by_id
        };

        let make_map = map_with("make", Some("fldMake"), Some("Make"));
        assert_eq!(record.value("make", &make_map), Some(&json!("Ford")));

        assert_eq!(record.value("model", &EntityFieldMap::new()), Some(&json!("F150")));

        let color_map = map_with("color", Some("fldColor"), Some("Colour"));
        assert_eq!(record.value("color", &color_map), Some(&json!("blue")));

        assert_eq!(record.value("vin", &EntityFieldMap::new()), None);
    }

    #[test]
    fn test_side_state_falls_back_to_last_modified() {
        let record = SheetRecord {
            airtable_id: "recA".to_string(),
            last_modified: parse_timestamp(&json!("2024-01-02T10:00:00Z")),
            fields: Record::new(),
            fields_by_id: Record::new()
        };
        let state = record.side_state(&EntityFieldMap::new());
        assert_eq!(state.last_changed, record.last_modified);
        assert_eq!(state.last_synced, None);
    }

    #[test]
    fn test_extract_field_names_patterns() {
        let message = r#"{"error":{"type":"INVALID_VALUE_FOR_COLUMN","message":"Field \"distance\" cannot accept the provided value. Invalid value for field \"Make\""}}"#;
        let names = extract_field_names(message);
        assert_eq!(names, vec!["distance".to_string(), "Make".to_string()]);

        let unknown = r#"Unknown field name: "load_number""#;
        assert_eq!(extract_field_names(unknown), vec!["load_number".to_string()]);

        assert!(extract_field_names("INTERNAL_SERVER_ERROR").is_empty());
    }

    #[test]
    fn test_payload_keys_for_mapped_field() {
        let map = map_with("distance", Some("fldDist"), Some("Distance (mi)"));
        let keys = payload_keys_for("Distance (mi)", &map);
        assert!(keys.contains(&"distance".to_string()));
        assert!(keys.contains(&"fldDist".to_string()));
        assert!(keys.contains(&"Distance (mi)".to_string()));
    }

    #[test]
    fn test_unknown_field_detection() {
        let err = SyncError::AirtableApi {
            status: 422,
            message: r#"{"error":{"type":"UNKNOWN_FIELD_NAME","message":"Unknown field name: \"vin\""}}"#.to_string()
        };
        assert!(is_unknown_field_error(&err));

        let other = SyncError::AirtableApi {
            status: 422,
            message: "INVALID_VALUE_FOR_COLUMN".to_string()
        };
        assert!(!is_unknown_field_error(&other));
    }
}
