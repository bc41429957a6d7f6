//! Cross-reference identity between the two stores.
//!
//! Built fresh each run from both record lists, then used to translate link
//! fields between relational UUIDs and sheet record ids. Pairs created
//! during an entity loop are seeded back in so later records of the same
//! loop resolve them.

use crate::airtable::SheetRecord;
use crate::payload::Record;
use crate::value::{is_blank, linked_id, normalize_record_id};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct CrossRef {
    sheet_to_relational: HashMap<String, String>,
    relational_to_sheet: HashMap<String, String>
}

impl CrossRef {
    /// Build both maps: the sheet records' `supabase_id` claims come first,
    /// relational records' `airtable_id` fill the gaps. The inverse map is
    /// first-write-wins on conflict.
    pub fn build(sheet: &[SheetRecord], relational: &[Record]) -> Self {
        let mut xref = Self::default();
        for record in sheet {
            if let Some(supabase_id) = record.fields.get("supabase_id").and_then(string_id) {
                xref.insert_pair(&supabase_id, &record.airtable_id);
            }
        }
        for record in relational {
            let Some(relational_id) = record.get("id").and_then(string_id) else {
                continue;
            };
            if let Some(airtable_id) = record.get("airtable_id").and_then(string_id) {
                xref.sheet_to_relational
                    .entry(airtable_id.clone())
                    .or_insert_with(|| relational_id.clone());
                xref.relational_to_sheet
                    .entry(relational_id)
                    .or_insert(airtable_id);
            }
        }
        xref
    }

    pub fn insert_pair(&mut self, relational_id: &str, sheet_id: &str) {
        let relational_id = normalize_record_id(relational_id);
        let sheet_id = normalize_record_id(sheet_id);
        if relational_id.is_empty() || sheet_id.is_empty() {
            return;
        }
        self.sheet_to_relational
            .entry(sheet_id.clone())
            .or_insert_with(|| relational_id.clone());
        self.relational_to_sheet
            .entry(relational_id)
            .or_insert(sheet_id);
    }

    pub fn relational_id(&self, sheet_id: &str) -> Option<&str> {
        self.sheet_to_relational
            .get(normalize_record_id(sheet_id).as_str())
            .map(String::as_str)
    }

    pub fn sheet_id(&self, relational_id: &str) -> Option<&str> {
        self.relational_to_sheet
            .get(normalize_record_id(relational_id).as_str())
            .map(String::as_str)
    }
}

fn string_id(value: &Value) -> Option<String> {
    let s = value.as_str()?;
    let id = normalize_record_id(s);
    (!id.is_empty()).then_some(id)
}

/// An assignment row counts when `is_assigned` is boolean true, a non-zero
/// number, or a yes-ish string.
#[must_use]
pub fn is_assigned(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            matches!(s.trim().to_lowercase().as_str(), "yes" | "y" | "true" | "1")
        }
        _ => false
    }
}

/// Aggregate `load_cars` join rows into `load_id -> [car sheet record id]`.
/// A row's car id comes from an embedded `car_airtable_id` when present,
/// otherwise from the car cross-ref. Unresolvable rows are dropped with a
/// debug line.
pub fn load_cars_index(rows: &[Record], cars: &CrossRef) -> HashMap<String, Vec<String>> {
    let mut index: HashMap<String, Vec<String>> = HashMap::new();
    for row in rows {
        let assigned = row.get("is_assigned").is_some_and(is_assigned);
        if !assigned {
            continue;
        }
        let Some(load_id) = row.get("load_id").and_then(string_id) else {
            continue;
        };
        let sheet_car_id = row
            .get("car_airtable_id")
            .filter(|v| !is_blank(v))
            .and_then(linked_id)
            .or_else(|| {
                row.get("car_id")
                    .and_then(string_id)
                    .and_then(|car_id| cars.sheet_id(&car_id).map(str::to_string))
            });
        match sheet_car_id {
            Some(id) => {
                let list = index.entry(load_id).or_default();
                if !list.contains(&id) {
                    list.push(id);
                }
            }
            None => debug!(load_id = %load_id, "assignment row has no resolvable car record id")
        }
    }
    index
}
