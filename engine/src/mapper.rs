//! Per-entity, per-direction candidate payload construction.
//!
//! Driven entirely by the declarative `EntitySpec` tables: value fields are
//! normalized, numeric fields coerced to finite numbers or null, date-only
//! fields reformatted for the sheet, and link fields translated between the
//! two identifier spaces through the cross-ref indexes.

use crate::airtable::{EntityFieldMap, SheetRecord};
use crate::entity::{EntityKind, EntitySpec};
use crate::payload::Record;
use crate::value::{as_trimmed_str, format_date_only, is_blank, linked_id, parse_finite};
use crate::xref::CrossRef;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::warn;

/// Cross-ref lookups available while mapping one entity.
pub struct MapContext<'a> {
    pub xrefs: &'a HashMap<EntityKind, CrossRef>,
    /// `load_id -> [car sheet record id]`, present when mapping loads
    /// toward the sheet.
    pub load_cars: Option<&'a HashMap<String, Vec<String>>>
}

impl MapContext<'_> {
    fn xref(&self, target: EntityKind) -> Option<&CrossRef> {
        self.xrefs.get(&target)
    }
}

/// Candidate relational payload from a sheet record. Only keys present on
/// the source appear; required fields are omitted rather than blanked.
pub fn map_sheet_to_relational(
    spec: &EntitySpec,
    record: &SheetRecord,
    field_map: &EntityFieldMap,
    ctx: &MapContext<'_>
) -> Record {
    let mut out = Record::new();

    for key in spec.fields {
        let Some(raw) = record.value(key, field_map) else {
            continue;
        };
        if let Some(value) = normalize_field(spec, key, raw) {
            out.insert((*key).to_string(), value);
        }
    }

    for link in spec.links {
        let Some(raw) = record.value(link.field, field_map) else {
            continue;
        };
        if is_blank(raw) {
            out.insert(link.field.to_string(), Value::Null);
            continue;
        }
        let Some(sheet_id) = linked_id(raw) else {
            out.insert(link.field.to_string(), Value::Null);
            continue;
        };
        match ctx
            .xref(link.target)
            .and_then(|xref| xref.relational_id(&sheet_id))
        {
            Some(relational_id) => {
                out.insert(link.field.to_string(), json!(relational_id));
            }
            None => warn!(
                entity = %spec.kind,
                field = link.field,
                sheet_id = %sheet_id,
                "link target has no relational twin, leaving link untouched"
            )
        }
    }

    out.insert("airtable_id".to_string(), json!(record.airtable_id));
    out.insert(
        "airtable_id_name_label".to_string(),
        json!(name_label(record, field_map))
    );
    out
}

/// Human-readable echo of the sheet's display field kept on the relational
/// side: the record's own label field when it has one, else its record id.
pub fn name_label(record: &SheetRecord, field_map: &EntityFieldMap) -> String {
    record
        .value("airtable_id_name_label", field_map)
        .and_then(as_trimmed_str)
        .or_else(|| record.fields.get("id").and_then(as_trimmed_str))
        .unwrap_or_else(|| record.airtable_id.clone())
}

/// Candidate sheet payload from a relational record. Link fields become
/// record-id lists (empty list is an explicit clear); date-only fields are
/// reformatted; the load payload gets its aggregated `load_cars` list and
/// loses `load_number`, which the sheet computes itself.
pub fn map_relational_to_sheet(
    spec: &EntitySpec,
    record: &Record,
    ctx: &MapContext<'_>
) -> Record {
    let mut out = Record::new();

    for key in spec.fields {
        let Some(raw) = record.get(*key) else {
            continue;
        };
        let Some(mut value) = normalize_field(spec, key, raw) else {
            continue;
        };
        if spec.date_only.contains(key) {
            if let Some(date) = format_date_only(&value) {
                value = json!(date);
            }
        }
        out.insert((*key).to_string(), value);
    }

    for link in spec.links {
        let Some(raw) = record.get(link.field) else {
            continue;
        };
        if is_blank(raw) {
            out.insert(link.field.to_string(), json!([]));
            continue;
        }
        let translated = linked_id(raw)
            .and_then(|id| {
                ctx.xref(link.target)
                    .and_then(|xref| xref.sheet_id(&id))
                    .map(str::to_string)
            });
        match translated {
            Some(sheet_id) => {
                out.insert(link.field.to_string(), json!([sheet_id]));
            }
            None => {
                warn!(
                    entity = %spec.kind,
                    field = link.field,
                    value = %raw,
                    "link target has no sheet twin, clearing sheet link"
                );
                out.insert(link.field.to_string(), json!([]));
            }
        }
    }

    if let Some(id) = record.get("id").and_then(as_trimmed_str) {
        out.insert("supabase_id".to_string(), json!(id));
    }

    if spec.kind == EntityKind::Load {
        out.remove("load_number");
        let cars: Vec<String> = record
            .get("id")
            .and_then(as_trimmed_str)
            .and_then(|load_id| ctx.load_cars.and_then(|index| index.get(&load_id)))
            .map(|list| {
                let mut seen = Vec::new();
                for id in list {
                    let id = id.trim();
                    if !id.is_empty() && !seen.contains(&id.to_string()) {
                        seen.push(id.to_string());
                    }
                }
                seen
            })
            .unwrap_or_default();
        out.insert("load_cars".to_string(), json!(cars));
    }

    out
}

/// Shared field normalization: trimmed strings, empty-to-null (omitted for
/// required fields), numeric coercion to finite-or-null.
fn normalize_field(spec: &EntitySpec, key: &str, raw: &Value) -> Option<Value> {
    let required = spec.required.contains(&key);

    if spec.numeric.contains(&key) {
        if raw.is_null() {
            return Some(Value::Null);
        }
        return Some(match parse_finite(raw) {
            Some(n) => json!(n),
            None => Value::Null
        });
    }

    match raw {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                if required { None } else { Some(Value::Null) }
            } else {
                Some(json!(trimmed))
            }
        }
        Value::Null if required => None,
        other => Some(other.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sheet_record(fields: Value) -> SheetRecord {
        SheetRecord {
            airtable_id: "recA".to_string(),
            last_modified: None,
            fields: fields.as_object().unwrap().clone(),
            fields_by_id: Record::new()
        }
    }

    fn relational_record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    fn empty_ctx(xrefs: &HashMap<EntityKind, CrossRef>) -> MapContext<'_> {
        MapContext {
            xrefs,
            load_cars: None
        }
    }

    #[test]
    fn test_sheet_to_relational_normalization() {
        let record = sheet_record(json!({
            "make": " Ford ",
            "model": "F150",
            "color": "",
            "distance": " 420.5 ",
            "carrier_rate": "not a number",
            "external_id": "E1"
        }));
        let xrefs = HashMap::new();
        let out = map_sheet_to_relational(
            EntityKind::Car.spec(),
            &record,
            &EntityFieldMap::new(),
            &empty_ctx(&xrefs)
        );

        assert_eq!(out["make"], json!("Ford"));
        assert_eq!(out["color"], Value::Null);
        assert_eq!(out["distance"], json!(420.5));
        assert_eq!(out["carrier_rate"], Value::Null);
        assert_eq!(out["airtable_id"], json!("recA"));
        // Absent fields stay absent.
        assert!(!out.contains_key("vin"));
    }

    #[test]
    fn test_required_blank_is_omitted_not_nulled() {
        let record = sheet_record(json!({"make": "  ", "model": null}));
        let xrefs = HashMap::new();
        let out = map_sheet_to_relational(
            EntityKind::Car.spec(),
            &record,
            &EntityFieldMap::new(),
            &empty_ctx(&xrefs)
        );
        assert!(!out.contains_key("make"));
        assert!(!out.contains_key("model"));
    }

    #[test]
    fn test_sheet_link_takes_first_element() {
        let mut locations = CrossRef::default();
        locations.insert_pair("L1", "recL1");
        let mut xrefs = HashMap::new();
        xrefs.insert(EntityKind::Location, locations);

        let record = sheet_record(json!({
            "make": "Ford",
            "model": "F150",
            "pickup_location_id": ["recL1", "recL2"],
            "delivery_location_id": ["recUnknown"]
        }));
        let out = map_sheet_to_relational(
            EntityKind::Car.spec(),
            &record,
            &EntityFieldMap::new(),
            &empty_ctx(&xrefs)
        );

        assert_eq!(out["pickup_location_id"], json!("L1"));
        // Unresolvable link is omitted, not nulled.
        assert!(!out.contains_key("delivery_location_id"));
    }

    #[test]
    fn test_sheet_empty_link_clears_relational_link() {
        let xrefs = HashMap::new();
        let record = sheet_record(json!({"make": "Ford", "model": "F150", "pickup_location_id": []}));
        let out = map_sheet_to_relational(
            EntityKind::Car.spec(),
            &record,
            &EntityFieldMap::new(),
            &empty_ctx(&xrefs)
        );
        assert_eq!(out["pickup_location_id"], Value::Null);
    }

    #[test]
    fn test_name_label_chain() {
        let labeled = sheet_record(json!({"airtable_id_name_label": " VIN-001 "}));
        assert_eq!(name_label(&labeled, &EntityFieldMap::new()), "VIN-001");

        let id_field = sheet_record(json!({"id": "row-7"}));
        assert_eq!(name_label(&id_field, &EntityFieldMap::new()), "row-7");

        let bare = sheet_record(json!({}));
        assert_eq!(name_label(&bare, &EntityFieldMap::new()), "recA");
    }

    #[test]
    fn test_relational_to_sheet_dates_and_numbers() {
        let xrefs = HashMap::new();
        let record = relational_record(json!({
            "id": "u1",
            "make": "Ford",
            "model": "F150",
            "pickup_date": "2024-03-05T18:30:00Z",
            "delivery_date": "unparseable",
            "distance": "120.5"
        }));
        let out = map_relational_to_sheet(EntityKind::Car.spec(), &record, &empty_ctx(&xrefs));

        assert_eq!(out["pickup_date"], json!("2024-03-05"));
        assert_eq!(out["delivery_date"], json!("unparseable"));
        assert_eq!(out["distance"], json!(120.5));
        assert_eq!(out["supabase_id"], json!("u1"));
    }

    #[test]
    fn test_relational_link_with_twin_and_without() {
        let mut locations = CrossRef::default();
        locations.insert_pair("L1", "recL1");
        let mut xrefs = HashMap::new();
        xrefs.insert(EntityKind::Location, locations);

        let record = relational_record(json!({
            "id": "u1",
            "make": "Ford",
            "model": "F150",
            "pickup_location_id": "L1",
            "delivery_location_id": "L-orphan"
        }));
        let out = map_relational_to_sheet(EntityKind::Car.spec(), &record, &empty_ctx(&xrefs));

        assert_eq!(out["pickup_location_id"], json!(["recL1"]));
        // No twin: explicit clear.
        assert_eq!(out["delivery_location_id"], json!([]));
    }

    #[test]
    fn test_relational_null_link_clears_sheet_list() {
        let xrefs = HashMap::new();
        let record = relational_record(json!({
            "id": "u1",
            "make": "Ford",
            "model": "F150",
            "pickup_location_id": null
        }));
        let out = map_relational_to_sheet(EntityKind::Car.spec(), &record, &empty_ctx(&xrefs));
        assert_eq!(out["pickup_location_id"], json!([]));
    }

    #[test]
    fn test_load_payload_strips_load_number_and_adds_cars() {
        let mut index = HashMap::new();
        index.insert(
            "L".to_string(),
            vec!["recC1".to_string(), " ".to_string(), "recC1".to_string()]
        );
        let xrefs = HashMap::new();
        let ctx = MapContext {
            xrefs: &xrefs,
            load_cars: Some(&index)
        };
        let record = relational_record(json!({
            "id": "L",
            "load_number": "LN-42",
            "status": "booked"
        }));
        let out = map_relational_to_sheet(EntityKind::Load.spec(), &record, &ctx);

        assert!(!out.contains_key("load_number"));
        assert_eq!(out["load_cars"], json!(["recC1"]));
        assert_eq!(out["status"], json!("booked"));
    }

    #[test]
    fn test_load_without_assignments_gets_empty_list() {
        let xrefs = HashMap::new();
        let record = relational_record(json!({"id": "L", "load_number": "LN-42"}));
        let out = map_relational_to_sheet(EntityKind::Load.spec(), &record, &empty_ctx(&xrefs));
        assert_eq!(out["load_cars"], json!([]));
    }
}
