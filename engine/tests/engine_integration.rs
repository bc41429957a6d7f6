//! End-to-end engine tests against HTTP doubles of both stores.

use haulsync::airtable::{AirtableClient, FieldMapEntry, SheetStore, TableRef};
use haulsync::config::EngineConfig;
use haulsync::conflict::Tolerances;
use haulsync::coordinator::{RunCoordinator, RunType};
use haulsync::entity::{Direction, EntityKind, RUN_ORDER};
use haulsync::payload::SyncRules;
use haulsync::supabase::{RelationalStore, SupabaseClient};
use haulsync::syncer::{EntityStats, EntitySyncer, ErrorSummary};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOL: Tolerances = Tolerances {
    supabase_ms: 1000,
    airtable_ms: 60000
};

fn table_refs() -> HashMap<EntityKind, TableRef> {
    RUN_ORDER
        .iter()
        .map(|kind| {
            (
                *kind,
                TableRef {
                    id: None,
                    name: Some(kind.table().to_string())
                }
            )
        })
        .collect()
}

fn clients(
    supabase: &MockServer,
    airtable: &MockServer,
    field_maps: HashMap<EntityKind, HashMap<String, FieldMapEntry>>
) -> (Arc<dyn RelationalStore>, Arc<dyn SheetStore>) {
    let relational: Arc<dyn RelationalStore> = Arc::new(
        SupabaseClient::new(supabase.uri(), "service-key".to_string()).unwrap()
    );
    let sheet: Arc<dyn SheetStore> = Arc::new(
        AirtableClient::new(
            "pat-token".to_string(),
            "appBase".to_string(),
            table_refs(),
            field_maps
        )
        .unwrap()
        .with_api_url(airtable.uri())
    );
    (relational, sheet)
}

fn syncer(
    relational: Arc<dyn RelationalStore>,
    sheet: Arc<dyn SheetStore>
) -> EntitySyncer {
    EntitySyncer::new(
        relational,
        sheet,
        TOL,
        SyncRules::default(),
        Arc::new(AtomicBool::new(false))
    )
}

async fn mount_empty_pair(supabase: &MockServer, airtable: &MockServer, table: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/rest/v1/{table}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(supabase)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/appBase/{table}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"records": []})))
        .mount(airtable)
        .await;
}

#[tokio::test]
async fn test_new_sheet_car_creates_relational_twin_and_backlink() {
    let supabase = MockServer::start().await;
    let airtable = MockServer::start().await;

    mount_empty_pair(&supabase, &airtable, "locations").await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/cars"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&supabase)
        .await;
    Mock::given(method("GET"))
        .and(path("/appBase/cars"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [{
                "id": "recA",
                "createdTime": "2024-01-02T09:00:00.000Z",
                "fields": {
                    "external_id": "E1",
                    "make": "Ford",
                    "model": "F150",
                    "last_changed_for_sync": "2024-01-02T10:00:00Z"
                }
            }]
        })))
        .mount(&airtable)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/cars"))
        .and(body_partial_json(json!({
            "external_id": "E1",
            "make": "Ford",
            "model": "F150",
            "airtable_id": "recA"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([{
            "id": "u1",
            "external_id": "E1",
            "make": "Ford",
            "model": "F150",
            "airtable_id": "recA"
        }])))
        .expect(1)
        .mount(&supabase)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/appBase/cars/recA"))
        .and(body_partial_json(json!({"fields": {"supabase_id": "u1"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "recA",
            "fields": {"supabase_id": "u1"}
        })))
        .expect(1)
        .mount(&airtable)
        .await;

    let (relational, sheet) = clients(&supabase, &airtable, HashMap::new());
    let engine = syncer(relational, sheet);
    let mut stats = EntityStats::default();
    let mut summary = ErrorSummary::default();
    engine
        .sync_entity(
            EntityKind::Car,
            Direction::AirtableToSupabase,
            &mut stats,
            &mut summary
        )
        .await
        .unwrap();

    assert_eq!(stats.processed, 1);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.errors, 0);
    assert!(summary.is_empty());
}

#[tokio::test]
async fn test_unknown_field_name_degrades_to_field_id_payload() {
    let supabase = MockServer::start().await;
    let airtable = MockServer::start().await;

    mount_empty_pair(&supabase, &airtable, "locations").await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/cars"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": "u1",
            "external_id": "E1",
            "make": "Ford",
            "model": "F150",
            "distance": 420,
            "airtable_id": "recA",
            "airtable_id_name_label": "recA",
            "last_changed_for_sync": "2024-06-01T10:00:00Z",
            "last_synced": "2024-06-01T09:00:00Z"
        }])))
        .mount(&supabase)
        .await;

    // The field-id variant of the cars fetch must be requested because the
    // map carries an id; it is mounted first so the query matcher wins.
    Mock::given(method("GET"))
        .and(path("/appBase/cars"))
        .and(query_param("returnFieldsByFieldId", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [{
                "id": "recA",
                "fields": {"fldDist": 1.0}
            }]
        })))
        .expect(1)
        .mount(&airtable)
        .await;
    Mock::given(method("GET"))
        .and(path("/appBase/cars"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [{
                "id": "recA",
                "fields": {
                    "supabase_id": "u1",
                    "external_id": "E1",
                    "make": "Ford",
                    "model": "F150",
                    "last_changed_for_sync": "2024-01-01T00:00:00Z",
                    "last_synced": "2024-01-01T00:00:30Z"
                }
            }]
        })))
        .mount(&airtable)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/appBase/cars/recA"))
        .and(body_partial_json(json!({"fields": {"Distance": 420.0}})))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "error": {
                "type": "UNKNOWN_FIELD_NAME",
                "message": "Unknown field name: \"Distance\""
            }
        })))
        .expect(1)
        .mount(&airtable)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/appBase/cars/recA"))
        .and(body_partial_json(json!({"fields": {"fldDist": 420.0}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "recA",
            "fields": {"fldDist": 420.0}
        })))
        .expect(1)
        .mount(&airtable)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/cars"))
        .and(query_param("id", "eq.u1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "u1"}])))
        .expect(1)
        .mount(&supabase)
        .await;

    let mut cars_map = HashMap::new();
    cars_map.insert(
        "distance".to_string(),
        FieldMapEntry {
            id: Some("fldDist".to_string()),
            name: Some("Distance".to_string())
        }
    );
    let mut field_maps = HashMap::new();
    field_maps.insert(EntityKind::Car, cars_map);

    let (relational, sheet) = clients(&supabase, &airtable, field_maps);
    let engine = syncer(relational, sheet);
    let mut stats = EntityStats::default();
    let mut summary = ErrorSummary::default();
    engine
        .sync_entity(
            EntityKind::Car,
            Direction::SupabaseToAirtable,
            &mut stats,
            &mut summary
        )
        .await
        .unwrap();

    assert_eq!(stats.updated, 1);
    assert_eq!(stats.errors, 0);
    assert!(summary.is_empty());
}

#[tokio::test]
async fn test_settled_pair_is_unchanged_in_both_directions() {
    let supabase = MockServer::start().await;
    let airtable = MockServer::start().await;

    mount_empty_pair(&supabase, &airtable, "locations").await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/cars"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": "u1",
            "external_id": "E1",
            "make": "Ford",
            "model": "F150",
            "airtable_id": "recA",
            "airtable_id_name_label": "recA",
            "last_changed_for_sync": "2024-01-02T10:00:00Z",
            "last_synced": "2024-01-02T10:00:00Z"
        }])))
        .mount(&supabase)
        .await;
    Mock::given(method("GET"))
        .and(path("/appBase/cars"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [{
                "id": "recA",
                "fields": {
                    "supabase_id": "u1",
                    "external_id": "E1",
                    "make": "Ford",
                    "model": "F150",
                    "last_changed_for_sync": "2024-01-02T10:00:00Z",
                    "last_synced": "2024-01-02T10:00:00Z"
                }
            }]
        })))
        .mount(&airtable)
        .await;
    // No write mocks mounted: any write would 404 and show up as an error.

    let (relational, sheet) = clients(&supabase, &airtable, HashMap::new());
    let engine = syncer(relational, sheet);

    for direction in [Direction::AirtableToSupabase, Direction::SupabaseToAirtable] {
        let mut stats = EntityStats::default();
        let mut summary = ErrorSummary::default();
        engine
            .sync_entity(EntityKind::Car, direction, &mut stats, &mut summary)
            .await
            .unwrap();
        assert_eq!(stats.processed, 1, "{direction}");
        assert_eq!(stats.created, 0, "{direction}");
        assert_eq!(stats.updated, 0, "{direction}");
        assert_eq!(stats.unchanged, 1, "{direction}");
        assert_eq!(stats.errors, 0, "{direction}");
    }
}

#[tokio::test]
async fn test_coordinator_records_sync_runs() {
    let supabase = MockServer::start().await;
    let airtable = MockServer::start().await;

    mount_empty_pair(&supabase, &airtable, "companies").await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/system_sync_runs"))
        .and(body_partial_json(json!({
            "table_name": "companies",
            "direction": "airtable_to_supabase",
            "type": "manual",
            "processed": 0,
            "errors": 0
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([{"id": "run-1"}])))
        .expect(1)
        .mount(&supabase)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/system_sync_runs"))
        .and(body_partial_json(json!({
            "table_name": "companies",
            "direction": "supabase_to_airtable",
            "type": "manual"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([{"id": "run-2"}])))
        .expect(1)
        .mount(&supabase)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/system_sync_runs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "run"}])))
        .expect(2)
        .mount(&supabase)
        .await;

    let (relational, sheet) = clients(&supabase, &airtable, HashMap::new());
    let config = EngineConfig {
        env_name: "test".to_string(),
        supabase_url: supabase.uri(),
        supabase_service_key: "service-key".to_string(),
        airtable_token: "pat-token".to_string(),
        airtable_base_id: "appBase".to_string(),
        tables: table_refs(),
        field_maps: HashMap::new(),
        interval_minutes: 15,
        tolerances: TOL,
        rules: SyncRules::default()
    };
    let coordinator = RunCoordinator::new(relational, sheet, &config);

    let report = coordinator
        .run(&[EntityKind::Company], RunType::Manual)
        .await
        .unwrap();

    assert_eq!(report.entities.len(), 2);
    assert_eq!(report.created(), 0);
    assert_eq!(report.updated(), 0);
    assert_eq!(report.errors(), 0);
    assert!(report.finished_at.is_some());
}
