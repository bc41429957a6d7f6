use serde::{Deserialize, Serialize};

/// The syncable entity tables. `load_cars` is not an entity of its own: it is
/// an assignment join read from the relational side and folded into the load
/// payload as a multi-link field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Car,
    Location,
    Company,
    Load,
    User,
    Booking,
    Request
}

/// Table name of the assignment join on the relational side.
pub const LOAD_CARS_TABLE: &str = "load_cars";

/// Dependency order for a full pass: parents of link fields come first so
/// that link resolution succeeds within a single run.
pub const RUN_ORDER: [EntityKind; 7] = [
    EntityKind::Location,
    EntityKind::Company,
    EntityKind::User,
    EntityKind::Car,
    EntityKind::Load,
    EntityKind::Booking,
    EntityKind::Request
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    AirtableToSupabase,
    SupabaseToAirtable
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AirtableToSupabase => "airtable_to_supabase",
            Self::SupabaseToAirtable => "supabase_to_airtable"
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secondary pairing key used when no cross-ref entry resolves a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    /// Exact value equality on a field.
    Field(&'static str),
    /// Trimmed value equality on a field.
    Trimmed(&'static str),
    /// Trimmed, lowercased value equality on a field.
    Folded(&'static str),
    /// Pair by the sheet record id mirrored on the relational side.
    AirtableId
}

#[derive(Debug, Clone, Copy)]
pub struct LinkSpec {
    pub field: &'static str,
    pub target: EntityKind
}

/// Declarative per-entity sync shape. Domain fields, the flag sets that
/// drive normalization, link fields and the fallback match key are declared
/// once here and consumed uniformly by the mapper and syncer.
#[derive(Debug, Clone, Copy)]
pub struct EntitySpec {
    pub kind: EntityKind,
    pub table: &'static str,
    pub fields: &'static [&'static str],
    pub required: &'static [&'static str],
    pub numeric: &'static [&'static str],
    pub date_only: &'static [&'static str],
    pub links: &'static [LinkSpec],
    pub match_key: MatchKey
}

static CAR: EntitySpec = EntitySpec {
    kind: EntityKind::Car,
    table: "cars",
    fields: &[
        "external_id",
        "make",
        "model",
        "year",
        "vin",
        "color",
        "status",
        "carrier_rate",
        "customer_rate",
        "distance",
        "pickup_date",
        "delivery_date",
        "estimated_pickup_date",
        "estimated_delivery_date",
        "actual_delivery_date",
        "special_instructions"
    ],
    required: &["make", "model"],
    numeric: &["carrier_rate", "customer_rate", "distance"],
    date_only: &[
        "pickup_date",
        "delivery_date",
        "estimated_pickup_date",
        "estimated_delivery_date",
        "actual_delivery_date"
    ],
    links: &[
        LinkSpec {
            field: "pickup_location_id",
            target: EntityKind::Location
        },
        LinkSpec {
            field: "delivery_location_id",
            target: EntityKind::Location
        }
    ],
    match_key: MatchKey::Field("external_id")
};

static LOCATION: EntitySpec = EntitySpec {
    kind: EntityKind::Location,
    table: "locations",
    fields: &[
        "name",
        "address_line1",
        "address_line2",
        "city",
        "state",
        "postal_code",
        "country_code",
        "latitude",
        "longitude",
        "created_at"
    ],
    required: &["address_line1", "city", "country_code"],
    numeric: &["latitude", "longitude"],
    date_only: &["created_at"],
    links: &[],
    match_key: MatchKey::AirtableId
};

static COMPANY: EntitySpec = EntitySpec {
    kind: EntityKind::Company,
    table: "companies",
    fields: &["name", "phone", "email", "website", "company_type", "notes"],
    required: &["name"],
    numeric: &[],
    date_only: &[],
    links: &[],
    match_key: MatchKey::Folded("name")
};

static LOAD: EntitySpec = EntitySpec {
    kind: EntityKind::Load,
    table: "loads",
    fields: &[
        "load_number",
        "status",
        "origin",
        "destination",
        "total_distance_km",
        "estimated_duration_hours",
        "transport_rate",
        "notes",
        "created_at"
    ],
    required: &["load_number"],
    numeric: &[
        "total_distance_km",
        "estimated_duration_hours",
        "transport_rate"
    ],
    date_only: &["created_at"],
    links: &[LinkSpec {
        field: "company_id",
        target: EntityKind::Company
    }],
    match_key: MatchKey::Trimmed("load_number")
};

static USER: EntitySpec = EntitySpec {
    kind: EntityKind::User,
    table: "users",
    fields: &[
        "email",
        "first_name",
        "last_name",
        "phone",
        "role",
        "created_at"
    ],
    required: &["email"],
    numeric: &[],
    date_only: &["created_at"],
    links: &[LinkSpec {
        field: "company_id",
        target: EntityKind::Company
    }],
    match_key: MatchKey::Folded("email")
};

static BOOKING: EntitySpec = EntitySpec {
    kind: EntityKind::Booking,
    table: "bookings",
    fields: &[
        "status",
        "quoted_price",
        "final_price",
        "margin_percentage",
        "quoted_at",
        "notes"
    ],
    required: &[],
    numeric: &["quoted_price", "final_price", "margin_percentage"],
    date_only: &["quoted_at"],
    links: &[
        LinkSpec {
            field: "load_id",
            target: EntityKind::Load
        },
        LinkSpec {
            field: "company_id",
            target: EntityKind::Company
        }
    ],
    match_key: MatchKey::AirtableId
};

static REQUEST: EntitySpec = EntitySpec {
    kind: EntityKind::Request,
    table: "requests",
    fields: &[
        "status",
        "pickup_address",
        "delivery_address",
        "vehicle_details",
        "notes"
    ],
    required: &[],
    numeric: &[],
    date_only: &[],
    links: &[LinkSpec {
        field: "company_id",
        target: EntityKind::Company
    }],
    match_key: MatchKey::AirtableId
};

impl EntityKind {
    pub fn spec(&self) -> &'static EntitySpec {
        match self {
            Self::Car => &CAR,
            Self::Location => &LOCATION,
            Self::Company => &COMPANY,
            Self::Load => &LOAD,
            Self::User => &USER,
            Self::Booking => &BOOKING,
            Self::Request => &REQUEST
        }
    }

    /// Table name on the relational side, also the default sheet table name.
    pub fn table(&self) -> &'static str {
        self.spec().table
    }

    /// Parse a CLI / config entity name (the plural table name).
    pub fn parse(name: &str) -> Option<Self> {
        RUN_ORDER.iter().copied().find(|k| k.table() == name)
    }

    pub fn valid_names() -> Vec<&'static str> {
        RUN_ORDER.iter().map(|k| k.table()).collect()
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}
