//! Candidate-to-minimal payload preparation.
//!
//! The mapper produces a full candidate; this stage drops everything the
//! target already has and enforces the blank-overwrite policy so a blank on
//! one side cannot erase real data on the other.

use crate::entity::Direction;
use crate::value::{comparison_key, is_blank};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub type Record = Map<String, Value>;

/// Optional sync-rules file model (camelCase on disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncRules {
    pub prevent_blank_overwrite: bool,
    pub allow_blank_overwrite: AllowBlankOverwrite
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllowBlankOverwrite {
    pub airtable_to_supabase: HashMap<String, Vec<String>>,
    pub supabase_to_airtable: HashMap<String, Vec<String>>
}

impl Default for SyncRules {
    fn default() -> Self {
        Self {
            prevent_blank_overwrite: true,
            allow_blank_overwrite: AllowBlankOverwrite::default()
        }
    }
}

impl SyncRules {
    pub fn allows(&self, direction: Direction, entity: &str, field: &str) -> bool {
        let map = match direction {
            Direction::AirtableToSupabase => &self.allow_blank_overwrite.airtable_to_supabase,
            Direction::SupabaseToAirtable => &self.allow_blank_overwrite.supabase_to_airtable
        };
        map.get(entity).is_some_and(|fields| fields.iter().any(|f| f == field))
    }
}

/// Reduce a candidate payload to the fields that actually change the
/// target. `target` is the target's current value per candidate key, with
/// absent keys meaning the target has no value; `None` means the target
/// record does not exist yet and the candidate passes through whole.
pub fn prepare(
    candidate: Record,
    target: Option<&Record>,
    direction: Direction,
    entity: &str,
    rules: &SyncRules
) -> Record {
    let Some(target) = target else {
        return candidate;
    };

    let mut prepared = Record::new();
    for (field, value) in candidate {
        let current = target.get(&field);
        if let Some(current) = current {
            if comparison_key(current) == comparison_key(&value) {
                continue;
            }
        }

        if rules.prevent_blank_overwrite && is_blank(&value) {
            let current_blank = current.is_none_or(is_blank);
            if !current_blank && !rules.allows(direction, entity, &field) {
                continue;
            }
        }

        prepared.insert(field, value);
    }
    prepared
}
