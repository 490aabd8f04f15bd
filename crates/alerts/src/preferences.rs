//! Per-user notification preferences: DND, personal quiet hours, and
//! timezone. Routing intersects these with the global policy.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use coda_store::JsonlTable;

const PREFS_CAP: usize = 1000;

/// The `user_preferences` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: String,
    #[serde(default)]
    pub dnd_enabled: bool,
    /// Suppress everything except alert deliveries on chat surfaces.
    /// Carried for the front-ends; the router itself only sends alerts.
    #[serde(default)]
    pub alerts_only: bool,
    #[serde(default)]
    pub quiet_hours_start: Option<String>,
    #[serde(default)]
    pub quiet_hours_end: Option<String>,
    #[serde(default = "d_timezone")]
    pub timezone: String,
}

fn d_timezone() -> String {
    "UTC".into()
}

impl UserPreferences {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            dnd_enabled: false,
            alerts_only: false,
            quiet_hours_start: None,
            quiet_hours_end: None,
            timezone: d_timezone(),
        }
    }
}

/// Read side used by the router.
pub trait PreferencesProvider: Send + Sync {
    fn get(&self, user_id: &str) -> Option<UserPreferences>;
}

/// Provider for deployments without per-user preferences.
pub struct NoPreferences;

impl PreferencesProvider for NoPreferences {
    fn get(&self, _user_id: &str) -> Option<UserPreferences> {
        None
    }
}

/// JSONL-backed preferences store. Rows append on every update; the
/// newest row per user wins on reload.
pub struct PreferencesStore {
    table: JsonlTable<UserPreferences>,
    cache: RwLock<HashMap<String, UserPreferences>>,
}

impl PreferencesStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let table: JsonlTable<UserPreferences> =
            JsonlTable::open(path.as_ref().to_path_buf(), PREFS_CAP);
        let mut cache = HashMap::new();
        for row in table.all() {
            cache.insert(row.user_id.clone(), row);
        }
        Self {
            table,
            cache: RwLock::new(cache),
        }
    }

    pub fn upsert(&self, prefs: UserPreferences) {
        self.table.append(prefs.clone());
        self.cache.write().insert(prefs.user_id.clone(), prefs);
    }

    pub fn all_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.cache.read().keys().cloned().collect();
        users.sort();
        users
    }
}

impl PreferencesProvider for PreferencesStore {
    fn get(&self, user_id: &str) -> Option<UserPreferences> {
        self.cache.read().get(user_id).cloned()
    }
}
