//! Rows resolved for a signed-in identity.

use serde::{Deserialize, Serialize};

pub(crate) const USERS: &str = "users";
pub(crate) const USER_STORE_ACCESS: &str = "user_store_access";
pub(crate) const STORES: &str = "stores";

/// The application role of an [`AppUser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Head-office administrator. Never bound to a store.
    HqAdmin,
    /// Manager of exactly one store.
    StoreManager,
}

impl Role {
    /// Returns `true` when users with this role are resolved to a store.
    pub fn has_store(self) -> bool {
        matches!(self, Role::StoreManager)
    }
}

/// The application-level profile of an authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppUser {
    /// Primary key of the profile row.
    pub id: String,
    /// Subject identifier of the authenticated identity.
    pub auth_user_id: String,
    /// Display name.
    pub name: String,
    /// Application role.
    pub role: Role,
}

/// A retail store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    /// Primary key.
    pub id: String,
    /// Short store code used by the sales feeds.
    pub code: String,
    /// Display name.
    pub name: String,
    /// Sales region, when assigned.
    #[serde(default)]
    pub region: Option<String>,
}

impl Store {
    /// Header label joining the store code and name.
    pub fn label(&self) -> String {
        format!("{} — {}", self.code, self.name).trim().to_string()
    }
}

/// Maps a store manager to the store they run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAccess {
    /// The [`AppUser::id`] of the manager.
    pub user_id: String,
    /// The [`Store::id`] of the managed store.
    pub store_id: String,
}
