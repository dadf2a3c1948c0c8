//! Resolution of an authenticated identity into an application profile, role
//! and store.
//!
//! A [`Hydrator`] owns the published [`AuthState`]. Each identity change starts
//! a new [`HydrationRun`] tagged with the next value of a monotonic counter.
//! A run may suspend at every remote lookup, and runs for rapid successive
//! changes may be in flight together, but only the run whose tag still equals
//! the counter may write to the published state. Superseded runs finish their
//! lookups and are then discarded without effect.
//!
//! Writes and counter increments both happen under the state channel's lock,
//! so the compare-and-publish at each checkpoint cannot interleave with a new
//! run being started.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::watch;

use crate::{
    model::{AppUser, Role, Store, StoreAccess, STORES, USERS, USER_STORE_ACCESS},
    session::Session,
    table::{decode, Query, TableStore},
    DataAccessError,
};

/// Default number of store-mapping lookups per run.
pub const DEFAULT_MAPPING_ATTEMPTS: u32 = 2;

/// Default pause between store-mapping lookups.
pub const DEFAULT_MAPPING_BACKOFF: Duration = Duration::from_millis(200);

/// Tuning for a [`Hydrator`].
///
/// The store mapping of a freshly provisioned manager may not be visible on
/// the first read; the mapping lookup is therefore retried a bounded number of
/// times with a fixed pause in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydratorConfig {
    mapping_attempts: u32,
    mapping_backoff: Duration,
}

impl Default for HydratorConfig {
    fn default() -> Self {
        Self {
            mapping_attempts: DEFAULT_MAPPING_ATTEMPTS,
            mapping_backoff: DEFAULT_MAPPING_BACKOFF,
        }
    }
}

impl HydratorConfig {
    /// Sets how many times the store mapping is looked up. At least one
    /// lookup is always made.
    pub fn with_mapping_attempts(mut self, attempts: u32) -> Self {
        self.mapping_attempts = attempts.max(1);
        self
    }

    /// Sets the pause between store-mapping lookups.
    pub fn with_mapping_backoff(mut self, backoff: Duration) -> Self {
        self.mapping_backoff = backoff;
        self
    }

    /// Number of store-mapping lookups per run.
    pub fn mapping_attempts(&self) -> u32 {
        self.mapping_attempts
    }

    /// Pause between store-mapping lookups.
    pub fn mapping_backoff(&self) -> Duration {
        self.mapping_backoff
    }
}

/// The resolved identity, as observed by every part of the application.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    /// The current session, `None` when signed out.
    pub session: Option<Session>,
    /// The application profile of the session's identity.
    pub app_user: Option<AppUser>,
    /// The profile's role.
    pub role: Option<Role>,
    /// The managed store. Only ever set for store managers.
    pub store: Option<Store>,
    /// `true` while a run for the current session is resolving.
    pub loading: bool,
}

impl AuthState {
    /// The state before the startup session check has completed.
    pub fn initial() -> Self {
        Self {
            loading: true,
            ..Self::default()
        }
    }

    /// Returns `true` for a resolved store manager without a store, which the
    /// interface surfaces as a warning rather than a failure.
    pub fn is_unassigned_manager(&self) -> bool {
        !self.loading && self.role == Some(Role::StoreManager) && self.store.is_none()
    }

    fn clear_resolved(&mut self) {
        self.app_user = None;
        self.role = None;
        self.store = None;
    }
}

/// One attempt to resolve the profile, role and store of an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydrationRun {
    id: u64,
    auth_user_id: String,
}

impl HydrationRun {
    /// The run's sequence number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subject identifier being resolved.
    pub fn auth_user_id(&self) -> &str {
        &self.auth_user_id
    }
}

/// How a [`HydrationRun`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A store manager was resolved to their store.
    Resolved,
    /// No profile exists for the identity.
    NoAppUser,
    /// The profile's role is never bound to a store.
    NoStoreForRole(Role),
    /// A store manager without a store mapping.
    UnmappedManager,
    /// The mapped store row does not exist.
    StoreNotFound,
    /// A lookup failed; the resolved state was reset.
    Failed,
    /// A newer run started first; nothing was published by this run's end.
    Superseded,
}

#[derive(Debug)]
enum Abort {
    Superseded,
    Failed(DataAccessError),
}

impl From<DataAccessError> for Abort {
    fn from(err: DataAccessError) -> Self {
        Abort::Failed(err)
    }
}

#[derive(Debug)]
struct Inner<Tables> {
    tables: Tables,
    config: HydratorConfig,
    generation: AtomicU64,
    state: watch::Sender<AuthState>,
}

/// The single writer of [`AuthState`].
///
/// Cloning a hydrator yields another handle to the same state.
#[derive(Debug)]
pub struct Hydrator<Tables: TableStore> {
    inner: Arc<Inner<Tables>>,
}

impl<Tables: TableStore> Clone for Hydrator<Tables> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Tables: TableStore> Hydrator<Tables> {
    /// Creates a hydrator reading from `tables`. The published state starts
    /// as [`AuthState::initial`].
    pub fn new(tables: Tables, config: HydratorConfig) -> Self {
        let (state, _) = watch::channel(AuthState::initial());
        Self {
            inner: Arc::new(Inner {
                tables,
                config,
                generation: AtomicU64::new(0),
                state,
            }),
        }
    }

    /// Subscribes to the published state.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    /// A copy of the published state.
    pub fn state(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    /// Sequence number of the current run.
    pub fn current_run(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// The table store the hydrator reads from.
    pub fn tables(&self) -> &Tables {
        &self.inner.tables
    }

    /// Records a newly observed session.
    ///
    /// Every call supersedes any run in flight. With an identity present, a
    /// new run is started, `loading` is raised, and the run is returned to be
    /// driven by [`hydrate`](Self::hydrate). Without one, the resolved state
    /// is cleared and `loading` lowered immediately.
    pub fn observe(&self, session: Option<Session>) -> Option<HydrationRun> {
        let mut started = None;
        self.inner.state.send_modify(|state| {
            let id = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
            match session.as_ref() {
                Some(session) => {
                    state.loading = true;
                    started = Some(HydrationRun {
                        id,
                        auth_user_id: session.auth_user_id().to_string(),
                    });
                }
                None => {
                    state.clear_resolved();
                    state.loading = false;
                }
            }
            state.session = session;
        });

        match &started {
            Some(run) => tracing::debug!(run = run.id, auth_user.id = %run.auth_user_id, "hydration run started"),
            None => tracing::debug!("no identity, resolved state cleared"),
        }

        started
    }

    /// Drives a run to completion and publishes its result if it is still
    /// current.
    ///
    /// Not-found conditions end the run normally with empty fields; a lookup
    /// failure resets the resolved state. Either way `loading` is lowered
    /// together with the run's final write.
    #[tracing::instrument(level = "debug", skip_all, fields(run = run.id, auth_user.id = %run.auth_user_id))]
    pub async fn hydrate(&self, run: HydrationRun) -> RunOutcome {
        let finished = match self.resolve(&run).await {
            Ok((outcome, store)) => self
                .publish(&run, |state| {
                    if outcome == RunOutcome::NoAppUser {
                        state.clear_resolved();
                    } else {
                        state.store = store;
                    }
                    state.loading = false;
                })
                .map(|()| outcome),
            Err(Abort::Failed(err)) => {
                tracing::error!(error = %err, "hydration failed, resetting resolved state");
                self.publish(&run, |state| {
                    state.clear_resolved();
                    state.loading = false;
                })
                .map(|()| RunOutcome::Failed)
            }
            Err(Abort::Superseded) => Err(Abort::Superseded),
        };

        match finished {
            Ok(outcome) => {
                tracing::debug!(?outcome, "hydration finished");
                outcome
            }
            Err(_) => {
                tracing::warn!(current = self.current_run(), "stale hydration run ignored");
                RunOutcome::Superseded
            }
        }
    }

    async fn resolve(&self, run: &HydrationRun) -> Result<(RunOutcome, Option<Store>), Abort> {
        let tables = &self.inner.tables;

        let query = Query::table(USERS).eq("auth_user_id", run.auth_user_id.as_str());
        let user_row = tables.query_row(&query).await;
        self.checkpoint(run)?;

        let Some(app_user) = user_row?.map(decode::<AppUser>).transpose()? else {
            tracing::warn!("no profile for this identity");
            return Ok((RunOutcome::NoAppUser, None));
        };

        let role = app_user.role;
        tracing::debug!(app_user.id = %app_user.id, ?role, "profile resolved");
        self.publish(run, |state| {
            let same_user = state
                .app_user
                .as_ref()
                .is_some_and(|previous| previous.id == app_user.id);
            // A store is only ever shown alongside the profile it was mapped for.
            if !same_user || !role.has_store() {
                state.store = None;
            }
            state.app_user = Some(app_user.clone());
            state.role = Some(role);
        })?;

        if !role.has_store() {
            tracing::debug!(?role, "role has no store, skipping store resolution");
            return Ok((RunOutcome::NoStoreForRole(role), None));
        }

        let Some(access) = self.resolve_store_access(run, &app_user).await? else {
            tracing::warn!(app_user.id = %app_user.id, "no store mapping for manager");
            return Ok((RunOutcome::UnmappedManager, None));
        };

        let query = Query::table(STORES).eq("id", access.store_id.as_str());
        let store_row = tables.query_row(&query).await;
        self.checkpoint(run)?;

        match store_row?.map(decode::<Store>).transpose()? {
            Some(store) => {
                tracing::debug!(store.id = %store.id, store.code = %store.code, "store resolved");
                Ok((RunOutcome::Resolved, Some(store)))
            }
            None => {
                tracing::warn!(store.id = %access.store_id, "mapped store does not exist");
                Ok((RunOutcome::StoreNotFound, None))
            }
        }
    }

    async fn resolve_store_access(
        &self,
        run: &HydrationRun,
        app_user: &AppUser,
    ) -> Result<Option<StoreAccess>, Abort> {
        let query = Query::table(USER_STORE_ACCESS).eq("user_id", app_user.id.as_str());
        let attempts = self.inner.config.mapping_attempts;

        for attempt in 1..=attempts {
            let row = self.inner.tables.query_row(&query).await;
            self.checkpoint(run)?;

            let access = row?
                .map(decode::<StoreAccess>)
                .transpose()?
                .filter(|access| !access.store_id.is_empty());
            tracing::debug!(attempt, found = access.is_some(), "store mapping lookup");

            if access.is_some() {
                return Ok(access);
            }

            if attempt < attempts {
                tokio::time::sleep(self.inner.config.mapping_backoff).await;
                self.checkpoint(run)?;
            }
        }

        Ok(None)
    }

    fn checkpoint(&self, run: &HydrationRun) -> Result<(), Abort> {
        if self.current_run() == run.id {
            Ok(())
        } else {
            Err(Abort::Superseded)
        }
    }

    fn publish(&self, run: &HydrationRun, update: impl FnOnce(&mut AuthState)) -> Result<(), Abort> {
        let generation = &self.inner.generation;
        let mut current = false;
        self.inner.state.send_if_modified(|state| {
            if generation.load(Ordering::Acquire) != run.id {
                return false;
            }
            current = true;
            update(state);
            true
        });

        if current {
            Ok(())
        } else {
            Err(Abort::Superseded)
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use serde_json::json;

    use super::*;
    use crate::{session::AuthUser, table::row, MemoryStore};

    fn session(auth_user_id: &str) -> Session {
        Session {
            user: AuthUser {
                id: auth_user_id.to_string(),
                email: None,
            },
            access_token: SecretString::new("token".to_string()),
            refresh_token: None,
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .seed(
                USERS,
                [
                    row(json!({ "id": "u-hq", "auth_user_id": "auth-hq", "name": "Head Office", "role": "hq_admin" })),
                    row(json!({ "id": "u-sm", "auth_user_id": "auth-sm", "name": "Manager", "role": "store_manager" })),
                ],
            )
            .await;
        store
            .seed(
                USER_STORE_ACCESS,
                [row(json!({ "user_id": "u-sm", "store_id": "s-1" }))],
            )
            .await;
        store
            .seed(
                STORES,
                [row(json!({ "id": "s-1", "code": "BLR01", "name": "Indiranagar", "region": "South" }))],
            )
            .await;
        store
    }

    #[test]
    fn config_keeps_at_least_one_attempt() {
        let config = HydratorConfig::default();
        assert_eq!(config.mapping_attempts(), 2);
        assert_eq!(config.mapping_backoff(), Duration::from_millis(200));

        let config = config.with_mapping_attempts(0);
        assert_eq!(config.mapping_attempts(), 1);
    }

    #[tokio::test]
    async fn test_initial_state_is_loading() {
        let hydrator = Hydrator::new(MemoryStore::new(), HydratorConfig::default());
        assert!(hydrator.state().loading);
        assert_eq!(hydrator.current_run(), 0);
    }

    #[tokio::test]
    async fn test_store_manager_is_resolved() {
        let hydrator = Hydrator::new(seeded().await, HydratorConfig::default());

        let run = hydrator.observe(Some(session("auth-sm"))).unwrap();
        assert_eq!(run.id(), 1);
        assert_eq!(run.auth_user_id(), "auth-sm");
        assert!(hydrator.state().loading);

        assert_eq!(hydrator.hydrate(run).await, RunOutcome::Resolved);

        let state = hydrator.state();
        assert_eq!(state.app_user.unwrap().id, "u-sm");
        assert_eq!(state.role, Some(Role::StoreManager));
        assert_eq!(state.store.unwrap().code, "BLR01");
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn test_hq_admin_has_no_store() {
        let hydrator = Hydrator::new(seeded().await, HydratorConfig::default());

        let run = hydrator.observe(Some(session("auth-hq"))).unwrap();
        assert_eq!(
            hydrator.hydrate(run).await,
            RunOutcome::NoStoreForRole(Role::HqAdmin)
        );

        let state = hydrator.state();
        assert_eq!(state.role, Some(Role::HqAdmin));
        assert!(state.store.is_none());
        assert!(!state.is_unassigned_manager());
    }

    #[tokio::test]
    async fn test_absent_identity_clears_without_lookups() {
        let hydrator = Hydrator::new(seeded().await, HydratorConfig::default());
        let run = hydrator.observe(Some(session("auth-sm"))).unwrap();
        hydrator.hydrate(run).await;

        assert!(hydrator.observe(None).is_none());

        let state = hydrator.state();
        assert!(state.session.is_none());
        assert!(state.app_user.is_none());
        assert!(state.role.is_none());
        assert!(state.store.is_none());
        assert!(!state.loading);
        assert_eq!(hydrator.current_run(), 2);
    }

    #[tokio::test]
    async fn test_superseded_run_publishes_nothing() {
        let hydrator = Hydrator::new(seeded().await, HydratorConfig::default());

        let stale = hydrator.observe(Some(session("auth-sm"))).unwrap();
        let current = hydrator.observe(Some(session("auth-hq"))).unwrap();

        assert_eq!(hydrator.hydrate(current).await, RunOutcome::NoStoreForRole(Role::HqAdmin));
        assert_eq!(hydrator.hydrate(stale).await, RunOutcome::Superseded);

        let state = hydrator.state();
        assert_eq!(state.app_user.unwrap().id, "u-hq");
        assert!(state.store.is_none());
    }
}
