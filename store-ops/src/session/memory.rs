//! An in-memory implementation of `SessionSource`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::broadcast;

use super::{AuthUser, Session, SessionChange, SessionEventKind, SessionSource};
use crate::AuthError;

const EVENT_CAPACITY: usize = 16;

#[derive(Debug)]
struct Account {
    password: SecretString,
    user: AuthUser,
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<String, Account>,
    current: Option<Session>,
    issued: u64,
}

/// An ephemeral session source, useful for testing and demonstration
/// purposes.
///
/// Accounts are registered up front with [`with_account`]. Every change to
/// the current session is broadcast to subscribers.
///
/// [`with_account`]: MemorySessionSource::with_account
#[derive(Clone, Debug)]
pub struct MemorySessionSource {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<SessionChange>,
}

impl Default for MemorySessionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionSource {
    /// Creates a source with no accounts and no session.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::default(),
            events,
        }
    }

    /// Registers an account which may sign in with `email` and `password`.
    pub fn with_account(self, email: &str, password: &str, auth_user_id: &str) -> Self {
        let account = Account {
            password: SecretString::new(password.to_string()),
            user: AuthUser {
                id: auth_user_id.to_string(),
                email: Some(email.to_string()),
            },
        };

        self.state().accounts.insert(email.to_string(), account);
        self
    }

    /// Starts a session for `auth_user_id` without credentials, as if it had
    /// been restored from an earlier visit. Subscribers are not notified.
    pub fn restore(&self, auth_user_id: &str) -> Session {
        let mut state = self.state();
        let session = issue(&mut state, auth_user_id, None);
        state.current = Some(session.clone());
        session
    }

    /// Replaces the current session and notifies subscribers with `kind`.
    pub fn emit(&self, kind: SessionEventKind, auth_user_id: Option<&str>) {
        let session = {
            let mut state = self.state();
            let session = auth_user_id.map(|id| issue(&mut state, id, None));
            state.current = session.clone();
            session
        };

        self.notify(kind, session);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, kind: SessionEventKind, session: Option<Session>) {
        // No receivers is not a failure.
        let _ = self.events.send(SessionChange { kind, session });
    }
}

fn issue(state: &mut State, auth_user_id: &str, email: Option<String>) -> Session {
    state.issued += 1;
    Session {
        user: AuthUser {
            id: auth_user_id.to_string(),
            email,
        },
        access_token: SecretString::new(format!("access-{}", state.issued)),
        refresh_token: Some(SecretString::new(format!("refresh-{}", state.issued))),
    }
}

#[async_trait]
impl SessionSource for MemorySessionSource {
    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        Ok(self.state().current.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.events.subscribe()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user.id), err)]
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Session, AuthError> {
        let session = {
            let mut state = self.state();
            let user = match state.accounts.get(email) {
                Some(account)
                    if account.password.expose_secret() == password.expose_secret() =>
                {
                    account.user.clone()
                }
                _ => return Err(AuthError::InvalidCredentials),
            };

            let session = issue(&mut state, &user.id, user.email);
            state.current = Some(session.clone());
            session
        };

        tracing::Span::current().record("user.id", session.auth_user_id());
        self.notify(SessionEventKind::SignedIn, Some(session.clone()));

        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.state().current = None;
        self.notify(SessionEventKind::SignedOut, None);
        Ok(())
    }
}
