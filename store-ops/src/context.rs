//! Keeping a [`Hydrator`](crate::Hydrator) in step with a session source.

use secrecy::SecretString;
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
};

use crate::{
    hydrator::{AuthState, Hydrator, HydratorConfig},
    session::{Session, SessionChange, SessionSource},
    table::TableStore,
    SignInError,
};

/// The application's view of who is signed in.
///
/// An `AuthContext` connects a [`SessionSource`] to a [`Hydrator`]: it checks
/// for a restored session once at startup, then follows every session change
/// for as long as it lives. Each change starts a hydration run in its own task
/// so a slow backend never delays the next event.
///
/// Dropping the context unsubscribes from the session source. Runs already in
/// flight still complete.
#[derive(Debug)]
pub struct AuthContext<Source: SessionSource, Tables: TableStore> {
    source: Source,
    hydrator: Hydrator<Tables>,
    listener: JoinHandle<()>,
}

impl<Source: SessionSource, Tables: TableStore> AuthContext<Source, Tables> {
    /// Starts following `source`, resolving identities against `tables`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(source: Source, tables: Tables, config: HydratorConfig) -> Self {
        let hydrator = Hydrator::new(tables, config);

        // Subscribe before the startup check so no change can slip between.
        let events = source.subscribe();
        let listener = tokio::spawn(listen(source.clone(), hydrator.clone(), events));

        Self {
            source,
            hydrator,
            listener,
        }
    }

    /// A copy of the published state.
    pub fn state(&self) -> AuthState {
        self.hydrator.state()
    }

    /// Subscribes to the published state.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.hydrator.subscribe()
    }

    /// Waits until no run is resolving and returns the state at that point.
    pub async fn wait_until_loaded(&self) -> AuthState {
        let mut receiver = self.hydrator.subscribe();
        let loaded = receiver
            .wait_for(|state| !state.loading)
            .await
            .map(|state| state.clone());

        // The sender lives as long as the hydrator, so this cannot fail.
        loaded.unwrap_or_else(|_| self.hydrator.state())
    }

    /// The hydrator publishing this context's state.
    pub fn hydrator(&self) -> &Hydrator<Tables> {
        &self.hydrator
    }

    /// The table store identities are resolved against.
    pub fn tables(&self) -> &Tables {
        self.hydrator.tables()
    }

    /// Signs in with an email and password.
    ///
    /// The published state follows through the session-change feed; the
    /// returned error, if any, is already worded for display.
    #[tracing::instrument(level = "debug", skip_all, fields(email = %email), err)]
    pub async fn sign_in(&self, email: &str, password: SecretString) -> Result<(), SignInError> {
        match self.source.sign_in_with_password(email, &password).await {
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %err, "sign in refused");
                Err(SignInError::from(err))
            }
        }
    }

    /// Signs out and clears the resolved state immediately.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn sign_out(&self) {
        if let Err(err) = self.source.sign_out().await {
            tracing::warn!(error = %err, "session source failed to sign out");
        }
        // State is cleared before returning, even if the source's `SignedOut`
        // event is late or never arrives; observing it again later only
        // advances the run counter.
        self.hydrator.observe(None);
    }
}

impl<Source: SessionSource, Tables: TableStore> Drop for AuthContext<Source, Tables> {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn spawn_run<Tables: TableStore>(hydrator: &Hydrator<Tables>, session: Option<Session>) {
    if let Some(run) = hydrator.observe(session) {
        let hydrator = hydrator.clone();
        tokio::spawn(async move {
            hydrator.hydrate(run).await;
        });
    }
}

async fn listen<Source: SessionSource, Tables: TableStore>(
    source: Source,
    hydrator: Hydrator<Tables>,
    mut events: tokio::sync::broadcast::Receiver<SessionChange>,
) {
    restore(&source, &hydrator).await;

    loop {
        match events.recv().await {
            Ok(change) => {
                tracing::debug!(
                    kind = ?change.kind,
                    has_session = change.session.is_some(),
                    "session changed"
                );
                spawn_run(&hydrator, change.session);
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "session events lagged, re-reading current session");
                restore(&source, &hydrator).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn restore<Source: SessionSource, Tables: TableStore>(
    source: &Source,
    hydrator: &Hydrator<Tables>,
) {
    let session = match source.current_session().await {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(error = %err, "could not read current session");
            None
        }
    };

    tracing::debug!(has_session = session.is_some(), "current session read");
    spawn_run(hydrator, session);
}
