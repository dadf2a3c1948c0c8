//! The authentication collaborator: sessions, session-change events, and
//! password sign-in.

use std::fmt::Debug;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::broadcast;

use crate::AuthError;

pub mod memory;

/// The identity carried by a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// Subject identifier of the identity.
    pub id: String,
    /// Email address the identity signed in with, if known.
    pub email: Option<String>,
}

/// A live credential for an authenticated identity.
///
/// Tokens are kept secret: they are redacted from `Debug` output.
#[derive(Debug, Clone)]
pub struct Session {
    /// The authenticated identity.
    pub user: AuthUser,
    /// Bearer token for requests made on behalf of the identity.
    pub access_token: SecretString,
    /// Token used to obtain a fresh access token.
    pub refresh_token: Option<SecretString>,
}

impl Session {
    /// Subject identifier of the session's identity.
    pub fn auth_user_id(&self) -> &str {
        &self.user.id
    }
}

/// Why a [`SessionChange`] was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    /// An identity signed in.
    SignedIn,
    /// The identity signed out, or its session was discarded.
    SignedOut,
    /// The session's tokens were renewed.
    TokenRefreshed,
    /// The identity's attributes changed.
    UserUpdated,
}

/// A session-change event.
#[derive(Debug, Clone)]
pub struct SessionChange {
    /// What happened.
    pub kind: SessionEventKind,
    /// The session after the change; `None` once signed out.
    pub session: Option<Session>,
}

/// A source of authenticated sessions.
///
/// Sources must implement:
///
/// 1. [`current_session`](SessionSource::current_session), a one-shot query
///    for the session restored at startup,
/// 2. [`subscribe`](SessionSource::subscribe), a feed of every subsequent
///    [`SessionChange`]; dropping the receiver unsubscribes,
/// 3. [`sign_in_with_password`](SessionSource::sign_in_with_password) and
///    [`sign_out`](SessionSource::sign_out), which must also publish the
///    resulting change to subscribers.
#[async_trait]
pub trait SessionSource: Debug + Clone + Send + Sync + 'static {
    /// Returns the current session, if an identity is signed in.
    async fn current_session(&self) -> Result<Option<Session>, AuthError>;

    /// Subscribes to session changes.
    fn subscribe(&self) -> broadcast::Receiver<SessionChange>;

    /// Authenticates an identifier and secret, starting a session.
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Session, AuthError>;

    /// Ends the current session.
    async fn sign_out(&self) -> Result<(), AuthError>;
}
