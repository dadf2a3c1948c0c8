use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;

use super::{error_message, execute, ErrorBody, RestClient};
use crate::{
    session::{AuthUser, Session, SessionChange, SessionEventKind, SessionSource},
    AuthError,
};

const INVALID_CREDENTIAL_CODES: [&str; 2] = ["invalid_grant", "invalid_credentials"];

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user: TokenUser,
}

impl From<TokenResponse> for Session {
    fn from(token: TokenResponse) -> Self {
        Session {
            user: AuthUser {
                id: token.user.id,
                email: token.user.email,
            },
            access_token: SecretString::new(token.access_token),
            refresh_token: token.refresh_token.map(SecretString::new),
        }
    }
}

fn is_invalid_credentials(status: StatusCode, body: &str) -> bool {
    if status != StatusCode::BAD_REQUEST {
        return false;
    }

    let error = ErrorBody::parse(body);
    let code = error.code();
    let coded = [error.error.as_deref(), code.as_deref()]
        .into_iter()
        .flatten()
        .any(|code| INVALID_CREDENTIAL_CODES.contains(&code));

    coded
        || error
            .message()
            .is_some_and(|message| message.eq_ignore_ascii_case("invalid login credentials"))
}

impl RestClient {
    /// Installs a session persisted from an earlier visit. Subscribers are
    /// not notified.
    pub fn restore_session(&self, session: Session) {
        *self.session_mut() = Some(session);
    }

    /// Exchanges the current refresh token for fresh tokens and notifies
    /// subscribers.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let refresh_token = self
            .session()
            .as_ref()
            .and_then(|session| session.refresh_token.as_ref())
            .map(|token| token.expose_secret().clone())
            .ok_or_else(|| AuthError::Rejected {
                status: StatusCode::UNAUTHORIZED.as_u16(),
                message: "Auth session missing!".to_string(),
            })?;

        let session = self
            .grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        self.install(SessionEventKind::TokenRefreshed, session.clone());

        Ok(session)
    }

    async fn grant(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> Result<Session, AuthError> {
        let request = self
            .request(Method::POST, "/auth/v1/token")
            .query(&[("grant_type", grant_type)])
            .json(&body);
        let reply = execute(request)
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        if is_invalid_credentials(reply.status, &reply.body) {
            return Err(AuthError::InvalidCredentials);
        }
        if !reply.status.is_success() {
            return Err(AuthError::Rejected {
                status: reply.status.as_u16(),
                message: error_message(reply.status, &reply.body),
            });
        }

        let token: TokenResponse = serde_json::from_str(&reply.body)?;
        Ok(token.into())
    }

    fn install(&self, kind: SessionEventKind, session: Session) {
        *self.session_mut() = Some(session.clone());
        self.notify(SessionChange {
            kind,
            session: Some(session),
        });
    }
}

#[async_trait]
impl SessionSource for RestClient {
    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        Ok(self.session().clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.inner.events.subscribe()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user.id), err)]
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Session, AuthError> {
        let session = self
            .grant(
                "password",
                json!({ "email": email, "password": password.expose_secret() }),
            )
            .await?;

        tracing::Span::current().record("user.id", session.auth_user_id());
        self.install(SessionEventKind::SignedIn, session.clone());

        Ok(session)
    }

    /// Revokes the session remotely, then forgets it locally even when the
    /// revocation failed.
    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn sign_out(&self) -> Result<(), AuthError> {
        let signed_in = self.session().is_some();

        let revoked = if signed_in {
            match execute(self.request(Method::POST, "/auth/v1/logout")).await {
                Ok(reply) if reply.status.is_success() => Ok(()),
                Ok(reply) => Err(AuthError::Rejected {
                    status: reply.status.as_u16(),
                    message: error_message(reply.status, &reply.body),
                }),
                Err(err) => Err(AuthError::Transport(err.to_string())),
            }
        } else {
            Ok(())
        };

        *self.session_mut() = None;
        self.notify(SessionChange {
            kind: SessionEventKind::SignedOut,
            session: None,
        });

        revoked
    }
}
