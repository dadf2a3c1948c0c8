//! Error types shared by the table store, the session source, and sign-in.

/// An error raised by a [`TableStore`](crate::TableStore) or
/// [`ProofStorage`](crate::tasks::ProofStorage) operation.
///
/// A query that matches nothing is never an error: stores return an empty
/// result instead.
#[derive(Debug, thiserror::Error)]
pub enum DataAccessError {
    /// The backend could not be reached or the exchange broke off.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The backend answered but refused the request, e.g. an authorization
    /// failure or a constraint violation.
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// HTTP-style status code.
        status: u16,
        /// Explanation given by the backend.
        message: String,
    },

    /// A row did not have the expected shape.
    #[error("row could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// An error raised by a [`SessionSource`](crate::SessionSource).
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The identifier and secret pair was not accepted.
    #[error("Invalid login credentials")]
    InvalidCredentials,

    /// The authentication service refused the request.
    #[error("{message}")]
    Rejected {
        /// HTTP-style status code.
        status: u16,
        /// Explanation given by the service.
        message: String,
    },

    /// The authentication service could not be reached.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The authentication service answered with an unexpected payload.
    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl AuthError {
    fn is_invalid_credentials(&self) -> bool {
        match self {
            AuthError::InvalidCredentials => true,
            AuthError::Rejected { message, .. } => message
                .to_lowercase()
                .contains("invalid login credentials"),
            _ => false,
        }
    }
}

/// A sign-in failure, already phrased for display to the person signing in.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SignInError {
    message: String,
}

impl SignInError {
    /// The human-readable explanation.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<AuthError> for SignInError {
    fn from(err: AuthError) -> Self {
        let message = if err.is_invalid_credentials() {
            "Invalid email or password. Please try again.".to_string()
        } else {
            let message = err.to_string();
            if message.trim().is_empty() {
                "An unexpected error occurred".to_string()
            } else {
                message
            }
        };

        Self { message }
    }
}
