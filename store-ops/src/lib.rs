//! Session hydration and store operations for retail store managers.
//!
//! This crate turns an authenticated identity into everything a store
//! manager's client needs to know about them, and then gives that client
//! typed access to the store's day-to-day work:
//!
//! 1. Resolving who signed in: their profile, role and store,
//! 2. Following sign-ins, sign-outs and token refreshes as they happen,
//! 3. Working through tasks assigned by HQ, with photo proof,
//! 4. Reading HQ broadcasts and holding conversations with HQ,
//! 5. Tracking the day's sales against target.
//!
//! Storage is decoupled from resolution: any backend for which
//! [`TableStore`] is implemented is supported. Likewise any authentication
//! service which implements [`SessionSource`] may be used. Both are
//! implemented over HTTP by [`RestClient`](rest::RestClient) when the `rest`
//! feature is enabled, and in memory by [`MemoryStore`] and
//! [`MemorySessionSource`](session::memory::MemorySessionSource).
//!
//! # Hydration
//!
//! The [`Hydrator`] publishes an [`AuthState`] through a watch channel. Every
//! session change supersedes the resolution in flight, so a slow lookup for an
//! earlier identity can never overwrite what is known about a later one. An
//! [`AuthContext`] wires a session source to a hydrator and keeps it fed.
//!
//! # Example
//!
//! Note that the below example makes use of memory-based backends for
//! demonstration purposes only.
//!
//! ```rust
//! use secrecy::SecretString;
//! use serde_json::json;
//! use store_ops::{
//!     session::memory::MemorySessionSource, table::row, AuthContext, HydratorConfig, MemoryStore,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let tables = MemoryStore::new();
//!     tables
//!         .seed(
//!             "users",
//!             [row(json!({
//!                 "id": "u-1",
//!                 "auth_user_id": "auth-1",
//!                 "name": "Meera",
//!                 "role": "store_manager",
//!             }))],
//!         )
//!         .await;
//!     tables
//!         .seed("user_store_access", [row(json!({ "user_id": "u-1", "store_id": "s-1" }))])
//!         .await;
//!     tables
//!         .seed(
//!             "stores",
//!             [row(json!({ "id": "s-1", "code": "BLR01", "name": "Bengaluru Central" }))],
//!         )
//!         .await;
//!
//!     let source =
//!         MemorySessionSource::new().with_account("meera@example.com", "hunter42", "auth-1");
//!     let auth = AuthContext::start(source, tables, HydratorConfig::default());
//!     assert!(auth.wait_until_loaded().await.session.is_none());
//!
//!     let mut state = auth.subscribe();
//!     auth.sign_in("meera@example.com", SecretString::new("hunter42".into()))
//!         .await
//!         .unwrap();
//!
//!     let state = state.wait_for(|state| state.store.is_some()).await.unwrap();
//!     assert_eq!(state.store.as_ref().unwrap().code, "BLR01");
//! }
//! ```

#![warn(
    clippy::all,
    nonstandard_style,
    future_incompatible,
    missing_debug_implementations
)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod context;
pub mod dashboard;
mod error;
pub mod hydrator;
pub mod inbox;
pub mod memory_store;
pub mod model;
pub mod performance;
#[cfg(feature = "rest")]
pub mod rest;
pub mod session;
pub mod table;
pub mod tasks;
pub mod threads;

pub use context::AuthContext;
pub use error::{AuthError, DataAccessError, SignInError};
pub use hydrator::{AuthState, HydrationRun, Hydrator, HydratorConfig, RunOutcome};
pub use memory_store::MemoryStore;
pub use model::{AppUser, Role, Store};
pub use secrecy;
pub use session::{Session, SessionSource};
pub use table::{Query, TableStore};
