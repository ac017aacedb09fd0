//! HTTP and WebSocket gateway for voice sessions.
//!
//! A client calls `POST /api/start-session` to register a session, then
//! connects to `/ws/{session_id}`. The connection owns that session's
//! pipeline task; the [`SessionRegistry`] is the only state shared between
//! sessions.

pub mod connection;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod registry;
pub mod server;
pub mod state;

pub use error::{ApiError, RegistryError};
pub use registry::{Session, SessionRegistry};
pub use server::{router, serve, start_gateway};
pub use state::AppState;
