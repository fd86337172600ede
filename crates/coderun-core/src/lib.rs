//! # coderun-core
//!
//! Session registry, event streams and the per-session driver.
//!
//! ## Key Types
//!
//! - [`SessionRegistry`] - Admits runs (one active run per workspace) and answers queries
//! - [`EventStream`] / [`Subscription`] - Ordered, replayable per-session events
//! - [`Session`] / [`SessionState`] - A run and its lifecycle
//! - [`Problem`] - A diagnostic attributed to a session

mod archiver;
mod config;
mod driver;
mod error;
mod event;
mod ids;
mod problem;
mod registry;
mod request;
mod session;
mod stream;

pub use archiver::{archive_run, spawn_archiver};
pub use config::{LimitPolicy, RegistryConfig};
pub use error::{AdmissionError, ArchiveError, CancelError, RegistryError};
pub use event::{Event, EventKind, LifecycleMarker};
pub use ids::{SessionId, WorkspaceId};
pub use problem::Problem;
pub use registry::SessionRegistry;
pub use request::RunRequest;
pub use session::{FailureCause, Session, SessionState, SessionSummary, SessionUpdate};
pub use stream::{EventStream, Subscription};
