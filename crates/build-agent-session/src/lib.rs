//! Session lifecycle and registry for the build agent.
//!
//! Provides:
//! - `Session` - One context's terminal, running tasks one after another
//! - `SessionRegistry` - Context to session map with atomic get-or-create
//! - Observer attachments for control, spectate and status listeners
//! - `SessionEvent` - Registry-wide feed of status transitions

pub mod config;
mod driver;
pub mod event;
pub mod observer;
pub mod registry;
pub mod session;

pub use config::{ControlPolicy, SessionConfig};
pub use event::SessionEvent;
pub use observer::{ControlAttachment, ObserverGuard, ObserverId, SpectateAttachment, StatusAttachment};
pub use registry::SessionRegistry;
pub use session::{Session, SessionError};
