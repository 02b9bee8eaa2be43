//! Network surface of the build agent.
//!
//! Provides:
//! - Wire protocol (JSON control messages, binary output frames)
//! - Attach path parsing (`/socket/term<ctx>`, `/socket/text<ctx>`, ...)
//! - WebSocket handlers for control, spectate and status observers
//! - File upload endpoint and index page

pub mod index;
pub mod path;
pub mod protocol;
pub mod router;
pub mod upload;
pub mod websocket;

pub use path::{AttachKind, AttachPaths, AttachTarget, OutputMode};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use router::{AppState, create_router};
