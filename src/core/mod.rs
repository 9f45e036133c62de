//! Core remote session protocol.
//!
//! - **frame**: wire codec (type-tagged JSON, base64 payloads)
//! - **transport**: framed full-duplex connection and its single writer
//! - **terminal**: raw mode, terminal size and keyboard input
//! - **resize**: per-platform terminal resize notification
//! - **session**: one remote exec/shell session and its pumps
//! - **registry**: live sessions by id
//!
//! # Architecture
//!
//! ```text
//! SessionRegistry
//! └── Session
//!     ├── FramedTransport
//!     │   ├── writer task  <── stdin pump, resize pump
//!     │   └── reader loop  ──> stdout / stderr
//!     ├── TerminalControl (raw mode, size)
//!     └── ResizeWatcher (SIGWINCH | no-op)
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod frame;
pub mod registry;
pub mod resize;
pub mod session;
pub mod terminal;
pub mod transport;

pub use registry::SessionRegistry;
pub use session::{Completion, Session, SessionConfig, SessionIo};
pub use terminal::CrosstermTerminal;
pub use transport::WebSocketConnector;

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
