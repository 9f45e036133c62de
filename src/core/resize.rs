//! Terminal resize notification
//!
//! Unix delivers `SIGWINCH` when the controlling terminal changes size; other
//! platforms have no such signal. The capability is picked once per platform
//! through [`platform_watcher`], so the session never branches on the OS.

use futures::future::{self, BoxFuture};
use futures::FutureExt;

use crate::error::Result;

/// Resolves each time the local terminal size may have changed
pub trait ResizeWatcher: Send {
    /// Wait for the next notification.
    ///
    /// An `Err` is a transient capability failure; callers log it and keep
    /// waiting.
    fn changed(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Never fires
#[cfg_attr(unix, allow(dead_code))]
#[derive(Debug, Default)]
pub struct NoopResizeWatcher;

impl ResizeWatcher for NoopResizeWatcher {
    fn changed(&mut self) -> BoxFuture<'_, Result<()>> {
        future::pending().boxed()
    }
}

#[cfg(unix)]
pub use self::unix::SignalResizeWatcher;

#[cfg(unix)]
mod unix {
    use super::*;

    use tokio::signal::unix::{signal, Signal, SignalKind};
    use tracing::{debug, warn};

    use crate::error::SessionError;

    /// Listens for `SIGWINCH`
    pub struct SignalResizeWatcher {
        signal: Option<Signal>,
        failed: bool,
    }

    fn install() -> std::io::Result<Signal> {
        signal(SignalKind::window_change())
    }

    impl SignalResizeWatcher {
        /// Installs the handler right away so no resize after construction is
        /// missed. Must run inside a tokio runtime.
        pub fn new() -> Self {
            let signal = match install() {
                Ok(sig) => Some(sig),
                Err(e) => {
                    debug!("SIGWINCH handler not installed yet: {}", e);
                    None
                }
            };
            Self {
                signal,
                failed: false,
            }
        }

        pub fn is_installed(&self) -> bool {
            self.signal.is_some()
        }
    }

    impl ResizeWatcher for SignalResizeWatcher {
        fn changed(&mut self) -> BoxFuture<'_, Result<()>> {
            async move {
                // after a failure the watcher goes quiet instead of spinning
                if self.failed {
                    return future::pending().await;
                }

                // second chance for a handler that failed in `new`
                if self.signal.is_none() {
                    match install() {
                        Ok(sig) => self.signal = Some(sig),
                        Err(e) => {
                            warn!("Failed to install SIGWINCH handler: {}", e);
                            self.failed = true;
                            return Err(SessionError::Capability(e.to_string()));
                        }
                    }
                }

                let received = match self.signal.as_mut() {
                    Some(sig) => sig.recv().await,
                    None => None,
                };
                match received {
                    Some(()) => Ok(()),
                    None => {
                        self.failed = true;
                        Err(SessionError::Capability(
                            "SIGWINCH stream ended".to_string(),
                        ))
                    }
                }
            }
            .boxed()
        }
    }
}

/// The resize watcher for this platform
#[cfg(unix)]
pub fn platform_watcher() -> Box<dyn ResizeWatcher> {
    let watcher = SignalResizeWatcher::new();
    tracing::debug!("SIGWINCH handler installed: {}", watcher.is_installed());
    Box::new(watcher)
}

/// The resize watcher for this platform
#[cfg(not(unix))]
pub fn platform_watcher() -> Box<dyn ResizeWatcher> {
    Box::new(NoopResizeWatcher)
}

/// Test watcher fired by hand
#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::error::SessionError;
    use tokio::sync::mpsc;

    /// `Ok(())` fires a notification, `Err(msg)` a transient failure
    pub struct ChannelResizeWatcher {
        rx: mpsc::UnboundedReceiver<std::result::Result<(), String>>,
    }

    pub fn channel() -> (
        mpsc::UnboundedSender<std::result::Result<(), String>>,
        ChannelResizeWatcher,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ChannelResizeWatcher { rx })
    }

    impl ResizeWatcher for ChannelResizeWatcher {
        fn changed(&mut self) -> BoxFuture<'_, Result<()>> {
            async move {
                match self.rx.recv().await {
                    Some(Ok(())) => Ok(()),
                    Some(Err(msg)) => Err(SessionError::Capability(msg)),
                    None => future::pending().await,
                }
            }
            .boxed()
        }
    }
}
