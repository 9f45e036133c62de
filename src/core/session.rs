//! Remote session
//!
//! A session binds one framed transport to the local terminal. Once started it
//! runs up to four tasks under one cancellation token:
//!
//! - the single writer, which owns the transport sink
//! - the reader loop, which dispatches inbound frames to stdout/stderr
//! - the stdin pump (interactive only)
//! - the resize pump (interactive only)
//!
//! Exit frames, transport errors and local interrupts all end in [`Session::close`],
//! which runs its body exactly once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::frame::{Frame, StreamKind, TermSize};
use super::lock;
use super::resize::{platform_watcher, ResizeWatcher};
use super::terminal::{spawn_stdin_reader, InputReceiver, TerminalControl, DEFAULT_SIZE};
use super::transport::{
    finish_writer, spawn_writer, Connector, FrameSender, FrameStream, WriteFailure,
};
use crate::error::{Result, SessionError};

/// Local output stream
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Tunables shared by every session a registry creates
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long the writer may keep flushing after close before it is aborted
    pub close_grace: Duration,
    /// Capacity of the outbound frame queue
    pub outbound_queue: usize,
    /// Print a notice when an interactive session's remote process exits
    pub exit_notice: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            close_grace: Duration::from_millis(250),
            outbound_queue: 64,
            exit_notice: true,
        }
    }
}

/// Local endpoints a session streams to and from
pub struct SessionIo {
    /// Keyboard input; only read by interactive sessions
    pub input: Option<InputReceiver>,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
    pub resize: Box<dyn ResizeWatcher>,
}

impl SessionIo {
    /// The process's own stdio. Stdin is only claimed for interactive sessions.
    pub fn stdio(interactive: bool) -> Self {
        Self {
            input: interactive.then(spawn_stdin_reader),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
            resize: platform_watcher(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    RawMode,
    Streaming,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::RawMode => "in raw mode",
            SessionState::Streaming => "streaming",
            SessionState::Closed => "closed",
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Remote process sent an exit frame
    Exited(i32),
    /// Remote side closed the transport without an exit frame
    Disconnected,
    /// Closed locally while streaming
    Closed,
    /// Local interrupt
    Interrupted,
}

impl Completion {
    /// Process exit code the CLI should report
    pub fn exit_code(&self) -> i32 {
        match self {
            Completion::Exited(code) => *code,
            _ => 0,
        }
    }
}

/// Result of the reader loop
#[derive(Debug)]
enum ReadOutcome {
    Exit(i32),
    Disconnected,
    Cancelled,
    Failed(SessionError),
}

#[derive(Default)]
struct Tasks {
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<ReadOutcome>>,
    pumps: Vec<JoinHandle<()>>,
}

/// One remote exec or shell session
pub struct Session {
    id: String,
    endpoint: Url,
    interactive: bool,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    terminal: Arc<dyn TerminalControl>,
    cancel: CancellationToken,
    /// Exactly-once guard for `close`
    closed: AtomicBool,
    /// Set while this session holds the terminal in raw mode
    raw_mode: AtomicBool,
    state: Mutex<SessionState>,
    io: Mutex<Option<SessionIo>>,
    outbound: Mutex<Option<FrameSender>>,
    write_failure: Mutex<Option<WriteFailure>>,
    tasks: Mutex<Tasks>,
    last_size: Arc<Mutex<Option<TermSize>>>,
    exit_code: Mutex<Option<i32>>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        endpoint: Url,
        interactive: bool,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        terminal: Arc<dyn TerminalControl>,
        io: SessionIo,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint,
            interactive,
            config,
            connector,
            terminal,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            raw_mode: AtomicBool::new(false),
            state: Mutex::new(SessionState::Created),
            io: Mutex::new(Some(io)),
            outbound: Mutex::new(None),
            write_failure: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
            last_size: Arc::new(Mutex::new(None)),
            exit_code: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Most recent terminal size sent to the remote side
    pub fn last_size(&self) -> Option<TermSize> {
        *lock(&self.last_size)
    }

    /// Exit code from the remote exit frame, once seen
    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn invalid_state(&self) -> SessionError {
        SessionError::InvalidState {
            id: self.id.clone(),
            state: self.state().as_str(),
        }
    }

    /// Open the transport and start streaming.
    ///
    /// Interactive sessions switch the terminal to raw mode and announce the
    /// current size before any pump starts. On failure the session is closed.
    pub async fn start(&self) -> Result<()> {
        if self.state() != SessionState::Created || self.closed.load(Ordering::SeqCst) {
            return Err(self.invalid_state());
        }

        let result = self.start_streaming().await;
        if let Err(e) = &result {
            error!("Session {} failed to start: {}", self.id, e);
            self.close().await;
        }
        result
    }

    async fn start_streaming(&self) -> Result<()> {
        let io = lock(&self.io).take().ok_or_else(|| self.invalid_state())?;

        if self.interactive && !self.terminal.is_terminal() {
            return Err(SessionError::Terminal(
                "interactive session requires a terminal on stdin".to_string(),
            ));
        }

        let transport = self.connector.connect(&self.endpoint).await?;
        let (tx, write_failure, writer) = spawn_writer(
            transport.sink,
            self.config.outbound_queue,
            self.cancel.clone(),
        );
        lock(&self.tasks).writer = Some(writer);
        *lock(&self.write_failure) = Some(write_failure);
        *lock(&self.outbound) = Some(tx.clone());

        if self.interactive {
            self.terminal.enable_raw_mode()?;
            self.raw_mode.store(true, Ordering::SeqCst);
            self.set_state(SessionState::RawMode);

            let size = self.terminal.size().unwrap_or_else(|e| {
                warn!(
                    "Failed to query terminal size, assuming {}x{}: {}",
                    DEFAULT_SIZE.cols, DEFAULT_SIZE.rows, e
                );
                DEFAULT_SIZE
            });
            *lock(&self.last_size) = Some(size);
            tx.send(Frame::resize(size))
                .await
                .map_err(|_| SessionError::Transport("connection closed".to_string()))?;
        }

        let reader = tokio::spawn(read_loop(
            transport.stream,
            io.stdout,
            io.stderr,
            self.interactive && self.config.exit_notice,
            self.cancel.clone(),
        ));

        let mut pumps = Vec::new();
        if self.interactive {
            match io.input {
                Some(input) => {
                    pumps.push(tokio::spawn(stdin_pump(input, tx.clone(), self.cancel.clone())));
                }
                None => warn!("Session {} has no local input", self.id),
            }
            pumps.push(tokio::spawn(resize_pump(
                io.resize,
                self.terminal.clone(),
                tx.clone(),
                self.last_size.clone(),
                self.cancel.clone(),
            )));
        }

        {
            let mut tasks = lock(&self.tasks);
            tasks.reader = Some(reader);
            tasks.pumps = pumps;
        }
        self.set_state(SessionState::Streaming);
        info!(
            "Session {} streaming to {} (interactive: {})",
            self.id, self.endpoint, self.interactive
        );
        Ok(())
    }

    /// Send `text` once as a single stdin frame
    pub async fn send_command(&self, text: &str) -> Result<()> {
        if self.state() != SessionState::Streaming {
            return Err(self.invalid_state());
        }
        let tx = lock(&self.outbound).clone().ok_or_else(|| self.invalid_state())?;

        debug!("Session {} sending command ({} bytes)", self.id, text.len());
        tx.send(Frame::stdin(text.as_bytes()))
            .await
            .map_err(|_| SessionError::Transport("connection closed".to_string()))
    }

    /// Block until the remote side finishes or Ctrl-C arrives
    pub async fn wait_for_completion(&self) -> Result<Completion> {
        self.wait_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                futures::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Block until the reader loop returns or `interrupt` resolves, then close
    pub async fn wait_until<F>(&self, interrupt: F) -> Result<Completion>
    where
        F: Future<Output = ()>,
    {
        let reader = lock(&self.tasks).reader.take().ok_or_else(|| self.invalid_state())?;

        let write_failure = lock(&self.write_failure).take();
        let write_failed = async move {
            match write_failure {
                Some(rx) => match rx.await {
                    Ok(e) => e,
                    // writer finished without an error
                    Err(_) => futures::future::pending().await,
                },
                None => futures::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            e = write_failed => {
                error!("Session {} lost its transport: {}", self.id, e);
                ReadOutcome::Failed(e)
            }
            res = reader => match res {
                Ok(outcome) => outcome,
                Err(e) => ReadOutcome::Failed(e.into()),
            },
            _ = interrupt => {
                info!("Session {} interrupted", self.id);
                self.close().await;
                return Ok(Completion::Interrupted);
            }
        };

        if let ReadOutcome::Exit(code) = outcome {
            *lock(&self.exit_code) = Some(code);
        }
        self.close().await;

        match outcome {
            ReadOutcome::Exit(code) => Ok(Completion::Exited(code)),
            ReadOutcome::Disconnected => Ok(Completion::Disconnected),
            ReadOutcome::Cancelled => Ok(Completion::Closed),
            ReadOutcome::Failed(e) => Err(e),
        }
    }

    /// Stop all tasks, restore the terminal and close the transport.
    ///
    /// Only the first call does anything; later or concurrent calls return
    /// immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing session {}", self.id);

        self.cancel.cancel();
        self.restore_terminal();

        let (pumps, writer) = {
            let mut tasks = lock(&self.tasks);
            (std::mem::take(&mut tasks.pumps), tasks.writer.take())
        };
        for pump in pumps {
            let _ = pump.await;
        }

        // last sender gone: the writer drains what is queued and closes the sink
        drop(lock(&self.outbound).take());
        if let Some(writer) = writer {
            finish_writer(writer, self.config.close_grace).await;
        }

        self.set_state(SessionState::Closed);
        info!("Session {} closed", self.id);
    }

    fn restore_terminal(&self) {
        if self.raw_mode.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.terminal.disable_raw_mode() {
                error!("Failed to restore terminal: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.as_str())
            .field("interactive", &self.interactive)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.restore_terminal();
    }
}

async fn write_out(out: &mut OutputSink, data: &[u8]) -> std::io::Result<()> {
    out.write_all(data).await?;
    out.flush().await
}

/// Decode inbound frames and dispatch them until exit, disconnect or cancel
async fn read_loop(
    mut stream: FrameStream,
    mut stdout: OutputSink,
    mut stderr: OutputSink,
    exit_notice: bool,
    cancel: CancellationToken,
) -> ReadOutcome {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReadOutcome::Cancelled,
            next = stream.next() => next,
        };

        let text = match next {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                error!("Transport failed: {}", e);
                return ReadOutcome::Failed(e);
            }
            None => {
                debug!("Transport closed by remote");
                return ReadOutcome::Disconnected;
            }
        };

        let frame = match Frame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Bad frame from remote: {}", e);
                return ReadOutcome::Failed(e);
            }
        };

        match frame {
            Frame::Data {
                stream: StreamKind::Stdout,
                data,
                ..
            } => {
                if let Err(e) = write_out(&mut stdout, &data).await {
                    return ReadOutcome::Failed(e.into());
                }
            }
            Frame::Data {
                stream: StreamKind::Stderr,
                data,
                ..
            } => {
                if let Err(e) = write_out(&mut stderr, &data).await {
                    return ReadOutcome::Failed(e.into());
                }
            }
            Frame::Exit { code, .. } => {
                info!("Remote process exited with code {}", code);
                if exit_notice {
                    let notice = format!("\r\n[rexec] session exited with code {}\r\n", code);
                    if let Err(e) = write_out(&mut stderr, notice.as_bytes()).await {
                        debug!("Failed to write exit notice: {}", e);
                    }
                }
                return ReadOutcome::Exit(code);
            }
            Frame::Data {
                stream: StreamKind::Stdin,
                ..
            }
            | Frame::Resize(_) => debug!("Ignoring client-bound frame from remote"),
            Frame::Unknown(kind) => debug!("Ignoring frame of unknown type {:?}", kind),
        }
    }
}

/// Forward local keyboard input as stdin frames
async fn stdin_pump(mut input: InputReceiver, tx: FrameSender, cancel: CancellationToken) {
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = input.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            debug!("Local input closed");
            break;
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            res = tx.send(Frame::stdin(chunk)) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
    debug!("stdin pump stopped");
}

/// Send a resize frame for every size-change notification
async fn resize_pump(
    mut watcher: Box<dyn ResizeWatcher>,
    terminal: Arc<dyn TerminalControl>,
    tx: FrameSender,
    last_size: Arc<Mutex<Option<TermSize>>>,
    cancel: CancellationToken,
) {
    loop {
        let changed = tokio::select! {
            _ = cancel.cancelled() => break,
            changed = watcher.changed() => changed,
        };
        if let Err(e) = changed {
            warn!("{}", e);
            continue;
        }

        let size = match terminal.size() {
            Ok(size) => size,
            Err(e) => {
                warn!("Failed to query terminal size: {}", e);
                continue;
            }
        };
        debug!("Terminal resized to {}x{}", size.cols, size.rows);
        *lock(&last_size) = Some(size);

        tokio::select! {
            _ = cancel.cancelled() => break,
            res = tx.send(Frame::resize(size)) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
    debug!("resize pump stopped");
}
