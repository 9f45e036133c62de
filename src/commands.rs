//! `exec` and `shell` commands
//!
//! Both receive the process-wide [`SessionRegistry`] from `main`.

use anyhow::Context;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::{Completion, Session, SessionIo, SessionRegistry};

/// `rexec exec`
#[derive(Debug, Clone, PartialEq)]
pub struct ExecArgs {
    pub session_id: String,
    pub endpoint: Url,
    pub command: Vec<String>,
    pub interactive: bool,
}

/// `rexec shell`
#[derive(Debug, Clone, PartialEq)]
pub struct ShellArgs {
    pub session_id: String,
    pub endpoint: Url,
}

/// Command words joined into one line for the remote shell
pub fn command_line(words: &[String]) -> String {
    let mut line = words.join(" ");
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}

/// Run one command remotely and wait for it to finish
pub async fn run_exec(
    registry: &SessionRegistry,
    args: ExecArgs,
    io: SessionIo,
) -> anyhow::Result<i32> {
    let session = registry
        .start_exec_session(&args.session_id, args.endpoint, args.interactive, io)
        .await
        .with_context(|| format!("failed to start session {}", args.session_id))?;

    let line = command_line(&args.command);
    if let Err(e) = session.send_command(&line).await {
        let _ = registry.close_session(session.id()).await;
        return Err(e).context("failed to send command");
    }

    finish(registry, &session).await
}

/// Attach an interactive shell until it exits
pub async fn run_shell(
    registry: &SessionRegistry,
    args: ShellArgs,
    io: SessionIo,
) -> anyhow::Result<i32> {
    let session = registry
        .start_shell_session(&args.session_id, args.endpoint, io)
        .await
        .with_context(|| format!("failed to start shell {}", args.session_id))?;

    finish(registry, &session).await
}

async fn finish(registry: &SessionRegistry, session: &Session) -> anyhow::Result<i32> {
    debug!("Waiting on session {} at {}", session.id(), session.endpoint());
    let result = session.wait_for_completion().await;
    if let Err(e) = registry.close_session(session.id()).await {
        warn!("{}", e);
    }

    let completion = result.with_context(|| format!("session {} failed", session.id()))?;
    match completion {
        Completion::Exited(code) => info!("Session {} exited with code {}", session.id(), code),
        other => info!("Session {} ended: {:?}", session.id(), other),
    }
    Ok(completion.exit_code())
}
