//! Session registry
//!
//! Process-scoped bookkeeping of live sessions by id. Built once at startup and
//! handed to the commands that need it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use url::Url;

use super::lock;
use super::session::{Session, SessionConfig, SessionIo};
use super::terminal::TerminalControl;
use super::transport::Connector;
use crate::error::{Result, SessionError};

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    connector: Arc<dyn Connector>,
    terminal: Arc<dyn TerminalControl>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        terminal: Arc<dyn TerminalControl>,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            connector,
            terminal,
            config,
        }
    }

    /// Create and start a session, registering it once it is streaming.
    ///
    /// A session that fails to start is closed and never registered.
    pub async fn start_exec_session(
        &self,
        id: &str,
        endpoint: Url,
        interactive: bool,
        io: SessionIo,
    ) -> Result<Arc<Session>> {
        if lock(&self.sessions).contains_key(id) {
            return Err(SessionError::AlreadyExists(id.to_string()));
        }

        let session = Arc::new(Session::new(
            id,
            endpoint,
            interactive,
            self.config.clone(),
            self.connector.clone(),
            self.terminal.clone(),
            io,
        ));
        session.start().await?;

        let raced = {
            let mut sessions = lock(&self.sessions);
            if sessions.contains_key(id) {
                true
            } else {
                sessions.insert(id.to_string(), session.clone());
                false
            }
        };
        if raced {
            session.close().await;
            return Err(SessionError::AlreadyExists(id.to_string()));
        }

        info!("Registered session {}", id);
        Ok(session)
    }

    /// A shell session is an interactive exec session
    pub async fn start_shell_session(
        &self,
        id: &str,
        endpoint: Url,
        io: SessionIo,
    ) -> Result<Arc<Session>> {
        self.start_exec_session(id, endpoint, true, io).await
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        lock(&self.sessions).get(id).cloned()
    }

    /// Remove a session and close it
    pub async fn close_session(&self, id: &str) -> Result<()> {
        let session = lock(&self.sessions)
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.close().await;
        debug!("Unregistered session {}", id);
        Ok(())
    }

    pub async fn close_all_sessions(&self) {
        let sessions: Vec<Arc<Session>> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }

    /// Ids of live sessions, sorted
    pub fn list_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
