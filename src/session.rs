use crate::errors::{Result, VistaSegError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const UPLOADS_DIR: &str = "images";
pub const OUTPUTS_DIR: &str = "eval";
pub const SOURCE_IMAGE_FILE: &str = "source_image.png";
pub const LABEL_MASK_FILE: &str = "source_image_label.tif";
pub const DEFAULT_ORIGINAL_NAME: &str = "source_image";

/// Identifier of one user session and of its artifact directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = VistaSegError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| VistaSegError::Validation {
                field: "session_id".to_string(),
                reason: format!("is not a UUID: {e}"),
            })
    }
}

/// On-disk namespace owned by a single session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionWorkspace {
    root: PathBuf,
}

impl SessionWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join(OUTPUTS_DIR)
    }

    pub fn source_image_path(&self) -> PathBuf {
        self.uploads_dir().join(SOURCE_IMAGE_FILE)
    }

    pub fn label_mask_path(&self) -> PathBuf {
        self.outputs_dir().join(LABEL_MASK_FILE)
    }

    /// Creates both artifact directories if absent.
    pub fn prepare(&self) -> Result<()> {
        for dir in [self.uploads_dir(), self.outputs_dir()] {
            fs::create_dir_all(&dir)
                .map_err(|e| VistaSegError::file_system(&dir, "directory creation", e))?;
        }
        Ok(())
    }

    /// Removes everything inside the artifact directories, keeping the directories.
    pub fn clear(&self) -> Result<()> {
        for dir in [self.uploads_dir(), self.outputs_dir()] {
            if !dir.is_dir() {
                continue;
            }
            let entries =
                fs::read_dir(&dir).map_err(|e| VistaSegError::file_system(&dir, "directory listing", e))?;
            for entry in entries {
                let path = entry
                    .map_err(|e| VistaSegError::file_system(&dir, "directory listing", e))?
                    .path();
                let removed = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                removed.map_err(|e| VistaSegError::file_system(&path, "artifact removal", e))?;
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> Result<bool> {
        for dir in [self.uploads_dir(), self.outputs_dir()] {
            let mut entries =
                fs::read_dir(&dir).map_err(|e| VistaSegError::file_system(&dir, "directory listing", e))?;
            if entries.next().is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
struct SessionState {
    workspace: SessionWorkspace,
    original_name: String,
    generation: u64,
    status: InferenceStatus,
    log: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    cancellation: Option<CancellationToken>,
}

/// Serializable view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub original_name: String,
    pub generation: u64,
    pub status: InferenceStatus,
    pub log: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A claimed inference run. Only the holder may report its outcome.
#[derive(Debug, Clone)]
pub struct InferenceTicket {
    pub session: SessionId,
    pub generation: u64,
    pub workspace: SessionWorkspace,
    pub cancellation: CancellationToken,
}

/// Claim on a running inference. Dropping it before [`RunGuard::finish`]
/// cancels the run and records it as failed, so an abandoned caller never
/// leaves the session `Running`.
pub struct RunGuard<'a> {
    store: &'a SessionStore,
    ticket: InferenceTicket,
    finished: bool,
}

impl RunGuard<'_> {
    pub fn ticket(&self) -> &InferenceTicket {
        &self.ticket
    }

    pub fn finish(
        mut self,
        succeeded: bool,
        log: Option<String>,
        error: Option<String>,
    ) -> Result<bool> {
        self.finished = true;
        self.store
            .finish_inference(&self.ticket, succeeded, log, error)
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!(session = %self.ticket.session, "inference run abandoned");
        self.ticket.cancellation.cancel();
        if let Err(e) = self.store.finish_inference(
            &self.ticket,
            false,
            None,
            Some(ABORTED_RUN_ERROR.to_string()),
        ) {
            tracing::error!(session = %self.ticket.session, error = %e, "failed to record abandoned run");
        }
    }
}

pub const ABORTED_RUN_ERROR: &str = "inference aborted";

/// Artifacts a download may be served from.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub workspace: SessionWorkspace,
    pub original_name: String,
    pub generation: u64,
}

/// Registry of sessions, each owning `<root>/<session_id>/`.
pub struct SessionStore {
    root: PathBuf,
    sessions: RwLock<HashMap<SessionId, SessionState>>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create(&self) -> Result<SessionId> {
        let id = SessionId::new();
        let workspace = SessionWorkspace::new(self.root.join(id.to_string()));
        workspace.prepare()?;

        self.sessions.write().insert(
            id,
            SessionState {
                workspace,
                original_name: DEFAULT_ORIGINAL_NAME.to_string(),
                generation: 0,
                status: InferenceStatus::Idle,
                log: None,
                error: None,
                created_at: Utc::now(),
                cancellation: None,
            },
        );
        tracing::info!(session = %id, "session created");
        Ok(id)
    }

    pub fn workspace(&self, id: SessionId) -> Result<SessionWorkspace> {
        self.with_state(id, |state| state.workspace.clone())
    }

    pub fn snapshot(&self, id: SessionId) -> Result<SessionSnapshot> {
        self.with_state(id, |state| SessionSnapshot {
            session_id: id,
            original_name: state.original_name.clone(),
            generation: state.generation,
            status: state.status,
            log: state.log.clone(),
            error: state.error.clone(),
            created_at: state.created_at,
        })
    }

    /// Starts a new upload generation. Results of earlier generations become
    /// unavailable and an in-flight run is cancelled.
    pub fn record_upload(&self, id: SessionId, original_name: &str) -> Result<u64> {
        self.with_state_mut(id, |state| {
            if let Some(token) = state.cancellation.take() {
                token.cancel();
            }
            state.generation += 1;
            state.original_name = original_name.to_string();
            state.status = InferenceStatus::Idle;
            state.log = None;
            state.error = None;
            state.generation
        })
    }

    pub fn begin_inference(&self, id: SessionId) -> Result<InferenceTicket> {
        let mut sessions = self.sessions.write();
        let state = sessions
            .get_mut(&id)
            .ok_or(VistaSegError::SessionNotFound { session: id })?;

        if state.status == InferenceStatus::Running {
            return Err(VistaSegError::InferenceInProgress { session: id });
        }

        let token = CancellationToken::new();
        state.status = InferenceStatus::Running;
        state.cancellation = Some(token.clone());
        state.error = None;

        Ok(InferenceTicket {
            session: id,
            generation: state.generation,
            workspace: state.workspace.clone(),
            cancellation: token,
        })
    }

    /// Like [`Self::begin_inference`], but the claim is released on drop.
    pub fn start_run(&self, id: SessionId) -> Result<RunGuard<'_>> {
        Ok(RunGuard {
            store: self,
            ticket: self.begin_inference(id)?,
            finished: false,
        })
    }

    /// Records the outcome of a run. Outcomes of superseded generations are dropped.
    pub fn finish_inference(
        &self,
        ticket: &InferenceTicket,
        succeeded: bool,
        log: Option<String>,
        error: Option<String>,
    ) -> Result<bool> {
        self.with_state_mut(ticket.session, |state| {
            if state.generation != ticket.generation {
                tracing::warn!(
                    session = %ticket.session,
                    generation = ticket.generation,
                    current = state.generation,
                    "dropping outcome of a superseded inference run"
                );
                return false;
            }
            state.cancellation = None;
            state.status = if succeeded {
                InferenceStatus::Succeeded
            } else {
                InferenceStatus::Failed
            };
            state.log = log;
            state.error = error;
            true
        })
    }

    /// Cancels the in-flight run, returning whether one existed.
    pub fn cancel(&self, id: SessionId) -> Result<bool> {
        self.with_state(id, |state| match &state.cancellation {
            Some(token) if state.status == InferenceStatus::Running => {
                token.cancel();
                true
            }
            _ => false,
        })
    }

    /// Returns the artifacts of the current generation when its run succeeded.
    pub fn completed_run(&self, id: SessionId) -> Result<CompletedRun> {
        let sessions = self.sessions.read();
        let state = sessions
            .get(&id)
            .ok_or(VistaSegError::SessionNotFound { session: id })?;

        if state.status != InferenceStatus::Succeeded {
            return Err(VistaSegError::MissingOutput {
                path: state.workspace.label_mask_path(),
            });
        }

        Ok(CompletedRun {
            workspace: state.workspace.clone(),
            original_name: state.original_name.clone(),
            generation: state.generation,
        })
    }

    pub fn clear(&self, id: SessionId) -> Result<()> {
        let workspace = self.with_state_mut(id, |state| {
            if state.status == InferenceStatus::Running {
                return Err(VistaSegError::InferenceInProgress { session: id });
            }
            state.generation += 1;
            state.original_name = DEFAULT_ORIGINAL_NAME.to_string();
            state.status = InferenceStatus::Idle;
            state.log = None;
            state.error = None;
            Ok(state.workspace.clone())
        })??;
        workspace.clear()?;
        tracing::info!(session = %id, "session artifacts cleared");
        Ok(())
    }

    /// Forgets the session and deletes its directory.
    pub fn remove(&self, id: SessionId) -> Result<()> {
        let state = {
            let mut sessions = self.sessions.write();
            match sessions.get(&id) {
                None => return Err(VistaSegError::SessionNotFound { session: id }),
                Some(state) if state.status == InferenceStatus::Running => {
                    return Err(VistaSegError::InferenceInProgress { session: id })
                }
                Some(_) => {}
            }
            sessions.remove(&id)
        };

        if let Some(state) = state {
            let root = state.workspace.root();
            match fs::remove_dir_all(root) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(VistaSegError::file_system(root, "session removal", e)),
            }
        }
        tracing::info!(session = %id, "session removed");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn with_state<T>(&self, id: SessionId, f: impl FnOnce(&SessionState) -> T) -> Result<T> {
        self.sessions
            .read()
            .get(&id)
            .map(f)
            .ok_or(VistaSegError::SessionNotFound { session: id })
    }

    fn with_state_mut<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut SessionState) -> T,
    ) -> Result<T> {
        self.sessions
            .write()
            .get_mut(&id)
            .map(f)
            .ok_or(VistaSegError::SessionNotFound { session: id })
    }
}
