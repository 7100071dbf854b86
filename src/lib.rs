pub mod config;
pub mod errors;
pub mod inference;
pub mod label_mask;
pub mod metadata;
pub mod packager;
pub mod palette;
pub mod server;
pub mod session;
pub mod traits;
pub mod upload;
pub mod visualization;

pub mod mocks;

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub use config::Config;
pub use errors::{Result, VistaSegError};
pub use inference::{CommandInferenceRunner, InferenceCommand, InferenceOutcome, InferenceRequest};
pub use label_mask::LabelMask;
pub use metadata::MetadataRecord;
pub use packager::{DownloadPackager, Payload};
pub use palette::RandomPalette;
pub use session::{InferenceStatus, SessionId, SessionSnapshot, SessionStore};
pub use traits::*;

#[cfg(test)]
pub use mocks::*;

/// Runtime settings of a [`SegmentationService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub workspace_root: PathBuf,
    pub visualization_enabled: bool,
    pub palette_seed: Option<u64>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("workspace"),
            visualization_enabled: true,
            palette_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub session_id: SessionId,
    pub original_name: String,
    pub width: u32,
    pub height: u32,
    pub generation: u64,
}

/// Upload, inference and download pipeline over per-session workspaces.
pub struct SegmentationService<R: InferenceRunner> {
    sessions: SessionStore,
    runner: R,
    visualization_enabled: bool,
    palette_seed: Option<u64>,
}

impl<R: InferenceRunner> SegmentationService<R> {
    pub fn new(runner: R, settings: ServiceSettings) -> Self {
        Self {
            sessions: SessionStore::new(settings.workspace_root),
            runner,
            visualization_enabled: settings.visualization_enabled,
            palette_seed: settings.palette_seed,
        }
    }

    pub const fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub const fn runner(&self) -> &R {
        &self.runner
    }

    pub const fn visualization_enabled(&self) -> bool {
        self.visualization_enabled
    }

    pub fn create_session(&self) -> Result<SessionId> {
        self.sessions.create()
    }

    pub fn session_status(&self, id: SessionId) -> Result<SessionSnapshot> {
        self.sessions.snapshot(id)
    }

    pub fn clear_session(&self, id: SessionId) -> Result<()> {
        self.sessions.clear(id)
    }

    /// Drops the session and deletes its workspace directory.
    pub fn remove_session(&self, id: SessionId) -> Result<()> {
        self.sessions.remove(id)
    }

    /// Stores an upload as the session's source image and starts a new
    /// generation. A payload that does not decode leaves the session as it was.
    pub fn store_upload(
        &self,
        id: SessionId,
        file_name: Option<&str>,
        raw: &[u8],
    ) -> Result<UploadSummary> {
        let workspace = self.sessions.workspace(id)?;
        let image = upload::store(raw, &workspace.source_image_path())?;

        let original_name = upload::original_stem(file_name);
        let generation = self.sessions.record_upload(id, &original_name)?;
        remove_stale_output(&workspace.label_mask_path())?;

        tracing::info!(session = %id, %original_name, generation, "upload recorded");
        Ok(UploadSummary {
            session_id: id,
            original_name,
            width: image.width(),
            height: image.height(),
            generation,
        })
    }

    pub fn preview(&self, id: SessionId) -> Result<Payload> {
        let workspace = self.sessions.workspace(id)?;
        let original_name = self.sessions.snapshot(id)?.original_name;
        Ok(Payload {
            file_name: format!("{original_name}_preview.png"),
            mime: packager::MIME_PNG,
            bytes: upload::preview_png(&workspace.source_image_path())?,
        })
    }

    /// Runs the segmentation tool once for the session's current upload.
    pub async fn run_inference(&self, id: SessionId) -> Result<InferenceOutcome> {
        let guard = self.sessions.start_run(id)?;
        let ticket = guard.ticket();
        let request = InferenceRequest::for_workspace(id, &ticket.workspace);

        let result = self.execute(&request, &ticket.cancellation).await;
        match &result {
            Ok(outcome) => {
                guard.finish(true, Some(outcome.log()), None)?;
            }
            Err(e) => {
                tracing::error!(session = %id, error = %e, "inference failed");
                guard.finish(
                    false,
                    e.inference_log().map(str::to_string),
                    Some(e.to_string()),
                )?;
            }
        }
        result
    }

    async fn execute(
        &self,
        request: &InferenceRequest,
        cancellation: &tokio_util::sync::CancellationToken,
    ) -> Result<InferenceOutcome> {
        if !request.input.is_file() {
            return Err(VistaSegError::MissingOutput {
                path: request.input.clone(),
            });
        }

        let outcome = self
            .runner
            .run(request, cancellation.clone())
            .await?
            .into_result()?;

        if !request.output.is_file() {
            return Err(VistaSegError::MissingOutput {
                path: request.output.clone(),
            });
        }
        Ok(outcome)
    }

    pub fn cancel_inference(&self, id: SessionId) -> Result<bool> {
        let cancelled = self.sessions.cancel(id)?;
        if cancelled {
            tracing::info!(session = %id, "cancellation requested");
        }
        Ok(cancelled)
    }

    pub fn mask_payload(&self, id: SessionId) -> Result<Payload> {
        self.packager(id)?.mask_payload()
    }

    pub fn metadata_payload(&self, id: SessionId) -> Result<Payload> {
        self.packager(id)?.metadata_payload()
    }

    /// JPEG of the blended overlay. Colors come from a fresh palette on every
    /// call unless a seed is configured.
    pub fn visualization_payload(&self, id: SessionId) -> Result<Payload> {
        if !self.visualization_enabled {
            return Err(VistaSegError::VisualizationDisabled);
        }
        let mut palette = RandomPalette::from_seed(self.palette_seed);
        self.packager(id)?.visualization_payload(&mut palette)
    }

    /// All payloads offered for the session's current result.
    pub fn payloads(&self, id: SessionId) -> Result<Vec<Payload>> {
        let mut payloads = vec![self.mask_payload(id)?, self.metadata_payload(id)?];
        if self.visualization_enabled {
            payloads.push(self.visualization_payload(id)?);
        }
        Ok(payloads)
    }

    fn packager(&self, id: SessionId) -> Result<DownloadPackager> {
        Ok(DownloadPackager::new(self.sessions.completed_run(id)?))
    }
}

impl SegmentationService<CommandInferenceRunner> {
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            CommandInferenceRunner::new(config.inference_command()),
            config.service_settings(),
        )
    }
}

fn remove_stale_output(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "stale label mask removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VistaSegError::file_system(path, "stale label mask removal", e)),
    }
}
