use crate::errors::{Result, VistaSegError};
use crate::session::{SessionId, SessionWorkspace};
use crate::traits::InferenceRunner;
use async_trait::async_trait;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PROGRAM: &str = "python";
pub const DEFAULT_ARGS: [&str; 5] = ["-m", "monai.bundle", "run", "--config_file", "{config}"];
pub const DEFAULT_CONFIG_FILE: &str = "monai_vista2d/configs/inference.json";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30 * 60;

pub const ENV_INPUT: &str = "VISTA_SEG_INPUT";
pub const ENV_OUTPUT: &str = "VISTA_SEG_OUTPUT";
pub const ENV_OUTPUT_DIR: &str = "VISTA_SEG_OUTPUT_DIR";

/// How the external segmentation tool is launched.
///
/// Arguments are templates: `{config}`, `{input}`, `{output}`,
/// `{output_dir}` and `{session}` are replaced for every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceCommand {
    pub program: String,
    pub args: Vec<String>,
    pub config_file: PathBuf,
    pub timeout: Duration,
}

impl Default for InferenceCommand {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args: DEFAULT_ARGS.iter().map(|s| s.to_string()).collect(),
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Paths a single run reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    pub session: SessionId,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl InferenceRequest {
    pub fn for_workspace(session: SessionId, workspace: &SessionWorkspace) -> Self {
        Self {
            session,
            input: workspace.source_image_path(),
            output: workspace.label_mask_path(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        self.output.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Captured result of a tool run that reached an exit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferenceOutcome {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub status: String,
}

impl InferenceOutcome {
    /// Stdout alone on success, both streams otherwise.
    pub fn log(&self) -> String {
        if self.success {
            self.stdout.clone()
        } else {
            self.combined_log()
        }
    }

    pub fn combined_log(&self) -> String {
        format!(
            "--- STDOUT ---\n{}\n\n--- STDERR ---\n{}",
            self.stdout, self.stderr
        )
    }

    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(VistaSegError::InferenceFailure {
                log: self.combined_log(),
                status: self.status,
            })
        }
    }
}

/// Runs the tool as a child process, one blocking-free invocation per call.
#[derive(Debug, Clone)]
pub struct CommandInferenceRunner {
    command: InferenceCommand,
}

impl CommandInferenceRunner {
    pub const fn new(command: InferenceCommand) -> Self {
        Self { command }
    }

    pub const fn command(&self) -> &InferenceCommand {
        &self.command
    }

    pub fn render_args(&self, request: &InferenceRequest) -> Vec<String> {
        let config = self.command.config_file.display().to_string();
        let input = request.input.display().to_string();
        let output = request.output.display().to_string();
        let output_dir = request.output_dir().display().to_string();
        let session = request.session.to_string();

        self.command
            .args
            .iter()
            .map(|arg| {
                arg.replace("{config}", &config)
                    .replace("{input}", &input)
                    .replace("{output_dir}", &output_dir)
                    .replace("{output}", &output)
                    .replace("{session}", &session)
            })
            .collect()
    }
}

#[async_trait]
impl InferenceRunner for CommandInferenceRunner {
    async fn run(
        &self,
        request: &InferenceRequest,
        cancellation: CancellationToken,
    ) -> Result<InferenceOutcome> {
        let args = self.render_args(request);
        tracing::info!(
            session = %request.session,
            program = %self.command.program,
            ?args,
            "launching inference tool"
        );

        let child = Command::new(&self.command.program)
            .args(&args)
            .env(ENV_INPUT, &request.input)
            .env(ENV_OUTPUT, &request.output)
            .env(ENV_OUTPUT_DIR, request.output_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => VistaSegError::ToolNotFound {
                    program: self.command.program.clone(),
                    source: e,
                },
                _ => VistaSegError::file_system(&self.command.program, "inference tool spawn", e),
            })?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = cancellation.cancelled() => {
                tracing::warn!(session = %request.session, "inference cancelled");
                return Err(VistaSegError::InferenceCancelled);
            }
            waited = timeout(self.command.timeout, child.wait_with_output()) => match waited {
                Ok(output) => output.map_err(|e| {
                    VistaSegError::file_system(&self.command.program, "child process wait", e)
                })?,
                Err(_) => {
                    tracing::error!(
                        session = %request.session,
                        timeout = ?self.command.timeout,
                        "inference timed out"
                    );
                    return Err(VistaSegError::InferenceTimeout {
                        timeout: self.command.timeout,
                    });
                }
            },
        };

        let outcome = InferenceOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            status: output.status.to_string(),
        };

        if outcome.success {
            tracing::info!(session = %request.session, "inference finished");
        } else {
            tracing::error!(
                session = %request.session,
                status = %outcome.status,
                "inference tool failed"
            );
        }
        Ok(outcome)
    }

    fn program(&self) -> &str {
        &self.command.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InferenceRequest {
        let workspace = SessionWorkspace::new("/work/abc");
        InferenceRequest::for_workspace(SessionId::new(), &workspace)
    }

    #[test]
    fn test_default_command_matches_bundle_invocation() {
        let runner = CommandInferenceRunner::new(InferenceCommand::default());
        let args = runner.render_args(&request());

        assert_eq!(runner.program(), "python");
        assert_eq!(
            args,
            vec![
                "-m",
                "monai.bundle",
                "run",
                "--config_file",
                "monai_vista2d/configs/inference.json"
            ]
        );
    }

    #[test]
    fn test_placeholders_are_rendered() {
        let request = request();
        let runner = CommandInferenceRunner::new(InferenceCommand {
            program: "seg".to_string(),
            args: vec![
                "--in={input}".to_string(),
                "--out={output}".to_string(),
                "--dir={output_dir}".to_string(),
                "--id={session}".to_string(),
            ],
            ..InferenceCommand::default()
        });

        let args = runner.render_args(&request);
        assert_eq!(args[0], "--in=/work/abc/images/source_image.png");
        assert_eq!(args[1], "--out=/work/abc/eval/source_image_label.tif");
        assert_eq!(args[2], "--dir=/work/abc/eval");
        assert_eq!(args[3], format!("--id={}", request.session));
    }

    #[test]
    fn test_failure_log_layout() {
        let outcome = InferenceOutcome {
            stdout: "loading".to_string(),
            stderr: "Traceback".to_string(),
            success: false,
            status: "exit status: 1".to_string(),
        };

        assert_eq!(
            outcome.log(),
            "--- STDOUT ---\nloading\n\n--- STDERR ---\nTraceback"
        );
        match outcome.into_result() {
            Err(VistaSegError::InferenceFailure { log, status }) => {
                assert!(log.contains("Traceback"));
                assert_eq!(status, "exit status: 1");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_success_log_is_stdout() {
        let outcome = InferenceOutcome {
            stdout: "done".to_string(),
            stderr: "warning".to_string(),
            success: true,
            status: "exit status: 0".to_string(),
        };
        assert_eq!(outcome.log(), "done");
        assert!(outcome.into_result().is_ok());
    }
}
