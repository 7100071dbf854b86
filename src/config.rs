use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::inference::{
    InferenceCommand, DEFAULT_ARGS, DEFAULT_CONFIG_FILE, DEFAULT_PROGRAM, DEFAULT_TIMEOUT_SECS,
};
use crate::ServiceSettings;

const PLACEHOLDERS: [&str; 5] = ["{config}", "{input}", "{output}", "{output_dir}", "{session}"];

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Directory holding one artifact directory per session.
    #[arg(short, long, default_value = "workspace", global = true)]
    pub workspace_root: PathBuf,

    /// Segmentation executable.
    #[arg(short, long, default_value = DEFAULT_PROGRAM, global = true)]
    pub program: String,

    /// Argument template for the executable, repeat once per argument.
    /// Supports {config}, {input}, {output}, {output_dir} and {session}.
    #[arg(
        long = "arg",
        value_name = "TEMPLATE",
        allow_hyphen_values = true,
        value_parser = check_template,
        global = true
    )]
    pub args: Vec<String>,

    /// Bundle configuration passed as {config}.
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    pub config_file: PathBuf,

    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, value_parser = check_timeout, global = true)]
    pub timeout_secs: u64,

    /// Do not offer the blended visualization download.
    #[arg(long, global = true)]
    pub no_visualization: bool,

    /// Seed for instance colors; random when omitted.
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Serve the upload/inference/download API.
    Serve {
        #[arg(short, long, default_value = "127.0.0.1:8501")]
        bind: SocketAddr,

        #[arg(long, default_value_t = 200)]
        max_upload_mb: usize,
    },
    /// Segment one image and write the downloads to a directory.
    Run {
        image: PathBuf,

        #[arg(short, long, default_value = "output")]
        out_dir: PathBuf,
    },
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    pub fn inference_command(&self) -> InferenceCommand {
        let args = if self.args.is_empty() {
            DEFAULT_ARGS.iter().map(|s| s.to_string()).collect()
        } else {
            self.args.clone()
        };

        InferenceCommand {
            program: self.program.clone(),
            args,
            config_file: self.config_file.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            workspace_root: self.workspace_root.clone(),
            visualization_enabled: !self.no_visualization,
            palette_seed: self.seed,
        }
    }
}

fn check_timeout(s: &str) -> Result<u64, String> {
    let secs: u64 = s
        .parse()
        .map_err(|e| format!("{s} is not a number of seconds: {e}"))?;
    if secs == 0 {
        return Err("timeout must be at least one second".to_string());
    }
    Ok(secs)
}

fn check_template(s: &str) -> Result<String, String> {
    let mut rest = s;
    while let Some(start) = rest.find('{') {
        let end = rest[start..]
            .find('}')
            .ok_or(format!("unclosed placeholder in `{s}`"))?;
        let placeholder = &rest[start..start + end + 1];
        if !PLACEHOLDERS.contains(&placeholder) {
            return Err(format!(
                "{placeholder} is not supported. Supported placeholders: {}",
                PLACEHOLDERS.join(", ")
            ));
        }
        rest = &rest[start + end + 1..];
    }
    Ok(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_reproduce_bundle_run() {
        let config = Config::try_parse_from(["vista-seg-rs", "serve"]).unwrap();
        let command = config.inference_command();

        assert_eq!(command.program, "python");
        assert_eq!(
            command.args,
            vec!["-m", "monai.bundle", "run", "--config_file", "{config}"]
        );
        assert_eq!(command.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(config.service_settings().visualization_enabled);
        assert_eq!(
            config.command,
            Command::Serve {
                bind: "127.0.0.1:8501".parse().unwrap(),
                max_upload_mb: 200
            }
        );
    }

    #[test]
    fn test_custom_command_and_run() {
        let config = Config::try_parse_from([
            "vista-seg-rs",
            "run",
            "cells.tif",
            "--program",
            "segment",
            "--arg",
            "--input={input}",
            "--arg",
            "{output}",
            "--timeout-secs",
            "5",
            "--no-visualization",
            "--seed",
            "9",
        ])
        .unwrap();

        let command = config.inference_command();
        assert_eq!(command.program, "segment");
        assert_eq!(command.args, vec!["--input={input}", "{output}"]);
        assert_eq!(command.timeout, Duration::from_secs(5));

        let settings = config.service_settings();
        assert!(!settings.visualization_enabled);
        assert_eq!(settings.palette_seed, Some(9));
        assert_eq!(
            config.command,
            Command::Run {
                image: "cells.tif".into(),
                out_dir: "output".into()
            }
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::try_parse_from(["vista-seg-rs", "serve", "--timeout-secs", "0"]).is_err());
        assert!(Config::try_parse_from(["vista-seg-rs", "serve", "--arg", "{model}"]).is_err());
        assert!(Config::try_parse_from(["vista-seg-rs", "serve", "--arg", "{input"]).is_err());
    }
}
