use crate::errors::{Result, VistaSegError};
use crate::inference::{InferenceOutcome, InferenceRequest};
use crate::label_mask::{write_label_mask, LabelMask};
use crate::traits::{ColorStrategy, InferenceRunner};
use async_trait::async_trait;
use image::Rgb;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Test palette that cycles through a fixed list of colors.
#[derive(Debug, Clone)]
pub struct FixedPalette {
    colors: Vec<Rgb<u8>>,
    next: usize,
}

impl FixedPalette {
    pub fn new(color: Rgb<u8>) -> Self {
        Self::cycle(vec![color])
    }

    pub fn cycle(colors: Vec<Rgb<u8>>) -> Self {
        assert!(!colors.is_empty(), "FixedPalette needs at least one color");
        Self { colors, next: 0 }
    }
}

impl ColorStrategy for FixedPalette {
    fn next_color(&mut self) -> Rgb<u8> {
        let color = self.colors[self.next % self.colors.len()];
        self.next += 1;
        color
    }
}

/// What the mock tool does when run.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Writes the mask to the requested output and exits 0.
    WriteMask(LabelMask),
    /// Exits 0 without writing anything.
    SucceedWithoutOutput,
    /// Exits with the given code.
    Fail { code: i32, stderr: String },
    /// Cannot be launched.
    Missing,
    /// Waits until cancelled.
    Hang,
}

/// In-process stand-in for the external segmentation tool.
#[derive(Debug)]
pub struct MockInferenceRunner {
    behavior: MockBehavior,
    delay: Duration,
    runs: AtomicUsize,
}

impl MockInferenceRunner {
    pub const fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn writing(mask: LabelMask) -> Self {
        Self::new(MockBehavior::WriteMask(mask))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceRunner for MockInferenceRunner {
    async fn run(
        &self,
        request: &InferenceRequest,
        cancellation: CancellationToken,
    ) -> Result<InferenceOutcome> {
        if let MockBehavior::Missing = self.behavior {
            return Err(VistaSegError::ToolNotFound {
                program: self.program().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock tool missing"),
            });
        }
        self.runs.fetch_add(1, Ordering::SeqCst);

        if matches!(self.behavior, MockBehavior::Hang) {
            cancellation.cancelled().await;
            return Err(VistaSegError::InferenceCancelled);
        }

        tokio::select! {
            _ = cancellation.cancelled() => return Err(VistaSegError::InferenceCancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }

        let outcome = |success: bool, stderr: String| InferenceOutcome {
            stdout: format!("mock inference for {}", request.input.display()),
            stderr,
            success,
            status: if success { "exit status: 0" } else { "exit status: 1" }.to_string(),
        };

        match &self.behavior {
            MockBehavior::WriteMask(mask) => {
                write_label_mask(mask, &request.output)?;
                Ok(outcome(true, String::new()))
            }
            MockBehavior::SucceedWithoutOutput => Ok(outcome(true, String::new())),
            MockBehavior::Fail { code, stderr } => Ok(InferenceOutcome {
                status: format!("exit status: {code}"),
                ..outcome(false, stderr.clone())
            }),
            MockBehavior::Missing | MockBehavior::Hang => unreachable!("handled above"),
        }
    }

    fn program(&self) -> &str {
        "mock-segmenter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label_mask::read_label_mask;
    use crate::session::{SessionId, SessionWorkspace};
    use tempfile::TempDir;

    #[test]
    fn test_fixed_palette_cycles() {
        let mut palette = FixedPalette::cycle(vec![Rgb([1, 1, 1]), Rgb([2, 2, 2])]);
        let colors: Vec<_> = (0..3).map(|_| palette.next_color()).collect();
        assert_eq!(colors, vec![Rgb([1, 1, 1]), Rgb([2, 2, 2]), Rgb([1, 1, 1])]);
    }

    #[tokio::test]
    async fn test_mock_runner_writes_mask() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let workspace = SessionWorkspace::new(temp_dir.path());
        workspace.prepare()?;
        let request = InferenceRequest::for_workspace(SessionId::new(), &workspace);
        let mask = LabelMask::from_raw(2, 1, vec![0, 4]).unwrap();

        let runner = MockInferenceRunner::writing(mask.clone());
        let outcome = runner.run(&request, CancellationToken::new()).await?;

        assert!(outcome.success);
        assert_eq!(runner.runs(), 1);
        assert_eq!(read_label_mask(&request.output)?, mask);
        Ok(())
    }

    #[tokio::test]
    async fn test_mock_runner_hang_until_cancelled() {
        let workspace = SessionWorkspace::new("unused");
        let request = InferenceRequest::for_workspace(SessionId::new(), &workspace);
        let runner = MockInferenceRunner::new(MockBehavior::Hang);
        let token = CancellationToken::new();
        token.cancel();

        let result = runner.run(&request, token).await;
        assert!(matches!(result, Err(VistaSegError::InferenceCancelled)));
    }
}
