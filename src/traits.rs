use crate::errors::Result;
use crate::inference::{InferenceOutcome, InferenceRequest};
use async_trait::async_trait;
use image::Rgb;
use tokio_util::sync::CancellationToken;

/// Launches the external segmentation tool for one request.
///
/// A run that starts but exits unsuccessfully is still `Ok`, with
/// `InferenceOutcome::success` unset. `Err` means no exit status was observed.
#[async_trait]
pub trait InferenceRunner: Send + Sync {
    async fn run(
        &self,
        request: &InferenceRequest,
        cancellation: CancellationToken,
    ) -> Result<InferenceOutcome>;

    /// Executable name, used in diagnostics.
    fn program(&self) -> &str;
}

/// Source of instance colors for the overlay.
pub trait ColorStrategy {
    fn next_color(&mut self) -> Rgb<u8>;
}

impl<C: ColorStrategy + ?Sized> ColorStrategy for &mut C {
    fn next_color(&mut self) -> Rgb<u8> {
        (**self).next_color()
    }
}

impl<C: ColorStrategy + ?Sized> ColorStrategy for Box<C> {
    fn next_color(&mut self) -> Rgb<u8> {
        (**self).next_color()
    }
}
