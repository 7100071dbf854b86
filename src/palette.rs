use crate::traits::ColorStrategy;
use image::Rgb;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Lowest channel value an instance color may take, keeping colors visible
/// over dark microscopy backgrounds.
pub const MIN_CHANNEL: u8 = 50;

/// Uniformly random instance colors, each channel in `[MIN_CHANNEL, 255]`.
#[derive(Debug, Clone)]
pub struct RandomPalette {
    rng: StdRng,
}

impl RandomPalette {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_seed(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::new, Self::seeded)
    }
}

impl Default for RandomPalette {
    fn default() -> Self {
        Self::new()
    }
}

impl ColorStrategy for RandomPalette {
    fn next_color(&mut self) -> Rgb<u8> {
        Rgb([
            self.rng.gen_range(MIN_CHANNEL..=u8::MAX),
            self.rng.gen_range(MIN_CHANNEL..=u8::MAX),
            self.rng.gen_range(MIN_CHANNEL..=u8::MAX),
        ])
    }
}
