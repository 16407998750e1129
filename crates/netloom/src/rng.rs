//! Random-number plumbing. Model construction owns a single seed; every
//! host derives its own deterministic stream from it so that replays with
//! the same seed produce identical traces.

use rand::rngs::ThreadRng;
use rand::RngCore;
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256StarStar;

// Enum to encapsulate different RngCore sources: the simulation either runs
// fully deterministic from a configured seed or falls back to OS entropy,
// and we have to dispatch without boxing because RngCore is not ?Sized
// everywhere we hand it out.
#[derive(Debug)]
pub enum RngSource {
    Thread(ThreadRng),
    Xoshiro(Xoshiro256StarStar),
}

impl RngSource {
    /// A deterministic stream when a seed is configured, OS entropy
    /// otherwise.
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => RngSource::Xoshiro(Xoshiro256StarStar::seed_from_u64(seed)),
            None => RngSource::Thread(rand::thread_rng()),
        }
    }

    /// Derive a per-entity stream from the model seed and a stable entity
    /// key (e.g. the host tie-breaking seed).
    pub fn derive(seed: u64, stream: u64) -> Xoshiro256StarStar {
        Xoshiro256StarStar::seed_from_u64(seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    /// Uniform sample in [low, high).
    pub fn uniform(&mut self, low: f64, high: f64) -> f64 {
        let unit = (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
        low + unit * (high - low)
    }
}

impl RngCore for RngSource {
    fn next_u32(&mut self) -> u32 {
        match self {
            RngSource::Thread(rng) => rng.next_u32(),
            RngSource::Xoshiro(rng) => rng.next_u32(),
        }
    }

    fn next_u64(&mut self) -> u64 {
        match self {
            RngSource::Thread(rng) => rng.next_u64(),
            RngSource::Xoshiro(rng) => rng.next_u64(),
        }
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        match self {
            RngSource::Thread(rng) => rng.fill_bytes(dest),
            RngSource::Xoshiro(rng) => rng.fill_bytes(dest),
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        match self {
            RngSource::Thread(rng) => rng.try_fill_bytes(dest),
            RngSource::Xoshiro(rng) => rng.try_fill_bytes(dest),
        }
    }
}
