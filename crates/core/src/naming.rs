//! Unit naming: `{owner}-{suffix}` with a 5-character lowercase alphanumeric suffix.
//!
//! The generator is owned by whoever executes creates; seed it for reproducible names.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const SUFFIX_LEN: usize = 5;
const ALPHABET: &[u8] = b"1234567890abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone)]
pub struct NameGenerator {
    rng: StdRng,
}

impl NameGenerator {
    pub fn seeded(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    pub fn from_entropy() -> Self {
        Self { rng: StdRng::from_os_rng() }
    }

    pub fn suffix(&mut self) -> String {
        (0..SUFFIX_LEN)
            .map(|_| ALPHABET[self.rng.random_range(0..ALPHABET.len())] as char)
            .collect()
    }

    pub fn unit_name(&mut self, owner: &str) -> String {
        format!("{}-{}", owner, self.suffix())
    }
}
