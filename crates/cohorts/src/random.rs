//! Reproducible randomness for cohort draws.

use propensity_core::config::SeedPolicy;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CohortDraw {
    Control,
    Test,
}

/// Hands out the generator used for one draw of one propensity group.
pub trait RandomSource {
    fn rng_for(&self, group_number: u32, draw: CohortDraw) -> StdRng;
}

/// Seeds every draw from a single experiment seed.
#[derive(Debug, Clone, Copy)]
pub struct SeededSource {
    seed: u64,
    policy: SeedPolicy,
}

impl SeededSource {
    pub fn new(seed: u64, policy: SeedPolicy) -> Self {
        Self { seed, policy }
    }

    pub fn seed_for(&self, group_number: u32, draw: CohortDraw) -> u64 {
        match self.policy {
            SeedPolicy::Shared => self.seed,
            SeedPolicy::Independent => {
                let stream = ((group_number as u64) << 1) | (draw == CohortDraw::Test) as u64;
                splitmix64(self.seed ^ splitmix64(stream))
            }
        }
    }
}

impl RandomSource for SeededSource {
    fn rng_for(&self, group_number: u32, draw: CohortDraw) -> StdRng {
        StdRng::seed_from_u64(self.seed_for(group_number, draw))
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
