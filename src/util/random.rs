use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Source of randomness for identifier allocation and loss simulation, abstracted to allow
///  deterministic tests
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send {
    /// uniformly distributed in `1..=100`
    fn gen_percent(&mut self) -> u8;
    fn shuffle(&mut self, ids: &mut [u8]);
}

pub struct RngRandom {
    rng: StdRng,
}
impl RngRandom {
    pub fn from_entropy() -> RngRandom {
        RngRandom {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> RngRandom {
        RngRandom {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Random for RngRandom {
    fn gen_percent(&mut self) -> u8 {
        self.rng.gen_range(1..=100)
    }

    fn shuffle(&mut self, ids: &mut [u8]) {
        ids.shuffle(&mut self.rng);
    }
}
