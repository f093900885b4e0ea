use std::collections::VecDeque;
use std::ops::RangeInclusive;

use tracing::warn;

use crate::util::random::Random;

/// A pool of one-byte identifiers, handed out in random order. Running out is a normal
///  condition the caller reports to the requester.
pub struct IdPool {
    name: &'static str,
    range: RangeInclusive<u8>,
    free: VecDeque<u8>,
}

impl IdPool {
    pub fn new(name: &'static str, range: RangeInclusive<u8>, random: &mut dyn Random) -> IdPool {
        let mut ids = range.clone().collect::<Vec<_>>();
        random.shuffle(&mut ids);
        IdPool {
            name,
            range,
            free: ids.into(),
        }
    }

    pub fn acquire(&mut self) -> Option<u8> {
        self.free.pop_front()
    }

    /// Released ids go to the end of the queue so they are not reused right away
    pub fn release(&mut self, id: u8) {
        if !self.range.contains(&id) || self.free.contains(&id) {
            warn!(pool = self.name, id, "releasing an id that is not in use - ignoring");
            return;
        }
        self.free.push_back(id);
    }

    pub fn is_exhausted(&self) -> bool {
        self.free.is_empty()
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }
}
