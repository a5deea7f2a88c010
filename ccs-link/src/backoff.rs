//! Exponential backoff with jitter.
//!
//! Delays grow as `(2^seed - 1) / 2` seconds plus a random 100..1000 ms
//! delta, with the seed starting at 2. A bounded generator reports
//! exhaustion by returning `None`; the unbounded variant (used for
//! reconnects) wraps the seed back down instead so delays start small
//! again after a long outage.

use std::time::Duration;

use rand::Rng;

const INITIAL_SEED: u32 = 2;

// Seed 10 yields ~511s. Past that an unbounded generator starts over.
const WRAP_SEED: u32 = 10;

#[derive(Debug, Clone)]
pub struct Backoff {
    max_retries: Option<u32>,
    retries: u32,
    seed: u32,
}

impl Backoff {
    /// A generator that gives up after `max_retries` calls.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            retries: 0,
            seed: INITIAL_SEED,
        }
    }

    /// A generator that never gives up.
    pub fn unbounded() -> Self {
        Self {
            max_retries: None,
            retries: 0,
            seed: INITIAL_SEED,
        }
    }

    /// Next delay, or `None` once the retry budget is spent.
    pub fn next(&mut self) -> Option<Duration> {
        self.retries += 1;
        match self.max_retries {
            Some(max) if self.retries > max => return None,
            None if self.seed > WRAP_SEED => self.seed = INITIAL_SEED,
            _ => {}
        }

        let base_ms = ((1u64 << self.seed) - 1) / 2 * 1000;
        let jitter_ms = rand::thread_rng().gen_range(100..1000);
        self.seed += 1;
        Some(Duration::from_millis(base_ms + jitter_ms))
    }

    pub fn reset(&mut self) {
        self.retries = 0;
        self.seed = INITIAL_SEED;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}
