// Copyright 2023 Oxide Computer Company
use std::thread;
use std::time::{Duration, Instant};

/*
 * Every wait in the orchestrator goes through this one loop.  The shape
 * matters for tests: the predicate is evaluated before the first sleep, so
 * a condition that already holds costs zero sleeps, and the predicate runs
 * exactly `retries` times before we give up.
 */
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    retries: u32,
    interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate held.  `rounds` is the number of sleeps taken before
    /// it did (zero means it held on the first look).
    Satisfied { rounds: u32 },
    /// The retry budget is spent.
    TimedOut { rounds: u32, elapsed: Duration },
}

impl Poller {
    pub fn new(retries: u32, interval: Duration) -> Self {
        Poller { retries, interval }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Evaluate `pred` up to `retries` times, sleeping `interval` between
    /// rounds.  A predicate error ends the loop immediately.
    pub fn run<E, F>(&self, mut pred: F) -> Result<PollOutcome, E>
    where
        F: FnMut(u32) -> Result<bool, E>,
    {
        let start = Instant::now();
        for round in 0..self.retries {
            if pred(round)? {
                return Ok(PollOutcome::Satisfied { rounds: round });
            }
            if round + 1 < self.retries && !self.interval.is_zero() {
                thread::sleep(self.interval);
            }
        }
        Ok(PollOutcome::TimedOut {
            rounds: self.retries,
            elapsed: start.elapsed(),
        })
    }
}
