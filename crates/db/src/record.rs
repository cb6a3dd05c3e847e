//! Peer records and the projections handed out of the database.

use fluxseed_primitives::Endpoint;

use crate::reliability::{WindowStat, WINDOWS, WINDOW_COUNT};

/// Outcome of one probe, fed back through `result_many`.
#[derive(Clone, Debug)]
pub struct ServiceResult {
    pub endpoint: Endpoint,
    pub good: bool,
    pub ban_secs: u64,
    pub client_version: i32,
    pub client_subversion: String,
    pub blocks: i32,
    pub services: u64,
}

/// A reservation handed to a crawler by `get_many`.
#[derive(Clone, Copy, Debug)]
pub struct ProbeTarget {
    pub endpoint: Endpoint,
    pub our_last_success: u64,
}

/// A peer that has succeeded at least once.
#[derive(Clone, Debug)]
pub struct TrackedPeer {
    pub id: u32,
    pub endpoint: Endpoint,
    pub services: u64,
    pub client_version: i32,
    pub client_subversion: String,
    pub blocks: i32,
    pub last_try: u64,
    pub our_last_try: u64,
    pub our_last_success: u64,
    pub ignore_until: u64,
    pub consecutive_failures: u32,
    pub windows: [WindowStat; WINDOW_COUNT],
}

impl TrackedPeer {
    /// A bootstrap record: straight into the tracked set, statistics zeroed.
    pub fn bootstrap(id: u32, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            services: 0,
            client_version: 0,
            client_subversion: String::new(),
            blocks: 0,
            last_try: 0,
            our_last_try: 0,
            our_last_success: 0,
            ignore_until: 0,
            consecutive_failures: 0,
            windows: [WindowStat::default(); WINDOW_COUNT],
        }
    }

    /// A record promoted out of the new bucket by its first success.
    pub fn promoted(id: u32, result: &ServiceResult, now: u64) -> Self {
        Self {
            id,
            endpoint: result.endpoint,
            services: result.services,
            client_version: result.client_version,
            client_subversion: result.client_subversion.clone(),
            blocks: result.blocks,
            last_try: now,
            our_last_try: now,
            our_last_success: now,
            ignore_until: 0,
            consecutive_failures: 0,
            windows: [WindowStat::seeded(); WINDOW_COUNT],
        }
    }

    /// Folds one probe outcome into every window, decayed by the time since
    /// the previous attempt, and advances the attempt timestamps.
    pub fn apply_attempt(&mut self, good: bool, now: u64) {
        let age = if self.our_last_try > 0 {
            now.saturating_sub(self.our_last_try)
        } else {
            0
        };
        for (stat, window) in self.windows.iter_mut().zip(WINDOWS.iter()) {
            stat.update(good, age, window.tau_secs);
        }
        self.last_try = now;
        self.our_last_try = now;
        if good {
            self.our_last_success = now;
            self.consecutive_failures = 0;
            self.ignore_until = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }

    pub fn any_window_passing(&self) -> bool {
        self.windows
            .iter()
            .zip(WINDOWS.iter())
            .any(|(stat, window)| stat.passes(window))
    }

    pub fn uptimes(&self) -> [f64; WINDOW_COUNT] {
        let mut out = [0.0; WINDOW_COUNT];
        for (slot, stat) in out.iter_mut().zip(self.windows.iter()) {
            *slot = stat.reliability;
        }
        out
    }
}

/// A known but never-verified peer in the bounded new bucket.
#[derive(Clone, Debug)]
pub struct NewPeer {
    pub id: u32,
    pub endpoint: Endpoint,
    pub evict_key: u64,
    pub total: u32,
    pub success: u32,
    pub our_last_try: u64,
}

/// One row of the full projection used by the dumper.
#[derive(Clone, Debug, PartialEq)]
pub struct SeedReport {
    pub endpoint: Endpoint,
    pub good: bool,
    pub last_success: u64,
    pub uptime: [f64; WINDOW_COUNT],
    pub blocks: i32,
    pub services: u64,
    pub client_version: i32,
    pub client_subversion: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DbStats {
    pub good: usize,
    pub avail: usize,
    pub tracked: usize,
    pub new: usize,
    pub probing: usize,
    pub banned: usize,
    pub age_secs: u64,
}
