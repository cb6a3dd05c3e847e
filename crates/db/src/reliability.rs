//! Sliding-window reliability statistics.
//!
//! Each tracked peer carries one [`WindowStat`] per window: an exponentially
//! decaying success rate together with a decayed attempt counter. A peer is
//! servable when any single window clears its row of the ladder, trading
//! recency against history: short-term excellence or a long settled record
//! both qualify.

pub const WINDOW_COUNT: usize = 5;

#[derive(Clone, Copy, Debug)]
pub struct ReliabilityWindow {
    pub label: &'static str,
    pub tau_secs: u64,
    pub min_attempts: f64,
    pub min_rate: f64,
}

pub const WINDOWS: [ReliabilityWindow; WINDOW_COUNT] = [
    ReliabilityWindow {
        label: "2h",
        tau_secs: 2 * 3600,
        min_attempts: 2.0,
        min_rate: 0.85,
    },
    ReliabilityWindow {
        label: "8h",
        tau_secs: 8 * 3600,
        min_attempts: 4.0,
        min_rate: 0.70,
    },
    ReliabilityWindow {
        label: "1d",
        tau_secs: 24 * 3600,
        min_attempts: 8.0,
        min_rate: 0.55,
    },
    ReliabilityWindow {
        label: "7d",
        tau_secs: 7 * 24 * 3600,
        min_attempts: 16.0,
        min_rate: 0.45,
    },
    ReliabilityWindow {
        label: "30d",
        tau_secs: 30 * 24 * 3600,
        min_attempts: 32.0,
        min_rate: 0.35,
    },
];

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WindowStat {
    pub reliability: f64,
    pub count: f64,
}

impl WindowStat {
    /// The state right after a promoting first success.
    pub fn seeded() -> Self {
        Self {
            reliability: 1.0,
            count: 1.0,
        }
    }

    /// Folds one attempt in. `age_secs` is the time since the previous
    /// attempt; everything older decays by `exp(-age/tau)` first.
    pub fn update(&mut self, good: bool, age_secs: u64, tau_secs: u64) {
        let decay = (-(age_secs as f64) / tau_secs as f64).exp();
        let gain = if good { 1.0 - decay } else { 0.0 };
        self.reliability = (self.reliability * decay + gain).clamp(0.0, 1.0);
        self.count = self.count * decay + 1.0;
    }

    /// Whether this window alone clears its ladder row. The attempt bound is
    /// `count > min_attempts - 1`: earlier attempts have already decayed a
    /// little when the Nth lands, so a literal `>= N` would be unreachable
    /// under rapid probing.
    pub fn passes(&self, window: &ReliabilityWindow) -> bool {
        self.reliability >= window.min_rate && self.count > window.min_attempts - 1.0
    }
}
