//! The address database: every known peer, its statistics, its scheduling
//! state, and the ban list, behind one reader-writer guard.
//!
//! Lifecycle: endpoints enter the bounded new bucket (or the tracked set
//! directly on the bootstrap path), are handed out in batches to crawlers,
//! and move to the tracked set on their first successful probe. Tracked peers
//! are re-probed on a failure-scaled interval and served over DNS while they
//! pass the reliability ladder. Protocol-level misbehavior earns a timed ban.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::RwLock;

use fluxseed_primitives::{sha256d, Endpoint};
use rand::seq::SliceRandom;

use crate::record::{DbStats, NewPeer, ProbeTarget, SeedReport, ServiceResult, TrackedPeer};

/// Unverified peers are dropped after this many attempts without a success.
pub const NEW_FAIL_CAP: u32 = 7;

const MIN_RETRY_SECS: u64 = 600;
const MAX_RETRY_SECS: u64 = 3 * 3600;
const RESERVATION_MIN_SECS: u64 = 300;
const IGNORE_GRACE_SECS: u64 = 7 * 86_400;
const IGNORE_BASE_SECS: u64 = 3600;
const IGNORE_MAX_SECS: u64 = 8 * 3600;

#[derive(Clone, Debug)]
pub struct DbPolicy {
    pub min_client_version: i32,
    pub min_blocks: i32,
    pub new_bucket_cap: usize,
    pub tracked_cap: usize,
}

impl Default for DbPolicy {
    fn default() -> Self {
        Self {
            min_client_version: 170_016,
            min_blocks: 1_840_000,
            new_bucket_cap: 50_000,
            tracked_cap: 250_000,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FamilyFilter {
    pub v4: bool,
    pub v6: bool,
}

impl FamilyFilter {
    pub fn all() -> Self {
        Self { v4: true, v6: true }
    }

    fn matches(&self, endpoint: &Endpoint) -> bool {
        (self.v4 && endpoint.is_ipv4()) || (self.v6 && endpoint.is_ipv6())
    }
}

pub struct SeedDb {
    policy: DbPolicy,
    inner: RwLock<DbInner>,
}

#[derive(Default)]
struct DbInner {
    next_id: u32,
    tracked: HashMap<u32, TrackedPeer>,
    new_bucket: HashMap<u32, NewPeer>,
    ids: HashMap<Endpoint, u32>,
    evict_order: BTreeSet<(u64, u32)>,
    queue: VecDeque<u32>,
    probing: HashMap<u32, u64>,
    banned: HashMap<Endpoint, u64>,
}

/// Everything the snapshot persists; scheduling state is rebuilt on load.
pub(crate) struct DbExport {
    pub tracked: Vec<TrackedPeer>,
    pub new: Vec<NewPeer>,
    pub banned: Vec<(Endpoint, u64)>,
}

impl SeedDb {
    pub fn new(policy: DbPolicy) -> Self {
        Self {
            policy,
            inner: RwLock::new(DbInner::default()),
        }
    }

    pub fn policy(&self) -> &DbPolicy {
        &self.policy
    }

    /// Inserts an endpoint if it is unknown and not banned. The bootstrap
    /// path (`force_tracked`) bypasses the new bucket and lands in the
    /// tracked set with zeroed statistics.
    pub fn add(&self, endpoint: Endpoint, force_tracked: bool, now: u64) -> bool {
        let Ok(mut inner) = self.inner.write() else {
            return false;
        };
        inner.add(&self.policy, endpoint, force_tracked, now)
    }

    pub fn add_many(&self, endpoints: &[Endpoint], now: u64) -> usize {
        let Ok(mut inner) = self.inner.write() else {
            return 0;
        };
        endpoints
            .iter()
            .filter(|endpoint| inner.add(&self.policy, **endpoint, false, now))
            .count()
    }

    /// Reserves up to `max` peers for probing. Reservations time out after
    /// `wait_secs` (with a floor well above the probe timeout); expired ones
    /// are swept here and rescheduled on a later refill.
    pub fn get_many(&self, max: usize, wait_secs: u64, now: u64) -> Vec<ProbeTarget> {
        let Ok(mut inner) = self.inner.write() else {
            return Vec::new();
        };
        inner.sweep_reservations(now);
        if inner.queue.is_empty() {
            inner.refill_queue(now);
        }
        let deadline = now + wait_secs.max(RESERVATION_MIN_SECS);
        let mut out = Vec::new();
        while out.len() < max {
            let Some(id) = inner.queue.pop_front() else {
                break;
            };
            let target = if let Some(peer) = inner.tracked.get(&id) {
                ProbeTarget {
                    endpoint: peer.endpoint,
                    our_last_success: peer.our_last_success,
                }
            } else if let Some(peer) = inner.new_bucket.get(&id) {
                ProbeTarget {
                    endpoint: peer.endpoint,
                    our_last_success: 0,
                }
            } else {
                // Stale queue entry for a banned or evicted record.
                continue;
            };
            inner.probing.insert(id, deadline);
            out.push(target);
        }
        out
    }

    /// Integrates a batch of probe outcomes. Unknown endpoints are dropped
    /// silently; nothing in a result batch can abort the database.
    pub fn result_many(&self, results: &[ServiceResult], now: u64) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        for result in results {
            inner.integrate(&self.policy, result, now);
        }
    }

    /// Up to `max` servable endpoints of the requested families: tracked,
    /// not ignored, passing the goodness predicate. Oversupply is cut down
    /// by a random partial shuffle.
    pub fn get_ips(&self, max: usize, filter: FamilyFilter, now: u64) -> Vec<Endpoint> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let mut out: Vec<Endpoint> = inner
            .tracked
            .values()
            .filter(|peer| peer.ignore_until <= now)
            .filter(|peer| is_good(peer, &self.policy))
            .filter(|peer| filter.matches(&peer.endpoint))
            .map(|peer| peer.endpoint)
            .collect();
        if out.len() > max {
            let mut rng = rand::thread_rng();
            let (sample, _) = out.partial_shuffle(&mut rng, max);
            return sample.to_vec();
        }
        out
    }

    pub fn get_all(&self) -> Vec<SeedReport> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        inner
            .tracked
            .values()
            .map(|peer| SeedReport {
                endpoint: peer.endpoint,
                good: is_good(peer, &self.policy),
                last_success: peer.our_last_success,
                uptime: peer.uptimes(),
                blocks: peer.blocks,
                services: peer.services,
                client_version: peer.client_version,
                client_subversion: peer.client_subversion.clone(),
            })
            .collect()
    }

    pub fn get_stats(&self, now: u64) -> DbStats {
        let Ok(inner) = self.inner.read() else {
            return DbStats::default();
        };
        let good = inner
            .tracked
            .values()
            .filter(|peer| peer.ignore_until <= now && is_good(peer, &self.policy))
            .count();
        let age_secs = inner
            .tracked
            .values()
            .filter(|peer| peer.our_last_try > 0)
            .map(|peer| now.saturating_sub(peer.our_last_try))
            .max()
            .unwrap_or(0);
        DbStats {
            good,
            avail: inner.tracked.len() + inner.new_bucket.len(),
            tracked: inner.tracked.len(),
            new: inner.new_bucket.len(),
            probing: inner.probing.len(),
            banned: inner.banned.values().filter(|until| **until > now).count(),
            age_secs,
        }
    }

    pub fn ban(&self, endpoint: Endpoint, secs: u64, now: u64) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        inner.banned.insert(endpoint, now + secs);
        if let Some(id) = inner.ids.get(&endpoint).copied() {
            inner.remove_record(id);
        }
    }

    pub fn clear_bans(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.banned.clear();
        }
    }

    pub fn reset_ignores(&self) {
        if let Ok(mut inner) = self.inner.write() {
            for peer in inner.tracked.values_mut() {
                peer.ignore_until = 0;
            }
        }
    }

    /// Whether the endpoint is currently in the new bucket or tracked set.
    pub fn knows(&self, endpoint: &Endpoint) -> bool {
        self.inner
            .read()
            .map(|inner| inner.ids.contains_key(endpoint))
            .unwrap_or(false)
    }

    pub fn is_banned(&self, endpoint: &Endpoint, now: u64) -> bool {
        self.inner
            .read()
            .map(|inner| {
                inner
                    .banned
                    .get(endpoint)
                    .map(|until| *until > now)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub(crate) fn export(&self) -> DbExport {
        let Ok(inner) = self.inner.read() else {
            return DbExport {
                tracked: Vec::new(),
                new: Vec::new(),
                banned: Vec::new(),
            };
        };
        let mut tracked: Vec<TrackedPeer> = inner.tracked.values().cloned().collect();
        tracked.sort_by_key(|peer| peer.id);
        let mut new: Vec<NewPeer> = inner.new_bucket.values().cloned().collect();
        new.sort_by_key(|peer| peer.id);
        let mut banned: Vec<(Endpoint, u64)> =
            inner.banned.iter().map(|(ep, until)| (*ep, *until)).collect();
        banned.sort();
        DbExport {
            tracked,
            new,
            banned,
        }
    }

    /// Rebuilds a database from snapshot contents. Ids are reassigned in
    /// snapshot order; scheduling state starts empty.
    pub(crate) fn import(policy: DbPolicy, export: DbExport) -> Self {
        let mut inner = DbInner::default();
        for mut peer in export.tracked {
            if inner.tracked.len() >= policy.tracked_cap {
                break;
            }
            if inner.ids.contains_key(&peer.endpoint) {
                continue;
            }
            let id = inner.alloc_id();
            peer.id = id;
            inner.ids.insert(peer.endpoint, id);
            inner.tracked.insert(id, peer);
        }
        for mut peer in export.new {
            if inner.new_bucket.len() >= policy.new_bucket_cap {
                break;
            }
            if inner.ids.contains_key(&peer.endpoint) {
                continue;
            }
            let id = inner.alloc_id();
            peer.id = id;
            peer.evict_key = evict_key(&peer.endpoint);
            inner.ids.insert(peer.endpoint, id);
            inner.evict_order.insert((peer.evict_key, id));
            inner.new_bucket.insert(id, peer);
        }
        inner.banned = export.banned.into_iter().collect();
        Self {
            policy,
            inner: RwLock::new(inner),
        }
    }
}

impl DbInner {
    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn add(&mut self, policy: &DbPolicy, endpoint: Endpoint, force_tracked: bool, now: u64) -> bool {
        if endpoint.port() == 0 || !endpoint.is_routable() {
            return false;
        }
        if let Some(until) = self.banned.get(&endpoint).copied() {
            if until > now {
                return false;
            }
            self.banned.remove(&endpoint);
        }
        if self.ids.contains_key(&endpoint) {
            return false;
        }
        if force_tracked {
            if self.tracked.len() >= policy.tracked_cap {
                return false;
            }
            let id = self.alloc_id();
            self.ids.insert(endpoint, id);
            self.tracked.insert(id, TrackedPeer::bootstrap(id, endpoint));
            return true;
        }
        let id = self.alloc_id();
        let key = evict_key(&endpoint);
        self.ids.insert(endpoint, id);
        self.evict_order.insert((key, id));
        self.new_bucket.insert(
            id,
            NewPeer {
                id,
                endpoint,
                evict_key: key,
                total: 0,
                success: 0,
                our_last_try: 0,
            },
        );
        while self.new_bucket.len() > policy.new_bucket_cap {
            let Some((_, victim)) = self.evict_order.pop_first() else {
                break;
            };
            self.remove_record(victim);
        }
        true
    }

    fn integrate(&mut self, policy: &DbPolicy, result: &ServiceResult, now: u64) {
        let Some(id) = self.ids.get(&result.endpoint).copied() else {
            return;
        };
        self.probing.remove(&id);
        if result.ban_secs > 0 {
            self.banned.insert(result.endpoint, now + result.ban_secs);
            self.remove_record(id);
            return;
        }
        if let Some(peer) = self.new_bucket.get_mut(&id) {
            peer.total = peer.total.saturating_add(1);
            peer.our_last_try = now;
            if result.good {
                peer.success = peer.success.saturating_add(1);
                self.remove_record(id);
                if self.tracked.len() < policy.tracked_cap {
                    self.ids.insert(result.endpoint, id);
                    self.tracked.insert(id, TrackedPeer::promoted(id, result, now));
                }
            } else if peer.success == 0 && peer.total >= NEW_FAIL_CAP {
                self.remove_record(id);
            }
            return;
        }
        if let Some(peer) = self.tracked.get_mut(&id) {
            peer.apply_attempt(result.good, now);
            if result.good {
                peer.services = result.services;
                peer.client_version = result.client_version;
                peer.client_subversion = result.client_subversion.clone();
                peer.blocks = result.blocks;
            } else if !peer.any_window_passing()
                && peer.our_last_success > 0
                && now.saturating_sub(peer.our_last_success) > IGNORE_GRACE_SECS
            {
                let failing_for = now - peer.our_last_success;
                let ignore = (IGNORE_BASE_SECS + failing_for / 16).min(IGNORE_MAX_SECS);
                peer.ignore_until = now + ignore;
            }
        }
    }

    fn sweep_reservations(&mut self, now: u64) {
        let expired: Vec<u32> = self
            .probing
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.probing.remove(&id);
            if let Some(peer) = self.tracked.get_mut(&id) {
                peer.last_try = now;
                peer.our_last_try = now;
            } else if let Some(peer) = self.new_bucket.get_mut(&id) {
                peer.our_last_try = now;
            }
        }
    }

    fn refill_queue(&mut self, now: u64) {
        let mut due: Vec<(u64, u32)> = Vec::new();
        for (id, peer) in &self.tracked {
            if self.probing.contains_key(id) {
                continue;
            }
            if tracked_next_attempt(peer) <= now {
                due.push((peer.our_last_try, *id));
            }
        }
        for (id, peer) in &self.new_bucket {
            if self.probing.contains_key(id) {
                continue;
            }
            if new_next_attempt(peer) <= now {
                due.push((peer.our_last_try, *id));
            }
        }
        due.sort_unstable();
        self.queue.extend(due.into_iter().map(|(_, id)| id));
    }

    fn remove_record(&mut self, id: u32) {
        self.probing.remove(&id);
        if let Some(peer) = self.tracked.remove(&id) {
            self.ids.remove(&peer.endpoint);
        }
        if let Some(peer) = self.new_bucket.remove(&id) {
            self.ids.remove(&peer.endpoint);
            self.evict_order.remove(&(peer.evict_key, id));
        }
    }
}

fn is_good(peer: &TrackedPeer, policy: &DbPolicy) -> bool {
    peer.client_version >= policy.min_client_version
        && peer.blocks >= policy.min_blocks
        && peer.any_window_passing()
}

fn tracked_next_attempt(peer: &TrackedPeer) -> u64 {
    (peer.our_last_try + retry_interval(peer.consecutive_failures)).max(peer.ignore_until)
}

fn new_next_attempt(peer: &NewPeer) -> u64 {
    if peer.our_last_try == 0 {
        0
    } else {
        peer.our_last_try + MIN_RETRY_SECS
    }
}

fn retry_interval(failures: u32) -> u64 {
    (MIN_RETRY_SECS << failures.min(5)).min(MAX_RETRY_SECS)
}

/// Deterministic eviction key for the new bucket: low hash values go first.
fn evict_key(endpoint: &Endpoint) -> u64 {
    let mut bytes = [0u8; 18];
    bytes[..16].copy_from_slice(&endpoint.wire_addr());
    bytes[16..].copy_from_slice(&endpoint.port().to_le_bytes());
    let digest = sha256d(&bytes);
    u64::from_le_bytes(digest[..8].try_into().unwrap_or_default())
}
