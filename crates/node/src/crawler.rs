//! The crawler pool: homogeneous workers pulling probe batches from the
//! database. The "probe a peer" capability is injected so tests can run the
//! full worker/database contract against a deterministic prober.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fluxseed_db::{SeedDb, ServiceResult};
use fluxseed_primitives::Endpoint;
use rand::Rng;

pub const CRAWL_BATCH: usize = 16;
pub const CRAWL_WAIT_SECS: u64 = 5;

/// Peers successfully seen within a day are not asked for their peer list.
const HARVEST_AFTER_SECS: u64 = 86_400;

#[derive(Clone, Debug, Default)]
pub struct ProbeOutcome {
    pub good: bool,
    pub ban_secs: u64,
    pub client_version: i32,
    pub client_subversion: String,
    pub blocks: i32,
    pub services: u64,
    pub harvested: Vec<Endpoint>,
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint, want_addrs: bool) -> ProbeOutcome;
}

pub async fn crawler_loop(db: Arc<SeedDb>, prober: Arc<dyn Probe>, pool_width: usize) {
    loop {
        let now = crate::unix_now_secs();
        if !crawl_once(db.as_ref(), prober.as_ref(), now).await {
            // Empty queue: back off, jittered by the pool width so a wide
            // pool does not stampede the database in lockstep.
            let jitter = rand::thread_rng().gen_range(0..500 * pool_width.max(1) as u64);
            tokio::time::sleep(Duration::from_millis(CRAWL_WAIT_SECS * 1000 + jitter)).await;
        }
    }
}

/// One worker pass: reserve a batch, probe it, feed results and any
/// harvested addresses back. Returns false when the queue was empty.
pub async fn crawl_once(db: &SeedDb, prober: &dyn Probe, now: u64) -> bool {
    let targets = db.get_many(CRAWL_BATCH, CRAWL_WAIT_SECS, now);
    if targets.is_empty() {
        return false;
    }
    let mut results = Vec::with_capacity(targets.len());
    let mut harvested: Vec<Endpoint> = Vec::new();
    for target in targets {
        let want_addrs = target.our_last_success + HARVEST_AFTER_SECS < now;
        let outcome = prober.probe(&target.endpoint, want_addrs).await;
        harvested.extend(outcome.harvested);
        results.push(ServiceResult {
            endpoint: target.endpoint,
            good: outcome.good,
            ban_secs: outcome.ban_secs,
            client_version: outcome.client_version,
            client_subversion: outcome.client_subversion,
            blocks: outcome.blocks,
            services: outcome.services,
        });
    }
    db.result_many(&results, now);
    db.add_many(&harvested, now);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use fluxseed_db::{DbPolicy, FamilyFilter};

    const T0: u64 = 1_700_000_000;

    fn ep(raw: &str) -> Endpoint {
        Endpoint::parse(raw, 16125).expect("test endpoint")
    }

    fn policy() -> DbPolicy {
        DbPolicy {
            min_client_version: 70_000,
            min_blocks: 10_000,
            ..DbPolicy::default()
        }
    }

    fn good_outcome() -> ProbeOutcome {
        ProbeOutcome {
            good: true,
            client_version: 70_015,
            client_subversion: "/fluxd:8.0.0/".to_string(),
            blocks: 12_345,
            services: 1,
            ..ProbeOutcome::default()
        }
    }

    #[derive(Default)]
    struct FakeProber {
        outcomes: Mutex<HashMap<Endpoint, ProbeOutcome>>,
        calls: Mutex<Vec<(Endpoint, bool)>>,
    }

    impl FakeProber {
        fn set(&self, endpoint: Endpoint, outcome: ProbeOutcome) {
            self.outcomes.lock().unwrap().insert(endpoint, outcome);
        }

        fn calls(&self) -> Vec<(Endpoint, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Probe for FakeProber {
        async fn probe(&self, endpoint: &Endpoint, want_addrs: bool) -> ProbeOutcome {
            self.calls.lock().unwrap().push((*endpoint, want_addrs));
            self.outcomes
                .lock()
                .unwrap()
                .get(endpoint)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn empty_queue_reports_idle() {
        let db = SeedDb::new(policy());
        let prober = FakeProber::default();
        assert!(!crawl_once(&db, &prober, T0).await);
        assert!(prober.calls().is_empty());
    }

    #[tokio::test]
    async fn batch_promotes_and_harvests() {
        let db = SeedDb::new(policy());
        let prober = FakeProber::default();
        let alive = ep("198.51.100.1:16125");
        let dead = ep("198.51.100.2:16125");
        let advertised = ep("198.51.100.3:16125");

        db.add(alive, false, T0);
        db.add(dead, false, T0);
        let mut outcome = good_outcome();
        outcome.harvested = vec![advertised];
        prober.set(alive, outcome);

        assert!(crawl_once(&db, &prober, T0).await);

        // Never-seen peers are always asked for their peer list.
        assert!(prober.calls().iter().all(|(_, want)| *want));

        let stats = db.get_stats(T0);
        assert_eq!(stats.tracked, 1);
        // The advertised peer joined the new bucket next to the failed one.
        assert_eq!(stats.new, 2);
        assert!(db.knows(&advertised));
        assert_eq!(stats.probing, 0);
    }

    #[tokio::test]
    async fn harvest_is_skipped_for_recently_seen_peers() {
        let db = SeedDb::new(policy());
        let prober = FakeProber::default();
        let peer = ep("198.51.100.4:16125");
        db.add(peer, false, T0);
        prober.set(peer, good_outcome());

        assert!(crawl_once(&db, &prober, T0).await);
        // Fresh success: the retry-interval later the harvest is skipped.
        assert!(crawl_once(&db, &prober, T0 + 601).await);
        // A day later it is due again.
        assert!(crawl_once(&db, &prober, T0 + 601 + HARVEST_AFTER_SECS + 1).await);

        let calls = prober.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].1);
        assert!(!calls[1].1);
        assert!(calls[2].1);
    }

    #[tokio::test]
    async fn protocol_ban_removes_the_peer() {
        let db = SeedDb::new(policy());
        let prober = FakeProber::default();
        let peer = ep("198.51.100.5:16125");
        db.add(peer, false, T0);
        prober.set(
            peer,
            ProbeOutcome {
                ban_secs: 100_000,
                ..ProbeOutcome::default()
            },
        );

        assert!(crawl_once(&db, &prober, T0).await);
        assert!(!db.knows(&peer));
        assert!(db.is_banned(&peer, T0 + 1));
        assert!(db.get_ips(10, FamilyFilter::all(), T0).is_empty());
    }
}
