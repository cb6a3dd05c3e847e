//! Authoritative UDP responder for the seed zone, plus the per-task answer
//! cache that keeps the query path off the database.
//!
//! Several tasks share one bound socket; each owns an independent cache, so
//! the hot path takes no lock at all. A cache refresh is the only moment the
//! database read guard is touched, amortized against query volume by the
//! hit-count predicate. Answers for a few seconds of cross-task divergence
//! are acceptable; they are advisory either way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fluxseed_db::{FamilyFilter, SeedDb};
use fluxseed_primitives::Encoder;
use rand::Rng;
use tokio::net::UdpSocket;

pub const DATA_TTL: u32 = 60;
pub const NS_TTL: u32 = 40_000;

const CACHE_FETCH: usize = 1000;
const MAX_RESPONSE_SIZE: usize = 512;
const MAX_ANSWER_ADDRS: usize = 24;

const QTYPE_A: u16 = 1;
const QTYPE_NS: u16 = 2;
const QTYPE_SOA: u16 = 6;
const QTYPE_AAAA: u16 = 28;
const QTYPE_ANY: u16 = 255;
const QCLASS_IN: u16 = 1;

const RCODE_NOERROR: u8 = 0;
const RCODE_FORMERR: u8 = 1;
const RCODE_NOTIMP: u8 = 4;
const RCODE_REFUSED: u8 = 5;

#[derive(Clone, Debug)]
pub struct DnsZone {
    pub host: String,
    pub ns: String,
    pub mbox: String,
}

#[derive(Debug, Default)]
pub struct DnsCounters {
    pub requests: AtomicU64,
    pub db_queries: AtomicU64,
}

impl DnsCounters {
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.db_queries.load(Ordering::Relaxed),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum CachedAddr {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl CachedAddr {
    fn is_v4(&self) -> bool {
        matches!(self, CachedAddr::V4(_))
    }
}

struct AnswerCache {
    entries: Vec<CachedAddr>,
    n_ipv4: usize,
    n_ipv6: usize,
    cache_time: u64,
    cache_hits: u64,
    primed: bool,
}

impl AnswerCache {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            n_ipv4: 0,
            n_ipv6: 0,
            cache_time: 0,
            cache_hits: 0,
            primed: false,
        }
    }

    /// The refresh predicate: forced on first use, then amortized against
    /// query pressure, with a time floor protecting small caches.
    fn wants_refresh(&self, now: u64) -> bool {
        if !self.primed {
            return true;
        }
        let size = self.entries.len() as u64;
        self.cache_hits > size * size / 400
            || (self.cache_hits * self.cache_hits > size / 20
                && now.saturating_sub(self.cache_time) > 5)
    }

    fn touch(&mut self, db: &SeedDb, now: u64, counters: &DnsCounters) {
        self.cache_hits += 1;
        if !self.wants_refresh(now) {
            return;
        }
        let ips = db.get_ips(CACHE_FETCH, FamilyFilter::all(), now);
        counters.db_queries.fetch_add(1, Ordering::Relaxed);
        self.entries.clear();
        self.n_ipv4 = 0;
        self.n_ipv6 = 0;
        for endpoint in ips {
            if let Some(octets) = endpoint.ipv4_octets() {
                self.entries.push(CachedAddr::V4(octets));
                self.n_ipv4 += 1;
            } else if endpoint.is_ipv6() {
                self.entries.push(CachedAddr::V6(endpoint.wire_addr()));
                self.n_ipv6 += 1;
            }
        }
        self.cache_hits = 0;
        self.cache_time = now;
        self.primed = true;
    }

    /// Partial Fisher-Yates over the cached array: drawn entries swap into
    /// the front prefix, so one call samples without replacement while later
    /// refreshes leave no element disadvantaged.
    fn sample(
        &mut self,
        max: usize,
        want_v4: bool,
        want_v6: bool,
        rng: &mut impl Rng,
    ) -> Vec<CachedAddr> {
        let size = self.entries.len();
        let matching =
            (if want_v4 { self.n_ipv4 } else { 0 }) + (if want_v6 { self.n_ipv6 } else { 0 });
        let max = max.min(size).min(matching);
        let mut out = Vec::with_capacity(max);
        let mut index = 0;
        while index < max {
            let mut pick = index + rng.gen_range(0..size - index);
            loop {
                let ok = (want_v4 && self.entries[pick].is_v4())
                    || (want_v6 && !self.entries[pick].is_v4());
                if ok {
                    break;
                }
                pick += 1;
                if pick == size {
                    pick = index;
                }
            }
            self.entries.swap(index, pick);
            out.push(self.entries[index]);
            index += 1;
        }
        out
    }
}

struct Question {
    id: u16,
    rd: bool,
    name: String,
    qtype: u16,
    qclass: u16,
    raw: Vec<u8>,
}

enum QueryDisposition {
    Answer(Question),
    Reject { id: u16, rd: bool, rcode: u8 },
    Drop,
}

fn parse_query(buf: &[u8]) -> QueryDisposition {
    if buf.len() < 12 {
        return QueryDisposition::Drop;
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    if flags & 0x8000 != 0 {
        // A response, not a query.
        return QueryDisposition::Drop;
    }
    let rd = flags & 0x0100 != 0;
    let opcode = (flags >> 11) & 0x0f;
    if opcode != 0 {
        return QueryDisposition::Reject {
            id,
            rd,
            rcode: RCODE_NOTIMP,
        };
    }
    let formerr = QueryDisposition::Reject {
        id,
        rd,
        rcode: RCODE_FORMERR,
    };
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    if qdcount != 1 {
        return formerr;
    }

    let mut pos = 12usize;
    let mut name = String::new();
    loop {
        let Some(&len) = buf.get(pos) else {
            return formerr;
        };
        pos += 1;
        if len == 0 {
            break;
        }
        if len & 0xc0 != 0 {
            // Compression pointers have no business in a question we serve.
            return formerr;
        }
        let Some(label) = buf.get(pos..pos + len as usize) else {
            return formerr;
        };
        if !name.is_empty() {
            name.push('.');
        }
        for byte in label {
            name.push(byte.to_ascii_lowercase() as char);
        }
        pos += len as usize;
        if name.len() > 255 {
            return formerr;
        }
    }
    let Some(tail) = buf.get(pos..pos + 4) else {
        return formerr;
    };
    let qtype = u16::from_be_bytes([tail[0], tail[1]]);
    let qclass = u16::from_be_bytes([tail[2], tail[3]]);
    QueryDisposition::Answer(Question {
        id,
        rd,
        name,
        qtype,
        qclass,
        raw: buf[12..pos + 4].to_vec(),
    })
}

struct ResponseBuilder {
    encoder: Encoder,
    answers: u16,
    authority: u16,
}

impl ResponseBuilder {
    fn new(question: &Question, rcode: u8) -> Self {
        let mut encoder = Encoder::with_capacity(MAX_RESPONSE_SIZE);
        encoder.write_u16_be(question.id);
        let mut flags: u16 = 0x8400;
        if question.rd {
            flags |= 0x0100;
        }
        flags |= rcode as u16;
        encoder.write_u16_be(flags);
        encoder.write_u16_be(1);
        encoder.write_u16_be(0);
        encoder.write_u16_be(0);
        encoder.write_u16_be(0);
        encoder.write_bytes(&question.raw);
        Self {
            encoder,
            answers: 0,
            authority: 0,
        }
    }

    fn push_addr(&mut self, addr: &CachedAddr) -> bool {
        let rdata_len = match addr {
            CachedAddr::V4(_) => 4,
            CachedAddr::V6(_) => 16,
        };
        if self.encoder.len() + 12 + rdata_len > MAX_RESPONSE_SIZE {
            return false;
        }
        self.encoder.write_u16_be(0xc00c);
        match addr {
            CachedAddr::V4(octets) => {
                self.encoder.write_u16_be(QTYPE_A);
                self.encoder.write_u16_be(QCLASS_IN);
                self.encoder.write_u32_be(DATA_TTL);
                self.encoder.write_u16_be(4);
                self.encoder.write_bytes(octets);
            }
            CachedAddr::V6(octets) => {
                self.encoder.write_u16_be(QTYPE_AAAA);
                self.encoder.write_u16_be(QCLASS_IN);
                self.encoder.write_u32_be(DATA_TTL);
                self.encoder.write_u16_be(16);
                self.encoder.write_bytes(octets);
            }
        }
        self.answers += 1;
        true
    }

    fn push_ns(&mut self, ns: &str) {
        let rdata = encode_name(ns);
        self.encoder.write_u16_be(0xc00c);
        self.encoder.write_u16_be(QTYPE_NS);
        self.encoder.write_u16_be(QCLASS_IN);
        self.encoder.write_u32_be(NS_TTL);
        self.encoder.write_u16_be(rdata.len() as u16);
        self.encoder.write_bytes(&rdata);
        self.answers += 1;
    }

    fn push_soa(&mut self, zone: &DnsZone, now: u64, authority: bool) {
        let mname = encode_name(&zone.ns);
        let rname = encode_name(&zone.mbox.replace('@', "."));
        self.encoder.write_u16_be(0xc00c);
        self.encoder.write_u16_be(QTYPE_SOA);
        self.encoder.write_u16_be(QCLASS_IN);
        self.encoder.write_u32_be(NS_TTL);
        self.encoder
            .write_u16_be((mname.len() + rname.len() + 20) as u16);
        self.encoder.write_bytes(&mname);
        self.encoder.write_bytes(&rname);
        self.encoder.write_u32_be((now / 3600) as u32);
        self.encoder.write_u32_be(604_800);
        self.encoder.write_u32_be(86_400);
        self.encoder.write_u32_be(2_592_000);
        self.encoder.write_u32_be(604_800);
        if authority {
            self.authority += 1;
        } else {
            self.answers += 1;
        }
    }

    fn finish(mut self) -> Vec<u8> {
        self.encoder.set_u16_be(6, self.answers);
        self.encoder.set_u16_be(8, self.authority);
        self.encoder.into_inner()
    }
}

fn encode_name(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        out.push(label.len().min(63) as u8);
        out.extend_from_slice(&label.as_bytes()[..label.len().min(63)]);
    }
    out.push(0);
    out
}

fn reject_response(id: u16, rd: bool, rcode: u8) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(12);
    encoder.write_u16_be(id);
    let mut flags: u16 = 0x8400;
    if rd {
        flags |= 0x0100;
    }
    flags |= rcode as u16;
    encoder.write_u16_be(flags);
    for _ in 0..4 {
        encoder.write_u16_be(0);
    }
    encoder.into_inner()
}

fn name_matches(name: &str, zone_host: &str) -> bool {
    name.eq_ignore_ascii_case(zone_host.trim_end_matches('.'))
}

fn handle_query(
    buf: &[u8],
    zone: &DnsZone,
    cache: &mut AnswerCache,
    db: &SeedDb,
    counters: &DnsCounters,
    now: u64,
    rng: &mut impl Rng,
) -> Option<Vec<u8>> {
    let question = match parse_query(buf) {
        QueryDisposition::Drop => return None,
        QueryDisposition::Reject { id, rd, rcode } => {
            return Some(reject_response(id, rd, rcode));
        }
        QueryDisposition::Answer(question) => question,
    };
    if question.qclass != QCLASS_IN || !name_matches(&question.name, &zone.host) {
        return Some(ResponseBuilder::new(&question, RCODE_REFUSED).finish());
    }
    let mut response = ResponseBuilder::new(&question, RCODE_NOERROR);
    match question.qtype {
        QTYPE_A | QTYPE_AAAA | QTYPE_ANY => {
            cache.touch(db, now, counters);
            let want_v4 = question.qtype != QTYPE_AAAA;
            let want_v6 = question.qtype != QTYPE_A;
            for addr in cache.sample(MAX_ANSWER_ADDRS, want_v4, want_v6, rng) {
                if !response.push_addr(&addr) {
                    break;
                }
            }
            if response.answers == 0 {
                response.push_soa(zone, now, true);
            }
        }
        QTYPE_NS => response.push_ns(&zone.ns),
        QTYPE_SOA => response.push_soa(zone, now, false),
        _ => response.push_soa(zone, now, true),
    }
    Some(response.finish())
}

pub async fn dns_task(
    socket: Arc<UdpSocket>,
    db: Arc<SeedDb>,
    zone: Arc<DnsZone>,
    counters: Arc<DnsCounters>,
) {
    let mut cache = AnswerCache::new();
    let mut buf = [0u8; 1024];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                log_warn!("dns recv failed: {err}");
                continue;
            }
        };
        counters.requests.fetch_add(1, Ordering::Relaxed);
        let now = crate::unix_now_secs();
        let reply = handle_query(
            &buf[..len],
            &zone,
            &mut cache,
            &db,
            &counters,
            now,
            &mut rand::thread_rng(),
        );
        if let Some(reply) = reply {
            if let Err(err) = socket.send_to(&reply, peer).await {
                log_debug!("dns send to {peer} failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxseed_db::{DbPolicy, ServiceResult};
    use fluxseed_primitives::Endpoint;

    const T0: u64 = 1_700_000_000;

    fn zone() -> DnsZone {
        DnsZone {
            host: "seed.runonflux.io".to_string(),
            ns: "ns1.runonflux.io".to_string(),
            mbox: "seeder@runonflux.io".to_string(),
        }
    }

    fn query(name: &str, qtype: u16) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u16_be(0x1234);
        encoder.write_u16_be(0x0100);
        encoder.write_u16_be(1);
        encoder.write_u16_be(0);
        encoder.write_u16_be(0);
        encoder.write_u16_be(0);
        encoder.write_bytes(&encode_name(name));
        encoder.write_u16_be(qtype);
        encoder.write_u16_be(QCLASS_IN);
        encoder.into_inner()
    }

    fn rcode(reply: &[u8]) -> u8 {
        (reply[3] & 0x0f) as u8
    }

    fn ancount(reply: &[u8]) -> u16 {
        u16::from_be_bytes([reply[6], reply[7]])
    }

    fn nscount(reply: &[u8]) -> u16 {
        u16::from_be_bytes([reply[8], reply[9]])
    }

    fn seeded_db(v4: usize, v6: usize) -> SeedDb {
        let db = SeedDb::new(DbPolicy {
            min_client_version: 70_000,
            min_blocks: 10_000,
            ..DbPolicy::default()
        });
        let make_good = |raw: String| {
            let endpoint = Endpoint::parse(&raw, 16125).expect("endpoint");
            assert!(db.add(endpoint, false, T0));
            let result = ServiceResult {
                endpoint,
                good: true,
                ban_secs: 0,
                client_version: 70_015,
                client_subversion: "/fluxd:8.0.0/".to_string(),
                blocks: 12_345,
                services: 1,
            };
            db.result_many(&[result.clone()], T0);
            db.result_many(&[result], T0 + 180);
        };
        for octet in 0..v4 {
            make_good(format!("198.51.100.{}:16125", octet + 1));
        }
        for octet in 0..v6 {
            make_good(format!("[2a01:4f8::{}]:16125", octet + 1));
        }
        db
    }

    #[test]
    fn family_sampling_bounds() {
        let db = seeded_db(3, 5);
        let counters = DnsCounters::default();
        let mut cache = AnswerCache::new();
        cache.touch(&db, T0 + 180, &counters);
        assert_eq!((cache.n_ipv4, cache.n_ipv6), (3, 5));

        let mut rng = rand::thread_rng();
        let only_v4 = cache.sample(10, true, false, &mut rng);
        assert_eq!(only_v4.len(), 3);
        assert!(only_v4.iter().all(CachedAddr::is_v4));

        let two = cache.sample(2, true, true, &mut rng);
        assert_eq!(two.len(), 2);

        let none = cache.sample(10, false, false, &mut rng);
        assert!(none.is_empty());
    }

    #[test]
    fn a_query_answers_from_cache() {
        let db = seeded_db(3, 2);
        let counters = DnsCounters::default();
        let mut cache = AnswerCache::new();
        let mut rng = rand::thread_rng();

        let reply = handle_query(
            &query("seed.runonflux.io", QTYPE_A),
            &zone(),
            &mut cache,
            &db,
            &counters,
            T0 + 180,
            &mut rng,
        )
        .expect("reply");
        assert_eq!(rcode(&reply), RCODE_NOERROR);
        assert_eq!(ancount(&reply), 3);
        assert_eq!(counters.snapshot().1, 1);

        let reply = handle_query(
            &query("SEED.RunOnFlux.io", QTYPE_AAAA),
            &zone(),
            &mut cache,
            &db,
            &counters,
            T0 + 180,
            &mut rng,
        )
        .expect("reply");
        assert_eq!(ancount(&reply), 2);
    }

    #[test]
    fn empty_cache_serves_soa_authority() {
        let db = seeded_db(0, 0);
        let counters = DnsCounters::default();
        let mut cache = AnswerCache::new();
        let reply = handle_query(
            &query("seed.runonflux.io", QTYPE_A),
            &zone(),
            &mut cache,
            &db,
            &counters,
            T0,
            &mut rand::thread_rng(),
        )
        .expect("reply");
        assert_eq!(rcode(&reply), RCODE_NOERROR);
        assert_eq!(ancount(&reply), 0);
        assert_eq!(nscount(&reply), 1);
    }

    #[test]
    fn foreign_zone_is_refused() {
        let db = seeded_db(1, 0);
        let counters = DnsCounters::default();
        let mut cache = AnswerCache::new();
        let reply = handle_query(
            &query("example.com", QTYPE_A),
            &zone(),
            &mut cache,
            &db,
            &counters,
            T0,
            &mut rand::thread_rng(),
        )
        .expect("reply");
        assert_eq!(rcode(&reply), RCODE_REFUSED);
        assert_eq!(ancount(&reply), 0);
        // Refusals never touch the database.
        assert_eq!(counters.snapshot().1, 0);
    }

    #[test]
    fn responses_and_garbage_are_dropped() {
        let db = seeded_db(0, 0);
        let counters = DnsCounters::default();
        let mut cache = AnswerCache::new();
        let mut rng = rand::thread_rng();

        let mut response_packet = query("seed.runonflux.io", QTYPE_A);
        response_packet[2] |= 0x80;
        assert!(handle_query(
            &response_packet,
            &zone(),
            &mut cache,
            &db,
            &counters,
            T0,
            &mut rng
        )
        .is_none());

        assert!(handle_query(&[0u8; 4], &zone(), &mut cache, &db, &counters, T0, &mut rng)
            .is_none());
    }

    #[test]
    fn multi_question_packets_are_formerr() {
        let db = seeded_db(0, 0);
        let counters = DnsCounters::default();
        let mut cache = AnswerCache::new();
        let mut packet = query("seed.runonflux.io", QTYPE_A);
        packet[5] = 2;
        let reply = handle_query(
            &packet,
            &zone(),
            &mut cache,
            &db,
            &counters,
            T0,
            &mut rand::thread_rng(),
        )
        .expect("reply");
        assert_eq!(rcode(&reply), RCODE_FORMERR);
    }

    #[test]
    fn ns_and_soa_queries_describe_the_zone() {
        let db = seeded_db(0, 0);
        let counters = DnsCounters::default();
        let mut cache = AnswerCache::new();
        let mut rng = rand::thread_rng();

        let reply = handle_query(
            &query("seed.runonflux.io", QTYPE_NS),
            &zone(),
            &mut cache,
            &db,
            &counters,
            T0,
            &mut rng,
        )
        .expect("reply");
        assert_eq!(ancount(&reply), 1);

        let reply = handle_query(
            &query("seed.runonflux.io", QTYPE_SOA),
            &zone(),
            &mut cache,
            &db,
            &counters,
            T0,
            &mut rng,
        )
        .expect("reply");
        assert_eq!(ancount(&reply), 1);
        assert_eq!(rcode(&reply), RCODE_NOERROR);
    }

    #[test]
    fn refresh_predicate_amortizes_hits() {
        let db = seeded_db(3, 0);
        let counters = DnsCounters::default();
        let mut cache = AnswerCache::new();

        // First touch is forced.
        cache.touch(&db, T0, &counters);
        assert_eq!(counters.snapshot().1, 1);

        // A tiny cache clears the pressure bound on every hit.
        cache.touch(&db, T0 + 2, &counters);
        assert_eq!(counters.snapshot().1, 2);
    }
}
