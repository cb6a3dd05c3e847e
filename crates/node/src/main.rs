#[macro_use]
mod logging;
mod crawler;
mod dns;
mod p2p;
mod params;

use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fluxseed_db::{SeedDb, SeedReport};
use fluxseed_primitives::Endpoint;
use tokio::net::UdpSocket;

use crate::dns::{DnsCounters, DnsZone};
use crate::p2p::{ProxyConfig, WireProber};
use crate::params::{seed_params, Network};

const SEEDS_FILE: &str = "seeds.dat";
const DUMP_FILE: &str = "seeds.dump";
const STATS_LOG_FILE: &str = "seedstats.log";

const SEEDER_INTERVAL_SECS: u64 = 1800;
const STATS_INTERVAL_SECS: u64 = 1;

struct SeedOpts {
    host: Option<String>,
    ns: Option<String>,
    mbox: Option<String>,
    crawlers: usize,
    dns_tasks: usize,
    port: u16,
    onion_proxy: Option<String>,
    ipv4_proxy: Option<String>,
    ipv6_proxy: Option<String>,
    network: Network,
    wipe_ban: bool,
    wipe_ignore: bool,
}

impl Default for SeedOpts {
    fn default() -> Self {
        Self {
            host: None,
            ns: None,
            mbox: None,
            crawlers: 96,
            dns_tasks: 4,
            port: 53,
            onion_proxy: None,
            ipv4_proxy: None,
            ipv6_proxy: None,
            network: Network::Mainnet,
            wipe_ban: false,
            wipe_ignore: false,
        }
    }
}

fn usage() -> String {
    "fluxseed\n\
     Usage: fluxseed -h <host> -n <ns> [-m <mbox>] [-t <threads>] [-p <port>]\n\
     \n\
     Options:\n\
     -h <host>       Hostname of the DNS seed\n\
     -n <ns>         Hostname of the nameserver\n\
     -m <mbox>       E-Mail address reported in SOA records\n\
     -t <threads>    Number of crawlers to run in parallel (default 96)\n\
     -d <threads>    Number of DNS server tasks (default 4)\n\
     -p <port>       UDP port to listen on (default 53)\n\
     -o <ip:port>    Tor proxy IP/Port\n\
     -i <ip:port>    IPV4 SOCKS5 proxy IP/Port\n\
     -k <ip:port>    IPV6 SOCKS5 proxy IP/Port\n\
     --testnet       Use testnet\n\
     --wipeban       Wipe list of banned nodes\n\
     --wipeignore    Wipe list of ignored nodes\n\
     -?, --help      Show this text\n"
        .to_string()
}

fn parse_args() -> Result<SeedOpts, String> {
    let mut opts = SeedOpts::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--host" => opts.host = Some(next_value(&mut args, "-h")?),
            "-n" | "--ns" => opts.ns = Some(next_value(&mut args, "-n")?),
            "-m" | "--mbox" => opts.mbox = Some(next_value(&mut args, "-m")?),
            "-t" | "--threads" => {
                let value = next_value(&mut args, "-t")?;
                opts.crawlers = parse_bounded(&value, 1, 999)
                    .ok_or_else(|| format!("invalid crawler count '{value}'\n{}", usage()))?;
            }
            "-d" | "--dnsthreads" => {
                let value = next_value(&mut args, "-d")?;
                opts.dns_tasks = parse_bounded(&value, 1, 999)
                    .ok_or_else(|| format!("invalid DNS task count '{value}'\n{}", usage()))?;
            }
            "-p" | "--port" => {
                let value = next_value(&mut args, "-p")?;
                opts.port = parse_bounded(&value, 1, 65_535)
                    .map(|port| port as u16)
                    .ok_or_else(|| format!("invalid port '{value}'\n{}", usage()))?;
            }
            "-o" | "--onion" => opts.onion_proxy = Some(next_value(&mut args, "-o")?),
            "-i" | "--proxyipv4" => opts.ipv4_proxy = Some(next_value(&mut args, "-i")?),
            "-k" | "--proxyipv6" => opts.ipv6_proxy = Some(next_value(&mut args, "-k")?),
            "--testnet" => opts.network = Network::Testnet,
            "--wipeban" => opts.wipe_ban = true,
            "--wipeignore" => opts.wipe_ignore = true,
            "-?" | "--help" => {
                print!("{}", usage());
                std::process::exit(0);
            }
            other => return Err(format!("unknown option '{other}'\n{}", usage())),
        }
    }
    Ok(opts)
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

fn parse_bounded(value: &str, min: usize, max: usize) -> Option<usize> {
    value
        .parse::<usize>()
        .ok()
        .filter(|parsed| (min..=max).contains(parsed))
}

fn parse_proxy(value: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = value.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, 9050));
    }
    Err(format!("invalid proxy address '{value}'"))
}

pub fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let opts = parse_args()?;
    let params = seed_params(opts.network);
    if opts.network == Network::Testnet {
        log_info!("Using testnet.");
    }

    let serve_dns = opts.ns.is_some();
    if !serve_dns {
        log_info!("No nameserver set. Not starting DNS server.");
    }
    if serve_dns && opts.host.is_none() {
        return Err(format!("no seed hostname set; use -h\n{}", usage()));
    }
    if serve_dns && opts.mbox.is_none() {
        return Err(format!("no SOA e-mail address set; use -m\n{}", usage()));
    }

    let mut proxies = ProxyConfig::default();
    if let Some(raw) = opts.onion_proxy.as_deref() {
        let addr = parse_proxy(raw)?;
        log_info!("Using Tor proxy at {addr}");
        proxies.onion = Some(addr);
    }
    if let Some(raw) = opts.ipv4_proxy.as_deref() {
        let addr = parse_proxy(raw)?;
        log_info!("Using IPv4 proxy at {addr}");
        proxies.ipv4 = Some(addr);
    }
    if let Some(raw) = opts.ipv6_proxy.as_deref() {
        let addr = parse_proxy(raw)?;
        log_info!("Using IPv6 proxy at {addr}");
        proxies.ipv6 = Some(addr);
    }

    let db = match SeedDb::load(Path::new(SEEDS_FILE), params.db_policy()) {
        Ok(db) => db,
        Err(err) => {
            log_warn!("failed to load {SEEDS_FILE}: {err}; starting empty");
            SeedDb::new(params.db_policy())
        }
    };
    let loaded = db.get_stats(unix_now_secs());
    if loaded.avail > 0 {
        log_info!(
            "Loaded {} tracked and {} new peers from {SEEDS_FILE}",
            loaded.tracked,
            loaded.new
        );
    }
    if opts.wipe_ban {
        log_info!("Wiping ban list");
        db.clear_bans();
    }
    if opts.wipe_ignore {
        log_info!("Wiping ignore deadlines");
        db.reset_ignores();
    }
    let db = Arc::new(db);

    let mut dns_counters: Vec<Arc<DnsCounters>> = Vec::new();
    if serve_dns {
        let host = opts.host.clone().unwrap_or_default();
        let ns = opts.ns.clone().unwrap_or_default();
        let mbox = opts.mbox.clone().unwrap_or_default();
        let socket = UdpSocket::bind(("0.0.0.0", opts.port))
            .await
            .map_err(|err| format!("failed to bind UDP port {}: {err}", opts.port))?;
        let socket = Arc::new(socket);
        let zone = Arc::new(DnsZone { host, ns, mbox });
        log_info!(
            "Starting {} DNS tasks for {} on {} (port {})",
            opts.dns_tasks,
            zone.host,
            zone.ns,
            opts.port
        );
        for _ in 0..opts.dns_tasks {
            let counters = Arc::new(DnsCounters::default());
            dns_counters.push(Arc::clone(&counters));
            tokio::spawn(dns::dns_task(
                Arc::clone(&socket),
                Arc::clone(&db),
                Arc::clone(&zone),
                counters,
            ));
        }
    }

    {
        let db = Arc::clone(&db);
        let params = params.clone();
        tokio::spawn(async move { seeder_loop(db, params).await });
    }

    log_info!("Starting {} crawlers", opts.crawlers);
    let prober: Arc<dyn crawler::Probe> = Arc::new(WireProber::new(&params, proxies));
    for _ in 0..opts.crawlers {
        let db = Arc::clone(&db);
        let prober = Arc::clone(&prober);
        let pool_width = opts.crawlers;
        tokio::spawn(crawler::crawler_loop(db, prober, pool_width));
    }

    {
        let db = Arc::clone(&db);
        thread::spawn(move || dumper_loop(db));
    }
    {
        let db = Arc::clone(&db);
        thread::spawn(move || stats_loop(db, dns_counters));
    }

    std::future::pending::<()>().await;
    Ok(())
}

/// Re-resolves the bootstrap seeds every half hour so the database can
/// recover even from a total loss of tracked peers.
async fn seeder_loop(db: Arc<SeedDb>, params: params::SeedParams) {
    loop {
        let mut added = 0;
        for seed in params.seeds {
            match tokio::net::lookup_host((*seed, params.default_port)).await {
                Ok(addrs) => {
                    let now = unix_now_secs();
                    for addr in addrs {
                        if db.add(Endpoint::from_socket_addr(addr), true, now) {
                            added += 1;
                        }
                    }
                }
                Err(err) => log_debug!("seed {seed} did not resolve: {err}"),
            }
        }
        if added > 0 {
            log_info!("Seeder added {added} bootstrap peers");
        }
        tokio::time::sleep(Duration::from_secs(SEEDER_INTERVAL_SECS)).await;
    }
}

/// Writes the snapshot, the human-readable dump, and one stats-log line per
/// cycle, backing off from 100s to 3200s after startup.
fn dumper_loop(db: Arc<SeedDb>) {
    let mut cycle = 0u32;
    loop {
        thread::sleep(Duration::from_secs(100u64 << cycle));
        if cycle < 5 {
            cycle += 1;
        }
        if let Err(err) = db.save(Path::new(SEEDS_FILE)) {
            log_warn!("failed to write {SEEDS_FILE}: {err}");
        }
        let mut reports = db.get_all();
        reports.sort_by(stat_compare);
        if let Err(err) = write_dump(Path::new(DUMP_FILE), &reports) {
            log_warn!("failed to write {DUMP_FILE}: {err}");
        }
        if let Err(err) = append_stats_log(Path::new(STATS_LOG_FILE), &reports) {
            log_warn!("failed to append {STATS_LOG_FILE}: {err}");
        }
    }
}

fn stat_compare(a: &SeedReport, b: &SeedReport) -> Ordering {
    b.uptime[4]
        .partial_cmp(&a.uptime[4])
        .unwrap_or(Ordering::Equal)
        .then(
            b.uptime[3]
                .partial_cmp(&a.uptime[3])
                .unwrap_or(Ordering::Equal),
        )
        .then(b.client_version.cmp(&a.client_version))
}

fn write_dump(path: &Path, reports: &[SeedReport]) -> Result<(), String> {
    let file = File::create(path).map_err(|err| err.to_string())?;
    let mut out = BufWriter::new(file);
    writeln!(
        out,
        "# address                                        good  lastSuccess    %(2h)   %(8h)   %(1d)   %(7d)  %(30d)  blocks      svcs  version"
    )
    .map_err(|err| err.to_string())?;
    for report in reports {
        writeln!(
            out,
            "{:<47}  {:4}  {:>11}  {:6.2}% {:6.2}% {:6.2}% {:6.2}% {:6.2}%  {:6}  {:08x}  {:5} \"{}\"",
            report.endpoint.to_string(),
            report.good as i32,
            report.last_success,
            100.0 * report.uptime[0],
            100.0 * report.uptime[1],
            100.0 * report.uptime[2],
            100.0 * report.uptime[3],
            100.0 * report.uptime[4],
            report.blocks,
            report.services,
            report.client_version,
            report.client_subversion,
        )
        .map_err(|err| err.to_string())?;
    }
    out.flush().map_err(|err| err.to_string())
}

fn append_stats_log(path: &Path, reports: &[SeedReport]) -> Result<(), String> {
    let mut sums = [0.0f64; 5];
    for report in reports {
        for (sum, uptime) in sums.iter_mut().zip(report.uptime.iter()) {
            *sum += uptime;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| err.to_string())?;
    let mut out = BufWriter::new(file);
    writeln!(
        out,
        "{} {} {} {} {} {}",
        unix_now_secs(),
        sums[0],
        sums[1],
        sums[2],
        sums[3],
        sums[4]
    )
    .map_err(|err| err.to_string())?;
    out.flush().map_err(|err| err.to_string())
}

/// Rewrites a one-line status ticker once a second.
fn stats_loop(db: Arc<SeedDb>, counters: Vec<Arc<DnsCounters>>) {
    loop {
        let now = unix_now_secs();
        let stats = db.get_stats(now);
        let (requests, queries) = counters.iter().fold((0u64, 0u64), |acc, counter| {
            let (requests, queries) = counter.snapshot();
            (acc.0 + requests, acc.1 + queries)
        });
        print!(
            "\x1b[2K\r[{}] {}/{} available ({} tried in {}s, {} new, {} active), {} banned; {} DNS requests, {} db queries",
            logging::timestamp(),
            stats.good,
            stats.avail,
            stats.tracked,
            stats.age_secs,
            stats.new,
            stats.probing,
            stats.banned,
            requests,
            queries
        );
        let _ = std::io::stdout().flush();
        thread::sleep(Duration::from_secs(STATS_INTERVAL_SECS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_parsing_rejects_out_of_range() {
        assert_eq!(parse_bounded("96", 1, 999), Some(96));
        assert_eq!(parse_bounded("0", 1, 999), None);
        assert_eq!(parse_bounded("1000", 1, 999), None);
        assert_eq!(parse_bounded("abc", 1, 999), None);
    }

    #[test]
    fn proxy_parsing_defaults_to_socks_port() {
        assert_eq!(
            parse_proxy("127.0.0.1").unwrap(),
            "127.0.0.1:9050".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_proxy("127.0.0.1:9150").unwrap(),
            "127.0.0.1:9150".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_proxy("not a proxy").is_err());
    }

    #[test]
    fn reports_sort_by_long_uptime_first() {
        let endpoint = Endpoint::parse("198.51.100.1:16125", 16125).unwrap();
        let report = |u30: f64, u7: f64, version: i32| SeedReport {
            endpoint,
            good: true,
            last_success: 0,
            uptime: [1.0, 1.0, 1.0, u7, u30],
            blocks: 0,
            services: 0,
            client_version: version,
            client_subversion: String::new(),
        };
        let mut reports = vec![
            report(0.5, 0.9, 2),
            report(0.9, 0.1, 1),
            report(0.5, 0.9, 7),
            report(0.5, 0.2, 3),
        ];
        reports.sort_by(stat_compare);
        assert_eq!(reports[0].uptime[4], 0.9);
        assert_eq!(reports[1].client_version, 7);
        assert_eq!(reports[2].client_version, 2);
        assert_eq!(reports[3].client_version, 3);
    }
}
