//! Durable snapshot of the database: a versioned JSON document written to a
//! sibling file and renamed into place. Loads are tolerant: a missing file
//! starts empty and malformed records are dropped, never fatal.

use std::fmt;
use std::fs;
use std::path::Path;

use fluxseed_primitives::Endpoint;
use serde::{Deserialize, Serialize};

use crate::db::{DbExport, DbPolicy, SeedDb};
use crate::record::{NewPeer, TrackedPeer};
use crate::reliability::{WindowStat, WINDOW_COUNT};

pub const SEEDS_FILE_VERSION: u32 = 1;

#[derive(Debug)]
pub enum SnapshotError {
    Io(String),
    Format(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Io(message) => write!(f, "{message}"),
            SnapshotError::Format(message) => write!(f, "invalid snapshot: {message}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

#[derive(Deserialize, Serialize)]
struct SeedsFile {
    version: u32,
    peers: Vec<SeedsFilePeer>,
    new: Vec<SeedsFileNew>,
    banned: Vec<SeedsFileBan>,
}

#[derive(Deserialize, Serialize)]
struct SeedsFileWindow {
    reliability: f64,
    count: f64,
}

#[derive(Deserialize, Serialize)]
struct SeedsFilePeer {
    addr: String,
    services: u64,
    client_version: i32,
    client_subversion: String,
    blocks: i32,
    last_try: u64,
    our_last_try: u64,
    our_last_success: u64,
    ignore_until: u64,
    consecutive_failures: u32,
    windows: Vec<SeedsFileWindow>,
}

#[derive(Deserialize, Serialize)]
struct SeedsFileNew {
    addr: String,
    total: u32,
    success: u32,
    our_last_try: u64,
}

#[derive(Deserialize, Serialize)]
struct SeedsFileBan {
    addr: String,
    until: u64,
}

impl SeedDb {
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let export = self.export();
        let file = SeedsFile {
            version: SEEDS_FILE_VERSION,
            peers: export.tracked.iter().map(peer_to_file).collect(),
            new: export
                .new
                .iter()
                .map(|peer| SeedsFileNew {
                    addr: peer.endpoint.to_string(),
                    total: peer.total,
                    success: peer.success,
                    our_last_try: peer.our_last_try,
                })
                .collect(),
            banned: export
                .banned
                .iter()
                .map(|(endpoint, until)| SeedsFileBan {
                    addr: endpoint.to_string(),
                    until: *until,
                })
                .collect(),
        };
        let json =
            serde_json::to_vec_pretty(&file).map_err(|err| SnapshotError::Format(err.to_string()))?;
        write_file_atomic(path, &json)
    }

    pub fn load(path: &Path, policy: DbPolicy) -> Result<Self, SnapshotError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new(policy));
            }
            Err(err) => return Err(SnapshotError::Io(err.to_string())),
        };
        let file: SeedsFile =
            serde_json::from_slice(&bytes).map_err(|err| SnapshotError::Format(err.to_string()))?;
        if file.version != SEEDS_FILE_VERSION {
            return Err(SnapshotError::Format(format!(
                "unsupported snapshot version {} (expected {})",
                file.version, SEEDS_FILE_VERSION
            )));
        }
        let mut export = DbExport {
            tracked: Vec::new(),
            new: Vec::new(),
            banned: Vec::new(),
        };
        for raw in file.peers {
            if let Some(peer) = peer_from_file(&raw) {
                export.tracked.push(peer);
            }
        }
        for raw in file.new {
            let Ok(endpoint) = Endpoint::parse(&raw.addr, 0) else {
                continue;
            };
            export.new.push(NewPeer {
                id: 0,
                endpoint,
                evict_key: 0,
                total: raw.total,
                success: raw.success,
                our_last_try: raw.our_last_try,
            });
        }
        for raw in file.banned {
            let Ok(endpoint) = Endpoint::parse(&raw.addr, 0) else {
                continue;
            };
            export.banned.push((endpoint, raw.until));
        }
        Ok(Self::import(policy, export))
    }
}

fn peer_to_file(peer: &TrackedPeer) -> SeedsFilePeer {
    SeedsFilePeer {
        addr: peer.endpoint.to_string(),
        services: peer.services,
        client_version: peer.client_version,
        client_subversion: peer.client_subversion.clone(),
        blocks: peer.blocks,
        last_try: peer.last_try,
        our_last_try: peer.our_last_try,
        our_last_success: peer.our_last_success,
        ignore_until: peer.ignore_until,
        consecutive_failures: peer.consecutive_failures,
        windows: peer
            .windows
            .iter()
            .map(|stat| SeedsFileWindow {
                reliability: stat.reliability,
                count: stat.count,
            })
            .collect(),
    }
}

fn peer_from_file(raw: &SeedsFilePeer) -> Option<TrackedPeer> {
    let endpoint = Endpoint::parse(&raw.addr, 0).ok()?;
    if raw.windows.len() != WINDOW_COUNT {
        return None;
    }
    let mut windows = [WindowStat::default(); WINDOW_COUNT];
    for (slot, window) in windows.iter_mut().zip(raw.windows.iter()) {
        if !(0.0..=1.0).contains(&window.reliability) || window.count < 0.0 {
            return None;
        }
        slot.reliability = window.reliability;
        slot.count = window.count;
    }
    Some(TrackedPeer {
        id: 0,
        endpoint,
        services: raw.services,
        client_version: raw.client_version,
        client_subversion: raw.client_subversion.clone(),
        blocks: raw.blocks,
        last_try: raw.last_try,
        our_last_try: raw.our_last_try,
        our_last_success: raw.our_last_success,
        ignore_until: raw.ignore_until,
        consecutive_failures: raw.consecutive_failures,
        windows,
    })
}

pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| SnapshotError::Io(err.to_string()))?;
        }
    }
    let tmp = path.with_extension("new");
    fs::write(&tmp, bytes).map_err(|err| SnapshotError::Io(err.to_string()))?;
    if fs::rename(&tmp, path).is_err() {
        let _ = fs::remove_file(path);
        fs::rename(&tmp, path).map_err(|err| SnapshotError::Io(err.to_string()))?;
    }
    Ok(())
}
