//! Peer reputation: misbehavior scores and timed bans, persisted as JSON.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pulse_consensus::constants::BAN_SCORE_THRESHOLD;
use serde::{Deserialize, Serialize};

const BANLIST_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize)]
struct BanListFile {
    version: u32,
    banned: Vec<BanListEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
struct BanListEntry {
    ip: IpAddr,
    banned_until: u64,
}

/// Shared read/write table of misbehavior scores and timed bans.
#[derive(Default)]
pub struct PeerBook {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    scores: HashMap<IpAddr, u32>,
    banned: HashMap<IpAddr, SystemTime>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds misbehavior and reports whether the threshold was crossed.
    pub fn add_misbehavior(&self, addr: SocketAddr, score: u32, ban_duration: Duration) -> bool {
        let mut inner = self.inner.lock().expect("peer book lock");
        let entry = inner.scores.entry(addr.ip()).or_insert(0);
        *entry = entry.saturating_add(score);
        if *entry >= BAN_SCORE_THRESHOLD {
            inner
                .banned
                .insert(addr.ip(), SystemTime::now() + ban_duration);
            inner.scores.remove(&addr.ip());
            return true;
        }
        false
    }

    pub fn ban(&self, addr: SocketAddr, ban_duration: Duration) {
        let mut inner = self.inner.lock().expect("peer book lock");
        inner
            .banned
            .insert(addr.ip(), SystemTime::now() + ban_duration);
        inner.scores.remove(&addr.ip());
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        let now = SystemTime::now();
        let mut inner = self.inner.lock().expect("peer book lock");
        if let Some(until) = inner.banned.get(&addr.ip()).copied() {
            if until > now {
                return true;
            }
            inner.banned.remove(&addr.ip());
        }
        false
    }

    pub fn banned_count(&self) -> usize {
        let now = SystemTime::now();
        let inner = self.inner.lock().expect("peer book lock");
        inner
            .banned
            .values()
            .filter(|until| **until > now)
            .count()
    }

    pub fn load(&self, path: &Path) -> Result<usize, String> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.to_string()),
        };
        let file: BanListFile =
            serde_json::from_slice(&bytes).map_err(|err| format!("invalid banlist: {err}"))?;
        if file.version != BANLIST_VERSION {
            return Err(format!(
                "unsupported banlist version {} (expected {BANLIST_VERSION})",
                file.version
            ));
        }
        let now = SystemTime::now();
        let mut inserted = 0usize;
        let mut inner = self.inner.lock().expect("peer book lock");
        for entry in file.banned {
            let until = UNIX_EPOCH + Duration::from_secs(entry.banned_until);
            if until <= now {
                continue;
            }
            inner.banned.insert(entry.ip, until);
            inserted += 1;
        }
        Ok(inserted)
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let now = SystemTime::now();
        let mut entries = Vec::new();
        {
            let mut inner = self.inner.lock().expect("peer book lock");
            inner.banned.retain(|_, until| *until > now);
            for (ip, until) in inner.banned.iter() {
                let secs = until
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                entries.push(BanListEntry {
                    ip: *ip,
                    banned_until: secs,
                });
            }
        }
        entries.sort_by_key(|entry| entry.ip.to_string());
        let file = BanListFile {
            version: BANLIST_VERSION,
            banned: entries,
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|err| err.to_string())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| err.to_string())?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|err| err.to_string())?;
        if fs::rename(&tmp, path).is_err() {
            let _ = fs::remove_file(path);
            fs::rename(&tmp, path).map_err(|err| err.to_string())?;
        }
        Ok(())
    }
}
