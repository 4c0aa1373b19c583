//! Peer-pool management and the header sync loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pulse_chain::{AcceptOutcome, ChainService};
use pulse_consensus::constants::MAX_HEADERS_RESULTS;
use pulse_consensus::params::NetworkParams;
use pulse_consensus::BlockHash;
use pulse_store::HeaderStore;
use tokio::net::lookup_host;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::config::P2pConfig;
use crate::p2p::peer_book::PeerBook;
use crate::p2p::session::{spawn_session, SessionEvent, SessionHandle};

const SYNC_STALL_TIMEOUT: Duration = Duration::from_secs(30);
const DEMOTION_COOLDOWN: Duration = Duration::from_secs(60);
const MAX_CANDIDATES: usize = 1000;
const MAX_SHARED_ADDRS: usize = 23;
/// An honest tip announcement carries at most a few headers; anything
/// larger that we never asked for is flood misbehavior.
const MAX_UNSOLICITED_HEADERS: usize = 8;
const MISBEHAVIOR_UNSOLICITED_FLOOD: u32 = 20;
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(300);

struct Peer {
    handle: SessionHandle,
    ready: bool,
    best_height: i32,
    /// Bytes/sec over the most recent solicited headers batch.
    speed: Option<u64>,
    demoted_until: Option<Instant>,
}

struct Backoff {
    attempts: u32,
    next_attempt: Instant,
}

pub struct SyncCoordinator<S: HeaderStore> {
    chain: Arc<ChainService<S>>,
    params: NetworkParams,
    config: P2pConfig,
    book: Arc<PeerBook>,
    peers: HashMap<SocketAddr, Peer>,
    candidates: VecDeque<SocketAddr>,
    known_candidates: HashSet<SocketAddr>,
    backoff: HashMap<SocketAddr, Backoff>,
    sync_peer: Option<SocketAddr>,
    caught_up: bool,
    last_progress: Instant,
    last_getheaders: Option<Instant>,
    last_addr_broadcast: Option<Instant>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    shutdown: watch::Receiver<bool>,
}

impl<S: HeaderStore> SyncCoordinator<S> {
    pub fn new(
        chain: Arc<ChainService<S>>,
        params: NetworkParams,
        config: P2pConfig,
        book: Arc<PeerBook>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            chain,
            params,
            config,
            book,
            peers: HashMap::new(),
            candidates: VecDeque::new(),
            known_candidates: HashSet::new(),
            backoff: HashMap::new(),
            sync_peer: None,
            caught_up: false,
            last_progress: Instant::now(),
            last_getheaders: None,
            last_addr_broadcast: None,
            events_tx,
            events_rx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), pulse_chain::ChainError> {
        self.resolve_seed_candidates().await;
        pulse_log::log_info!(
            "coordinator started with {} candidate peers",
            self.candidates.len()
        );

        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    pulse_log::log_info!("coordinator shutting down");
                    break;
                }
                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await?;
                }
                _ = tick.tick() => {
                    self.maintenance()?;
                }
            }
        }
        Ok(())
    }

    async fn resolve_seed_candidates(&mut self) {
        let mut seeds: Vec<(String, u16)> = Vec::new();
        for peer in self.config.seed_peers.clone() {
            let peer = &peer;
            if let Ok(addr) = peer.parse::<SocketAddr>() {
                self.add_candidate(addr);
                continue;
            }
            seeds.push((peer.clone(), self.params.default_port));
        }
        for seed in &self.params.dns_seeds {
            seeds.push((seed.to_string(), self.params.default_port));
        }
        for (host, port) in seeds {
            match lookup_host((host.as_str(), port)).await {
                Ok(addrs) => {
                    for addr in addrs {
                        self.add_candidate(addr);
                    }
                }
                Err(err) => {
                    pulse_log::log_warn!("seed {host} did not resolve: {err}");
                }
            }
        }
    }

    fn add_candidate(&mut self, addr: SocketAddr) {
        if self.known_candidates.len() >= MAX_CANDIDATES {
            return;
        }
        if self.known_candidates.insert(addr) {
            self.candidates.push_back(addr);
        }
    }

    fn connections_to_ip(&self, ip: IpAddr) -> usize {
        self.peers.keys().filter(|addr| addr.ip() == ip).count()
    }

    fn maintenance(&mut self) -> Result<(), pulse_chain::ChainError> {
        self.fill_peers()?;

        // Demotion on stall: the sync peer made no progress for too long.
        if let Some(sync_addr) = self.sync_peer {
            if !self.caught_up && self.last_progress.elapsed() > SYNC_STALL_TIMEOUT {
                pulse_log::log_warn!("sync peer {sync_addr} stalled; rotating");
                self.demote_sync_peer(sync_addr);
            }
        }

        if self.sync_peer.is_none() {
            self.select_sync_peer()?;
        } else if self.caught_up {
            // A peer announcing a taller chain pulls us back into sync.
            let tip_height = self.tip_height()?;
            let best = self
                .peers
                .values()
                .filter(|peer| peer.ready)
                .map(|peer| peer.best_height)
                .max()
                .unwrap_or(-1);
            if best > tip_height {
                self.caught_up = false;
                self.request_next_batch()?;
            }
        }
        Ok(())
    }

    fn fill_peers(&mut self) -> Result<(), pulse_chain::ChainError> {
        let now = Instant::now();
        while self.peers.len() < self.config.max_peers {
            let Some(addr) = self.next_dialable(now) else {
                break;
            };
            let tip_height = self.tip_height()?;
            pulse_log::log_debug!("dialing {addr}");
            let handle = spawn_session(
                addr,
                self.params.magic,
                self.config.excessive_block_size,
                tip_height,
                self.events_tx.clone(),
                self.shutdown.clone(),
            );
            self.peers.insert(
                addr,
                Peer {
                    handle,
                    ready: false,
                    best_height: -1,
                    speed: None,
                    demoted_until: None,
                },
            );
        }
        Ok(())
    }

    fn next_dialable(&mut self, now: Instant) -> Option<SocketAddr> {
        let mut seen = 0;
        while seen < self.candidates.len() {
            let addr = self.candidates.pop_front()?;
            self.candidates.push_back(addr);
            seen += 1;

            if self.peers.contains_key(&addr) || self.book.is_banned(addr) {
                continue;
            }
            if self.connections_to_ip(addr.ip()) >= self.config.max_peers_per_ip {
                continue;
            }
            if let Some(backoff) = self.backoff.get(&addr) {
                if backoff.next_attempt > now {
                    continue;
                }
            }
            return Some(addr);
        }
        None
    }

    fn tip_height(&self) -> Result<i32, pulse_chain::ChainError> {
        Ok(self
            .chain
            .tip()?
            .map(|tip| tip.height as i32)
            .unwrap_or(-1))
    }

    fn select_sync_peer(&mut self) -> Result<(), pulse_chain::ChainError> {
        let now = Instant::now();
        let min_speed = self.config.min_sync_peer_network_speed;
        let candidate = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.ready)
            .filter(|(_, peer)| {
                peer.demoted_until.map(|until| until <= now).unwrap_or(true)
            })
            .filter(|(_, peer)| peer.speed.map(|speed| speed >= min_speed).unwrap_or(true))
            .max_by_key(|(_, peer)| peer.best_height)
            .map(|(addr, _)| *addr);

        if let Some(addr) = candidate {
            pulse_log::log_info!("sync peer selected: {addr}");
            self.sync_peer = Some(addr);
            self.caught_up = false;
            self.last_progress = Instant::now();
            self.request_next_batch()?;
        }
        Ok(())
    }

    fn demote_sync_peer(&mut self, addr: SocketAddr) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.demoted_until = Some(Instant::now() + DEMOTION_COOLDOWN);
        }
        if self.sync_peer == Some(addr) {
            self.sync_peer = None;
        }
    }

    /// Issues the next locator walk to the sync peer, paced by the trickle
    /// interval so repeated requests never flood the wire.
    fn request_next_batch(&mut self) -> Result<(), pulse_chain::ChainError> {
        let Some(addr) = self.sync_peer else {
            return Ok(());
        };
        if let Some(last) = self.last_getheaders {
            if last.elapsed() < self.config.trickle_interval {
                return Ok(());
            }
        }
        let locator = self.chain.locator()?;
        if locator.is_empty() {
            return Ok(());
        }
        let Some(peer) = self.peers.get(&addr) else {
            self.sync_peer = None;
            return Ok(());
        };
        if !peer.handle.request_headers(locator, BlockHash::ZERO) {
            pulse_log::log_warn!("sync peer {addr} not accepting requests; rotating");
            self.demote_sync_peer(addr);
            return Ok(());
        }
        self.last_getheaders = Some(Instant::now());
        Ok(())
    }

    async fn handle_event(&mut self, event: SessionEvent) -> Result<(), pulse_chain::ChainError> {
        match event {
            SessionEvent::Ready {
                addr,
                best_height,
                user_agent,
                services,
            } => {
                pulse_log::log_debug!(
                    "peer {addr} ready (height {best_height}, services {services:#x}, {user_agent:?})"
                );
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.ready = true;
                    peer.best_height = best_height;
                }
                self.backoff.remove(&addr);
                if self.sync_peer.is_none() {
                    self.select_sync_peer()?;
                }
            }
            SessionEvent::Headers {
                addr,
                headers,
                solicited,
                elapsed,
                bytes,
            } => {
                self.ingest_headers(addr, headers, solicited, elapsed, bytes)?;
            }
            SessionEvent::HeadersTimeout { addr } => {
                if self.sync_peer == Some(addr) {
                    pulse_log::log_warn!("sync peer {addr} timed out on getheaders; rotating");
                    self.demote_sync_peer(addr);
                }
            }
            SessionEvent::Addr { addr, addrs } => {
                pulse_log::log_debug!("peer {addr} gossiped {} addresses", addrs.len());
                for candidate in addrs {
                    self.add_candidate(candidate);
                }
            }
            SessionEvent::GetHeaders {
                addr,
                locator,
                stop,
            } => {
                // Serve the longest chain back to peers we dialed.
                let records = self.chain.headers_from_locator(&locator, &stop)?;
                let headers: Vec<_> = records.iter().map(|record| record.header()).collect();
                pulse_log::log_debug!(
                    "serving {} headers to {addr} from locator of {}",
                    headers.len(),
                    locator.len()
                );
                if let Some(peer) = self.peers.get(&addr) {
                    peer.handle.send_headers(headers);
                }
            }
            SessionEvent::GetAddr { addr } => {
                // Address broadcasts are paced by the trickle interval.
                if let Some(last) = self.last_addr_broadcast {
                    if last.elapsed() < self.config.trickle_interval {
                        return Ok(());
                    }
                }
                let addrs: Vec<SocketAddr> = self
                    .known_candidates
                    .iter()
                    .copied()
                    .take(MAX_SHARED_ADDRS)
                    .collect();
                if addrs.is_empty() {
                    return Ok(());
                }
                if let Some(peer) = self.peers.get(&addr) {
                    if peer.handle.send_addr(addrs) {
                        self.last_addr_broadcast = Some(Instant::now());
                    }
                }
            }
            SessionEvent::Misbehaving {
                addr,
                score,
                reason,
            } => {
                pulse_log::log_warn!("peer {addr} misbehaving (+{score}): {reason}");
                if self
                    .book
                    .add_misbehavior(addr, score, self.config.ban_duration)
                {
                    pulse_log::log_warn!("peer {addr} banned: {reason}");
                    self.drop_peer(addr);
                }
            }
            SessionEvent::Disconnected {
                addr,
                reason,
                banned,
            } => {
                pulse_log::log_debug!("peer {addr} disconnected: {reason}");
                if banned {
                    self.book.ban(addr, self.config.ban_duration);
                }
                self.drop_peer(addr);
                let backoff = self.backoff.entry(addr).or_insert(Backoff {
                    attempts: 0,
                    next_attempt: Instant::now(),
                });
                backoff.attempts = backoff.attempts.saturating_add(1);
                // 1s, 2s, 4s, ... doubling until the five-minute cap binds.
                let exponent = backoff.attempts.min(10).saturating_sub(1);
                let delay = Duration::from_secs(1u64 << exponent);
                backoff.next_attempt = Instant::now() + delay.min(MAX_RECONNECT_BACKOFF);
            }
        }
        Ok(())
    }

    fn ingest_headers(
        &mut self,
        addr: SocketAddr,
        headers: Vec<pulse_primitives::BlockHeader>,
        solicited: bool,
        elapsed: Duration,
        bytes: usize,
    ) -> Result<(), pulse_chain::ChainError> {
        if headers.is_empty() {
            if solicited && self.sync_peer == Some(addr) {
                self.caught_up = true;
                pulse_log::log_info!("caught up at height {}", self.tip_height()?);
            }
            return Ok(());
        }

        let count = headers.len();
        let outcomes = self.chain.accept_header_batch(&headers)?;
        let mut accepted = 0usize;
        let mut rejected = 0usize;
        for outcome in &outcomes {
            match outcome {
                AcceptOutcome::Accepted => accepted += 1,
                AcceptOutcome::Rejected(_) => rejected += 1,
                _ => {}
            }
        }
        if accepted > 0 {
            self.last_progress = Instant::now();
        }
        pulse_log::log_debug!(
            "peer {addr}: {count} headers, {accepted} accepted, {rejected} rejected"
        );

        // Every invalid header costs the full ban score.
        if rejected > 0
            && self
                .book
                .add_misbehavior(addr, 100 * rejected as u32, self.config.ban_duration)
        {
            pulse_log::log_warn!("peer {addr} banned for {rejected} invalid headers");
            self.drop_peer(addr);
            return Ok(());
        }

        // Announcement-sized unsolicited batches are how peers surface new
        // tips; a bulk batch nobody asked for accrues misbehavior.
        if !solicited
            && count > MAX_UNSOLICITED_HEADERS
            && self.book.add_misbehavior(
                addr,
                MISBEHAVIOR_UNSOLICITED_FLOOD,
                self.config.ban_duration,
            )
        {
            pulse_log::log_warn!("peer {addr} banned for unsolicited header floods");
            self.drop_peer(addr);
            return Ok(());
        }

        if solicited && self.sync_peer == Some(addr) {
            if elapsed > Duration::ZERO {
                let speed = (bytes as u64 * 1000) / elapsed.as_millis().max(1) as u64;
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.speed = Some(speed);
                }
                if speed < self.config.min_sync_peer_network_speed {
                    pulse_log::log_warn!(
                        "sync peer {addr} too slow ({speed} B/s); rotating"
                    );
                    self.demote_sync_peer(addr);
                    return Ok(());
                }
            }
            if count == MAX_HEADERS_RESULTS {
                self.request_next_batch()?;
            } else {
                self.caught_up = true;
                pulse_log::log_info!("caught up at height {}", self.tip_height()?);
            }
        }
        Ok(())
    }

    fn drop_peer(&mut self, addr: SocketAddr) {
        self.peers.remove(&addr);
        if self.sync_peer == Some(addr) {
            self.sync_peer = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_chain::{ChainOptions, ChainService};
    use pulse_consensus::params::{network_params, Network};
    use pulse_primitives::BlockHeader;
    use pulse_store::{HeaderStore, MemoryHeaderStore};

    fn coordinator() -> (
        SyncCoordinator<MemoryHeaderStore>,
        Arc<PeerBook>,
        BlockHeader,
    ) {
        let params = network_params(Network::Regtest);
        let store = MemoryHeaderStore::new();
        store.migrate().expect("migrate");
        let chain = Arc::new(ChainService::new(
            store,
            params.clone(),
            ChainOptions::default(),
        ));
        let book = Arc::new(PeerBook::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let genesis = BlockHeader::genesis(&params);
        let coordinator = SyncCoordinator::new(
            chain,
            params,
            P2pConfig::default(),
            book.clone(),
            shutdown_rx,
        );
        (coordinator, book, genesis)
    }

    fn peer_addr(last_octet: u8) -> SocketAddr {
        format!("198.51.100.{last_octet}:8333").parse().expect("addr")
    }

    #[test]
    fn unsolicited_header_floods_accrue_misbehavior() {
        let (mut coordinator, book, genesis) = coordinator();
        let addr = peer_addr(7);

        // Nine valid headers nobody asked for, over and over.
        let flood = vec![genesis; MAX_UNSOLICITED_HEADERS + 1];
        for _ in 0..4 {
            coordinator
                .ingest_headers(addr, flood.clone(), false, Duration::ZERO, 0)
                .expect("ingest");
            assert!(!book.is_banned(addr));
        }
        coordinator
            .ingest_headers(addr, flood, false, Duration::ZERO, 0)
            .expect("ingest");
        assert!(book.is_banned(addr));
    }

    #[test]
    fn small_unsolicited_announcements_stay_welcome() {
        let (mut coordinator, book, genesis) = coordinator();
        let addr = peer_addr(8);

        let announcement = vec![genesis; 3];
        for _ in 0..20 {
            coordinator
                .ingest_headers(addr, announcement.clone(), false, Duration::ZERO, 0)
                .expect("ingest");
        }
        assert!(!book.is_banned(addr));

        // The announced header made it into the chain.
        let tip = coordinator.chain.tip().expect("tip").expect("tip exists");
        assert_eq!(tip.hash, genesis.hash());
    }

    #[test]
    fn solicited_batches_are_never_flood_scored() {
        let (mut coordinator, book, genesis) = coordinator();
        let addr = peer_addr(9);

        let batch = vec![genesis; MAX_UNSOLICITED_HEADERS + 1];
        for _ in 0..20 {
            coordinator
                .ingest_headers(addr, batch.clone(), true, Duration::ZERO, 0)
                .expect("ingest");
        }
        assert!(!book.is_banned(addr));
    }
}
