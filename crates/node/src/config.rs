//! Runtime configuration and command-line parsing.

use std::path::PathBuf;
use std::time::Duration;

use pulse_consensus::params::Network;
use pulse_log::{Format, Level};

#[derive(Clone, Debug)]
pub struct P2pConfig {
    pub max_peers: usize,
    pub max_peers_per_ip: usize,
    pub ban_duration: Duration,
    /// Minimum bytes/sec over the last headers batch to stay sync peer.
    pub min_sync_peer_network_speed: u64,
    /// Upper bound on any single P2P message.
    pub excessive_block_size: usize,
    /// Minimum delay between outgoing announcement floods.
    pub trickle_interval: Duration,
    /// Extra peer addresses beside the DNS seeds.
    pub seed_peers: Vec<String>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            max_peers: 125,
            max_peers_per_ip: 5,
            ban_duration: Duration::from_secs(24 * 60 * 60),
            min_sync_peer_network_speed: 51_200,
            excessive_block_size: 128_000_000,
            trickle_interval: Duration::from_millis(50),
            seed_peers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub network: Network,
    pub db_path: PathBuf,
    pub banlist_path: PathBuf,
    pub log_level: Level,
    pub log_format: Format,
    pub blocks_for_fork_confirmation: u32,
    pub max_block_height_excess: u32,
    pub p2p: P2pConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            db_path: PathBuf::from("./data/blockheaders.db"),
            banlist_path: PathBuf::from("./data/banlist.json"),
            log_level: Level::Info,
            log_format: Format::Text,
            blocks_for_fork_confirmation: 10,
            max_block_height_excess: 6,
            p2p: P2pConfig::default(),
        }
    }
}

pub enum CliAction {
    Run(Box<AppConfig>),
    Help,
}

pub const USAGE: &str = "\
pulse - Bitcoin SV block-header tracking node

USAGE:
    pulse [OPTIONS]

OPTIONS:
    --network <mainnet|testnet|stn|regtest>   network to join (default mainnet)
    --db <path>                               header database file
    --banlist <path>                          persisted ban-list file
    --peer <addr:port>                        extra seed peer, repeatable
    --max-peers <n>                           connection cap (default 125)
    --fork-confirmations <n>                  reorg depth cutoff (default 10)
    --log-level <error|warn|info|debug|trace> (default info)
    --log-format <text|json>                  (default text)
    --help                                    show this help
";

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut config = AppConfig::default();
    let mut args = raw_args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::Help),
            "--network" => {
                let value = expect_value(&arg, args.next())?;
                config.network = Network::parse(&value)
                    .ok_or_else(|| format!("unknown network {value:?}"))?;
            }
            "--db" => {
                config.db_path = PathBuf::from(expect_value(&arg, args.next())?);
            }
            "--banlist" => {
                config.banlist_path = PathBuf::from(expect_value(&arg, args.next())?);
            }
            "--peer" => {
                config.p2p.seed_peers.push(expect_value(&arg, args.next())?);
            }
            "--max-peers" => {
                let value = expect_value(&arg, args.next())?;
                config.p2p.max_peers = value
                    .parse()
                    .map_err(|_| format!("invalid peer count {value:?}"))?;
            }
            "--fork-confirmations" => {
                let value = expect_value(&arg, args.next())?;
                config.blocks_for_fork_confirmation = value
                    .parse()
                    .map_err(|_| format!("invalid confirmation depth {value:?}"))?;
            }
            "--log-level" => {
                let value = expect_value(&arg, args.next())?;
                config.log_level = value
                    .parse::<Level>()
                    .map_err(|_| format!("unknown log level {value:?}"))?;
            }
            "--log-format" => {
                let value = expect_value(&arg, args.next())?;
                config.log_format = value
                    .parse::<Format>()
                    .map_err(|_| format!("unknown log format {value:?}"))?;
            }
            other => return Err(format!("unknown argument {other:?}")),
        }
    }

    Ok(CliAction::Run(Box::new(config)))
}

fn expect_value(flag: &str, value: Option<String>) -> Result<String, String> {
    value.ok_or_else(|| format!("{flag} requires a value"))
}
