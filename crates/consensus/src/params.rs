//! Per-network consensus and peering parameters.

use primitive_types::U256;

use crate::BlockHash;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Stn,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Stn => "stn",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "stn" => Some(Network::Stn),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

/// A pinned (height, hash) pair the header chain must pass through.
#[derive(Clone, Copy, Debug)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: BlockHash,
}

/// The fields of the network's genesis header, needed to reconstruct and
/// validate block zero without special cases elsewhere.
#[derive(Clone, Copy, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub merkle_root: BlockHash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Clone, Debug)]
pub struct NetworkParams {
    pub network: Network,
    pub magic: [u8; 4],
    pub default_port: u16,
    pub genesis_hash: BlockHash,
    pub genesis: GenesisParams,
    /// Highest admissible proof-of-work target.
    pub pow_limit: U256,
    pub pow_limit_bits: u32,
    /// Seconds between blocks the difficulty rules aim for.
    pub target_spacing: i64,
    /// Length of a pre-DAA retarget epoch in seconds.
    pub target_timespan: i64,
    /// Blocks per pre-DAA retarget epoch.
    pub retarget_interval: u32,
    /// Testnet rule: a block 20 minutes late may use the pow limit.
    pub allow_min_difficulty_blocks: bool,
    /// Regtest rule: difficulty never moves.
    pub no_retargeting: bool,
    /// Height at which the emergency difficulty adjustment activates.
    pub uahf_height: u32,
    /// Height of the last block governed by the pre-DAA rules.
    pub daa_height: u32,
    /// Heights at which header versions 2, 3 and 4 become mandatory.
    pub bip34_height: u32,
    pub bip66_height: u32,
    pub bip65_height: u32,
    pub checkpoints: Vec<Checkpoint>,
    pub dns_seeds: Vec<&'static str>,
}

impl NetworkParams {
    /// Minimum header version required at `height`.
    pub fn min_version_at(&self, height: u32) -> i32 {
        if height >= self.bip65_height {
            4
        } else if height >= self.bip66_height {
            3
        } else if height >= self.bip34_height {
            2
        } else {
            1
        }
    }

    pub fn checkpoint_at(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }

    /// True when the cw-144 difficulty algorithm governs the block at `height`.
    pub fn daa_active_at(&self, height: u32) -> bool {
        height > self.daa_height
    }

    /// True when the emergency difficulty adjustment governs the block at `height`.
    pub fn eda_active_at(&self, height: u32) -> bool {
        height > self.uahf_height && !self.daa_active_at(height)
    }
}

pub fn network_params(network: Network) -> NetworkParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
        Network::Stn => stn_params(),
        Network::Regtest => regtest_params(),
    }
}

fn hash(hex: &str) -> BlockHash {
    BlockHash::from_hex(hex).expect("static hash literal")
}

// 0x00000000ffff0000...: the 0x1d00ffff compact target.
fn mainnet_pow_limit() -> U256 {
    U256::from_big_endian(&{
        let mut bytes = [0xffu8; 32];
        bytes[0] = 0;
        bytes[1] = 0;
        bytes[2] = 0;
        bytes[3] = 0;
        bytes
    })
}

// 0x7fffffffffff...: the 0x207fffff compact target.
fn regtest_pow_limit() -> U256 {
    let mut bytes = [0xffu8; 32];
    bytes[0] = 0x7f;
    U256::from_big_endian(&bytes)
}

fn mainnet_params() -> NetworkParams {
    NetworkParams {
        network: Network::Mainnet,
        magic: [0xe3, 0xe1, 0xf3, 0xe8],
        default_port: 8333,
        genesis_hash: hash("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"),
        genesis: GenesisParams {
            version: 1,
            merkle_root: hash(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            ),
            time: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        },
        pow_limit: mainnet_pow_limit(),
        pow_limit_bits: 0x1d00ffff,
        target_spacing: 600,
        target_timespan: 14 * 24 * 60 * 60,
        retarget_interval: 2016,
        allow_min_difficulty_blocks: false,
        no_retargeting: false,
        uahf_height: 478_558,
        daa_height: 504_031,
        bip34_height: 227_931,
        bip66_height: 363_725,
        bip65_height: 388_381,
        checkpoints: vec![
            Checkpoint {
                height: 11_111,
                hash: hash("0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
            },
            Checkpoint {
                height: 33_333,
                hash: hash("000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
            },
            Checkpoint {
                height: 105_000,
                hash: hash("00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
            },
            Checkpoint {
                height: 134_444,
                hash: hash("00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
            },
            Checkpoint {
                height: 168_000,
                hash: hash("000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
            },
            Checkpoint {
                height: 210_000,
                hash: hash("000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"),
            },
            Checkpoint {
                height: 250_000,
                hash: hash("000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
            },
            Checkpoint {
                height: 295_000,
                hash: hash("00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983"),
            },
            Checkpoint {
                height: 478_558,
                hash: hash("0000000000000000011865af4122fe3b144e2cbeea86142e8ff2fb4107352d43"),
            },
            Checkpoint {
                height: 504_031,
                hash: hash("0000000000000000011ebf65b60d0a3de80b8175be709d653b4c1a1beeb6ab9c"),
            },
            Checkpoint {
                height: 556_767,
                hash: hash("000000000000000001d956714215d96ffc00e0afda4cd0a96c96f8d802b1662b"),
            },
        ],
        dns_seeds: vec![
            "seed.bitcoinsv.io",
            "seed.satoshisvision.network",
            "seed.bitcoinseed.directory",
        ],
    }
}

fn testnet_params() -> NetworkParams {
    NetworkParams {
        network: Network::Testnet,
        magic: [0xf4, 0xe5, 0xf3, 0xf4],
        default_port: 18333,
        genesis_hash: hash("000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"),
        genesis: GenesisParams {
            version: 1,
            merkle_root: hash(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            ),
            time: 1296688602,
            bits: 0x1d00ffff,
            nonce: 414098458,
        },
        pow_limit: mainnet_pow_limit(),
        pow_limit_bits: 0x1d00ffff,
        target_spacing: 600,
        target_timespan: 14 * 24 * 60 * 60,
        retarget_interval: 2016,
        allow_min_difficulty_blocks: true,
        no_retargeting: false,
        uahf_height: 1_155_875,
        daa_height: 1_188_697,
        bip34_height: 21_111,
        bip66_height: 330_776,
        bip65_height: 581_885,
        checkpoints: vec![Checkpoint {
            height: 546,
            hash: hash("000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70"),
        }],
        dns_seeds: vec!["testnet-seed.bitcoinsv.io", "testnet-seed.bitcoincloud.net"],
    }
}

fn stn_params() -> NetworkParams {
    NetworkParams {
        network: Network::Stn,
        magic: [0xfb, 0xce, 0xc4, 0xf9],
        default_port: 9333,
        // The scaling testnet restarts from the public testnet genesis.
        genesis_hash: hash("000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"),
        genesis: GenesisParams {
            version: 1,
            merkle_root: hash(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            ),
            time: 1296688602,
            bits: 0x1d00ffff,
            nonce: 414098458,
        },
        pow_limit: mainnet_pow_limit(),
        pow_limit_bits: 0x1d00ffff,
        target_spacing: 600,
        target_timespan: 14 * 24 * 60 * 60,
        retarget_interval: 2016,
        allow_min_difficulty_blocks: false,
        no_retargeting: false,
        uahf_height: 15,
        daa_height: 2200,
        bip34_height: 100_000_000,
        bip66_height: 100_000_000,
        bip65_height: 100_000_000,
        checkpoints: Vec::new(),
        dns_seeds: vec!["stn-seed.bitcoinsv.io"],
    }
}

fn regtest_params() -> NetworkParams {
    NetworkParams {
        network: Network::Regtest,
        magic: [0xda, 0xb5, 0xbf, 0xfa],
        default_port: 18444,
        genesis_hash: hash("0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"),
        genesis: GenesisParams {
            version: 1,
            merkle_root: hash(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            ),
            time: 1296688602,
            bits: 0x207fffff,
            nonce: 2,
        },
        pow_limit: regtest_pow_limit(),
        pow_limit_bits: 0x207fffff,
        target_spacing: 600,
        target_timespan: 14 * 24 * 60 * 60,
        retarget_interval: 2016,
        allow_min_difficulty_blocks: true,
        no_retargeting: true,
        uahf_height: 0,
        daa_height: 0,
        bip34_height: 100_000_000,
        bip66_height: 100_000_000,
        bip65_height: 100_000_000,
        checkpoints: Vec::new(),
        dns_seeds: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_differ_per_network() {
        let nets = [
            Network::Mainnet,
            Network::Testnet,
            Network::Stn,
            Network::Regtest,
        ];
        for (i, a) in nets.iter().enumerate() {
            for b in nets.iter().skip(i + 1) {
                assert_ne!(network_params(*a).magic, network_params(*b).magic);
            }
        }
    }

    #[test]
    fn mainnet_version_schedule() {
        let params = network_params(Network::Mainnet);
        assert_eq!(params.min_version_at(0), 1);
        assert_eq!(params.min_version_at(227_931), 2);
        assert_eq!(params.min_version_at(363_725), 3);
        assert_eq!(params.min_version_at(400_000), 4);
    }

    #[test]
    fn difficulty_regimes() {
        let params = network_params(Network::Mainnet);
        assert!(!params.eda_active_at(478_558));
        assert!(params.eda_active_at(478_559));
        assert!(params.eda_active_at(504_031));
        assert!(!params.daa_active_at(504_031));
        assert!(params.daa_active_at(504_032));
    }

    #[test]
    fn network_parse() {
        assert_eq!(Network::parse("mainnet"), Some(Network::Mainnet));
        assert_eq!(Network::parse("STN"), Some(Network::Stn));
        assert_eq!(Network::parse("nope"), None);
    }
}
