use fluxseed_db::DbPolicy;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
}

#[derive(Clone, Debug)]
pub struct SeedParams {
    pub network: Network,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub protocol_version: i32,
    pub min_seed_version: i32,
    pub require_height: i32,
    pub user_agent: &'static str,
    pub seeds: &'static [&'static str],
}

/// Peers may trail the checkpoint by this much and still be served.
const HEIGHT_MARGIN: i32 = 10_000;
const MAINNET_CHECKPOINT_HEIGHT: i32 = 1_850_000;
const TESTNET_CHECKPOINT_HEIGHT: i32 = 240_000;

const MAINNET_SEEDS: &[&str] = &[
    "62.171.129.44",
    "65.108.212.6",
    "78.46.38.125",
    "89.58.40.141",
    "95.217.118.206",
    "116.202.21.109",
    "135.181.76.44",
    "144.91.95.233",
    "152.228.230.53",
    "161.97.85.103",
    "167.86.98.59",
    "173.212.212.73",
    "185.16.39.190",
    "193.188.15.214",
    "202.61.202.21",
    "207.180.213.141",
];

const TESTNET_SEEDS: &[&str] = &["95.217.118.206", "161.97.85.103"];

pub fn seed_params(network: Network) -> SeedParams {
    match network {
        Network::Mainnet => SeedParams {
            network,
            message_start: [0x24, 0xe9, 0x27, 0x64],
            default_port: 16_125,
            protocol_version: 170_020,
            min_seed_version: 170_016,
            require_height: MAINNET_CHECKPOINT_HEIGHT - HEIGHT_MARGIN,
            user_agent: "/fluxseed:0.1.0/",
            seeds: MAINNET_SEEDS,
        },
        Network::Testnet => SeedParams {
            network,
            message_start: [0xfa, 0x1a, 0xf9, 0xbf],
            default_port: 26_125,
            protocol_version: 170_020,
            min_seed_version: 170_016,
            require_height: TESTNET_CHECKPOINT_HEIGHT - HEIGHT_MARGIN,
            user_agent: "/fluxseed:0.1.0/",
            seeds: TESTNET_SEEDS,
        },
    }
}

impl SeedParams {
    pub fn db_policy(&self) -> DbPolicy {
        DbPolicy {
            min_client_version: self.min_seed_version,
            min_blocks: self.require_height,
            ..DbPolicy::default()
        }
    }
}
