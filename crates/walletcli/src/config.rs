use anyhow::{Context, Result};
use bitcoin::Network;
use clap::{Parser, Subcommand};
use datatypes::types::{AddressType, MessageSigningProtocol};
use serde::Deserialize;
use std::fs;

#[derive(Parser, Debug)]
#[command(version, about = "Build, sign and bump bitcoin transactions")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Mempool fee tiers in sat/vB
    Fees,
    /// Spendable UTXOs of the payment address
    Utxos,
    /// Pick payment UTXOs for one recipient and print the unsigned PSBT
    Select {
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        #[arg(long)]
        fee_rate: f64,
    },
    /// Pay one recipient from the payment address
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        #[arg(long)]
        fee_rate: f64,
        #[arg(long)]
        broadcast: bool,
    },
    /// Show replacement fees for a pending transaction, or build the replacement
    Rbf {
        #[arg(long)]
        txid: String,
        #[arg(long)]
        fee_rate: Option<u64>,
        #[arg(long)]
        broadcast: bool,
    },
    /// Sign inputs of a base64 PSBT owned by one of the account addresses
    SignPsbt {
        #[arg(long)]
        psbt: String,
        #[arg(long)]
        address: String,
        #[arg(long, value_delimiter = ',')]
        indexes: Vec<usize>,
        #[arg(long)]
        finalize: bool,
    },
    SignMessage {
        /// Defaults to the payment address
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        message: String,
        #[arg(long)]
        protocol: Option<MessageSigningProtocol>,
    },
    VerifyMessage {
        #[arg(long)]
        address: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        signature: String,
    },
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub network: NetworkConfig,
    #[serde(default)]
    pub mempool: MempoolConfig,
    pub wallet: WalletConfig,
}

#[derive(Deserialize, Debug)]
pub struct NetworkConfig {
    pub network: Network,
}

#[derive(Deserialize, Debug, Default)]
pub struct MempoolConfig {
    /// Falls back to mempool.space for the configured network
    pub url: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct WalletConfig {
    pub mnemonic: String,
    #[serde(default)]
    pub passphrase: String,
    pub account_type: String,
    pub payment_type: AddressType,
    #[serde(default)]
    pub account_index: u32,
    #[serde(default)]
    pub address_index: u32,
}

pub fn load_config(path: &str) -> Result<Config> {
    let config_content =
        fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path))?;
    parse_config(&config_content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).context("failed to parse config file")
}
