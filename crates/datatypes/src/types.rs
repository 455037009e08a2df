use std::fmt;
use std::str::FromStr;

use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Change below this many sats is folded into the fee instead of paid out.
pub const DUST_THRESHOLD: u64 = 1000;

/// A spendable output as reported by the chain indexer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    pub out_point: OutPoint,
    pub value: Amount,
    pub address: Address,
    pub confirmed: bool,
    pub block_height: Option<u32>,
}

impl Utxo {
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    pub address: Address,
    pub amount: Amount,
}

impl Recipient {
    pub fn new(address: Address, amount_sats: u64) -> Self {
        Self {
            address,
            amount: Amount::from_sat(amount_sats),
        }
    }
}

/// Outcome of pricing one candidate input set.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionUtxoSelectionMetadata {
    pub selected_utxos: Vec<Utxo>,
    pub fee: Amount,
    /// Effective sat/vB of the chosen variant.
    pub fee_rate: f64,
    /// Zero when the no-change variant was cheaper.
    pub change: Amount,
}

/// The address families this wallet spends from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressType {
    #[serde(rename = "nested")]
    P2shP2wpkh,
    #[serde(rename = "native")]
    P2wpkh,
    #[serde(rename = "taproot")]
    P2tr,
}

impl AddressType {
    /// BIP32 purpose used for this family.
    pub fn purpose(&self) -> u32 {
        match self {
            AddressType::P2shP2wpkh => 49,
            AddressType::P2wpkh => 84,
            AddressType::P2tr => 86,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressType::P2shP2wpkh => "p2sh-p2wpkh",
            AddressType::P2wpkh => "p2wpkh",
            AddressType::P2tr => "p2tr",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown address type: {0}")]
pub struct ParseAddressTypeError(pub String);

impl FromStr for AddressType {
    type Err = ParseAddressTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nested" | "p2sh-p2wpkh" | "p2sh" => Ok(AddressType::P2shP2wpkh),
            "native" | "p2wpkh" => Ok(AddressType::P2wpkh),
            "taproot" | "p2tr" => Ok(AddressType::P2tr),
            _ => Err(ParseAddressTypeError(s.to_string())),
        }
    }
}

/// Where the account's keys live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Software,
    Ledger,
    Keystone,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognised account type: {0}")]
pub struct ParseAccountTypeError(pub String);

impl FromStr for AccountType {
    type Err = ParseAccountTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "software" => Ok(AccountType::Software),
            "ledger" => Ok(AccountType::Ledger),
            "keystone" => Ok(AccountType::Keystone),
            _ => Err(ParseAccountTypeError(s.to_string())),
        }
    }
}

/// Identifies which scripts belong to the wallet when replacing a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RbfContext {
    pub btc_address: String,
    pub ordinals_address: String,
    /// Hex encoded compressed public key of the payment address.
    pub btc_public_key: String,
    /// Hex encoded public key (compressed or x-only) of the taproot address.
    pub ordinals_public_key: String,
    pub account_type: AccountType,
    pub network: Network,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSigningProtocol {
    #[serde(rename = "ECDSA")]
    Ecdsa,
    #[serde(rename = "BIP322")]
    Bip322,
}

impl FromStr for MessageSigningProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ECDSA" => Ok(MessageSigningProtocol::Ecdsa),
            "BIP322" => Ok(MessageSigningProtocol::Bip322),
            _ => Err(format!("unknown message signing protocol: {}", s)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    /// Base64 encoded signature.
    pub signature: String,
    pub protocol: MessageSigningProtocol,
}

/// Mempool fee tiers in sat/vB.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedFees {
    pub fastest_fee: u64,
    pub half_hour_fee: u64,
    pub hour_fee: u64,
    pub economy_fee: u64,
    pub minimum_fee: u64,
}
