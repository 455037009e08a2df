use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::Network;
use zeroize::Zeroizing;

use crate::error::{Result, TxError};

pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

/// `m/purpose'/coin'/account'/0/index`
pub fn derivation_path(
    purpose: u32,
    network: Network,
    account_index: u32,
    address_index: u32,
) -> Result<DerivationPath> {
    let path = vec![
        ChildNumber::from_hardened_idx(purpose)?,
        ChildNumber::from_hardened_idx(coin_type(network))?,
        ChildNumber::from_hardened_idx(account_index)?,
        ChildNumber::from_normal_idx(0)?,
        ChildNumber::from_normal_idx(address_index)?,
    ];
    Ok(DerivationPath::from(path))
}

/// The hardened account prefix of a full address path.
pub fn account_path(path: &DerivationPath) -> DerivationPath {
    let children: &[ChildNumber] = path.as_ref();
    DerivationPath::from(&children[..children.len().min(3)])
}

pub fn seed_from_mnemonic(phrase: &str, passphrase: &str) -> Result<Zeroizing<Vec<u8>>> {
    let mnemonic = bip39::Mnemonic::parse(phrase)
        .map_err(|e| TxError::invalid(format!("mnemonic: {}", e)))?;
    Ok(Zeroizing::new(mnemonic.to_seed(passphrase).to_vec()))
}

pub struct DerivedNode {
    pub private_key: SecretKey,
    pub public_key: PublicKey,
    pub extended_public_key: Xpub,
    pub master_fingerprint: Fingerprint,
}

/// Turns a seed and a path into key material. Nothing is cached between calls.
pub trait KeyVault: Send + Sync {
    fn derive_node(&self, seed: &[u8], path: &DerivationPath) -> Result<DerivedNode>;
}

#[derive(Clone, Copy, Debug)]
pub struct Bip32Vault {
    network: Network,
}

impl Bip32Vault {
    pub fn new(network: Network) -> Self {
        Self { network }
    }
}

impl KeyVault for Bip32Vault {
    fn derive_node(&self, seed: &[u8], path: &DerivationPath) -> Result<DerivedNode> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(self.network, seed)?;
        let node = master.derive_priv(&secp, path)?;
        let extended_public_key = Xpub::from_priv(&secp, &node);

        Ok(DerivedNode {
            private_key: node.private_key,
            public_key: extended_public_key.public_key,
            extended_public_key,
            master_fingerprint: master.fingerprint(&secp),
        })
    }
}
