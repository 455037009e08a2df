use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::psbt::Input;
use bitcoin::secp256k1::{PublicKey, Secp256k1, XOnlyPublicKey};
use bitcoin::{Address, CompressedPublicKey, Network, Script, ScriptBuf, TxOut};
use datatypes::types::{AccountType, AddressType, RbfContext, Utxo};

use crate::error::{Result, TxError};
use crate::keys::{derivation_path, KeyVault};

/// Everything a signer needs to know about one input it is asked to sign.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputSigningInfo {
    pub index: usize,
    pub address_type: AddressType,
    pub public_key: PublicKey,
    pub derivation_path: Option<DerivationPath>,
    pub master_fingerprint: Option<Fingerprint>,
}

/// One wallet address of a given family, able to shape PSBT inputs spending it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressContext {
    address_type: AddressType,
    address: Address,
    public_key: PublicKey,
    key_origin: Option<(Fingerprint, DerivationPath)>,
}

impl AddressContext {
    pub fn new(
        address_type: AddressType,
        public_key: PublicKey,
        network: Network,
        key_origin: Option<(Fingerprint, DerivationPath)>,
    ) -> Self {
        let address = match address_type {
            AddressType::P2shP2wpkh => Address::p2shwpkh(&CompressedPublicKey(public_key), network),
            AddressType::P2wpkh => Address::p2wpkh(&CompressedPublicKey(public_key), network),
            AddressType::P2tr => {
                let secp = Secp256k1::verification_only();
                Address::p2tr(&secp, public_key.x_only_public_key().0, None, network)
            }
        };

        Self {
            address_type,
            address,
            public_key,
            key_origin,
        }
    }

    pub fn from_seed(
        vault: &dyn KeyVault,
        seed: &[u8],
        address_type: AddressType,
        network: Network,
        account_index: u32,
        address_index: u32,
    ) -> Result<Self> {
        let path = derivation_path(address_type.purpose(), network, account_index, address_index)?;
        let node = vault.derive_node(seed, &path)?;
        Ok(Self::new(
            address_type,
            node.public_key,
            network,
            Some((node.master_fingerprint, path)),
        ))
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.public_key.x_only_public_key().0
    }

    pub fn key_origin(&self) -> Option<&(Fingerprint, DerivationPath)> {
        self.key_origin.as_ref()
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    /// The P2WPKH program wrapped by a nested segwit address.
    pub fn redeem_script(&self) -> Option<ScriptBuf> {
        match self.address_type {
            AddressType::P2shP2wpkh => {
                let hash = CompressedPublicKey(self.public_key).wpubkey_hash();
                Some(ScriptBuf::new_p2wpkh(&hash))
            }
            _ => None,
        }
    }

    /// PSBT input fields for spending `utxo` from this address.
    pub fn psbt_input(&self, utxo: &Utxo) -> Result<Input> {
        let script_pubkey = utxo.script_pubkey();
        if script_pubkey != self.script_pubkey() {
            return Err(TxError::AddressNotFound(utxo.address.to_string()));
        }

        let mut input = Input {
            witness_utxo: Some(TxOut {
                value: utxo.value,
                script_pubkey,
            }),
            ..Default::default()
        };

        match self.address_type {
            AddressType::P2tr => {
                let internal_key = self.internal_key();
                input.tap_internal_key = Some(internal_key);
                if let Some(origin) = &self.key_origin {
                    input
                        .tap_key_origins
                        .insert(internal_key, (Vec::new(), origin.clone()));
                }
            }
            AddressType::P2shP2wpkh | AddressType::P2wpkh => {
                input.redeem_script = self.redeem_script();
                if let Some(origin) = &self.key_origin {
                    input.bip32_derivation.insert(self.public_key, origin.clone());
                }
            }
        }

        Ok(input)
    }

    pub fn signing_info(&self, index: usize) -> InputSigningInfo {
        InputSigningInfo {
            index,
            address_type: self.address_type,
            public_key: self.public_key,
            derivation_path: self.key_origin.as_ref().map(|(_, path)| path.clone()),
            master_fingerprint: self.key_origin.as_ref().map(|(fp, _)| *fp),
        }
    }
}

/// The payment and ordinals addresses of one account.
#[derive(Clone, Debug)]
pub struct AccountContext {
    pub payment: AddressContext,
    pub ordinals: AddressContext,
    pub account_type: AccountType,
    pub network: Network,
}

impl AccountContext {
    pub fn from_seed(
        vault: &dyn KeyVault,
        seed: &[u8],
        network: Network,
        account_type: AccountType,
        payment_type: AddressType,
        account_index: u32,
        address_index: u32,
    ) -> Result<Self> {
        if payment_type == AddressType::P2tr {
            return Err(TxError::UnsupportedAddressType(
                "taproot cannot be the payment address".to_string(),
            ));
        }
        let payment = AddressContext::from_seed(
            vault,
            seed,
            payment_type,
            network,
            account_index,
            address_index,
        )?;
        let ordinals = AddressContext::from_seed(
            vault,
            seed,
            AddressType::P2tr,
            network,
            account_index,
            address_index,
        )?;

        Ok(Self {
            payment,
            ordinals,
            account_type,
            network,
        })
    }

    /// Rebuilds the account from public data only. The addresses must match the keys.
    pub fn from_rbf_context(ctx: &RbfContext) -> Result<Self> {
        let payment_address = parse_address(&ctx.btc_address, ctx.network)?;
        let payment_type = match payment_address.address_type() {
            Some(bitcoin::AddressType::P2sh) => AddressType::P2shP2wpkh,
            Some(bitcoin::AddressType::P2wpkh) => AddressType::P2wpkh,
            _ => return Err(TxError::UnsupportedAddressType(ctx.btc_address.clone())),
        };
        let payment_key = PublicKey::from_str(&ctx.btc_public_key)
            .map_err(|e| TxError::invalid(format!("payment public key: {}", e)))?;
        let ordinals_key = parse_taproot_key(&ctx.ordinals_public_key)?;

        let payment = AddressContext::new(payment_type, payment_key, ctx.network, None);
        let ordinals = AddressContext::new(AddressType::P2tr, ordinals_key, ctx.network, None);

        if payment.address != payment_address {
            return Err(TxError::invalid(format!(
                "public key does not match payment address {}",
                ctx.btc_address
            )));
        }
        if ordinals.address.to_string() != ctx.ordinals_address {
            return Err(TxError::invalid(format!(
                "public key does not match ordinals address {}",
                ctx.ordinals_address
            )));
        }

        Ok(Self {
            payment,
            ordinals,
            account_type: ctx.account_type,
            network: ctx.network,
        })
    }

    pub fn contexts(&self) -> [&AddressContext; 2] {
        [&self.payment, &self.ordinals]
    }

    pub fn owns_script(&self, script: &Script) -> bool {
        self.context_for_script(script).is_ok()
    }

    pub fn context_for_script(&self, script: &Script) -> Result<&AddressContext> {
        self.contexts()
            .into_iter()
            .find(|ctx| ctx.script_pubkey().as_script() == script)
            .ok_or_else(|| {
                let name = Address::from_script(script, self.network)
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| script.to_hex_string());
                TxError::AddressNotFound(name)
            })
    }

    pub fn context_for_address(&self, address: &str) -> Result<&AddressContext> {
        self.contexts()
            .into_iter()
            .find(|ctx| ctx.address.to_string() == address)
            .ok_or_else(|| TxError::AddressNotFound(address.to_string()))
    }
}

pub(crate) fn parse_address(address: &str, network: Network) -> Result<Address> {
    Address::from_str(address)
        .map_err(|e| TxError::invalid(format!("address {}: {}", address, e)))?
        .require_network(network)
        .map_err(|e| TxError::invalid(format!("address {}: {}", address, e)))
}

/// Accepts a compressed key or a bare x-only key. X-only keys are lifted with even parity.
fn parse_taproot_key(hex: &str) -> Result<PublicKey> {
    if hex.len() == 64 {
        let xonly = XOnlyPublicKey::from_str(hex)
            .map_err(|e| TxError::invalid(format!("ordinals public key: {}", e)))?;
        return Ok(xonly.public_key(bitcoin::secp256k1::Parity::Even));
    }
    PublicKey::from_str(hex).map_err(|e| TxError::invalid(format!("ordinals public key: {}", e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keys::{seed_from_mnemonic, Bip32Vault};
    use bitcoin::{Amount, OutPoint, Txid};

    pub(crate) const MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    pub(crate) fn account(payment_type: AddressType) -> AccountContext {
        let seed = seed_from_mnemonic(MNEMONIC, "").unwrap();
        AccountContext::from_seed(
            &Bip32Vault::new(Network::Bitcoin),
            &seed,
            Network::Bitcoin,
            AccountType::Software,
            payment_type,
            0,
            0,
        )
        .unwrap()
    }

    pub(crate) fn utxo(address: &Address, sats: u64, vout: u32) -> Utxo {
        Utxo {
            out_point: OutPoint {
                txid: Txid::from_str(
                    "903e78a5ce44c985459ff91fb9db49338b5901b8cfdbfa1aa875efc53eed4a2f",
                )
                .unwrap(),
                vout,
            },
            value: Amount::from_sat(sats),
            address: address.clone(),
            confirmed: true,
            block_height: Some(840000),
        }
    }

    #[test]
    fn derives_standard_addresses() {
        let native = account(AddressType::P2wpkh);
        assert_eq!(
            native.payment.address().to_string(),
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );
        assert_eq!(
            native.ordinals.address().to_string(),
            "bc1p5cyxnuxmeuwuvkwfem96lqzszd02n6xdcjrs20cac6yqjjwudpxqkedrcr"
        );

        let nested = account(AddressType::P2shP2wpkh);
        assert_eq!(
            nested.payment.address().to_string(),
            "37VucYSaXLCAsxYyAPfbSi9eh4iEcbShgf"
        );
        assert!(nested.payment.redeem_script().unwrap().is_p2wpkh());
    }

    #[test]
    fn shapes_inputs_per_family() {
        let acc = account(AddressType::P2shP2wpkh);

        let nested = acc.payment.psbt_input(&utxo(acc.payment.address(), 5000, 0)).unwrap();
        assert!(nested.redeem_script.is_some());
        assert_eq!(nested.bip32_derivation.len(), 1);
        assert!(nested.tap_internal_key.is_none());

        let taproot = acc.ordinals.psbt_input(&utxo(acc.ordinals.address(), 5000, 1)).unwrap();
        assert_eq!(taproot.tap_internal_key, Some(acc.ordinals.internal_key()));
        let (leaves, (fp, path)) = &taproot.tap_key_origins[&acc.ordinals.internal_key()];
        assert!(leaves.is_empty());
        assert_eq!(fp.to_string(), "73c5da0a");
        assert_eq!(path, &DerivationPath::from_str("m/86'/0'/0'/0/0").unwrap());
        assert!(taproot.redeem_script.is_none());
    }

    #[test]
    fn foreign_utxo_is_not_found() {
        let acc = account(AddressType::P2wpkh);
        let err = acc
            .payment
            .psbt_input(&utxo(acc.ordinals.address(), 5000, 0))
            .unwrap_err();
        assert!(matches!(err, TxError::AddressNotFound(_)));

        let err = acc
            .context_for_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
            .unwrap_err();
        assert!(matches!(err, TxError::AddressNotFound(_)));
        assert!(acc.owns_script(&acc.ordinals.script_pubkey()));
    }

    #[test]
    fn account_from_public_data() {
        let acc = account(AddressType::P2wpkh);
        let ctx = RbfContext {
            btc_address: acc.payment.address().to_string(),
            ordinals_address: acc.ordinals.address().to_string(),
            btc_public_key: acc.payment.public_key().to_string(),
            ordinals_public_key: acc.ordinals.internal_key().to_string(),
            account_type: AccountType::Ledger,
            network: Network::Bitcoin,
        };

        let rebuilt = AccountContext::from_rbf_context(&ctx).unwrap();
        assert_eq!(rebuilt.payment.address_type(), AddressType::P2wpkh);
        assert_eq!(rebuilt.ordinals.script_pubkey(), acc.ordinals.script_pubkey());
        assert!(rebuilt.payment.key_origin().is_none());

        let mismatched = RbfContext {
            ordinals_address: acc.payment.address().to_string(),
            ..ctx
        };
        assert!(AccountContext::from_rbf_context(&mismatched).is_err());
    }
}
