use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::psbt::PsbtSighashType;
use bitcoin::secp256k1::ecdsa::RecoverableSignature;
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache};
use bitcoin::{taproot, Network, Psbt, TapSighashType, TxOut};
use datatypes::types::{AccountType, ParseAccountTypeError};
use tracing::debug;
use zeroize::Zeroizing;

use crate::context::{AccountContext, InputSigningInfo};
use crate::error::{Result, TxError};
use crate::finalize::finalize_inputs;
use crate::hardware::{DeviceTransport, KeystoneSigner, LedgerSigner};
use crate::keys::{derivation_path, Bip32Vault, KeyVault};
use crate::vsize::resolve_prevout;

/// Adds partial signatures (or taproot key signatures) for the listed inputs.
#[async_trait]
pub trait PsbtSigner: Send + Sync {
    async fn sign(&self, psbt: &mut Psbt, inputs: &[InputSigningInfo]) -> Result<()>;

    /// Recoverable ECDSA signature over a message digest with the key behind `info`.
    async fn sign_digest_recoverable(
        &self,
        info: &InputSigningInfo,
        digest: [u8; 32],
    ) -> Result<RecoverableSignature> {
        let _ = (info, digest);
        Err(TxError::Signing(
            "this signer cannot sign arbitrary messages".to_string(),
        ))
    }
}

/// Signs with keys derived from a seed held in memory.
pub struct SoftwareSigner {
    seed: Zeroizing<Vec<u8>>,
    vault: Box<dyn KeyVault>,
    network: Network,
    account_index: u32,
    address_index: u32,
}

impl SoftwareSigner {
    pub fn new(
        seed: Zeroizing<Vec<u8>>,
        network: Network,
        account_index: u32,
        address_index: u32,
    ) -> Self {
        Self::with_vault(
            seed,
            Box::new(Bip32Vault::new(network)),
            network,
            account_index,
            address_index,
        )
    }

    pub fn with_vault(
        seed: Zeroizing<Vec<u8>>,
        vault: Box<dyn KeyVault>,
        network: Network,
        account_index: u32,
        address_index: u32,
    ) -> Self {
        Self {
            seed,
            vault,
            network,
            account_index,
            address_index,
        }
    }

    fn secret_key(&self, info: &InputSigningInfo) -> Result<SecretKey> {
        let path = match &info.derivation_path {
            Some(path) => path.clone(),
            None => derivation_path(
                info.address_type.purpose(),
                self.network,
                self.account_index,
                self.address_index,
            )?,
        };
        let node = self.vault.derive_node(&self.seed, &path)?;
        if node.public_key != info.public_key {
            return Err(TxError::Signing(format!(
                "key at {} does not match input {}",
                path, info.index
            )));
        }
        Ok(node.private_key)
    }

    /// Signs synchronously; the async trait method is a thin wrapper.
    pub fn sign_inputs(&self, psbt: &mut Psbt, inputs: &[InputSigningInfo]) -> Result<()> {
        let secp = Secp256k1::new();
        let tx = psbt.unsigned_tx.clone();
        let mut cache = SighashCache::new(&tx);
        let mut prevouts: Option<Vec<TxOut>> = None;

        for info in inputs {
            let index = info.index;
            if index >= psbt.inputs.len() {
                return Err(TxError::invalid(format!("no input at index {}", index)));
            }
            let prevout = resolve_prevout(psbt, index)?;
            let secret = self.secret_key(info)?;

            if prevout.script_pubkey.is_p2tr() {
                if prevouts.is_none() {
                    let all = (0..tx.input.len())
                        .map(|i| resolve_prevout(psbt, i))
                        .collect::<Result<Vec<_>>>()?;
                    prevouts = Some(all);
                }
                let all = prevouts.as_deref().unwrap_or_default();
                let input = &mut psbt.inputs[index];
                let sighash_type = taproot_sighash_type(input.sighash_type)?;
                let sighash = cache
                    .taproot_key_spend_signature_hash(index, &Prevouts::All(all), sighash_type)
                    .map_err(|e| TxError::Signing(e.to_string()))?;

                let keypair = Keypair::from_secret_key(&secp, &secret)
                    .tap_tweak(&secp, input.tap_merkle_root)
                    .to_inner();
                let msg = Message::from_digest(sighash.to_byte_array());
                let signature = secp.sign_schnorr(&msg, &keypair);
                input.tap_key_sig = Some(taproot::Signature {
                    signature,
                    sighash_type,
                });
                debug!("schnorr signature for input {}", index);
                continue;
            }

            let input = &mut psbt.inputs[index];
            let sighash_type = ecdsa_sighash_type(input.sighash_type)?;
            let digest = if prevout.script_pubkey.is_p2pkh() {
                cache
                    .legacy_signature_hash(index, &prevout.script_pubkey, sighash_type.to_u32())
                    .map_err(|e| TxError::Signing(e.to_string()))?
                    .to_byte_array()
            } else {
                let program = if prevout.script_pubkey.is_p2sh() {
                    input.redeem_script.clone().ok_or(TxError::MissingScript {
                        index,
                        script: "redeem script",
                    })?
                } else {
                    prevout.script_pubkey.clone()
                };
                cache
                    .p2wpkh_signature_hash(index, &program, prevout.value, sighash_type)
                    .map_err(|e| TxError::Signing(e.to_string()))?
                    .to_byte_array()
            };

            let msg = Message::from_digest(digest);
            let signature = secp.sign_ecdsa(&msg, &secret);
            input.partial_sigs.insert(
                bitcoin::PublicKey::new(info.public_key),
                ecdsa::Signature {
                    signature,
                    sighash_type,
                },
            );
            debug!("ecdsa signature for input {}", index);
        }

        Ok(())
    }
}

#[async_trait]
impl PsbtSigner for SoftwareSigner {
    async fn sign(&self, psbt: &mut Psbt, inputs: &[InputSigningInfo]) -> Result<()> {
        self.sign_inputs(psbt, inputs)
    }

    async fn sign_digest_recoverable(
        &self,
        info: &InputSigningInfo,
        digest: [u8; 32],
    ) -> Result<RecoverableSignature> {
        let secret = self.secret_key(info)?;
        let secp = Secp256k1::signing_only();
        Ok(secp.sign_ecdsa_recoverable(&Message::from_digest(digest), &secret))
    }
}

fn ecdsa_sighash_type(requested: Option<PsbtSighashType>) -> Result<EcdsaSighashType> {
    match requested {
        None => Ok(EcdsaSighashType::All),
        Some(ty) => ty
            .ecdsa_hash_ty()
            .map_err(|e| TxError::invalid(format!("sighash: {}", e))),
    }
}

fn taproot_sighash_type(requested: Option<PsbtSighashType>) -> Result<TapSighashType> {
    match requested {
        None => Ok(TapSighashType::Default),
        Some(ty) => ty
            .taproot_hash_ty()
            .map_err(|e| TxError::invalid(format!("sighash: {}", e))),
    }
}

/// Where a signer gets its keys from.
pub enum KeySource {
    Seed(Zeroizing<Vec<u8>>),
    Device(Box<dyn DeviceTransport>),
}

pub fn parse_account_type(account_type: &str) -> Result<AccountType> {
    AccountType::from_str(account_type)
        .map_err(|ParseAccountTypeError(name)| TxError::UnrecognisedAccountType(name))
}

/// Picks the signer variant for an account once, up front.
pub fn signer_for(
    account_type: AccountType,
    source: KeySource,
    network: Network,
    account_index: u32,
    address_index: u32,
) -> Result<Box<dyn PsbtSigner>> {
    let signer: Box<dyn PsbtSigner> = match (account_type, source) {
        (AccountType::Software, KeySource::Seed(seed)) => Box::new(SoftwareSigner::new(
            seed,
            network,
            account_index,
            address_index,
        )),
        (AccountType::Ledger, KeySource::Device(transport)) => Box::new(LedgerSigner::new(
            transport,
            network,
            account_index,
            address_index,
        )),
        (AccountType::Keystone, KeySource::Device(transport)) => {
            Box::new(KeystoneSigner::new(transport))
        }
        (account_type, _) => {
            return Err(TxError::invalid(format!(
                "{:?} account needs a matching key source",
                account_type
            )))
        }
    };
    Ok(signer)
}

/// One entry of a sign request: which inputs an address should sign.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputToSign {
    pub address: String,
    pub signing_indexes: Vec<usize>,
    pub sighash: Option<u32>,
}

/// Signs the requested inputs of a base64 PSBT and returns it base64 encoded again.
pub async fn sign_psbt(
    account: &AccountContext,
    signer: &dyn PsbtSigner,
    psbt_base64: &str,
    inputs_to_sign: &[InputToSign],
    finalize: bool,
) -> Result<String> {
    let mut psbt = Psbt::from_str(psbt_base64.trim())
        .map_err(|e| TxError::invalid(format!("psbt: {}", e)))?;

    let mut infos = Vec::new();
    for request in inputs_to_sign {
        let ctx = account.context_for_address(&request.address)?;
        for &index in &request.signing_indexes {
            let input = psbt.inputs.get_mut(index).ok_or_else(|| {
                TxError::invalid(format!("signing index {} is out of range", index))
            })?;
            if let Some(sighash) = request.sighash {
                input.sighash_type = Some(PsbtSighashType::from_u32(sighash));
            }
            infos.push(ctx.signing_info(index));
        }
    }

    signer.sign(&mut psbt, &infos).await?;
    if finalize {
        let indexes: Vec<usize> = infos.iter().map(|info| info.index).collect();
        finalize_inputs(&mut psbt, &indexes)?;
    }

    Ok(psbt.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PsbtBuilder;
    use crate::context::tests::{account, utxo, MNEMONIC};
    use crate::keys::seed_from_mnemonic;
    use bitcoin::{Address, Amount};
    use datatypes::types::{AddressType, Recipient};

    fn software() -> SoftwareSigner {
        let seed = seed_from_mnemonic(MNEMONIC, "").unwrap();
        SoftwareSigner::new(seed, Network::Bitcoin, 0, 0)
    }

    fn mixed_psbt(acc: &AccountContext) -> String {
        let mut builder = PsbtBuilder::new(acc);
        builder.add_utxo(&utxo(acc.ordinals.address(), 10_000, 0)).unwrap();
        builder.add_utxo(&utxo(acc.payment.address(), 20_000, 1)).unwrap();
        let to = Address::from_str("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
            .unwrap()
            .assume_checked();
        builder.add_recipient(&Recipient::new(to, 29_000));
        builder.build().unwrap().to_base64()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn signs_and_finalizes_requested_inputs() {
        let acc = account(AddressType::P2wpkh);
        let signer = software();
        let request = vec![
            InputToSign {
                address: acc.ordinals.address().to_string(),
                signing_indexes: vec![0],
                sighash: None,
            },
            InputToSign {
                address: acc.payment.address().to_string(),
                signing_indexes: vec![1],
                sighash: None,
            },
        ];

        let signed = sign_psbt(&acc, &signer, &mixed_psbt(&acc), &request, true)
            .await
            .unwrap();
        let psbt = Psbt::from_str(&signed).unwrap();
        assert!(psbt.inputs.iter().all(|i| i.final_script_witness.is_some()));
        assert!(psbt.inputs[0].tap_internal_key.is_none());
        assert!(psbt.inputs[1].partial_sigs.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn partial_request_keeps_other_inputs_open() {
        let acc = account(AddressType::P2wpkh);
        let request = vec![InputToSign {
            address: acc.payment.address().to_string(),
            signing_indexes: vec![1],
            sighash: Some(EcdsaSighashType::AllPlusAnyoneCanPay.to_u32()),
        }];

        let signed = sign_psbt(&acc, &software(), &mixed_psbt(&acc), &request, false)
            .await
            .unwrap();
        let psbt = Psbt::from_str(&signed).unwrap();
        let (_, sig) = psbt.inputs[1].partial_sigs.iter().next().unwrap();
        assert_eq!(sig.sighash_type, EcdsaSighashType::AllPlusAnyoneCanPay);
        assert!(psbt.inputs[0].tap_key_sig.is_none());
        assert_eq!(psbt.unsigned_tx.output[0].value, Amount::from_sat(29_000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_unknown_address_and_bad_bytes() {
        let acc = account(AddressType::P2wpkh);
        let other = account(AddressType::P2shP2wpkh);
        let request = vec![InputToSign {
            address: other.payment.address().to_string(),
            signing_indexes: vec![0],
            sighash: None,
        }];
        let err = sign_psbt(&acc, &software(), &mixed_psbt(&acc), &request, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::AddressNotFound(_)));

        let err = sign_psbt(&acc, &software(), "not a psbt", &[], false)
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::InvalidInput(_)));

        let request = vec![InputToSign {
            address: acc.payment.address().to_string(),
            signing_indexes: vec![7],
            sighash: None,
        }];
        let err = sign_psbt(&acc, &software(), &mixed_psbt(&acc), &request, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::InvalidInput(_)));
    }

    #[test]
    fn wrong_key_is_refused() {
        let acc = account(AddressType::P2wpkh);
        let psbt_b64 = mixed_psbt(&acc);
        let mut psbt = Psbt::from_str(&psbt_b64).unwrap();
        let mut info = acc.payment.signing_info(1);
        info.public_key = acc.ordinals.public_key();
        assert!(matches!(
            software().sign_inputs(&mut psbt, &[info]),
            Err(TxError::Signing(_))
        ));
    }

    #[test]
    fn account_type_selection() {
        assert!(matches!(
            parse_account_type("trezor"),
            Err(TxError::UnrecognisedAccountType(name)) if name == "trezor"
        ));
        assert_eq!(parse_account_type("keystone").unwrap(), AccountType::Keystone);

        let seed = seed_from_mnemonic(MNEMONIC, "").unwrap();
        assert!(signer_for(AccountType::Software, KeySource::Seed(seed.clone()), Network::Bitcoin, 0, 0).is_ok());
        assert!(signer_for(AccountType::Ledger, KeySource::Seed(seed), Network::Bitcoin, 0, 0).is_err());
    }
}
