use async_trait::async_trait;
use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpub};
use bitcoin::{ecdsa, taproot, Network, Psbt};
use datatypes::types::AddressType;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::InputSigningInfo;
use crate::error::{Result, TxError};
use crate::keys::{account_path, derivation_path};
use crate::signer::PsbtSigner;

/// Device signing order for mixed transactions.
pub const LEDGER_SIGNING_ORDER: [AddressType; 3] =
    [AddressType::P2tr, AddressType::P2wpkh, AddressType::P2shP2wpkh];

/// A signature handed back by a device for one input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceSignature {
    Ecdsa(bitcoin::PublicKey, ecdsa::Signature),
    Schnorr(taproot::Signature),
}

/// Ledger style wallet policy: a descriptor template and its key expressions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletPolicy {
    pub name: String,
    pub descriptor_template: String,
    pub keys: Vec<String>,
}

impl WalletPolicy {
    pub fn single_key(
        address_type: AddressType,
        fingerprint: Fingerprint,
        account_path: &DerivationPath,
        xpub: &Xpub,
    ) -> Self {
        let descriptor_template = match address_type {
            AddressType::P2wpkh => "wpkh(@0/**)",
            AddressType::P2shP2wpkh => "sh(wpkh(@0/**))",
            AddressType::P2tr => "tr(@0/**)",
        };
        Self {
            name: String::new(),
            descriptor_template: descriptor_template.to_string(),
            keys: vec![format!("[{}/{}]{}", fingerprint, origin_path(account_path), xpub)],
        }
    }
}

/// `84'/0'/0'` without the leading `m`.
fn origin_path(path: &DerivationPath) -> String {
    path.into_iter()
        .map(|child| match child {
            ChildNumber::Hardened { index } => format!("{}'", index),
            ChildNumber::Normal { index } => index.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// The wire to a hardware wallet. One session at a time.
#[async_trait]
pub trait DeviceTransport: Send {
    async fn master_fingerprint(&mut self) -> anyhow::Result<Fingerprint>;

    async fn extended_pubkey(&mut self, path: &DerivationPath) -> anyhow::Result<Xpub>;

    async fn sign_psbt(
        &mut self,
        policy: Option<&WalletPolicy>,
        psbt: &Psbt,
    ) -> anyhow::Result<Vec<(usize, DeviceSignature)>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SigningProgress {
    Started {
        address_type: AddressType,
        inputs: Vec<usize>,
    },
    Signed {
        address_type: AddressType,
        signatures: usize,
    },
}

fn apply_signatures(
    psbt: &mut Psbt,
    requested: &[usize],
    signatures: Vec<(usize, DeviceSignature)>,
) -> Result<usize> {
    let mut applied = 0;
    for (index, signature) in signatures {
        if !requested.contains(&index) {
            debug!("ignoring unrequested signature for input {}", index);
            continue;
        }
        let input = psbt.inputs.get_mut(index).ok_or_else(|| {
            TxError::Signing(format!("device signed missing input {}", index))
        })?;
        match signature {
            DeviceSignature::Ecdsa(public_key, sig) => {
                input.partial_sigs.insert(public_key, sig);
            }
            DeviceSignature::Schnorr(sig) => input.tap_key_sig = Some(sig),
        }
        applied += 1;
    }
    Ok(applied)
}

/// Signs through a Ledger, one wallet policy per address family.
pub struct LedgerSigner {
    transport: Mutex<Box<dyn DeviceTransport>>,
    network: Network,
    account_index: u32,
    address_index: u32,
    progress: Option<UnboundedSender<SigningProgress>>,
}

impl LedgerSigner {
    pub fn new(
        transport: Box<dyn DeviceTransport>,
        network: Network,
        account_index: u32,
        address_index: u32,
    ) -> Self {
        Self {
            transport: Mutex::new(transport),
            network,
            account_index,
            address_index,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: UnboundedSender<SigningProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, event: SigningProgress) {
        if let Some(progress) = &self.progress {
            if progress.send(event).is_err() {
                warn!("signing progress receiver dropped");
            }
        }
    }

    /// Fills in key origins the device needs to recognise its own inputs.
    fn add_key_origins(
        &self,
        psbt: &mut Psbt,
        group: &[&InputSigningInfo],
        fingerprint: Fingerprint,
    ) -> Result<()> {
        for info in group {
            let path = match &info.derivation_path {
                Some(path) => path.clone(),
                None => derivation_path(
                    info.address_type.purpose(),
                    self.network,
                    self.account_index,
                    self.address_index,
                )?,
            };
            let origin = (info.master_fingerprint.unwrap_or(fingerprint), path);
            let input = &mut psbt.inputs[info.index];
            match info.address_type {
                AddressType::P2tr => {
                    let xonly = info.public_key.x_only_public_key().0;
                    input.tap_internal_key.get_or_insert(xonly);
                    input
                        .tap_key_origins
                        .entry(xonly)
                        .or_insert_with(|| (Vec::new(), origin));
                }
                _ => {
                    input
                        .bip32_derivation
                        .entry(info.public_key)
                        .or_insert(origin);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PsbtSigner for LedgerSigner {
    async fn sign(&self, psbt: &mut Psbt, inputs: &[InputSigningInfo]) -> Result<()> {
        if let Some(info) = inputs.iter().find(|info| info.index >= psbt.inputs.len()) {
            return Err(TxError::invalid(format!("no input at index {}", info.index)));
        }
        let mut device = self.transport.lock().await;
        let fingerprint = device.master_fingerprint().await?;

        for address_type in LEDGER_SIGNING_ORDER {
            let group: Vec<&InputSigningInfo> = inputs
                .iter()
                .filter(|info| info.address_type == address_type)
                .collect();
            if group.is_empty() {
                continue;
            }
            let indexes: Vec<usize> = group.iter().map(|info| info.index).collect();
            self.add_key_origins(psbt, &group, fingerprint)?;

            let account = account_path(&derivation_path(
                address_type.purpose(),
                self.network,
                self.account_index,
                0,
            )?);
            let xpub = device.extended_pubkey(&account).await?;
            let policy = WalletPolicy::single_key(address_type, fingerprint, &account, &xpub);

            self.report(SigningProgress::Started {
                address_type,
                inputs: indexes.clone(),
            });
            info!(
                "ledger signing {} {} input(s) with {}",
                indexes.len(),
                address_type,
                policy.descriptor_template
            );
            let signatures = device.sign_psbt(Some(&policy), psbt).await?;
            let applied = apply_signatures(psbt, &indexes, signatures)?;
            self.report(SigningProgress::Signed {
                address_type,
                signatures: applied,
            });
        }

        Ok(())
    }
}

/// Signs through a Keystone in a single round trip.
pub struct KeystoneSigner {
    transport: Mutex<Box<dyn DeviceTransport>>,
}

impl KeystoneSigner {
    pub fn new(transport: Box<dyn DeviceTransport>) -> Self {
        Self {
            transport: Mutex::new(transport),
        }
    }
}

#[async_trait]
impl PsbtSigner for KeystoneSigner {
    async fn sign(&self, psbt: &mut Psbt, inputs: &[InputSigningInfo]) -> Result<()> {
        let indexes: Vec<usize> = inputs.iter().map(|info| info.index).collect();
        let mut device = self.transport.lock().await;
        let signatures = device.sign_psbt(None, psbt).await?;
        let applied = apply_signatures(psbt, &indexes, signatures)?;
        info!("keystone returned {} signature(s)", applied);
        Ok(())
    }
}
