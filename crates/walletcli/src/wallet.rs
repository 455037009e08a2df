use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use bitcoin::{Address, Network, Transaction, Txid};
use bittx::keys::{seed_from_mnemonic, Bip32Vault};
use bittx::message::{sign_message, verify_message};
use bittx::rbf::{RbfRecommendations, RbfTransaction};
use bittx::signer::{parse_account_type, sign_psbt, signer_for, InputToSign, KeySource};
use bittx::{
    build_send_psbt, extract_transaction, finalize_psbt, send_btc, AccountContext,
    DummySignatureSizer, PsbtSigner, UnsignedPsbt,
};
use datatypes::types::{
    AccountType, MessageSigningProtocol, RecommendedFees, Recipient, SignedMessage,
    TransactionUtxoSelectionMetadata, Utxo,
};
use mempool::{default_base_url, ChainProvider, EsploraClient, FeeProvider};
use tracing::info;

use crate::config::Config;

/// A software account bound to one Esplora endpoint.
pub struct Wallet {
    network: Network,
    client: EsploraClient,
    account: AccountContext,
    signer: Box<dyn PsbtSigner>,
}

/// Replacement pricing for one pending transaction.
#[derive(Debug)]
pub struct RbfReport {
    pub minimum_fee: u64,
    pub minimum_fee_rate: u64,
    pub recommendations: Option<RbfRecommendations>,
    pub replacement: Option<Transaction>,
}

impl Wallet {
    pub fn open(cfg: &Config) -> Result<Self> {
        let network = cfg.network.network;
        let account_type = parse_account_type(&cfg.wallet.account_type)?;
        if account_type != AccountType::Software {
            return Err(anyhow!(
                "{:?} accounts need a device transport, only software accounts run here",
                account_type
            ));
        }

        let url = match &cfg.mempool.url {
            Some(url) => url.clone(),
            None => default_base_url(network)
                .ok_or_else(|| anyhow!("no default mempool url for {}", network))?,
        };

        let seed = seed_from_mnemonic(&cfg.wallet.mnemonic, &cfg.wallet.passphrase)?;
        let account = AccountContext::from_seed(
            &Bip32Vault::new(network),
            &seed,
            network,
            account_type,
            cfg.wallet.payment_type,
            cfg.wallet.account_index,
            cfg.wallet.address_index,
        )?;
        let signer = signer_for(
            account_type,
            KeySource::Seed(seed),
            network,
            cfg.wallet.account_index,
            cfg.wallet.address_index,
        )?;

        info!(
            "payment {} ordinals {} via {}",
            account.payment.address(),
            account.ordinals.address(),
            url
        );
        Ok(Self {
            network,
            client: EsploraClient::new(url, network),
            account,
            signer,
        })
    }

    pub fn account(&self) -> &AccountContext {
        &self.account
    }

    pub async fn fees(&self) -> Result<RecommendedFees> {
        self.client.get_recommended_fees().await
    }

    pub async fn utxos(&self) -> Result<Vec<Utxo>> {
        self.client
            .get_unspent_utxos(self.account.payment.address())
            .await
    }

    fn recipient(&self, to: &str, amount: u64) -> Result<Recipient> {
        let address = Address::from_str(to)?.require_network(self.network)?;
        Ok(Recipient::new(address, amount))
    }

    pub async fn select(
        &self,
        to: &str,
        amount: u64,
        fee_rate: f64,
    ) -> Result<(UnsignedPsbt, TransactionUtxoSelectionMetadata)> {
        let recipient = self.recipient(to, amount)?;
        let utxos = self.utxos().await?;
        Ok(build_send_psbt(
            &self.account,
            &utxos,
            &[recipient],
            fee_rate,
            &DummySignatureSizer,
        )?)
    }

    pub async fn send(&self, to: &str, amount: u64, fee_rate: f64) -> Result<Transaction> {
        let recipient = self.recipient(to, amount)?;
        let tx = send_btc(
            &self.client,
            &self.account,
            self.signer.as_ref(),
            &[recipient],
            fee_rate,
            &DummySignatureSizer,
        )
        .await?;
        Ok(tx)
    }

    pub async fn rbf(&self, txid: &str, fee_rate: Option<u64>) -> Result<RbfReport> {
        let txid = Txid::from_str(txid).context("invalid txid")?;
        let rbf = RbfTransaction::new(&self.client, &self.account, txid).await?;
        let mut report = RbfReport {
            minimum_fee: rbf.minimum_rbf_fee(),
            minimum_fee_rate: rbf.minimum_rbf_fee_rate(),
            recommendations: None,
            replacement: None,
        };

        match fee_rate {
            None => {
                report.recommendations = Some(rbf.get_rbf_recommended_fees(&self.client).await?);
            }
            Some(fee_rate) => {
                let mut compiled = rbf.get_replacement_transaction(fee_rate).await?;
                let psbt = &mut compiled.unsigned.psbt;
                self.signer.sign(psbt, &compiled.unsigned.inputs).await?;
                finalize_psbt(psbt)?;
                info!(
                    "replacement of {} pays {} sats ({} vB)",
                    txid, compiled.fee, compiled.vsize
                );
                report.replacement = Some(extract_transaction(compiled.unsigned.psbt));
            }
        }
        Ok(report)
    }

    pub async fn sign_psbt(
        &self,
        psbt: &str,
        address: &str,
        indexes: Vec<usize>,
        finalize: bool,
    ) -> Result<String> {
        let request = InputToSign {
            address: address.to_string(),
            signing_indexes: indexes,
            sighash: None,
        };
        Ok(sign_psbt(&self.account, self.signer.as_ref(), psbt, &[request], finalize).await?)
    }

    pub async fn sign_message(
        &self,
        address: Option<&str>,
        message: &str,
        protocol: Option<MessageSigningProtocol>,
    ) -> Result<SignedMessage> {
        let payment = self.account.payment.address().to_string();
        let address = address.unwrap_or(&payment);
        Ok(sign_message(&self.account, self.signer.as_ref(), address, message, protocol).await?)
    }

    pub fn verify_message(&self, address: &str, message: &str, signature: &str) -> Result<bool> {
        Ok(verify_message(address, message, signature, self.network)?)
    }

    pub async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let txid = self.client.send_tx(tx).await?;
        info!("broadcast {}", txid);
        Ok(txid)
    }
}
