pub mod fees;
pub mod tx;
pub mod utxo;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::{Address, Network, Transaction, Txid};
use datatypes::types;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

pub use tx::{EsploraTransaction, EsploraVin, EsploraVout, Outspend, TxStatus};

const MEMPOOL_URL: &str = "https://mempool.space";

/// Source of UTXOs and transaction history for the wallet's addresses.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn get_unspent_utxos(&self, address: &Address) -> Result<Vec<types::Utxo>>;

    async fn get_transaction(&self, txid: &Txid) -> Result<EsploraTransaction>;

    /// One entry per output of `txid`, telling whether and by whom it was spent.
    async fn get_transaction_outspends(&self, txid: &Txid) -> Result<Vec<Outspend>>;
}

#[async_trait]
pub trait FeeProvider: Send + Sync {
    async fn get_recommended_fees(&self) -> Result<types::RecommendedFees>;
}

/// Default mempool.space endpoint for a network. Regtest has no public instance.
pub fn default_base_url(network: Network) -> Option<String> {
    match network {
        Network::Bitcoin => Some(MEMPOOL_URL.to_string()),
        Network::Testnet => Some(format!("{}/testnet", MEMPOOL_URL)),
        Network::Signet => Some(format!("{}/signet", MEMPOOL_URL)),
        _ => None,
    }
}

/// Esplora REST client bound to one endpoint and network.
#[derive(Clone, Debug)]
pub struct EsploraClient {
    base_url: String,
    network: Network,
    http: Client,
}

impl EsploraClient {
    pub fn new(base_url: impl Into<String>, network: Network) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            network,
            http: Client::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!("GET {}", url);
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn send_tx(&self, tx: &Transaction) -> Result<Txid> {
        tx::send_tx(self, tx).await
    }
}

#[async_trait]
impl ChainProvider for EsploraClient {
    async fn get_unspent_utxos(&self, address: &Address) -> Result<Vec<types::Utxo>> {
        utxo::get_unspent_utxos(self, address).await
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<EsploraTransaction> {
        tx::get_transaction(self, txid).await
    }

    async fn get_transaction_outspends(&self, txid: &Txid) -> Result<Vec<Outspend>> {
        tx::get_outspends(self, txid).await
    }
}

#[async_trait]
impl FeeProvider for EsploraClient {
    async fn get_recommended_fees(&self) -> Result<types::RecommendedFees> {
        fees::get_recommended_fees(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_api_urls() {
        let client = EsploraClient::new("https://mempool.space/testnet/", Network::Testnet);
        assert_eq!(
            client.url("/tx/abcd/outspends"),
            "https://mempool.space/testnet/api/tx/abcd/outspends"
        );
        assert_eq!(client.network(), Network::Testnet);
    }

    #[test]
    fn default_urls_per_network() {
        assert_eq!(
            default_base_url(Network::Bitcoin).as_deref(),
            Some("https://mempool.space")
        );
        assert_eq!(
            default_base_url(Network::Signet).as_deref(),
            Some("https://mempool.space/signet")
        );
        assert!(default_base_url(Network::Regtest).is_none());
    }
}
