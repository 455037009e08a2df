use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::{Address, Txid};
use datatypes::types::{RecommendedFees, Utxo};
use mempool::{ChainProvider, EsploraTransaction, FeeProvider, Outspend};

/// In-memory chain: UTXOs per address plus transactions and their outspends.
#[derive(Default)]
pub(crate) struct MockChain {
    pub utxos: HashMap<String, Vec<Utxo>>,
    pub txs: HashMap<Txid, EsploraTransaction>,
    pub outspends: HashMap<Txid, Vec<Outspend>>,
}

#[async_trait]
impl ChainProvider for MockChain {
    async fn get_unspent_utxos(&self, address: &Address) -> anyhow::Result<Vec<Utxo>> {
        Ok(self.utxos.get(&address.to_string()).cloned().unwrap_or_default())
    }

    async fn get_transaction(&self, txid: &Txid) -> anyhow::Result<EsploraTransaction> {
        self.txs
            .get(txid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("transaction {} not found", txid))
    }

    async fn get_transaction_outspends(&self, txid: &Txid) -> anyhow::Result<Vec<Outspend>> {
        Ok(self.outspends.get(txid).cloned().unwrap_or_default())
    }
}

pub(crate) struct MockFees(pub RecommendedFees);

#[async_trait]
impl FeeProvider for MockFees {
    async fn get_recommended_fees(&self) -> anyhow::Result<RecommendedFees> {
        Ok(self.0)
    }
}
