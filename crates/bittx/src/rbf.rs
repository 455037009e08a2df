use std::collections::{HashSet, VecDeque};

use bitcoin::{Address, Amount, OutPoint, Sequence, TxOut, Txid};
use datatypes::types::{Utxo, DUST_THRESHOLD};
use mempool::{ChainProvider, EsploraTransaction, FeeProvider};
use tracing::{debug, info};

use crate::builder::{PsbtBuilder, UnsignedPsbt};
use crate::context::AccountContext;
use crate::error::{Result, TxError};
use crate::vsize::estimate_vsize;

/// Deeper unconfirmed descendant chains are refused; the relay limit is 25.
pub const MAX_CHAIN_DEPTH: usize = 30;

/// Why `tx` cannot be replaced by this wallet, if it cannot.
pub fn rbf_ineligibility(tx: &EsploraTransaction, account: &AccountContext) -> Option<String> {
    if tx.status.confirmed {
        return Some("transaction is confirmed".to_string());
    }
    if !tx.vin.iter().any(|vin| vin.sequence().is_rbf()) {
        return Some("no input signals replaceability".to_string());
    }
    for (index, vin) in tx.vin.iter().enumerate() {
        let owned = vin
            .prevout
            .as_ref()
            .and_then(|prevout| prevout.script_pubkey().ok())
            .map_or(false, |script| account.owns_script(&script));
        if !owned {
            return Some(format!("input {} does not belong to the wallet", index));
        }
    }
    None
}

pub fn is_rbf_enabled(tx: &EsploraTransaction, account: &AccountContext) -> bool {
    rbf_ineligibility(tx, account).is_none()
}

/// Fee and size of a transaction together with its unconfirmed descendants.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainFee {
    pub fee: u64,
    pub vsize: f64,
    pub txids: Vec<Txid>,
}

/// Walks the unconfirmed descendants of `root` breadth first through outspends.
pub async fn discover_chain_fee(
    provider: &dyn ChainProvider,
    root_txid: Txid,
    root: &EsploraTransaction,
) -> Result<ChainFee> {
    let mut fee = root.fee;
    let mut vsize = root.vsize();
    let mut txids = vec![root_txid];
    let mut visited = HashSet::from([root_txid]);
    let mut pending = VecDeque::from([(root_txid, 0usize)]);

    while let Some((txid, depth)) = pending.pop_front() {
        for outspend in provider.get_transaction_outspends(&txid).await? {
            let Some(child) = outspend.spending_txid()? else {
                continue;
            };
            if !visited.insert(child) {
                continue;
            }
            if depth + 1 > MAX_CHAIN_DEPTH {
                return Err(TxError::ChainTooLong(MAX_CHAIN_DEPTH));
            }
            let child_tx = provider.get_transaction(&child).await?;
            if child_tx.status.confirmed {
                continue;
            }
            fee += child_tx.fee;
            vsize += child_tx.vsize();
            txids.push(child);
            pending.push_back((child, depth + 1));
        }
    }

    debug!(
        "chain of {} unconfirmed tx(s): fee {} vsize {}",
        txids.len(),
        fee,
        vsize
    );
    Ok(ChainFee { fee, vsize, txids })
}

/// The cheapest replacement a node will accept.
pub fn minimum_rbf_fee(chain: &ChainFee, original_vsize: f64) -> (u64, u64) {
    let fee = (chain.fee as f64 + chain.vsize).ceil() as u64;
    let rate = (fee as f64 / original_vsize).ceil() as u64;
    (fee, rate)
}

#[derive(Clone, Debug)]
pub struct CompiledReplacement {
    pub unsigned: UnsignedPsbt,
    pub fee: u64,
    pub vsize: usize,
    pub change: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RbfFeeSummary {
    pub fee_rate: u64,
    pub fee: u64,
    pub vsize: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RbfRecommendation {
    pub fee_rate: u64,
    pub enough_funds: bool,
    pub fee: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RbfTier {
    Medium,
    High,
    Higher,
    Highest,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RbfRecommendations {
    pub medium: Option<RbfRecommendation>,
    pub high: Option<RbfRecommendation>,
    pub higher: Option<RbfRecommendation>,
    pub highest: Option<RbfRecommendation>,
}

impl RbfRecommendations {
    fn slot(&mut self, tier: RbfTier) -> &mut Option<RbfRecommendation> {
        match tier {
            RbfTier::Medium => &mut self.medium,
            RbfTier::High => &mut self.high,
            RbfTier::Higher => &mut self.higher,
            RbfTier::Highest => &mut self.highest,
        }
    }
}

/// Tier rates derived from the mempool's half-hour and fastest rates.
pub fn recommended_tiers(
    minimum_rate: u64,
    half_hour: u64,
    fastest: u64,
) -> [(RbfTier, u64); 2] {
    let scaled = |rate: u64, tenths: u64| rate.saturating_mul(tenths).div_ceil(10);
    if minimum_rate <= half_hour {
        let medium = half_hour;
        [
            (RbfTier::Medium, medium),
            (RbfTier::High, fastest.max(medium.saturating_add(1))),
        ]
    } else if minimum_rate <= fastest {
        let high = fastest;
        let higher = high.saturating_add(1).max(scaled(high, 12));
        [(RbfTier::High, high), (RbfTier::Higher, higher)]
    } else {
        let higher = scaled(minimum_rate, 11);
        let highest = higher.saturating_add(1).max(scaled(minimum_rate, 12));
        [(RbfTier::Higher, higher), (RbfTier::Highest, highest)]
    }
}

/// An unconfirmed wallet transaction that may be replaced with a higher fee version.
pub struct RbfTransaction<'a> {
    provider: &'a dyn ChainProvider,
    account: &'a AccountContext,
    txid: Txid,
    tx: EsploraTransaction,
    chain: ChainFee,
    inputs: Vec<Utxo>,
    outputs: Vec<TxOut>,
    minimum_rbf_fee: u64,
    minimum_rbf_fee_rate: u64,
}

impl<'a> RbfTransaction<'a> {
    pub async fn new(
        provider: &'a dyn ChainProvider,
        account: &'a AccountContext,
        txid: Txid,
    ) -> Result<RbfTransaction<'a>> {
        let tx = provider.get_transaction(&txid).await?;
        if let Some(reason) = rbf_ineligibility(&tx, account) {
            info!("{} is not replaceable: {}", txid, reason);
            return Err(TxError::NotRbfEligible(txid));
        }

        let inputs = original_inputs(&tx, account)?;
        let payment_script = account.payment.script_pubkey();
        let mut outputs = tx
            .vout
            .iter()
            .map(|vout| -> Result<TxOut> {
                Ok(TxOut {
                    value: vout.amount(),
                    script_pubkey: vout.script_pubkey()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        // the last output back to the payment address is the change, any earlier one is a self-send
        if let Some(change) = outputs
            .iter()
            .rposition(|output| output.script_pubkey == payment_script)
        {
            outputs.remove(change);
        }

        let chain = discover_chain_fee(provider, txid, &tx).await?;
        let (minimum_rbf_fee, minimum_rbf_fee_rate) = minimum_rbf_fee(&chain, tx.vsize());

        Ok(Self {
            provider,
            account,
            txid,
            tx,
            chain,
            inputs,
            outputs,
            minimum_rbf_fee,
            minimum_rbf_fee_rate,
        })
    }

    pub fn txid(&self) -> Txid {
        self.txid
    }

    pub fn original_fee(&self) -> u64 {
        self.tx.fee
    }

    pub fn chain(&self) -> &ChainFee {
        &self.chain
    }

    pub fn minimum_rbf_fee(&self) -> u64 {
        self.minimum_rbf_fee
    }

    pub fn minimum_rbf_fee_rate(&self) -> u64 {
        self.minimum_rbf_fee_rate
    }

    /// Payment UTXOs that survive the replacement.
    async fn spendable_utxos(&self) -> Result<Vec<Utxo>> {
        let utxos = self
            .provider
            .get_unspent_utxos(self.account.payment.address())
            .await?;
        Ok(utxos)
    }

    pub async fn get_rbf_fee_summary(&self, fee_rate: u64) -> Result<RbfFeeSummary> {
        let compiled = self.get_replacement_transaction(fee_rate).await?;
        Ok(RbfFeeSummary {
            fee_rate,
            fee: compiled.fee,
            vsize: compiled.vsize,
        })
    }

    pub async fn get_replacement_transaction(&self, fee_rate: u64) -> Result<CompiledReplacement> {
        self.check_rate(fee_rate)?;
        let utxos = self.spendable_utxos().await?;
        self.compile(&utxos, fee_rate)
    }

    pub async fn get_rbf_recommended_fees(
        &self,
        fees: &dyn FeeProvider,
    ) -> Result<RbfRecommendations> {
        let mempool = fees.get_recommended_fees().await?;
        let utxos = self.spendable_utxos().await?;

        let mut recommendations = RbfRecommendations::default();
        for (tier, fee_rate) in recommended_tiers(
            self.minimum_rbf_fee_rate,
            mempool.half_hour_fee,
            mempool.fastest_fee,
        ) {
            let recommendation = match self.compile(&utxos, fee_rate) {
                Ok(compiled) => RbfRecommendation {
                    fee_rate,
                    enough_funds: true,
                    fee: Some(compiled.fee),
                },
                Err(e) if e.is_insufficient_funds() => RbfRecommendation {
                    fee_rate,
                    enough_funds: false,
                    fee: None,
                },
                Err(e) => return Err(e),
            };
            *recommendations.slot(tier) = Some(recommendation);
        }
        Ok(recommendations)
    }

    fn check_rate(&self, fee_rate: u64) -> Result<()> {
        if fee_rate < self.minimum_rbf_fee_rate {
            return Err(TxError::FeeRateTooLow {
                requested: fee_rate,
                minimum: self.minimum_rbf_fee_rate,
            });
        }
        Ok(())
    }

    /// Rebuilds the transaction at `fee_rate`, pulling in extra UTXOs one at a time.
    pub fn compile(&self, utxos: &[Utxo], fee_rate: u64) -> Result<CompiledReplacement> {
        self.check_rate(fee_rate)?;

        let spent: HashSet<OutPoint> = self.inputs.iter().map(|u| u.out_point).collect();
        let mut extras: Vec<&Utxo> = utxos
            .iter()
            .filter(|u| !spent.contains(&u.out_point))
            .filter(|u| !self.chain.txids.contains(&u.out_point.txid))
            .collect();
        extras.sort_by(|a, b| b.confirmed.cmp(&a.confirmed).then(b.value.cmp(&a.value)));

        let output_total: u64 = self.outputs.iter().map(|o| o.value.to_sat()).sum();
        let mut input_total: u64 = self.inputs.iter().map(|u| u.value.to_sat()).sum();
        let change_address = self.account.payment.address();

        for added in 0..=extras.len() {
            if added > 0 {
                input_total += extras[added - 1].value.to_sat();
            }
            if input_total < output_total {
                continue;
            }
            let surplus = input_total - output_total;

            let with_change = self.draft(&extras[..added], Some((change_address, 0)))?;
            let vsize = estimate_vsize(&with_change.psbt)?;
            let Some(required) = self.required_fee(vsize, fee_rate) else {
                return Err(unaffordable(input_total));
            };
            if required
                .checked_add(DUST_THRESHOLD)
                .is_some_and(|needed| surplus > needed)
            {
                let change = surplus - required;
                let unsigned = self.draft(&extras[..added], Some((change_address, change)))?;
                debug!(
                    "replacement with {} extra input(s), fee {} change {}",
                    added, required, change
                );
                return Ok(CompiledReplacement {
                    unsigned,
                    fee: required,
                    vsize,
                    change,
                });
            }

            let without_change = self.draft(&extras[..added], None)?;
            let vsize = estimate_vsize(&without_change.psbt)?;
            let Some(required) = self.required_fee(vsize, fee_rate) else {
                return Err(unaffordable(input_total));
            };
            if surplus >= required {
                debug!(
                    "replacement with {} extra input(s), fee {} without change",
                    added, surplus
                );
                return Ok(CompiledReplacement {
                    unsigned: without_change,
                    fee: surplus,
                    vsize,
                    change: 0,
                });
            }
        }

        let vsize_hint = self.tx.vsize().ceil() as usize;
        let required = self
            .required_fee(vsize_hint, fee_rate)
            .and_then(|fee| fee.checked_add(output_total))
            .unwrap_or(u64::MAX);
        Err(TxError::InsufficientFunds {
            required,
            available: input_total,
        })
    }

    /// `None` when the fee does not fit in a `u64`.
    fn required_fee(&self, vsize: usize, fee_rate: u64) -> Option<u64> {
        let vsize = vsize as u64;
        let at_rate = vsize.checked_mul(fee_rate)?;
        Some(at_rate.max(self.tx.fee.checked_add(vsize)?))
    }

    fn draft(&self, extras: &[&Utxo], change: Option<(&Address, u64)>) -> Result<UnsignedPsbt> {
        let mut builder =
            PsbtBuilder::new(self.account).with_sequence(Sequence::ENABLE_RBF_NO_LOCKTIME);
        builder.add_utxos(&self.inputs)?;
        for utxo in extras {
            builder.add_utxo(utxo)?;
        }
        for output in &self.outputs {
            builder.add_output(output.clone());
        }
        if let Some((address, value)) = change {
            builder.set_change(address, Amount::from_sat(value));
        }
        builder.build()
    }
}

fn unaffordable(available: u64) -> TxError {
    TxError::InsufficientFunds {
        required: u64::MAX,
        available,
    }
}

fn original_inputs(tx: &EsploraTransaction, account: &AccountContext) -> Result<Vec<Utxo>> {
    let mut inputs = Vec::with_capacity(tx.vin.len());
    for (index, vin) in tx.vin.iter().enumerate() {
        let prevout = vin.prevout.as_ref().ok_or(TxError::MissingPrevout(index))?;
        let script_pubkey = prevout.script_pubkey()?;
        let address = Address::from_script(&script_pubkey, account.network)
            .map_err(|e| TxError::invalid(format!("input {}: {}", index, e)))?;
        inputs.push(Utxo {
            out_point: vin.out_point()?,
            value: prevout.amount(),
            address,
            confirmed: true,
            block_height: None,
        });
    }
    Ok(inputs)
}
