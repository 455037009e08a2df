use bitcoin::{Address, Amount, Psbt};
use datatypes::types::{Recipient, TransactionUtxoSelectionMetadata, Utxo, DUST_THRESHOLD};
use tracing::debug;

use crate::builder::PsbtBuilder;
use crate::context::AccountContext;
use crate::error::{Result, TxError};
use crate::vsize::TransactionSizer;

/// Rough per-output and per-input vbytes used to reject hopeless selections early.
const OUTPUT_VBYTES_HINT: u64 = 45;
const INPUT_VBYTES_HINT: u64 = 85;

/// Prices one candidate input set with and without a change output.
pub struct TransactionMetadataCalculator<'a> {
    account: &'a AccountContext,
    sizer: &'a dyn TransactionSizer,
}

impl<'a> TransactionMetadataCalculator<'a> {
    pub fn new(account: &'a AccountContext, sizer: &'a dyn TransactionSizer) -> Self {
        Self { account, sizer }
    }

    pub fn calculate(
        &self,
        recipients: &[Recipient],
        selected: &[Utxo],
        change_address: &Address,
        fee_rate: f64,
    ) -> Result<Option<TransactionUtxoSelectionMetadata>> {
        let input_sum: u64 = selected.iter().map(|u| u.value.to_sat()).sum();
        let recipient_total = recipient_total(recipients);
        let hint = (OUTPUT_VBYTES_HINT * (recipients.len() as u64 + 1)
            + INPUT_VBYTES_HINT * selected.len() as u64) as f64
            * fee_rate;
        if input_sum as f64 <= recipient_total as f64 + hint {
            return Ok(None);
        }
        let surplus = input_sum - recipient_total;

        let with_change = self.draft(recipients, selected, Some((change_address, surplus)))?;
        let vsize = self.sizer.vsize(&with_change)?;
        let fee = (vsize as f64 * fee_rate).ceil() as u64;
        if surplus > fee + DUST_THRESHOLD {
            return Ok(Some(TransactionUtxoSelectionMetadata {
                selected_utxos: selected.to_vec(),
                fee: Amount::from_sat(fee),
                fee_rate: fee as f64 / vsize as f64,
                change: Amount::from_sat(surplus - fee),
            }));
        }

        let without_change = self.draft(recipients, selected, None)?;
        let vsize = self.sizer.vsize(&without_change)?;
        let actual_rate = surplus as f64 / vsize as f64;
        if actual_rate >= fee_rate {
            return Ok(Some(TransactionUtxoSelectionMetadata {
                selected_utxos: selected.to_vec(),
                fee: Amount::from_sat(surplus),
                fee_rate: actual_rate,
                change: Amount::ZERO,
            }));
        }

        Ok(None)
    }

    fn draft(
        &self,
        recipients: &[Recipient],
        selected: &[Utxo],
        change: Option<(&Address, u64)>,
    ) -> Result<Psbt> {
        let mut builder = PsbtBuilder::new(self.account);
        builder.add_utxos(selected)?;
        for recipient in recipients {
            builder.add_recipient(recipient);
        }
        if let Some((address, value)) = change {
            builder.set_change(address, Amount::from_sat(value));
        }
        Ok(builder.build()?.psbt)
    }
}

pub fn recipient_total(recipients: &[Recipient]) -> u64 {
    recipients.iter().map(|r| r.amount.to_sat()).sum()
}

struct Frame {
    selected: Vec<Utxo>,
    /// Sorted ascending once the frame is entered; children are popped from the end.
    remaining: Vec<Utxo>,
    best: Option<TransactionUtxoSelectionMetadata>,
    bound: Option<usize>,
    entered: bool,
}

impl Frame {
    fn new(selected: Vec<Utxo>, remaining: Vec<Utxo>, bound: Option<usize>) -> Self {
        Self {
            selected,
            remaining,
            best: None,
            bound,
            entered: false,
        }
    }
}

enum Step {
    Return(Option<TransactionUtxoSelectionMetadata>),
    Descend(Frame),
}

/// Searches for the input set with the lowest fee, preferring more change on a tie.
///
/// Candidates are tried largest first. A feasible set is never extended, a
/// branch needing more inputs than the best set found so far is cut, and
/// siblings stop as soon as the fee starts rising.
pub struct UtxoSelector<'a> {
    calculator: TransactionMetadataCalculator<'a>,
}

impl<'a> UtxoSelector<'a> {
    pub fn new(account: &'a AccountContext, sizer: &'a dyn TransactionSizer) -> Self {
        Self {
            calculator: TransactionMetadataCalculator::new(account, sizer),
        }
    }

    pub fn select(
        &self,
        recipients: &[Recipient],
        utxos: &[Utxo],
        change_address: &Address,
        fee_rate: f64,
    ) -> Result<Option<TransactionUtxoSelectionMetadata>> {
        if recipients.is_empty() {
            return Err(TxError::invalid("no recipients"));
        }
        if !(fee_rate > 0.0) {
            return Err(TxError::invalid(format!("fee rate must be positive, got {}", fee_rate)));
        }
        let target = recipient_total(recipients);

        let mut stack = vec![Frame::new(Vec::new(), utxos.to_vec(), None)];
        let mut returned: Option<Option<TransactionUtxoSelectionMetadata>> = None;

        while let Some(frame) = stack.last_mut() {
            let step = if !frame.entered {
                frame.entered = true;
                self.enter(frame, recipients, change_address, fee_rate, target)?
            } else {
                match returned.take() {
                    Some(child) => Self::accept_child(frame, child),
                    None => None,
                }
                .unwrap_or_else(|| Self::next_child(frame))
            };

            match step {
                Step::Return(result) => {
                    stack.pop();
                    returned = Some(result);
                }
                Step::Descend(child) => stack.push(child),
            }
        }

        let best = returned.flatten();
        match &best {
            Some(meta) => debug!(
                "selected {} of {} utxos, fee {} change {}",
                meta.selected_utxos.len(),
                utxos.len(),
                meta.fee,
                meta.change
            ),
            None => debug!("no feasible selection among {} utxos", utxos.len()),
        }
        Ok(best)
    }

    fn enter(
        &self,
        frame: &mut Frame,
        recipients: &[Recipient],
        change_address: &Address,
        fee_rate: f64,
        target: u64,
    ) -> Result<Step> {
        let selected_sum: u64 = frame.selected.iter().map(|u| u.value.to_sat()).sum();
        let remaining_sum: u64 = frame.remaining.iter().map(|u| u.value.to_sat()).sum();
        if selected_sum + remaining_sum <= target {
            return Ok(Step::Return(None));
        }

        if !frame.selected.is_empty() {
            let meta = self
                .calculator
                .calculate(recipients, &frame.selected, change_address, fee_rate)?;
            if meta.is_some() {
                return Ok(Step::Return(meta));
            }
        }

        if let Some(bound) = frame.bound {
            if frame.selected.len() + 1 > bound {
                return Ok(Step::Return(None));
            }
        }

        frame.remaining.sort_by_key(|u| u.value);
        Ok(Self::next_child(frame))
    }

    /// Folds a child's result into the frame. `Some` ends the frame early.
    fn accept_child(
        frame: &mut Frame,
        child: Option<TransactionUtxoSelectionMetadata>,
    ) -> Option<Step> {
        let Some(child) = child else {
            return Some(Step::Return(frame.best.take()));
        };

        match &frame.best {
            None => frame.best = Some(child),
            Some(best) if child.fee < best.fee => frame.best = Some(child),
            Some(best) if child.fee == best.fee && child.change > best.change => {
                frame.best = Some(child)
            }
            Some(best) if child.fee > best.fee => return Some(Step::Return(frame.best.take())),
            Some(_) => {}
        }
        None
    }

    fn next_child(frame: &mut Frame) -> Step {
        match frame.remaining.pop() {
            Some(utxo) => {
                let mut selected = frame.selected.clone();
                selected.push(utxo);
                let bound = frame
                    .best
                    .as_ref()
                    .map(|best| best.selected_utxos.len())
                    .or(frame.bound);
                Step::Descend(Frame::new(selected, frame.remaining.clone(), bound))
            }
            None => Step::Return(frame.best.take()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::tests::{account, utxo};
    use crate::vsize::DummySignatureSizer;
    use datatypes::types::AddressType;
    use proptest::prelude::*;
    use std::str::FromStr;

    /// Every transaction weighs the same.
    pub(crate) struct FixedSizer(pub usize);

    impl TransactionSizer for FixedSizer {
        fn vsize(&self, _psbt: &Psbt) -> Result<usize> {
            Ok(self.0)
        }
    }

    /// Each input adds `per_input` vbytes on top of `base`.
    struct PerInputSizer {
        base: usize,
        per_input: usize,
    }

    impl TransactionSizer for PerInputSizer {
        fn vsize(&self, psbt: &Psbt) -> Result<usize> {
            Ok(self.base + self.per_input * psbt.inputs.len())
        }
    }

    fn recipient(sats: u64) -> Recipient {
        let address = Address::from_str("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
            .unwrap()
            .assume_checked();
        Recipient::new(address, sats)
    }

    fn wallet_utxos(acc: &AccountContext, values: &[u64]) -> Vec<Utxo> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| utxo(acc.payment.address(), *v, i as u32))
            .collect()
    }

    fn values(meta: &TransactionUtxoSelectionMetadata) -> Vec<u64> {
        meta.selected_utxos.iter().map(|u| u.value.to_sat()).collect()
    }

    #[test]
    fn picks_single_large_utxo() {
        let acc = account(AddressType::P2wpkh);
        let sizer = FixedSizer(188);
        let selector = UtxoSelector::new(&acc, &sizer);
        let utxos = wallet_utxos(&acc, &[10000, 3000, 384000, 792000, 546]);

        let meta = selector
            .select(&[recipient(60000)], &utxos, acc.payment.address(), 10.0)
            .unwrap()
            .unwrap();

        assert_eq!(values(&meta), vec![792000]);
        assert_eq!(meta.fee, Amount::from_sat(1880));
        assert_eq!(meta.change, Amount::from_sat(730120));
        assert_eq!(meta.fee_rate, 10.0);
    }

    #[test]
    fn rejects_bad_requests() {
        let acc = account(AddressType::P2wpkh);
        let sizer = FixedSizer(188);
        let selector = UtxoSelector::new(&acc, &sizer);
        let utxos = wallet_utxos(&acc, &[10000]);

        let err = selector
            .select(&[], &utxos, acc.payment.address(), 10.0)
            .unwrap_err();
        assert!(matches!(err, TxError::InvalidInput(_)));

        for rate in [0.0, -1.0, f64::NAN] {
            let err = selector
                .select(&[recipient(1000)], &utxos, acc.payment.address(), rate)
                .unwrap_err();
            assert!(matches!(err, TxError::InvalidInput(_)));
        }
    }

    #[test]
    fn none_when_funds_fall_short() {
        let acc = account(AddressType::P2wpkh);
        let sizer = FixedSizer(188);
        let selector = UtxoSelector::new(&acc, &sizer);
        let utxos = wallet_utxos(&acc, &[10000, 20000, 30000]);

        let result = selector
            .select(&[recipient(70000)], &utxos, acc.payment.address(), 1.0)
            .unwrap();
        assert!(result.is_none());

        let result = selector
            .select(&[recipient(59000)], &utxos, acc.payment.address(), 1.0)
            .unwrap();
        assert_eq!(values(&result.unwrap()), vec![30000, 20000, 10000]);
    }

    #[test]
    fn equal_fee_prefers_more_change() {
        let acc = account(AddressType::P2wpkh);
        let sizer = FixedSizer(200);
        let selector = UtxoSelector::new(&acc, &sizer);
        let utxos = wallet_utxos(&acc, &[100000, 200000]);

        let meta = selector
            .select(&[recipient(50000)], &utxos, acc.payment.address(), 2.0)
            .unwrap()
            .unwrap();
        assert_eq!(values(&meta), vec![200000]);
        assert_eq!(meta.change, Amount::from_sat(149600));
    }

    #[test]
    fn fewer_inputs_win_when_fees_grow_per_input() {
        let acc = account(AddressType::P2wpkh);
        let sizer = PerInputSizer {
            base: 60,
            per_input: 70,
        };
        let selector = UtxoSelector::new(&acc, &sizer);
        let utxos = wallet_utxos(&acc, &[30000, 30000, 30000, 65000]);

        let meta = selector
            .select(&[recipient(60000)], &utxos, acc.payment.address(), 5.0)
            .unwrap()
            .unwrap();
        assert_eq!(values(&meta), vec![65000]);
        assert_eq!(meta.fee, Amount::from_sat(650));
    }

    #[test]
    fn no_change_when_surplus_is_dust() {
        let acc = account(AddressType::P2wpkh);
        let sizer = FixedSizer(150);
        let selector = UtxoSelector::new(&acc, &sizer);
        let utxos = wallet_utxos(&acc, &[52500]);

        let meta = selector
            .select(&[recipient(50000)], &utxos, acc.payment.address(), 10.0)
            .unwrap()
            .unwrap();
        assert_eq!(meta.change, Amount::ZERO);
        assert_eq!(meta.fee, Amount::from_sat(2500));
    }

    #[test]
    fn real_estimator_prices_selection() {
        let acc = account(AddressType::P2shP2wpkh);
        let sizer = DummySignatureSizer;
        let selector = UtxoSelector::new(&acc, &sizer);
        let utxos = wallet_utxos(&acc, &[20000, 40000, 80000]);

        let meta = selector
            .select(&[recipient(50000)], &utxos, acc.payment.address(), 3.0)
            .unwrap()
            .unwrap();
        assert_eq!(values(&meta), vec![80000]);
        assert_eq!(
            meta.change.to_sat() + meta.fee.to_sat() + 50000,
            80000
        );
        assert!(meta.fee_rate >= 3.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn no_selection_means_no_feasible_subset(
            values in prop::collection::vec(1_000u64..200_000, 2..=6),
            amount in 1_000u64..400_000,
            fee_rate in 1u64..50,
        ) {
            let acc = account(AddressType::P2wpkh);
            let sizer = DummySignatureSizer;
            let utxos = wallet_utxos(&acc, &values);
            let recipients = [recipient(amount)];
            let change = acc.payment.address();
            let fee_rate = fee_rate as f64;

            let selected = UtxoSelector::new(&acc, &sizer)
                .select(&recipients, &utxos, change, fee_rate)
                .unwrap();
            if values.iter().sum::<u64>() < amount {
                prop_assert!(selected.is_none());
            }
            if selected.is_some() {
                return Ok(());
            }

            let calculator = TransactionMetadataCalculator::new(&acc, &sizer);
            for mask in 1u32..(1 << utxos.len()) {
                let subset: Vec<Utxo> = utxos
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, u)| u.clone())
                    .collect();
                let feasible = calculator
                    .calculate(&recipients, &subset, change, fee_rate)
                    .unwrap();
                prop_assert!(feasible.is_none(), "subset {:b} of {:?} pays {}", mask, values, amount);
            }
        }
    }
}
