use super::*;

/// An unsigned PSBT together with who has to sign which input.
#[derive(Clone, Debug)]
pub struct UnsignedPsbt {
    pub psbt: Psbt,
    pub inputs: Vec<InputSigningInfo>,
}

impl UnsignedPsbt {
    /// Input indexes grouped by the address family that signs them.
    pub fn signing_plan(&self) -> BTreeMap<AddressType, Vec<usize>> {
        let mut plan: BTreeMap<AddressType, Vec<usize>> = BTreeMap::new();
        for info in &self.inputs {
            plan.entry(info.address_type).or_default().push(info.index);
        }
        plan
    }

    pub fn fee(&self) -> Amount {
        let inputs: Amount = self
            .psbt
            .inputs
            .iter()
            .filter_map(|input| input.witness_utxo.as_ref())
            .map(|out| out.value)
            .sum();
        let outputs: Amount = self.psbt.unsigned_tx.output.iter().map(|out| out.value).sum();
        inputs.checked_sub(outputs).unwrap_or(Amount::ZERO)
    }

    pub fn to_base64(&self) -> String {
        self.psbt.to_string()
    }
}

/// Collects inputs and outputs for one transaction, then turns them into a PSBT.
///
/// Outputs come out as recipients in insertion order, then data outputs, then change.
pub struct PsbtBuilder<'a> {
    account: &'a AccountContext,
    sequence: Sequence,
    inputs: Vec<(TxIn, Input)>,
    signing: Vec<InputSigningInfo>,
    recipients: Vec<TxOut>,
    data: Vec<TxOut>,
    change: Option<TxOut>,
    used: HashSet<OutPoint>,
    excluded: HashSet<OutPoint>,
}

impl<'a> PsbtBuilder<'a> {
    pub fn new(account: &'a AccountContext) -> Self {
        Self {
            account,
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            inputs: Vec::new(),
            signing: Vec::new(),
            recipients: Vec::new(),
            data: Vec::new(),
            change: None,
            used: HashSet::new(),
            excluded: HashSet::new(),
        }
    }

    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_excluded(mut self, outpoints: impl IntoIterator<Item = OutPoint>) -> Self {
        self.excluded.extend(outpoints);
        self
    }

    pub fn add_utxo(&mut self, utxo: &types::Utxo) -> Result<()> {
        if self.excluded.contains(&utxo.out_point) {
            return Err(TxError::ExcludedUtxo(utxo.out_point));
        }
        if !self.used.insert(utxo.out_point) {
            return Err(TxError::AlreadyUsedUtxo(utxo.out_point));
        }

        let ctx = self.account.context_for_script(&utxo.script_pubkey())?;
        let input = ctx.psbt_input(utxo)?;
        self.signing.push(ctx.signing_info(self.inputs.len()));
        self.inputs.push((
            TxIn {
                previous_output: utxo.out_point,
                script_sig: ScriptBuf::new(),
                sequence: self.sequence,
                witness: Witness::new(),
            },
            input,
        ));
        Ok(())
    }

    pub fn add_utxos(&mut self, utxos: &[types::Utxo]) -> Result<()> {
        for utxo in utxos {
            self.add_utxo(utxo)?;
        }
        Ok(())
    }

    pub fn add_recipient(&mut self, recipient: &Recipient) {
        self.add_output(TxOut {
            value: recipient.amount,
            script_pubkey: recipient.address.script_pubkey(),
        });
    }

    pub fn add_output(&mut self, output: TxOut) {
        self.recipients.push(output);
    }

    /// Zero-value `OP_RETURN` carrying `data`.
    pub fn add_data_output(&mut self, data: &[u8]) -> Result<()> {
        let push = PushBytesBuf::try_from(data.to_vec())
            .map_err(|_| TxError::invalid(format!("{} bytes do not fit in one push", data.len())))?;
        self.data.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new_op_return(push),
        });
        Ok(())
    }

    pub fn set_change(&mut self, address: &Address, amount: Amount) {
        self.change = Some(TxOut {
            value: amount,
            script_pubkey: address.script_pubkey(),
        });
    }

    pub fn clear_change(&mut self) {
        self.change = None;
    }

    pub fn input_total(&self) -> Amount {
        self.inputs
            .iter()
            .filter_map(|(_, input)| input.witness_utxo.as_ref())
            .map(|out| out.value)
            .sum()
    }

    pub fn output_total(&self) -> Amount {
        self.recipients
            .iter()
            .chain(self.data.iter())
            .chain(self.change.iter())
            .map(|out| out.value)
            .sum()
    }

    pub fn build(self) -> Result<UnsignedPsbt> {
        let available = self.input_total();
        let required = self.output_total();
        if available < required {
            return Err(TxError::InsufficientFunds {
                required: required.to_sat(),
                available: available.to_sat(),
            });
        }

        let (txins, inputs): (Vec<TxIn>, Vec<Input>) = self.inputs.into_iter().unzip();
        let mut output = self.recipients;
        output.extend(self.data);
        output.extend(self.change);

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: txins,
            output,
        };
        let mut psbt = Psbt::from_unsigned_tx(tx)
            .map_err(|e| TxError::invalid(format!("unsigned transaction: {}", e)))?;
        psbt.inputs = inputs;

        Ok(UnsignedPsbt {
            psbt,
            inputs: self.signing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{account, utxo};
    use std::str::FromStr;

    fn recipient(sats: u64) -> Recipient {
        let address = Address::from_str("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
            .unwrap()
            .assume_checked();
        Recipient::new(address, sats)
    }

    #[test]
    fn output_order_and_sequence() {
        let acc = account(AddressType::P2wpkh);
        let mut builder = PsbtBuilder::new(&acc);
        builder.add_utxo(&utxo(acc.payment.address(), 100_000, 0)).unwrap();
        builder.set_change(acc.payment.address(), Amount::from_sat(39_000));
        builder.add_recipient(&recipient(50_000));
        builder.add_data_output(b"hello").unwrap();
        builder.add_recipient(&recipient(10_000));
        let unsigned = builder.build().unwrap();

        let outputs = &unsigned.psbt.unsigned_tx.output;
        assert_eq!(outputs.len(), 4);
        assert_eq!(outputs[0].value, Amount::from_sat(50_000));
        assert_eq!(outputs[1].value, Amount::from_sat(10_000));
        assert!(outputs[2].script_pubkey.is_op_return());
        assert_eq!(outputs[3].script_pubkey, acc.payment.script_pubkey());
        assert_eq!(unsigned.fee(), Amount::from_sat(1_000));
        assert_eq!(
            unsigned.psbt.unsigned_tx.input[0].sequence,
            Sequence::ENABLE_RBF_NO_LOCKTIME
        );
    }

    #[test]
    fn mixed_inputs_are_planned_per_family() {
        let acc = account(AddressType::P2shP2wpkh);
        let mut builder = PsbtBuilder::new(&acc).with_sequence(Sequence::MAX);
        builder.add_utxo(&utxo(acc.ordinals.address(), 546, 0)).unwrap();
        builder.add_utxo(&utxo(acc.payment.address(), 20_000, 1)).unwrap();
        builder.add_utxo(&utxo(acc.payment.address(), 30_000, 2)).unwrap();
        builder.add_recipient(&recipient(40_000));
        let unsigned = builder.build().unwrap();

        let plan = unsigned.signing_plan();
        assert_eq!(plan[&AddressType::P2tr], vec![0]);
        assert_eq!(plan[&AddressType::P2shP2wpkh], vec![1, 2]);
        assert!(unsigned.psbt.inputs[0].tap_internal_key.is_some());
        assert!(unsigned.psbt.inputs[1].redeem_script.is_some());
        assert_eq!(unsigned.psbt.unsigned_tx.input[2].sequence, Sequence::MAX);

        let parsed = Psbt::from_str(&unsigned.to_base64()).unwrap();
        assert_eq!(parsed, unsigned.psbt);
    }

    #[test]
    fn rejects_conflicting_utxos() {
        let acc = account(AddressType::P2wpkh);
        let first = utxo(acc.payment.address(), 20_000, 0);
        let second = utxo(acc.payment.address(), 20_000, 1);

        let mut builder = PsbtBuilder::new(&acc).with_excluded([second.out_point]);
        builder.add_utxo(&first).unwrap();
        assert!(matches!(
            builder.add_utxo(&first),
            Err(TxError::AlreadyUsedUtxo(op)) if op == first.out_point
        ));
        assert!(matches!(
            builder.add_utxo(&second),
            Err(TxError::ExcludedUtxo(op)) if op == second.out_point
        ));
    }

    #[test]
    fn foreign_utxo_and_overspend() {
        let acc = account(AddressType::P2wpkh);
        let stranger = recipient(1).address;

        let mut builder = PsbtBuilder::new(&acc);
        assert!(matches!(
            builder.add_utxo(&utxo(&stranger, 20_000, 0)),
            Err(TxError::AddressNotFound(_))
        ));

        builder.add_utxo(&utxo(acc.payment.address(), 20_000, 1)).unwrap();
        builder.add_recipient(&recipient(25_000));
        let err = builder.build().unwrap_err();
        assert!(err.is_insufficient_funds());
    }
}
