use super::*;

/// Selects payment UTXOs for `recipients` and returns the unsigned PSBT with change last.
pub fn build_send_psbt(
    account: &AccountContext,
    utxos: &[types::Utxo],
    recipients: &[Recipient],
    fee_rate: f64,
    sizer: &dyn TransactionSizer,
) -> Result<(UnsignedPsbt, TransactionUtxoSelectionMetadata)> {
    let change_address = account.payment.address();
    let selector = UtxoSelector::new(account, sizer);
    let Some(selection) = selector.select(recipients, utxos, change_address, fee_rate)? else {
        let available: u64 = utxos.iter().map(|u| u.value.to_sat()).sum();
        let overhead = ((45 * (recipients.len() + 1) + 85 * utxos.len()) as f64 * fee_rate).ceil();
        return Err(TxError::InsufficientFunds {
            required: recipient_total(recipients) + overhead as u64,
            available,
        });
    };

    let mut builder = PsbtBuilder::new(account);
    builder.add_utxos(&selection.selected_utxos)?;
    for recipient in recipients {
        builder.add_recipient(recipient);
    }
    if selection.change > Amount::ZERO {
        builder.set_change(change_address, selection.change);
    }
    let unsigned = builder.build()?;

    debug!(
        "send psbt: {} inputs, {} outputs, fee {}",
        unsigned.psbt.inputs.len(),
        unsigned.psbt.outputs.len(),
        selection.fee
    );
    Ok((unsigned, selection))
}

/// Fetches payment UTXOs, builds, signs and finalizes a payment. Broadcasting is left to the caller.
pub async fn send_btc(
    provider: &dyn ChainProvider,
    account: &AccountContext,
    signer: &dyn PsbtSigner,
    recipients: &[Recipient],
    fee_rate: f64,
    sizer: &dyn TransactionSizer,
) -> Result<Transaction> {
    let utxos = provider.get_unspent_utxos(account.payment.address()).await?;
    let (mut unsigned, selection) = build_send_psbt(account, &utxos, recipients, fee_rate, sizer)?;

    signer.sign(&mut unsigned.psbt, &unsigned.inputs).await?;
    finalize_psbt(&mut unsigned.psbt)?;
    let tx = extract_transaction(unsigned.psbt);

    info!(
        "signed {} paying {} sats in fees ({:.2} sat/vB)",
        tx.compute_txid(),
        selection.fee.to_sat(),
        selection.fee_rate
    );
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{account, utxo, MNEMONIC};
    use crate::keys::seed_from_mnemonic;
    use crate::signer::SoftwareSigner;
    use crate::vsize::DummySignatureSizer;
    use crate::testing::MockChain;
    use bitcoin::{Network, Txid};
    use std::str::FromStr;

    fn recipient(sats: u64) -> Recipient {
        let address = Address::from_str("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
            .unwrap()
            .assume_checked();
        Recipient::new(address, sats)
    }

    #[test]
    fn change_goes_last() {
        let acc = account(AddressType::P2wpkh);
        let utxos = vec![
            utxo(acc.payment.address(), 10_000, 0),
            utxo(acc.payment.address(), 120_000, 1),
        ];
        let (unsigned, selection) = build_send_psbt(
            &acc,
            &utxos,
            &[recipient(30_000), recipient(20_000)],
            4.0,
            &DummySignatureSizer,
        )
        .unwrap();

        let outputs = &unsigned.psbt.unsigned_tx.output;
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[2].script_pubkey, acc.payment.script_pubkey());
        assert_eq!(outputs[2].value, selection.change);
        assert_eq!(unsigned.fee(), selection.fee);
        assert_eq!(unsigned.psbt.inputs.len(), 1);
    }

    #[test]
    fn unaffordable_send_is_insufficient_funds() {
        let acc = account(AddressType::P2wpkh);
        let utxos = vec![utxo(acc.payment.address(), 10_000, 0)];
        let err = build_send_psbt(&acc, &utxos, &[recipient(9_990)], 5.0, &DummySignatureSizer)
            .unwrap_err();
        assert!(err.is_insufficient_funds());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_btc_signs_every_input() {
        let acc = account(AddressType::P2shP2wpkh);
        let mut chain = MockChain::default();
        chain.utxos.insert(
            acc.payment.address().to_string(),
            vec![
                utxo(acc.payment.address(), 15_000, 0),
                utxo(acc.payment.address(), 16_000, 1),
            ],
        );
        let seed = seed_from_mnemonic(MNEMONIC, "").unwrap();
        let signer = SoftwareSigner::new(seed, Network::Bitcoin, 0, 0);

        let tx = send_btc(
            &chain,
            &acc,
            &signer,
            &[recipient(25_000)],
            2.0,
            &DummySignatureSizer,
        )
        .await
        .unwrap();

        assert_eq!(tx.input.len(), 2);
        for input in &tx.input {
            assert_eq!(input.witness.len(), 2);
            assert!(!input.script_sig.is_empty());
        }
        assert_eq!(tx.output[0].value, Amount::from_sat(25_000));
        assert!(Txid::from_str(&tx.compute_txid().to_string()).is_ok());
    }
}
