use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::{Psbt, ScriptBuf, Transaction, Witness};

use crate::error::{Result, TxError};
use crate::vsize::resolve_prevout;

/// Finalizes every input of `psbt`.
pub fn finalize_psbt(psbt: &mut Psbt) -> Result<()> {
    let indexes: Vec<usize> = (0..psbt.inputs.len()).collect();
    finalize_inputs(psbt, &indexes)
}

/// Turns the signatures on the given inputs into their final scriptSig and witness.
pub fn finalize_inputs(psbt: &mut Psbt, indexes: &[usize]) -> Result<()> {
    for &index in indexes {
        finalize_input(psbt, index)?;
    }
    Ok(())
}

fn finalize_input(psbt: &mut Psbt, index: usize) -> Result<()> {
    let prevout = resolve_prevout(psbt, index)?;
    let input = &mut psbt.inputs[index];
    if input.final_script_sig.is_some() || input.final_script_witness.is_some() {
        return Ok(());
    }
    let spk = &prevout.script_pubkey;

    if spk.is_p2tr() {
        let signature = input.tap_key_sig.ok_or(TxError::IncompleteSignature(index))?;
        input.final_script_witness = Some(Witness::p2tr_key_spend(&signature));
    } else {
        let (public_key, signature) = input
            .partial_sigs
            .iter()
            .next()
            .map(|(pk, sig)| (*pk, *sig))
            .ok_or(TxError::IncompleteSignature(index))?;

        if spk.is_p2wpkh() {
            input.final_script_witness = Some(Witness::p2wpkh(&signature, &public_key.inner));
        } else if spk.is_p2sh() {
            let redeem_script = input.redeem_script.clone().ok_or(TxError::MissingScript {
                index,
                script: "redeem script",
            })?;
            if !redeem_script.is_p2wpkh() {
                return Err(TxError::UnsupportedAddressType(redeem_script.to_hex_string()));
            }
            input.final_script_sig = Some(
                Builder::new()
                    .push_slice(push(redeem_script.to_bytes())?)
                    .into_script(),
            );
            input.final_script_witness = Some(Witness::p2wpkh(&signature, &public_key.inner));
        } else if spk.is_p2pkh() {
            input.final_script_sig = Some(
                Builder::new()
                    .push_slice(push(signature.to_vec())?)
                    .push_key(&public_key)
                    .into_script(),
            );
        } else {
            return Err(TxError::UnsupportedAddressType(spk.to_hex_string()));
        }
    }

    input.partial_sigs.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    input.bip32_derivation.clear();
    input.tap_key_sig = None;
    input.tap_script_sigs.clear();
    input.tap_scripts.clear();
    input.tap_key_origins.clear();
    input.tap_internal_key = None;
    input.tap_merkle_root = None;
    Ok(())
}

fn push(bytes: Vec<u8>) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(bytes).map_err(|_| TxError::invalid("push too large"))
}

/// The network transaction of a fully finalized PSBT.
pub fn extract_transaction(psbt: Psbt) -> Transaction {
    psbt.extract_tx_unchecked_fee_rate()
}

/// Final scriptSig of every input, empty where none was set.
pub fn final_script_sigs(psbt: &Psbt) -> Vec<ScriptBuf> {
    psbt.inputs
        .iter()
        .map(|input| input.final_script_sig.clone().unwrap_or_default())
        .collect()
}
