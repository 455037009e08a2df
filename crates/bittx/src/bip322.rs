//! Generic message signing: a proof that the signer could spend from an address,
//! expressed as the witness of a transaction that can never be mined.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::{deserialize, serialize};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::opcodes::{all::OP_RETURN, OP_0};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    ecdsa, taproot, Address, Amount, CompressedPublicKey, Network, OutPoint, Psbt, Script,
    ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use datatypes::types::Utxo;
use tracing::debug;

use crate::context::{parse_address, AccountContext};
use crate::error::{Result, TxError};
use crate::finalize::finalize_psbt;
use crate::signer::PsbtSigner;

const TAG: &[u8] = b"BIP0322-signed-message";

/// `SHA256(tag ‖ tag ‖ message)` with `tag = SHA256("BIP0322-signed-message")`.
pub fn bip0322_hash(message: &[u8]) -> sha256::Hash {
    let tag = sha256::Hash::hash(TAG);
    let mut engine = sha256::Hash::engine();
    engine.input(tag.as_byte_array());
    engine.input(tag.as_byte_array());
    engine.input(message);
    sha256::Hash::from_engine(engine)
}

pub fn to_spend_transaction(script_pubkey: ScriptBuf, message: &[u8]) -> Transaction {
    let script_sig = Builder::new()
        .push_opcode(OP_0)
        .push_slice(bip0322_hash(message).to_byte_array())
        .into_script();
    Transaction {
        version: Version(0),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::all_zeros(),
                vout: 0xFFFF_FFFF,
            },
            script_sig,
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey,
        }],
    }
}

pub fn to_sign_transaction(to_spend: &Transaction) -> Transaction {
    Transaction {
        version: Version(0),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: to_spend.compute_txid(),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: Builder::new().push_opcode(OP_RETURN).into_script(),
        }],
    }
}

fn check_script(address: &str, script: &Script) -> Result<()> {
    if script.is_p2sh() || script.is_p2wpkh() || script.is_p2tr() {
        Ok(())
    } else {
        Err(TxError::UnsupportedAddressType(address.to_string()))
    }
}

/// Signs `message` for one of the account's addresses and returns the base64 witness.
pub async fn sign_bip322(
    account: &AccountContext,
    signer: &dyn PsbtSigner,
    address: &str,
    message: &str,
) -> Result<String> {
    let ctx = account.context_for_address(address)?;
    check_script(address, &ctx.script_pubkey())?;

    let to_spend = to_spend_transaction(ctx.script_pubkey(), message.as_bytes());
    let to_sign = to_sign_transaction(&to_spend);
    let mut psbt = Psbt::from_unsigned_tx(to_sign)
        .map_err(|e| TxError::invalid(format!("bip322 psbt: {}", e)))?;
    psbt.inputs[0] = ctx.psbt_input(&Utxo {
        out_point: psbt.unsigned_tx.input[0].previous_output,
        value: Amount::ZERO,
        address: ctx.address().clone(),
        confirmed: true,
        block_height: None,
    })?;

    signer.sign(&mut psbt, &[ctx.signing_info(0)]).await?;
    finalize_psbt(&mut psbt)?;

    let witness = psbt.inputs[0]
        .final_script_witness
        .take()
        .ok_or(TxError::IncompleteSignature(0))?;
    debug!("bip322 proof for {} with {} witness items", address, witness.len());
    Ok(STANDARD.encode(serialize(&witness)))
}

/// Checks a simple BIP322 proof. Malformed or mismatching proofs verify as false.
pub fn verify_bip322(address: &str, message: &str, signature: &str, network: Network) -> Result<bool> {
    let address = parse_address(address, network)?;
    let script_pubkey = address.script_pubkey();
    check_script(&address.to_string(), &script_pubkey)?;

    let Some(witness) = STANDARD
        .decode(signature.trim())
        .ok()
        .and_then(|bytes| deserialize::<Witness>(&bytes).ok())
    else {
        return Ok(false);
    };

    let to_spend = to_spend_transaction(script_pubkey.clone(), message.as_bytes());
    let to_sign = to_sign_transaction(&to_spend);
    Ok(verify_witness(&address, &to_spend, &to_sign, &witness, network).unwrap_or(false))
}

fn verify_witness(
    address: &Address,
    to_spend: &Transaction,
    to_sign: &Transaction,
    witness: &Witness,
    network: Network,
) -> Option<bool> {
    let secp = Secp256k1::verification_only();
    let script_pubkey = address.script_pubkey();
    let mut cache = SighashCache::new(to_sign);

    if script_pubkey.is_p2tr() {
        if witness.len() != 1 {
            return Some(false);
        }
        let signature = taproot::Signature::from_slice(witness.nth(0)?).ok()?;
        let output_key = XOnlyPublicKey::from_slice(&script_pubkey.as_bytes()[2..]).ok()?;
        let sighash = cache
            .taproot_key_spend_signature_hash(
                0,
                &Prevouts::All(&to_spend.output),
                signature.sighash_type,
            )
            .ok()?;
        let msg = Message::from_digest(sighash.to_byte_array());
        return Some(
            secp.verify_schnorr(&signature.signature, &msg, &output_key)
                .is_ok(),
        );
    }

    if witness.len() != 2 {
        return Some(false);
    }
    let signature = ecdsa::Signature::from_slice(witness.nth(0)?).ok()?;
    let public_key = CompressedPublicKey::from_slice(witness.nth(1)?).ok()?;
    let expected = if script_pubkey.is_p2sh() {
        Address::p2shwpkh(&public_key, network)
    } else {
        Address::p2wpkh(&public_key, network)
    };
    if &expected != address {
        return Some(false);
    }

    let program = ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash());
    let sighash = cache
        .p2wpkh_signature_hash(0, &program, Amount::ZERO, signature.sighash_type)
        .ok()?;
    let msg = Message::from_digest(sighash.to_byte_array());
    Some(
        secp.verify_ecdsa(&msg, &signature.signature, &public_key.0)
            .is_ok(),
    )
}
