use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::psbt::Input;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::taproot::{ControlBlock, LeafVersion};
use bitcoin::{Psbt, Script, ScriptBuf, TapSighashType, TxOut, Witness};

use crate::error::{Result, TxError};

pub const ECDSA_SIGNATURE_SIZE: usize = 72;
pub const COMPRESSED_PUBKEY_SIZE: usize = 33;
pub const SCHNORR_SIGNATURE_SIZE: usize = 64;

/// How an input will be unlocked once it is signed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpendKind {
    P2pkh,
    P2wpkh,
    P2shP2wpkh { redeem_script: ScriptBuf },
    P2shMultisig { redeem_script: ScriptBuf, required: usize },
    P2shP2wsh { redeem_script: ScriptBuf, witness_script: ScriptBuf },
    P2wsh { witness_script: ScriptBuf },
    TaprootKey { sighash_byte: bool },
    TaprootScript {
        script: ScriptBuf,
        control_block: Vec<u8>,
        signatures: usize,
        sighash_byte: bool,
    },
}

/// Prices a PSBT before any real signature exists.
pub trait TransactionSizer: Send + Sync {
    fn vsize(&self, psbt: &Psbt) -> Result<usize>;
}

/// Fills every input with placeholders of the final byte length.
#[derive(Clone, Copy, Debug, Default)]
pub struct DummySignatureSizer;

impl TransactionSizer for DummySignatureSizer {
    fn vsize(&self, psbt: &Psbt) -> Result<usize> {
        estimate_vsize(psbt)
    }
}

pub fn resolve_prevout(psbt: &Psbt, index: usize) -> Result<TxOut> {
    let input = psbt.inputs.get(index).ok_or(TxError::MissingPrevout(index))?;
    if let Some(utxo) = &input.witness_utxo {
        return Ok(utxo.clone());
    }

    let vout = psbt
        .unsigned_tx
        .input
        .get(index)
        .ok_or(TxError::MissingPrevout(index))?
        .previous_output
        .vout as usize;
    input
        .non_witness_utxo
        .as_ref()
        .and_then(|tx| tx.output.get(vout))
        .cloned()
        .ok_or(TxError::MissingPrevout(index))
}

pub fn spend_kind(index: usize, input: &Input, script_pubkey: &Script) -> Result<SpendKind> {
    let sighash_byte = has_taproot_sighash_byte(input);

    if script_pubkey.is_p2pkh() {
        return Ok(SpendKind::P2pkh);
    }
    if script_pubkey.is_p2wpkh() {
        return Ok(SpendKind::P2wpkh);
    }
    if script_pubkey.is_p2tr() {
        return Ok(match smallest_leaf(input) {
            Some((control_block, script)) => SpendKind::TaprootScript {
                signatures: xonly_key_count(&script).max(1),
                control_block: control_block.serialize(),
                script,
                sighash_byte,
            },
            None => SpendKind::TaprootKey { sighash_byte },
        });
    }
    if script_pubkey.is_p2wsh() {
        let witness_script = input.witness_script.clone().ok_or(TxError::MissingScript {
            index,
            script: "witness script",
        })?;
        return Ok(SpendKind::P2wsh { witness_script });
    }
    if script_pubkey.is_p2sh() {
        let redeem_script = input.redeem_script.clone().ok_or(TxError::MissingScript {
            index,
            script: "redeem script",
        })?;
        if redeem_script.is_p2wpkh() {
            return Ok(SpendKind::P2shP2wpkh { redeem_script });
        }
        if redeem_script.is_p2wsh() {
            let witness_script = input.witness_script.clone().ok_or(TxError::MissingScript {
                index,
                script: "witness script",
            })?;
            return Ok(SpendKind::P2shP2wsh {
                redeem_script,
                witness_script,
            });
        }
        let required = multisig_threshold(&redeem_script).unwrap_or(1);
        return Ok(SpendKind::P2shMultisig {
            redeem_script,
            required,
        });
    }

    Err(TxError::UnsupportedAddressType(script_pubkey.to_hex_string()))
}

/// Estimated virtual size of `psbt` once every input is signed.
pub fn estimate_vsize(psbt: &Psbt) -> Result<usize> {
    let mut tx = psbt.unsigned_tx.clone();
    for (index, (txin, input)) in tx.input.iter_mut().zip(psbt.inputs.iter()).enumerate() {
        let prevout = resolve_prevout(psbt, index)?;
        let kind = spend_kind(index, input, &prevout.script_pubkey)?;
        let (script_sig, witness) = placeholder(&kind)?;
        txin.script_sig = script_sig;
        txin.witness = witness;
    }

    Ok(tx.weight().to_vbytes_ceil() as usize)
}

fn placeholder(kind: &SpendKind) -> Result<(ScriptBuf, Witness)> {
    let ecdsa = vec![0u8; ECDSA_SIGNATURE_SIZE];
    let pubkey = vec![0u8; COMPRESSED_PUBKEY_SIZE];

    let unlock = match kind {
        SpendKind::P2pkh => {
            let script_sig = Builder::new()
                .push_slice(push_bytes(&ecdsa)?)
                .push_slice(push_bytes(&pubkey)?)
                .into_script();
            (script_sig, Witness::new())
        }
        SpendKind::P2wpkh => (ScriptBuf::new(), Witness::from_slice(&[&ecdsa, &pubkey])),
        SpendKind::P2shP2wpkh { redeem_script } => (
            wrap_redeem_script(redeem_script)?,
            Witness::from_slice(&[&ecdsa, &pubkey]),
        ),
        SpendKind::P2shMultisig {
            redeem_script,
            required,
        } => {
            let mut builder = Builder::new().push_int(0);
            for _ in 0..*required {
                builder = builder.push_slice(push_bytes(&ecdsa)?);
            }
            let script_sig = builder
                .push_slice(push_bytes(redeem_script.as_bytes())?)
                .into_script();
            (script_sig, Witness::new())
        }
        SpendKind::P2shP2wsh {
            redeem_script,
            witness_script,
        } => (
            wrap_redeem_script(redeem_script)?,
            witness_script_stack(witness_script),
        ),
        SpendKind::P2wsh { witness_script } => {
            (ScriptBuf::new(), witness_script_stack(witness_script))
        }
        SpendKind::TaprootKey { sighash_byte } => {
            let sig = vec![0u8; schnorr_size(*sighash_byte)];
            (ScriptBuf::new(), Witness::from_slice(&[sig]))
        }
        SpendKind::TaprootScript {
            script,
            control_block,
            signatures,
            sighash_byte,
        } => {
            let mut witness = Witness::new();
            for _ in 0..*signatures {
                witness.push(vec![0u8; schnorr_size(*sighash_byte)]);
            }
            witness.push(script.as_bytes());
            witness.push(control_block);
            (ScriptBuf::new(), witness)
        }
    };

    Ok(unlock)
}

/// Multisig gets `OP_0` plus one signature per required key, anything else one signature.
fn witness_script_stack(witness_script: &Script) -> Witness {
    let ecdsa = vec![0u8; ECDSA_SIGNATURE_SIZE];
    let mut witness = Witness::new();
    match multisig_threshold(witness_script) {
        Some(required) => {
            witness.push(Vec::<u8>::new());
            for _ in 0..required {
                witness.push(&ecdsa);
            }
        }
        None => witness.push(&ecdsa),
    }
    witness.push(witness_script.as_bytes());
    witness
}

fn wrap_redeem_script(redeem_script: &Script) -> Result<ScriptBuf> {
    Ok(Builder::new()
        .push_slice(push_bytes(redeem_script.as_bytes())?)
        .into_script())
}

fn push_bytes(bytes: &[u8]) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(bytes.to_vec())
        .map_err(|_| TxError::invalid(format!("{} byte push is too large", bytes.len())))
}

fn schnorr_size(sighash_byte: bool) -> usize {
    if sighash_byte {
        SCHNORR_SIGNATURE_SIZE + 1
    } else {
        SCHNORR_SIGNATURE_SIZE
    }
}

fn has_taproot_sighash_byte(input: &Input) -> bool {
    input.sighash_type.map_or(false, |ty| {
        ty.taproot_hash_ty()
            .map_or(true, |ty| ty != TapSighashType::Default)
    })
}

fn smallest_leaf(input: &Input) -> Option<(ControlBlock, ScriptBuf)> {
    input
        .tap_scripts
        .iter()
        .filter(|(_, (_, version))| *version == LeafVersion::TapScript)
        .min_by_key(|(control_block, _)| control_block.size())
        .map(|(control_block, (script, _))| (control_block.clone(), script.clone()))
}

/// `m` of an `m <keys> n OP_CHECKMULTISIG` script.
pub fn multisig_threshold(script: &Script) -> Option<usize> {
    let instructions: Vec<Instruction> = script.instructions().collect::<Result<_, _>>().ok()?;
    match (instructions.first(), instructions.last()) {
        (Some(Instruction::Op(first)), Some(Instruction::Op(last)))
            if *last == OP_CHECKMULTISIG
                && first.to_u8() >= OP_PUSHNUM_1.to_u8()
                && first.to_u8() <= OP_PUSHNUM_16.to_u8() =>
        {
            Some((first.to_u8() - OP_PUSHNUM_1.to_u8() + 1) as usize)
        }
        _ => None,
    }
}

fn xonly_key_count(script: &Script) -> usize {
    script
        .instructions()
        .filter_map(|ins| ins.ok())
        .filter(|ins| matches!(ins, Instruction::PushBytes(bytes) if bytes.len() == 32))
        .count()
}
