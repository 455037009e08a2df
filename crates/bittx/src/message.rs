use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bitcoin::hashes::Hash;
use bitcoin::sign_message::signed_msg_hash;
use bitcoin::{Address, CompressedPublicKey, Network, PublicKey};
use datatypes::types::{AddressType, MessageSigningProtocol, SignedMessage};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1};
use tracing::debug;

use crate::bip322::{sign_bip322, verify_bip322};
use crate::context::{parse_address, AccountContext};
use crate::error::{Result, TxError};
use crate::signer::PsbtSigner;

const HEADER_P2PKH_UNCOMPRESSED: u8 = 27;
const HEADER_P2PKH: u8 = 31;
const HEADER_P2SH_P2WPKH: u8 = 35;
const HEADER_P2WPKH: u8 = 39;

/// First byte of a 65 byte signature: address family plus recovery id.
pub fn ecdsa_header(address_type: AddressType, recovery_id: RecoveryId) -> Result<u8> {
    let base = match address_type {
        AddressType::P2shP2wpkh => HEADER_P2SH_P2WPKH,
        AddressType::P2wpkh => HEADER_P2WPKH,
        AddressType::P2tr => return Err(TxError::UnsupportedForTaproot),
    };
    Ok(base + recovery_id.to_i32() as u8)
}

/// Signs `message` in the Bitcoin Signed Message format with a segwit header.
pub async fn sign_ecdsa_message(
    account: &AccountContext,
    signer: &dyn PsbtSigner,
    address: &str,
    message: &str,
) -> Result<String> {
    let ctx = account.context_for_address(address)?;
    if ctx.address_type() == AddressType::P2tr {
        return Err(TxError::UnsupportedForTaproot);
    }

    let digest = signed_msg_hash(message).to_byte_array();
    let signature = signer
        .sign_digest_recoverable(&ctx.signing_info(0), digest)
        .await?;
    let (recovery_id, compact) = signature.serialize_compact();

    let mut bytes = Vec::with_capacity(65);
    bytes.push(ecdsa_header(ctx.address_type(), recovery_id)?);
    bytes.extend_from_slice(&compact);
    Ok(STANDARD.encode(bytes))
}

pub fn verify_ecdsa_message(
    address: &str,
    message: &str,
    signature: &str,
    network: Network,
) -> Result<bool> {
    let address = parse_address(address, network)?;
    let Ok(bytes) = STANDARD.decode(signature.trim()) else {
        return Ok(false);
    };
    Ok(recover_and_match(&address, message, &bytes, network).unwrap_or(false))
}

fn recover_and_match(address: &Address, message: &str, bytes: &[u8], network: Network) -> Option<bool> {
    if bytes.len() != 65 || !(HEADER_P2PKH_UNCOMPRESSED..HEADER_P2WPKH + 4).contains(&bytes[0]) {
        return None;
    }
    let header = bytes[0];
    let recovery_id = RecoveryId::from_i32(i32::from((header - HEADER_P2PKH_UNCOMPRESSED) % 4)).ok()?;
    let signature = RecoverableSignature::from_compact(&bytes[1..], recovery_id).ok()?;

    let msg = Message::from_digest(signed_msg_hash(message).to_byte_array());
    let recovered = Secp256k1::verification_only()
        .recover_ecdsa(&msg, &signature)
        .ok()?;

    let script_pubkey = address.script_pubkey();
    let expected = if script_pubkey.is_p2wpkh() {
        Address::p2wpkh(&CompressedPublicKey(recovered), network)
    } else if script_pubkey.is_p2sh() {
        Address::p2shwpkh(&CompressedPublicKey(recovered), network)
    } else if script_pubkey.is_p2pkh() {
        let public_key = PublicKey {
            compressed: header >= HEADER_P2PKH,
            inner: recovered,
        };
        Address::p2pkh(public_key, network)
    } else {
        return Some(false);
    };
    Some(&expected == address)
}

/// Signs with the requested protocol, BIP322 when none is given.
pub async fn sign_message(
    account: &AccountContext,
    signer: &dyn PsbtSigner,
    address: &str,
    message: &str,
    protocol: Option<MessageSigningProtocol>,
) -> Result<SignedMessage> {
    let protocol = protocol.unwrap_or(MessageSigningProtocol::Bip322);
    debug!("signing message for {} with {:?}", address, protocol);
    let signature = match protocol {
        MessageSigningProtocol::Ecdsa => sign_ecdsa_message(account, signer, address, message).await?,
        MessageSigningProtocol::Bip322 => sign_bip322(account, signer, address, message).await?,
    };
    Ok(SignedMessage {
        signature,
        protocol,
    })
}

/// Accepts either a 65 byte ECDSA signature or a BIP322 simple proof.
pub fn verify_message(address: &str, message: &str, signature: &str, network: Network) -> Result<bool> {
    let looks_ecdsa = STANDARD
        .decode(signature.trim())
        .map(|bytes| bytes.len() == 65)
        .unwrap_or(false);
    if looks_ecdsa {
        verify_ecdsa_message(address, message, signature, network)
    } else {
        match verify_bip322(address, message, signature, network) {
            Err(TxError::UnsupportedAddressType(_)) => Ok(false),
            other => other,
        }
    }
}
