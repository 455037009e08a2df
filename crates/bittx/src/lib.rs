pub mod bip322;
pub mod builder;
pub mod context;
pub mod error;
pub mod finalize;
pub mod hardware;
pub mod keys;
pub mod message;
pub mod rbf;
pub mod selection;
pub mod signer;
pub mod vsize;

#[cfg(test)]
mod testing;

pub use builder::{build_send_psbt, send_btc, PsbtBuilder, UnsignedPsbt};
pub use context::{AccountContext, AddressContext, InputSigningInfo};
pub use error::{Result, TxError};
pub use finalize::{extract_transaction, finalize_psbt};
pub use message::{sign_message, verify_message};
pub use rbf::{is_rbf_enabled, RbfTransaction};
pub use selection::{TransactionMetadataCalculator, UtxoSelector};
pub use signer::{sign_psbt, signer_for, InputToSign, KeySource, PsbtSigner, SoftwareSigner};
pub use vsize::{estimate_vsize, DummySignatureSizer, TransactionSizer};
