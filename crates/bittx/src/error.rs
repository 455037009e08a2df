use bitcoin::{OutPoint, Txid};
use thiserror::Error;

pub type Result<T, E = TxError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TxError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("insufficient funds: need {required} sats, have {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("address {0} does not belong to this account")]
    AddressNotFound(String),

    #[error("unrecognised account type: {0}")]
    UnrecognisedAccountType(String),

    #[error("utxo {0} is spent more than once")]
    AlreadyUsedUtxo(OutPoint),

    #[error("utxo {0} is on the exclusion list")]
    ExcludedUtxo(OutPoint),

    #[error("transaction {0} cannot be replaced")]
    NotRbfEligible(Txid),

    #[error("unconfirmed descendant chain is deeper than {0} transactions")]
    ChainTooLong(usize),

    #[error("fee rate {requested} sat/vB is below the minimum replacement rate {minimum} sat/vB")]
    FeeRateTooLow { requested: u64, minimum: u64 },

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(String),

    #[error("ECDSA message signing is not available for taproot addresses")]
    UnsupportedForTaproot,

    #[error("input {0} has no signature to finalize")]
    IncompleteSignature(usize),

    #[error("previous output of input {0} is unknown")]
    MissingPrevout(usize),

    #[error("input {index} needs a {script} to be classified")]
    MissingScript { index: usize, script: &'static str },

    #[error("key derivation failed: {0}")]
    Key(#[from] bitcoin::bip32::Error),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

impl TxError {
    /// True when the request was well formed but the wallet cannot pay for it.
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, TxError::InsufficientFunds { .. })
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        TxError::InvalidInput(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funds_errors_are_distinguishable() {
        let funds = TxError::InsufficientFunds {
            required: 10,
            available: 5,
        };
        assert!(funds.is_insufficient_funds());
        assert!(!TxError::invalid("no recipients").is_insufficient_funds());
        assert_eq!(
            funds.to_string(),
            "insufficient funds: need 10 sats, have 5 sats"
        );
    }

    #[test]
    fn provider_errors_pass_through() {
        let err: TxError = anyhow::anyhow!("esplora unavailable").into();
        assert_eq!(err.to_string(), "esplora unavailable");
    }
}
