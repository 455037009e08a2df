use std::collections::{BTreeMap, HashSet};

use bitcoin::absolute::LockTime;
use bitcoin::psbt::Input;
use bitcoin::script::PushBytesBuf;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use datatypes::types::{self, AddressType, Recipient, TransactionUtxoSelectionMetadata};
use mempool::ChainProvider;
use tracing::{debug, info};

use crate::context::{AccountContext, InputSigningInfo};
use crate::error::{Result, TxError};
use crate::finalize::{extract_transaction, finalize_psbt};
use crate::selection::{recipient_total, UtxoSelector};
use crate::signer::PsbtSigner;
use crate::vsize::TransactionSizer;

mod psbt;
mod send;

pub use psbt::{PsbtBuilder, UnsignedPsbt};
pub use send::{build_send_psbt, send_btc};
