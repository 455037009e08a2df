use std::str::FromStr;

use super::*;
use bitcoin::{consensus::encode::serialize_hex, Amount, OutPoint, ScriptBuf, Sequence};

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct TxStatus {
    pub confirmed: bool,
    pub block_height: Option<u32>,
    pub block_hash: Option<String>,
    pub block_time: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct EsploraVout {
    pub scriptpubkey: String,
    pub scriptpubkey_address: Option<String>,
    pub value: u64,
}

impl EsploraVout {
    pub fn script_pubkey(&self) -> Result<ScriptBuf> {
        Ok(ScriptBuf::from_hex(&self.scriptpubkey)?)
    }

    pub fn amount(&self) -> Amount {
        Amount::from_sat(self.value)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct EsploraVin {
    pub txid: String,
    pub vout: u32,
    pub prevout: Option<EsploraVout>,
    #[serde(default)]
    pub scriptsig: String,
    #[serde(default)]
    pub witness: Option<Vec<String>>,
    #[serde(default)]
    pub is_coinbase: bool,
    pub sequence: u32,
}

impl EsploraVin {
    pub fn out_point(&self) -> Result<OutPoint> {
        Ok(OutPoint {
            txid: Txid::from_str(&self.txid)?,
            vout: self.vout,
        })
    }

    pub fn sequence(&self) -> Sequence {
        Sequence(self.sequence)
    }
}

/// Transaction as returned by `GET /api/tx/{txid}`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct EsploraTransaction {
    pub txid: String,
    pub version: i32,
    pub locktime: u32,
    pub vin: Vec<EsploraVin>,
    pub vout: Vec<EsploraVout>,
    #[serde(default)]
    pub size: u64,
    pub weight: u64,
    pub fee: u64,
    pub status: TxStatus,
}

impl EsploraTransaction {
    pub fn txid(&self) -> Result<Txid> {
        Ok(Txid::from_str(&self.txid)?)
    }

    /// Virtual size as the unrounded `weight / 4`.
    pub fn vsize(&self) -> f64 {
        self.weight as f64 / 4.0
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Outspend {
    pub spent: bool,
    pub txid: Option<String>,
    pub vin: Option<u32>,
    pub status: Option<TxStatus>,
}

impl Outspend {
    pub fn spending_txid(&self) -> Result<Option<Txid>> {
        match (&self.txid, self.spent) {
            (Some(txid), true) => Ok(Some(Txid::from_str(txid)?)),
            _ => Ok(None),
        }
    }
}

pub async fn get_transaction(client: &EsploraClient, txid: &Txid) -> Result<EsploraTransaction> {
    client.get_json(&format!("tx/{}", txid)).await
}

pub async fn get_outspends(client: &EsploraClient, txid: &Txid) -> Result<Vec<Outspend>> {
    client.get_json(&format!("tx/{}/outspends", txid)).await
}

pub async fn send_tx(client: &EsploraClient, tx: &Transaction) -> Result<Txid> {
    let url = client.url("tx");
    let tx_hex = serialize_hex(tx);
    debug!("POST {} ({} bytes)", url, tx_hex.len() / 2);
    let response = client
        .http
        .post(url)
        .body(tx_hex)
        .send()
        .await?
        .error_for_status()?;
    let resp = response.text().await?;
    Ok(Txid::from_str(resp.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW_TX: &str = r#"{
        "txid":"e0e9053a4fc6c353293671887ca22687b0334720740628ce9611abb967dfb334",
        "version":2,"locktime":0,
        "vin":[{
            "txid":"85238518173326623fdae44c79edc3250f3e8607afbb1415cd74d8a7d2d39712","vout":1,
            "prevout":{"scriptpubkey":"001492b8c3a56fac121ddcdffbc85b02fb9ef681038a","scriptpubkey_asm":"OP_0 OP_PUSHBYTES_20 92b8c3a56fac121ddcdffbc85b02fb9ef681038a",
                       "scriptpubkey_type":"v0_p2wpkh","scriptpubkey_address":"bc1qj2uv8ft04sfpmhxll0y9kqhmnmmgzqu2ck9rf3","value":100000},
            "scriptsig":"","scriptsig_asm":"","witness":["3044","02"],"is_coinbase":false,"sequence":4294967293
        }],
        "vout":[{"scriptpubkey":"001492b8c3a56fac121ddcdffbc85b02fb9ef681038a","scriptpubkey_address":"bc1qj2uv8ft04sfpmhxll0y9kqhmnmmgzqu2ck9rf3","value":98000}],
        "size":191,"weight":437,"fee":2000,
        "status":{"confirmed":false}
    }"#;

    #[test]
    fn parse_esplora_transaction() {
        let tx: EsploraTransaction = serde_json::from_str(RAW_TX).unwrap();
        assert_eq!(tx.fee, 2000);
        assert!(!tx.status.confirmed);
        assert_eq!(tx.vsize(), 109.25);
        assert_eq!(tx.vin[0].sequence(), Sequence::ENABLE_RBF_NO_LOCKTIME);
        assert_eq!(tx.vin[0].out_point().unwrap().vout, 1);

        let prevout = tx.vin[0].prevout.as_ref().unwrap();
        assert!(prevout.script_pubkey().unwrap().is_p2wpkh());
        assert_eq!(tx.vout[0].amount(), Amount::from_sat(98000));
    }

    #[test]
    fn outspend_only_reports_spent_outputs() {
        let raw = r#"[
            {"spent":true,"txid":"e0e9053a4fc6c353293671887ca22687b0334720740628ce9611abb967dfb334","vin":0,"status":{"confirmed":false}},
            {"spent":false}
        ]"#;
        let outspends: Vec<Outspend> = serde_json::from_str(raw).unwrap();
        assert!(outspends[0].spending_txid().unwrap().is_some());
        assert!(outspends[1].spending_txid().unwrap().is_none());
    }
}
