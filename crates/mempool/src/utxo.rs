use std::str::FromStr;

use super::*;
use bitcoin::{Amount, OutPoint};

#[derive(Debug, Deserialize)]
struct Utxo {
    txid: String,
    vout: u32,
    value: u64,
    status: Status,
}

#[derive(Debug, Deserialize)]
struct Status {
    confirmed: bool,
    block_height: Option<u32>,
}

pub async fn get_unspent_utxos(
    client: &EsploraClient,
    address: &Address,
) -> Result<Vec<types::Utxo>> {
    let utxos: Vec<Utxo> = client.get_json(&format!("address/{}/utxo", address)).await?;
    debug!("{} utxos for {}", utxos.len(), address);
    into_utxos(address, utxos)
}

fn into_utxos(address: &Address, utxos: Vec<Utxo>) -> Result<Vec<types::Utxo>> {
    let mut my_utxos = Vec::with_capacity(utxos.len());
    for utxo in utxos {
        my_utxos.push(types::Utxo {
            out_point: OutPoint {
                txid: Txid::from_str(&utxo.txid)?,
                vout: utxo.vout,
            },
            value: Amount::from_sat(utxo.value),
            address: address.clone(),
            confirmed: utxo.status.confirmed,
            block_height: utxo.status.block_height,
        });
    }

    Ok(my_utxos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_esplora_utxos() {
        let raw = r#"[
            {"txid":"903e78a5ce44c985459ff91fb9db49338b5901b8cfdbfa1aa875efc53eed4a2f","vout":0,
             "status":{"confirmed":true,"block_height":840000,"block_hash":"00","block_time":1713571767},"value":792000},
            {"txid":"e34b3404c96b516e31c08931997f6eddb3974ad9d613a2e3a9fd24880aa17a50","vout":1,
             "status":{"confirmed":false},"value":3000}
        ]"#;
        let address = Address::from_str("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
            .unwrap()
            .require_network(Network::Bitcoin)
            .unwrap();

        let parsed: Vec<Utxo> = serde_json::from_str(raw).unwrap();
        let utxos = into_utxos(&address, parsed).unwrap();

        assert_eq!(utxos.len(), 2);
        assert_eq!(utxos[0].value, Amount::from_sat(792000));
        assert!(utxos[0].confirmed);
        assert_eq!(utxos[0].block_height, Some(840000));
        assert!(!utxos[1].confirmed);
        assert_eq!(utxos[1].out_point.vout, 1);
        assert_eq!(utxos[1].address, address);
    }

    #[test]
    fn rejects_bad_txid() {
        let address = Address::from_str("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
            .unwrap()
            .assume_checked();
        let parsed = vec![Utxo {
            txid: "not-a-txid".to_string(),
            vout: 0,
            value: 1,
            status: Status {
                confirmed: true,
                block_height: None,
            },
        }];
        assert!(into_utxos(&address, parsed).is_err());
    }
}
