use super::*;

pub async fn get_recommended_fees(client: &EsploraClient) -> Result<types::RecommendedFees> {
    let fees: types::RecommendedFees = client.get_json("v1/fees/recommended").await?;
    debug!("recommended fees on {}: {:?}", client.network(), fees);
    Ok(fees)
}
