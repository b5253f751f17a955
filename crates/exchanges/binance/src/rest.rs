//! User-data stream listen-key management.

use exgate_core::AdapterError;
use serde::Deserialize;

pub const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const USER_DATA_STREAM: &str = "/api/v3/userDataStream";

#[derive(Deserialize)]
struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

fn endpoint(rest_url: &str) -> String {
    format!("{}{}", rest_url.trim_end_matches('/'), USER_DATA_STREAM)
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(AdapterError::Rest(format!("{}: {}", status, body)))
}

/// Create a listen key for the account behind `api_key`.
pub async fn create_listen_key(
    http: &reqwest::Client,
    rest_url: &str,
    api_key: &str,
) -> Result<String, AdapterError> {
    let resp = http
        .post(endpoint(rest_url))
        .header(API_KEY_HEADER, api_key)
        .send()
        .await?;
    let parsed: ListenKeyResponse = check(resp).await?.json().await?;
    Ok(parsed.listen_key)
}

/// Extend a listen key's validity.
pub async fn keepalive_listen_key(
    http: &reqwest::Client,
    rest_url: &str,
    api_key: &str,
    listen_key: &str,
) -> Result<(), AdapterError> {
    let resp = http
        .put(endpoint(rest_url))
        .header(API_KEY_HEADER, api_key)
        .query(&[("listenKey", listen_key)])
        .send()
        .await?;
    check(resp).await?;
    Ok(())
}

/// Invalidate a listen key.
pub async fn close_listen_key(
    http: &reqwest::Client,
    rest_url: &str,
    api_key: &str,
    listen_key: &str,
) -> Result<(), AdapterError> {
    let resp = http
        .delete(endpoint(rest_url))
        .header(API_KEY_HEADER, api_key)
        .query(&[("listenKey", listen_key)])
        .send()
        .await?;
    check(resp).await?;
    Ok(())
}
