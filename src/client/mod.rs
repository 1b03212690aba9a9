//! HTTP clients for masters and volume servers

pub mod blob;
pub mod master;
pub mod volume;

pub use blob::BlobClient;
pub use master::MasterClient;
pub use volume::{SizeResponse, VolumeClient};

use crate::common::{Error, ErrorBody, Result};
use std::time::Duration;

pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(16)
        .build()?)
}

/// Turn a non-2xx response into the error the peer reported.
pub async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let leader = resp
        .headers()
        .get("x-leader")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let url = resp.url().to_string();
    let bytes = resp.bytes().await?;
    match serde_json::from_slice::<ErrorBody>(&bytes) {
        Ok(mut body) => {
            if body.leader.is_none() {
                body.leader = leader;
            }
            Err(Error::from_body(body))
        }
        Err(_) if status == reqwest::StatusCode::NOT_FOUND => Err(Error::NotFound(url)),
        Err(_) => Err(Error::Http(format!(
            "{} returned {}: {}",
            url,
            status,
            String::from_utf8_lossy(&bytes)
        ))),
    }
}
