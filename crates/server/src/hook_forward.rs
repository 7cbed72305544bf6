//! `switchyard hook-forward --port N`
//!
//! Run by the assistant for every registered hook. Relays stdin to the
//! loopback receiver and always succeeds, so a missing receiver never
//! blocks the assistant.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::debug;

pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(2);

/// POST `body` to the receiver on `port`. Returns whether it was accepted.
pub async fn forward(port: u16, body: Vec<u8>, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => {
            debug!(
                component = "hook_forward",
                event = "hook_forward.client_failed",
                error = %err,
                "Failed to build HTTP client"
            );
            return false;
        }
    };

    let result = client
        .post(format!("http://127.0.0.1:{port}/hook"))
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await;

    match result {
        Ok(response) => response.status().is_success(),
        Err(err) => {
            debug!(
                component = "hook_forward",
                event = "hook_forward.failed",
                port = port,
                error = %err,
                "Hook relay failed"
            );
            false
        }
    }
}

pub async fn run(port: u16) -> anyhow::Result<()> {
    let mut body = Vec::new();
    if tokio::io::stdin().read_to_end(&mut body).await.is_err() {
        body.clear();
    }
    forward(port, body, FORWARD_TIMEOUT).await;
    Ok(())
}
