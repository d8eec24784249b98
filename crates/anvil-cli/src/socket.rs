use anyhow::{bail, Context, Result};
use anvil_core::protocol::{self, DaemonRequest, DaemonResponse};
use tokio::net::UnixStream;

/// Sends one request over a fresh connection to the daemon's control
/// socket and returns the response. One connection per call keeps the CLI
/// simple — it's an interactive operator tool, not a long-lived client.
pub async fn call(socket_path: &str, req: DaemonRequest) -> Result<DaemonResponse> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to anvild at {socket_path}"))?;

    protocol::send_request(&mut stream, &req)
        .await
        .context("failed to send request")?;

    protocol::recv_response(&mut stream)
        .await
        .context("failed to read response")
}

/// Calls the daemon and unwraps a successful `Data` payload, surfacing
/// `Error` responses as a normal CLI error.
pub async fn call_for_data(socket_path: &str, req: DaemonRequest) -> Result<serde_json::Value> {
    match call(socket_path, req).await? {
        DaemonResponse::Data { payload } => Ok(payload),
        DaemonResponse::Ok => Ok(serde_json::Value::Null),
        DaemonResponse::Pong => Ok(serde_json::json!("pong")),
        DaemonResponse::Error { kind, message } => bail!("{kind}: {message}"),
    }
}
