use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default Unix domain socket path for the anvil daemon.
pub const DAEMON_SOCKET_PATH: &str = "/run/anvil/anvild.sock";

/// Maximum frame size for daemon IPC (1 MiB).
const MAX_FRAME_SIZE: usize = 1024 * 1024;

// ============================================================================
// Request/Response types
// ============================================================================

/// Request sent to `anvild` over the control socket.
///
/// Each variant maps to exactly one operation exposed by the unified
/// instance manager or one of its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonRequest {
    CreateInstance {
        user_id: String,
        challenge_id: String,
    },
    StartInstance {
        instance_id: String,
    },
    StopInstance {
        instance_id: String,
    },
    ExtendInstance {
        instance_id: String,
        minutes: u32,
    },
    ResetInstance {
        instance_id: String,
    },
    DestroyInstance {
        instance_id: String,
    },
    GetInstance {
        instance_id: String,
    },
    ListInstances {
        user_id: String,
    },
    CreateVpnPeer {
        user_id: String,
    },
    RemoveVpnPeer {
        user_id: String,
    },
    ListVpnPeers,
    RegisterNode {
        node: crate::model::Node,
    },
    ListNodes,
    InitUpload {
        identity: String,
        req: crate::protocol::UploadInitPayload,
    },
    UploadChunk {
        session_id: String,
        chunk_number: u32,
        /// Base64-encoded chunk bytes; JSON frames carry text, not raw bytes.
        data_b64: String,
    },
    CompleteUpload {
        session_id: String,
    },
    UploadStatus {
        session_id: String,
    },
    /// Health check.
    Ping,
}

/// Wire form of `anvil_upload::engine::InitRequest`, kept in `anvil-core`
/// so the protocol module doesn't need a dependency on `anvil-upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadInitPayload {
    pub filename: String,
    pub tag: String,
    pub total_size: u64,
    pub chunk_size: Option<u64>,
    pub checksum: Option<String>,
}

/// Response from `anvild` to a control-socket client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonResponse {
    /// Operation succeeded with no payload.
    Ok,
    /// Operation succeeded with a JSON payload.
    Data { payload: serde_json::Value },
    /// Error with a machine-readable kind and message.
    Error { kind: String, message: String },
    /// Pong response to Ping.
    Pong,
}

// ============================================================================
// Frame protocol (length-prefixed JSON over Unix socket)
// ============================================================================

/// Read a length-prefixed JSON frame from a tokio AsyncRead.
pub async fn read_frame<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .with_context(|| "Failed to read frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!("Frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .with_context(|| "Failed to read frame body")?;

    Ok(buf)
}

/// Write a length-prefixed JSON frame to a tokio AsyncWrite.
pub async fn write_frame<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .with_context(|| "Failed to write frame length")?;
    writer
        .write_all(data)
        .await
        .with_context(|| "Failed to write frame body")?;
    writer
        .flush()
        .await
        .with_context(|| "Failed to flush frame")?;
    Ok(())
}

/// Serialize and send a request.
pub async fn send_request<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    req: &DaemonRequest,
) -> Result<()> {
    let data = serde_json::to_vec(req).with_context(|| "Failed to serialize request")?;
    write_frame(writer, &data).await
}

/// Read and deserialize a request.
pub async fn recv_request<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<DaemonRequest> {
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).with_context(|| "Failed to deserialize request")
}

/// Serialize and send a response.
pub async fn send_response<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    resp: &DaemonResponse,
) -> Result<()> {
    let data = serde_json::to_vec(resp).with_context(|| "Failed to serialize response")?;
    write_frame(writer, &data).await
}

/// Read and deserialize a response.
pub async fn recv_response<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<DaemonResponse> {
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).with_context(|| "Failed to deserialize response")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_instance_roundtrip() {
        let req = DaemonRequest::CreateInstance {
            user_id: "u-1".to_string(),
            challenge_id: "c-1".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed: DaemonRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            DaemonRequest::CreateInstance {
                user_id,
                challenge_id,
            } => {
                assert_eq!(user_id, "u-1");
                assert_eq!(challenge_id, "c-1");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn extend_instance_roundtrip() {
        let req = DaemonRequest::ExtendInstance {
            instance_id: "i-abc123".to_string(),
            minutes: 30,
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed: DaemonRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            DaemonRequest::ExtendInstance {
                instance_id,
                minutes,
            } => {
                assert_eq!(instance_id, "i-abc123");
                assert_eq!(minutes, 30);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ping_roundtrip() {
        let req = DaemonRequest::Ping;
        let json = serde_json::to_string(&req).unwrap();
        let parsed: DaemonRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, DaemonRequest::Ping));
    }

    #[test]
    fn error_response_roundtrip() {
        let resp = DaemonResponse::Error {
            kind: "not_found".to_string(),
            message: "instance not found".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: DaemonResponse = serde_json::from_str(&json).unwrap();
        match parsed {
            DaemonResponse::Error { kind, message } => {
                assert_eq!(kind, "not_found");
                assert_eq!(message, "instance not found");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn data_response_roundtrip() {
        let resp = DaemonResponse::Data {
            payload: serde_json::json!({"id": "i-abc123"}),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: DaemonResponse = serde_json::from_str(&json).unwrap();
        match parsed {
            DaemonResponse::Data { payload } => assert_eq!(payload["id"], "i-abc123"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn socket_path_constant() {
        assert_eq!(DAEMON_SOCKET_PATH, "/run/anvil/anvild.sock");
    }

    #[test]
    fn init_upload_roundtrip() {
        let req = DaemonRequest::InitUpload {
            identity: "user-1".to_string(),
            req: UploadInitPayload {
                filename: "template.qcow2".to_string(),
                tag: "qcow2".to_string(),
                total_size: 1024,
                chunk_size: None,
                checksum: Some("deadbeef".to_string()),
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed: DaemonRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            DaemonRequest::InitUpload { identity, req } => {
                assert_eq!(identity, "user-1");
                assert_eq!(req.filename, "template.qcow2");
                assert_eq!(req.total_size, 1024);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn upload_chunk_roundtrip() {
        let req = DaemonRequest::UploadChunk {
            session_id: "sess-1".to_string(),
            chunk_number: 3,
            data_b64: "aGVsbG8=".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed: DaemonRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            DaemonRequest::UploadChunk {
                session_id,
                chunk_number,
                data_b64,
            } => {
                assert_eq!(session_id, "sess-1");
                assert_eq!(chunk_number, 3);
                assert_eq!(data_b64, "aGVsbG8=");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn list_nodes_and_list_vpn_peers_roundtrip() {
        for req in [DaemonRequest::ListNodes, DaemonRequest::ListVpnPeers] {
            let json = serde_json::to_string(&req).unwrap();
            let _: DaemonRequest = serde_json::from_str(&json).unwrap();
        }
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let data = b"hello anvild";
        let mut buf = Vec::new();
        write_frame(&mut buf, data).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        buf.extend_from_slice(&len);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn request_send_recv_roundtrip() {
        let req = DaemonRequest::Ping;
        let mut buf = Vec::new();
        send_request(&mut buf, &req).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let parsed = recv_request(&mut cursor).await.unwrap();
        assert!(matches!(parsed, DaemonRequest::Ping));
    }

    #[tokio::test]
    async fn response_send_recv_roundtrip() {
        let resp = DaemonResponse::Ok;
        let mut buf = Vec::new();
        send_response(&mut buf, &resp).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let parsed = recv_response(&mut cursor).await.unwrap();
        assert!(matches!(parsed, DaemonResponse::Ok));
    }
}
