use anvil_core::error::{AnvilError, Result};
use async_trait::async_trait;

/// Abstraction over `wg`/`wg-quick` invocations so the manager can be
/// tested without a real WireGuard-capable kernel.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[&str]) -> Result<String>;
}

pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new(args[0])
            .args(&args[1..])
            .output()
            .await
            .map_err(|e| AnvilError::internal(format!("spawn {}: {e}", args[0])))?;

        if !output.status.success() {
            return Err(AnvilError::Upstream {
                message: format!(
                    "{} exited with {}: {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerRuntimeStatus {
    pub last_handshake_unix: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub endpoint: Option<String>,
}

/// Live view of a kernel WireGuard interface, backed by `wg`.
pub struct WgInterface<R: CommandRunner> {
    pub interface: String,
    runner: R,
}

impl<R: CommandRunner> WgInterface<R> {
    pub fn new(interface: impl Into<String>, runner: R) -> Self {
        Self {
            interface: interface.into(),
            runner,
        }
    }

    pub async fn add_peer(&self, public_key: &str, allowed_ip: &str) -> Result<()> {
        self.runner
            .run(&[
                "wg",
                "set",
                &self.interface,
                "peer",
                public_key,
                "allowed-ips",
                allowed_ip,
            ])
            .await?;
        Ok(())
    }

    pub async fn remove_peer(&self, public_key: &str) -> Result<()> {
        self.runner
            .run(&["wg", "set", &self.interface, "peer", public_key, "remove"])
            .await?;
        Ok(())
    }

    /// Parses `wg show <iface> dump` (tab-separated, one peer per line
    /// after the interface's own line) for a single peer's counters.
    pub async fn peer_status(&self, public_key: &str) -> Result<Option<PeerRuntimeStatus>> {
        let dump = self.runner.run(&["wg", "show", &self.interface, "dump"]).await?;
        for line in dump.lines().skip(1) {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.first() == Some(&public_key) && fields.len() >= 7 {
                return Ok(Some(PeerRuntimeStatus {
                    endpoint: (fields[2] != "(none)").then(|| fields[2].to_string()),
                    last_handshake_unix: fields[4].parse().unwrap_or(0),
                    rx_bytes: fields[5].parse().unwrap_or(0),
                    tx_bytes: fields[6].parse().unwrap_or(0),
                }));
            }
        }
        Ok(None)
    }
}
