use std::path::PathBuf;

use anyhow::{Context, Result};
use anvil_core::protocol::{DaemonRequest, UploadInitPayload, DAEMON_SOCKET_PATH};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncReadExt;

use crate::display::{InstanceRow, NodeRow, VpnPeerRow};
use crate::{display, socket, ui};

const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "anvilctl", about = "Operator CLI for the anvil lab daemon")]
pub struct Cli {
    /// Path to the anvild control socket.
    #[arg(long, global = true, default_value = DAEMON_SOCKET_PATH)]
    socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that anvild is reachable.
    Ping,
    /// Node registration and listing.
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },
    /// Challenge template upload, driving the resumable upload engine.
    Challenge {
        #[command(subcommand)]
        action: ChallengeAction,
    },
    /// Instance inspection and lifecycle operations.
    Instance {
        #[command(subcommand)]
        action: InstanceAction,
    },
    /// VPN peer administration.
    Vpn {
        #[command(subcommand)]
        action: VpnAction,
    },
}

#[derive(Subcommand)]
enum NodeAction {
    /// Register a node from a JSON file describing it (see `anvil_core::model::Node`).
    Register {
        #[arg(long)]
        file: PathBuf,
    },
    List,
}

#[derive(Subcommand)]
enum ChallengeAction {
    /// Upload a VM template or docker build context in chunks.
    Upload {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        tag: String,
        #[arg(long)]
        checksum: Option<String>,
        #[arg(long)]
        chunk_size: Option<u64>,
    },
}

#[derive(Subcommand)]
enum InstanceAction {
    List {
        #[arg(long)]
        user_id: String,
    },
    Get {
        instance_id: String,
    },
    Start {
        instance_id: String,
    },
    Stop {
        instance_id: String,
    },
    Reset {
        instance_id: String,
    },
    Extend {
        instance_id: String,
        #[arg(long, default_value_t = 30)]
        minutes: u32,
    },
    Destroy {
        instance_id: String,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum VpnAction {
    Create { user_id: String },
    Remove { user_id: String },
    /// Export every registered peer, e.g. for an admin config dump.
    List,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Ping => {
            socket::call(&cli.socket, DaemonRequest::Ping).await?;
            ui::success("anvild is reachable");
        }
        Command::Node { action } => run_node(&cli.socket, action).await?,
        Command::Challenge { action } => run_challenge(&cli.socket, action).await?,
        Command::Instance { action } => run_instance(&cli.socket, action).await?,
        Command::Vpn { action } => run_vpn(&cli.socket, action).await?,
    }

    Ok(())
}

async fn run_node(socket_path: &str, action: NodeAction) -> Result<()> {
    match action {
        NodeAction::Register { file } => {
            let contents = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let node: anvil_core::model::Node = serde_json::from_str(&contents)
                .with_context(|| format!("{} is not a valid node descriptor", file.display()))?;
            let id = node.id.clone();
            socket::call_for_data(socket_path, DaemonRequest::RegisterNode { node }).await?;
            ui::success(&format!("registered node {id}"));
        }
        NodeAction::List => {
            let payload = socket::call_for_data(socket_path, DaemonRequest::ListNodes).await?;
            let nodes: Vec<anvil_core::model::Node> = serde_json::from_value(payload)?;
            let rows: Vec<NodeRow> = nodes
                .iter()
                .map(|n| NodeRow {
                    id: n.id.clone(),
                    hostname: n.hostname.clone(),
                    status: format!("{:?}", n.status).to_lowercase(),
                    active_vms: n.active_vms,
                    max_vms: n.max_vms,
                    priority: n.priority,
                })
                .collect();
            display::print_nodes(&rows);
        }
    }
    Ok(())
}

async fn run_challenge(socket_path: &str, action: ChallengeAction) -> Result<()> {
    let ChallengeAction::Upload {
        file,
        tag,
        checksum,
        chunk_size,
    } = action;

    let metadata = tokio::fs::metadata(&file)
        .await
        .with_context(|| format!("failed to stat {}", file.display()))?;
    let total_size = metadata.len();
    let chunk_size = chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("upload path has no filename")?
        .to_string();
    let identity = std::env::var("USER").unwrap_or_else(|_| "operator".to_string());

    let init_req = DaemonRequest::InitUpload {
        identity,
        req: UploadInitPayload {
            filename,
            tag,
            total_size,
            chunk_size: Some(chunk_size),
            checksum,
        },
    };
    let session = socket::call_for_data(socket_path, init_req).await?;
    let session_id = session["id"]
        .as_str()
        .context("daemon did not return a session id")?
        .to_string();

    let total_chunks = total_size.div_ceil(chunk_size).max(1);
    let pb = ProgressBar::new(total_chunks);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {pos}/{len} chunks")
            .expect("invalid progress bar template"),
    );

    let mut f = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("failed to open {}", file.display()))?;
    let mut buf = vec![0u8; chunk_size as usize];
    for chunk_number in 1..=total_chunks {
        let n = f.read(&mut buf).await.context("failed to read chunk")?;
        if n == 0 {
            break;
        }
        let data_b64 = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(&buf[..n])
        };
        socket::call_for_data(
            socket_path,
            DaemonRequest::UploadChunk {
                session_id: session_id.clone(),
                chunk_number: chunk_number as u32,
                data_b64,
            },
        )
        .await?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    socket::call_for_data(
        socket_path,
        DaemonRequest::CompleteUpload {
            session_id: session_id.clone(),
        },
    )
    .await?;
    ui::success(&format!("upload complete: session {session_id}"));
    Ok(())
}

async fn run_instance(socket_path: &str, action: InstanceAction) -> Result<()> {
    match action {
        InstanceAction::List { user_id } => {
            let payload =
                socket::call_for_data(socket_path, DaemonRequest::ListInstances { user_id }).await?;
            let instances: Vec<anvil_core::model::Instance> = serde_json::from_value(payload)?;
            let rows: Vec<InstanceRow> = instances
                .iter()
                .map(|i| InstanceRow {
                    id: i.id.clone(),
                    kind: format!("{:?}", i.kind).to_lowercase(),
                    state: format!("{:?}", i.state).to_lowercase(),
                    challenge_id: i.challenge_id.clone(),
                    expires_at: i.expires_at.to_rfc3339(),
                    ip_address: i
                        .network
                        .ip_address
                        .clone()
                        .unwrap_or_else(|| "-".to_string()),
                })
                .collect();
            display::print_instances(&rows);
        }
        InstanceAction::Get { instance_id } => {
            let payload =
                socket::call_for_data(socket_path, DaemonRequest::GetInstance { instance_id }).await?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        InstanceAction::Start { instance_id } => {
            socket::call_for_data(
                socket_path,
                DaemonRequest::StartInstance {
                    instance_id: instance_id.clone(),
                },
            )
            .await?;
            ui::success(&format!("started {instance_id}"));
        }
        InstanceAction::Stop { instance_id } => {
            socket::call_for_data(
                socket_path,
                DaemonRequest::StopInstance {
                    instance_id: instance_id.clone(),
                },
            )
            .await?;
            ui::success(&format!("stopped {instance_id}"));
        }
        InstanceAction::Reset { instance_id } => {
            socket::call_for_data(
                socket_path,
                DaemonRequest::ResetInstance {
                    instance_id: instance_id.clone(),
                },
            )
            .await?;
            ui::success(&format!("reset {instance_id}"));
        }
        InstanceAction::Extend {
            instance_id,
            minutes,
        } => {
            socket::call_for_data(
                socket_path,
                DaemonRequest::ExtendInstance {
                    instance_id: instance_id.clone(),
                    minutes,
                },
            )
            .await?;
            ui::success(&format!("extended {instance_id} by {minutes}m"));
        }
        InstanceAction::Destroy { instance_id, yes } => {
            if !yes && !ui::confirm(&format!("destroy instance {instance_id}?")) {
                ui::warn("aborted");
                return Ok(());
            }
            socket::call_for_data(
                socket_path,
                DaemonRequest::DestroyInstance {
                    instance_id: instance_id.clone(),
                },
            )
            .await?;
            ui::success(&format!("destroyed {instance_id}"));
        }
    }
    Ok(())
}

async fn run_vpn(socket_path: &str, action: VpnAction) -> Result<()> {
    match action {
        VpnAction::Create { user_id } => {
            let payload =
                socket::call_for_data(socket_path, DaemonRequest::CreateVpnPeer { user_id }).await?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        VpnAction::Remove { user_id } => {
            socket::call_for_data(
                socket_path,
                DaemonRequest::RemoveVpnPeer {
                    user_id: user_id.clone(),
                },
            )
            .await?;
            ui::success(&format!("removed peer for {user_id}"));
        }
        VpnAction::List => {
            let payload = socket::call_for_data(socket_path, DaemonRequest::ListVpnPeers).await?;
            let peers: Vec<anvil_core::model::VpnPeer> = serde_json::from_value(payload)?;
            let rows: Vec<VpnPeerRow> = peers
                .iter()
                .map(|p| VpnPeerRow {
                    user_id: p.user_id.clone(),
                    public_key: p.public_key.clone(),
                    assigned_ip: p.assigned_ip.to_string(),
                })
                .collect();
            display::print_vpn_peers(&rows);
        }
    }
    Ok(())
}
