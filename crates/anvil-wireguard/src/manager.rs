use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anvil_core::config::WireguardConfig;
use anvil_core::error::{AnvilError, Result};
use anvil_core::model::VpnPeer;
use anvil_core::store::Store;
use base64::Engine as _;
use rand::RngCore;

use crate::ip_pool::IpPool;
use crate::kernel::{CommandRunner, WgInterface};
use crate::keys::generate_keypair;
use crate::render::{render_client_config, ClientConfigParams};

const HANDSHAKE_FRESH_SECS: i64 = 3 * 60;

pub struct GeneratedConfig {
    pub client_config: String,
    pub public_key: String,
}

pub struct PeerStatus {
    pub connected: bool,
    pub last_handshake: Option<chrono::DateTime<chrono::Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub endpoint: Option<String>,
}

/// Ties together key generation, IP allocation, at-rest encryption of
/// peer private keys, and kernel interface sync. The server's own
/// Curve25519 keypair and AES-GCM encryption key are supplied at
/// construction (persisted under the config directory by the caller).
pub struct WireguardManager<S, R: CommandRunner> {
    store: std::sync::Arc<S>,
    iface: WgInterface<R>,
    config: WireguardConfig,
    server_public_key: String,
    cipher: Aes256Gcm,
    ip_pool: Mutex<IpPool>,
}

impl<S: Store, R: CommandRunner> WireguardManager<S, R> {
    pub fn new(
        store: std::sync::Arc<S>,
        iface: WgInterface<R>,
        config: WireguardConfig,
        server_public_key: String,
        encryption_key: [u8; 32],
    ) -> Result<Self> {
        let ip_pool = IpPool::new(&config.lab_cidr)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&encryption_key));
        Ok(Self {
            store,
            iface,
            config,
            server_public_key,
            cipher,
            ip_pool: Mutex::new(ip_pool),
        })
    }

    fn encrypt_private_key(&self, private_key_b64: &str) -> String {
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, private_key_b64.as_bytes())
            .expect("AES-GCM encryption does not fail for valid inputs");

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);
        base64::engine::general_purpose::STANDARD.encode(blob)
    }

    fn decrypt_private_key(&self, encrypted_b64: &str) -> Result<String> {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(encrypted_b64)
            .map_err(|e| AnvilError::internal(format!("decode encrypted peer key: {e}")))?;
        if blob.len() < 12 {
            return Err(AnvilError::internal("encrypted peer key too short"));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| AnvilError::internal("failed to decrypt peer private key"))?;
        String::from_utf8(plaintext).map_err(|e| AnvilError::internal(format!("decrypted key not utf8: {e}")))
    }

    pub async fn generate_user_config(&self, user_id: &str) -> Result<GeneratedConfig> {
        if self.store.get_vpn_peer(user_id).await.is_ok() {
            return Err(AnvilError::Conflict {
                message: format!("user {user_id} already has a VPN peer; use regenerate"),
            });
        }
        self.create_peer(user_id).await
    }

    /// Replaces an existing peer's keys and address.
    pub async fn regenerate_user_config(&self, user_id: &str) -> Result<GeneratedConfig> {
        if let Ok(existing) = self.store.get_vpn_peer(user_id).await {
            let _ = self.iface.remove_peer(&existing.public_key).await;
            let ip: std::net::Ipv4Addr = existing.assigned_ip.parse().unwrap();
            self.ip_pool.lock().unwrap().release(ip);
            self.store.delete_vpn_peer(user_id).await?;
        }
        self.create_peer(user_id).await
    }

    async fn create_peer(&self, user_id: &str) -> Result<GeneratedConfig> {
        let keypair = generate_keypair();
        let assigned_ip = self.ip_pool.lock().unwrap().allocate()?;
        let allowed_ips = format!("{}/32", assigned_ip);

        self.iface
            .add_peer(&keypair.public_key_b64, &allowed_ips)
            .await?;

        let peer = VpnPeer {
            user_id: user_id.to_string(),
            public_key: keypair.public_key_b64.clone(),
            encrypted_private_key: self.encrypt_private_key(&keypair.private_key_b64),
            assigned_ip: assigned_ip.to_string(),
            allowed_ips: allowed_ips.clone(),
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        };
        self.store.put_vpn_peer(peer).await?;

        let client_config = render_client_config(&ClientConfigParams {
            private_key: &keypair.private_key_b64,
            address: &format!("{}/32", assigned_ip),
            dns: &self.config.dns,
            server_public_key: &self.server_public_key,
            endpoint: &format!("{}:{}", self.config.server_endpoint, self.config.listen_port),
            allowed_ips: &self.config.lab_cidr,
        })?;

        Ok(GeneratedConfig {
            client_config,
            public_key: keypair.public_key_b64,
        })
    }

    pub async fn get_user_config(&self, user_id: &str) -> Result<String> {
        let peer = self.store.get_vpn_peer(user_id).await?;
        let private_key = self.decrypt_private_key(&peer.encrypted_private_key)?;
        render_client_config(&ClientConfigParams {
            private_key: &private_key,
            address: &format!("{}/32", peer.assigned_ip),
            dns: &self.config.dns,
            server_public_key: &self.server_public_key,
            endpoint: &format!("{}:{}", self.config.server_endpoint, self.config.listen_port),
            allowed_ips: &self.config.lab_cidr,
        })
    }

    pub async fn remove_peer(&self, user_id: &str) -> Result<()> {
        let peer = self.store.get_vpn_peer(user_id).await?;
        self.iface.remove_peer(&peer.public_key).await?;
        let ip: std::net::Ipv4Addr = peer
            .assigned_ip
            .parse()
            .map_err(|_| AnvilError::internal("stored peer IP is not valid IPv4"))?;
        self.ip_pool.lock().unwrap().release(ip);
        self.store.delete_vpn_peer(user_id).await?;
        Ok(())
    }

    /// Re-applies every persisted peer to the kernel interface. Used
    /// after a daemon restart, when the interface starts empty.
    pub async fn sync_peers(&self) -> Result<usize> {
        let peers = self.store.list_vpn_peers().await?;
        let mut synced = 0;
        for peer in &peers {
            self.iface.add_peer(&peer.public_key, &peer.allowed_ips).await?;
            synced += 1;
        }
        Ok(synced)
    }

    pub async fn status(&self, user_id: &str) -> Result<PeerStatus> {
        let peer = self.store.get_vpn_peer(user_id).await?;
        let live = self.iface.peer_status(&peer.public_key).await?;

        match live {
            Some(live) if live.last_handshake_unix > 0 => {
                let handshake = chrono::DateTime::from_timestamp(live.last_handshake_unix as i64, 0)
                    .unwrap_or_else(chrono::Utc::now);
                let connected =
                    (chrono::Utc::now() - handshake).num_seconds() < HANDSHAKE_FRESH_SECS;
                Ok(PeerStatus {
                    connected,
                    last_handshake: Some(handshake),
                    rx_bytes: live.rx_bytes,
                    tx_bytes: live.tx_bytes,
                    endpoint: live.endpoint,
                })
            }
            _ => Ok(PeerStatus {
                connected: false,
                last_handshake: None,
                rx_bytes: 0,
                tx_bytes: 0,
                endpoint: None,
            }),
        }
    }
}
