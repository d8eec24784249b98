use anvil_core::error::{AnvilError, Result};
use tera::{Context, Tera};

const CLIENT_CONFIG_TEMPLATE: &str = r#"[Interface]
PrivateKey = {{ private_key }}
Address = {{ address }}
DNS = {{ dns }}

[Peer]
PublicKey = {{ server_public_key }}
Endpoint = {{ endpoint }}
AllowedIPs = {{ allowed_ips }}
PersistentKeepalive = 25
"#;

pub struct ClientConfigParams<'a> {
    pub private_key: &'a str,
    pub address: &'a str,
    pub dns: &'a str,
    pub server_public_key: &'a str,
    pub endpoint: &'a str,
    pub allowed_ips: &'a str,
}

pub fn render_client_config(params: &ClientConfigParams) -> Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("wg_client.conf", CLIENT_CONFIG_TEMPLATE)
        .map_err(|e| AnvilError::internal(format!("register wg template: {e}")))?;

    let mut ctx = Context::new();
    ctx.insert("private_key", params.private_key);
    ctx.insert("address", params.address);
    ctx.insert("dns", params.dns);
    ctx.insert("server_public_key", params.server_public_key);
    ctx.insert("endpoint", params.endpoint);
    ctx.insert("allowed_ips", params.allowed_ips);

    tera.render("wg_client.conf", &ctx)
        .map_err(|e| AnvilError::internal(format!("render wg client config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_fields() {
        let params = ClientConfigParams {
            private_key: "PRIV",
            address: "10.100.0.2/32",
            dns: "1.1.1.1",
            server_public_key: "SERVERPUB",
            endpoint: "lab.example.org:51820",
            allowed_ips: "10.100.0.0/16",
        };
        let text = render_client_config(&params).unwrap();
        assert!(text.contains("PrivateKey = PRIV"));
        assert!(text.contains("Address = 10.100.0.2/32"));
        assert!(text.contains("Endpoint = lab.example.org:51820"));
        assert!(text.contains("PersistentKeepalive = 25"));
    }
}
