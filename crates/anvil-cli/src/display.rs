use colored::Colorize;

/// Row for `node list`.
pub struct NodeRow {
    pub id: String,
    pub hostname: String,
    pub status: String,
    pub active_vms: u32,
    pub max_vms: u32,
    pub priority: i32,
}

/// Row for `instance list`.
pub struct InstanceRow {
    pub id: String,
    pub kind: String,
    pub state: String,
    pub challenge_id: String,
    pub expires_at: String,
    pub ip_address: String,
}

/// Row for `vpn peer list`.
pub struct VpnPeerRow {
    pub user_id: String,
    pub public_key: String,
    pub assigned_ip: String,
}

fn print_header(cols: &[(&str, usize)]) {
    let header: String = cols
        .iter()
        .map(|(name, width)| format!("{:<width$}", name, width = width))
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", header.bold());
    println!("{}", "-".repeat(header.len()).dimmed());
}

pub fn print_nodes(rows: &[NodeRow]) {
    print_header(&[
        ("ID", 14),
        ("HOSTNAME", 20),
        ("STATUS", 10),
        ("VMS", 8),
        ("PRIORITY", 8),
    ]);
    for row in rows {
        let vms = format!("{}/{}", row.active_vms, row.max_vms);
        let status = match row.status.as_str() {
            "online" => row.status.green().to_string(),
            "offline" => row.status.red().to_string(),
            _ => row.status.yellow().to_string(),
        };
        println!(
            "{:<14}  {:<20}  {:<10}  {:<8}  {:<8}",
            row.id, row.hostname, status, vms, row.priority
        );
    }
}

pub fn print_instances(rows: &[InstanceRow]) {
    print_header(&[
        ("ID", 14),
        ("KIND", 8),
        ("STATE", 12),
        ("CHALLENGE", 16),
        ("EXPIRES", 20),
        ("IP", 15),
    ]);
    for row in rows {
        let state = match row.state.as_str() {
            "running" => row.state.green().to_string(),
            "error" => row.state.red().to_string(),
            "provisioning" => row.state.yellow().to_string(),
            _ => row.state.dimmed().to_string(),
        };
        println!(
            "{:<14}  {:<8}  {:<12}  {:<16}  {:<20}  {:<15}",
            row.id, row.kind, state, row.challenge_id, row.expires_at, row.ip_address
        );
    }
}

pub fn print_vpn_peers(rows: &[VpnPeerRow]) {
    print_header(&[("USER", 14), ("PUBLIC KEY", 48), ("ASSIGNED IP", 15)]);
    for row in rows {
        println!(
            "{:<14}  {:<48}  {:<15}",
            row.user_id, row.public_key, row.assigned_ip
        );
    }
}
