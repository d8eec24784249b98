use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;

use anvil_core::error::{AnvilError, Result};
use anvil_core::model::NodeConnection;
use regex::Regex;

use crate::runner::{virsh, CommandRunner};

/// Per-node monotonic allocator over the node's VM subnet. Skips the
/// network address, gateway (`.1`), and broadcast equivalents.
pub struct VmIpPool {
    network: u32,
    prefix_len: u32,
    next: u32,
    free: BTreeSet<u32>,
}

impl VmIpPool {
    pub fn new(cidr: &str) -> Result<Self> {
        let (addr, prefix_len) = parse_cidr(cidr)?;
        let network = u32::from(addr);
        Ok(Self {
            network,
            prefix_len,
            next: network + 2, // skip network address and gateway (.1)
            free: BTreeSet::new(),
        })
    }

    fn broadcast(&self) -> u32 {
        let host_bits = 32 - self.prefix_len;
        let mask = if host_bits == 32 { u32::MAX } else { (1u32 << host_bits) - 1 };
        self.network | mask
    }

    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        if let Some(&addr) = self.free.iter().next() {
            self.free.remove(&addr);
            return Ok(Ipv4Addr::from(addr));
        }
        let upper = self.broadcast();
        if self.next >= upper {
            return Err(AnvilError::Exhausted {
                message: "VM subnet exhausted".to_string(),
            });
        }
        let addr = self.next;
        self.next += 1;
        Ok(Ipv4Addr::from(addr))
    }

    pub fn release(&mut self, addr: Ipv4Addr) {
        let raw = u32::from(addr);
        if raw > self.network && raw < self.broadcast() {
            self.free.insert(raw);
        }
    }
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u32)> {
    let (addr_str, prefix_str) = cidr.split_once('/').ok_or_else(|| AnvilError::Validation {
        message: format!("invalid CIDR: {cidr}"),
    })?;
    let addr: Ipv4Addr = addr_str
        .parse()
        .map_err(|_| AnvilError::Validation { message: format!("invalid CIDR address: {cidr}") })?;
    let prefix_len: u32 = prefix_str
        .parse()
        .map_err(|_| AnvilError::Validation { message: format!("invalid CIDR prefix: {cidr}") })?;
    Ok((addr, prefix_len))
}

/// Derives a QEMU-reserved-range MAC (`52:54:00:XX:XX:XX`) deterministically
/// from an instance id so the same instance always gets the same MAC.
pub fn mac_for_instance(instance_id: &str) -> String {
    let digest = {
        let mut acc: u32 = 0x811c9dc5;
        for b in instance_id.bytes() {
            acc ^= b as u32;
            acc = acc.wrapping_mul(0x01000193);
        }
        acc
    };
    let bytes = digest.to_be_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

/// Adds a DHCP host reservation on the node's libvirt network. Best-effort:
/// callers continue on failure per spec (guest still gets an IP from the
/// pool, truth is established by the post-boot `domifaddr` query).
pub async fn add_dhcp_reservation(
    runner: &dyn CommandRunner,
    conn: &NodeConnection,
    mac: &str,
    ip: Ipv4Addr,
) -> Result<()> {
    let entry = format!("<host mac='{mac}' ip='{ip}'/>");
    virsh(
        runner,
        conn,
        &[
            "net-update",
            &conn.bridge_network,
            "add",
            "ip-dhcp-host",
            &entry,
            "--live",
            "--config",
        ],
    )
    .await?;
    Ok(())
}

pub async fn remove_dhcp_reservation(
    runner: &dyn CommandRunner,
    conn: &NodeConnection,
    mac: &str,
    ip: Ipv4Addr,
) -> Result<()> {
    let entry = format!("<host mac='{mac}' ip='{ip}'/>");
    virsh(
        runner,
        conn,
        &[
            "net-update",
            &conn.bridge_network,
            "delete",
            "ip-dhcp-host",
            &entry,
            "--live",
            "--config",
        ],
    )
    .await?;
    Ok(())
}

/// Polls `virsh domifaddr <name>` for up to 60 seconds for the guest's
/// first IPv4 address.
pub async fn discover_guest_ip(
    runner: &dyn CommandRunner,
    conn: &NodeConnection,
    domain_name: &str,
) -> Result<Ipv4Addr> {
    let re = Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})/\d+").unwrap();
    for _ in 0..60 {
        if let Ok(output) = virsh(runner, conn, &["domifaddr", domain_name]).await {
            if let Some(caps) = re.captures(&output) {
                if let Ok(addr) = caps[1].parse() {
                    return Ok(addr);
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
    Err(AnvilError::Timeout {
        message: format!("{domain_name} did not report a DHCP address within 60s"),
    })
}

/// Sweeps stale DHCP host reservations: parses the network's XML for
/// `<host mac='...' ip='.../>` entries and removes any whose MAC is not
/// claimed by a live instance.
pub async fn sweep_stale_reservations(
    runner: &dyn CommandRunner,
    conn: &NodeConnection,
    live_macs: &HashSet<String>,
) -> Result<usize> {
    let xml = virsh(runner, conn, &["net-dumpxml", &conn.bridge_network]).await?;
    let re = Regex::new(r"<host mac='([0-9a-fA-F:]+)' ip='([0-9.]+)'\s*/>").unwrap();
    let mut removed = 0;
    for caps in re.captures_iter(&xml) {
        let mac = &caps[1];
        let ip: Ipv4Addr = caps[2].parse().map_err(|_| AnvilError::internal("bad dhcp host ip in net xml"))?;
        if !live_macs.contains(mac) {
            remove_dhcp_reservation(runner, conn, mac, ip).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_skips_network_and_gateway() {
        let mut pool = VmIpPool::new("10.100.10.0/24").unwrap();
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 100, 10, 2));
    }

    #[test]
    fn released_ip_is_reused() {
        let mut pool = VmIpPool::new("10.100.10.0/24").unwrap();
        let a = pool.allocate().unwrap();
        pool.allocate().unwrap();
        pool.release(a);
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    fn mac_is_deterministic_and_in_qemu_range() {
        let a = mac_for_instance("i-abc123");
        let b = mac_for_instance("i-abc123");
        let c = mac_for_instance("i-xyz999");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("52:54:00:"));
    }
}
