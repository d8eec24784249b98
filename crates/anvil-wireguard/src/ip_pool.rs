use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use anvil_core::error::{AnvilError, Result};

/// Monotonic allocator over the lab `/16`. Skips the network address
/// and the server's own `.0.1`; refuses to wrap once every address has
/// been handed out. Released addresses return to a free-set so the
/// pool doesn't need a wraparound to reclaim them.
pub struct IpPool {
    network: u32,
    prefix_len: u32,
    next: u32,
    free: BTreeSet<u32>,
    reserved: BTreeSet<u32>,
}

impl IpPool {
    /// `cidr` like `"10.100.0.0/16"`. The server's own address
    /// (`<network>.0.1`) is reserved up front.
    pub fn new(cidr: &str) -> Result<Self> {
        let (addr, prefix_len) = parse_cidr(cidr)?;
        let network = u32::from(addr);
        let server_ip = network | 1;
        let mut reserved = BTreeSet::new();
        reserved.insert(network);
        reserved.insert(server_ip);

        Ok(Self {
            network,
            prefix_len,
            next: network + 1,
            free: BTreeSet::new(),
            reserved,
        })
    }

    fn broadcast(&self) -> u32 {
        let host_bits = 32 - self.prefix_len;
        let mask = if host_bits == 32 {
            u32::MAX
        } else {
            (1u32 << host_bits) - 1
        };
        self.network | mask
    }

    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        if let Some(&addr) = self.free.iter().next() {
            self.free.remove(&addr);
            return Ok(Ipv4Addr::from(addr));
        }

        let upper = self.broadcast();
        while self.next < upper {
            let candidate = self.next;
            self.next += 1;
            if !self.reserved.contains(&candidate) {
                return Ok(Ipv4Addr::from(candidate));
            }
        }

        Err(AnvilError::Exhausted {
            message: "wireguard IP pool exhausted".to_string(),
        })
    }

    pub fn release(&mut self, addr: Ipv4Addr) {
        let raw = u32::from(addr);
        if raw > self.network && raw < self.broadcast() && !self.reserved.contains(&raw) {
            self.free.insert(raw);
        }
    }
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u32)> {
    let (addr_str, prefix_str) = cidr.split_once('/').ok_or_else(|| AnvilError::Validation {
        message: format!("invalid CIDR: {cidr}"),
    })?;
    let addr: Ipv4Addr = addr_str.parse().map_err(|_| AnvilError::Validation {
        message: format!("invalid CIDR address: {cidr}"),
    })?;
    let prefix_len: u32 = prefix_str.parse().map_err(|_| AnvilError::Validation {
        message: format!("invalid CIDR prefix: {cidr}"),
    })?;
    Ok((addr, prefix_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_skips_network_and_server_addresses() {
        let mut pool = IpPool::new("10.100.0.0/16").unwrap();
        let first = pool.allocate().unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 100, 0, 2));
    }

    #[test]
    fn released_addresses_are_reused_before_advancing() {
        let mut pool = IpPool::new("10.100.0.0/16").unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.release(a);
        let c = pool.allocate().unwrap();
        assert_eq!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn exhausted_pool_refuses_to_wrap() {
        let mut pool = IpPool::new("10.100.255.254/31").unwrap();
        let err = pool.allocate().unwrap_err();
        assert_eq!(err.tag(), "exhausted");
    }
}
