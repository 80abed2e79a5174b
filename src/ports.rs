//! Public-port allocation for client-facing listeners.
//!
//! The relay hands every origin one port out of a configured inclusive range.
//! [`PortRange`] is the parsed form of the `--ports` flag
//! (`<bind_addr>:<low>-<high>`); [`PortAllocator`] is the process-wide used
//! set over that range.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, ensure};

/// Bind address plus inclusive port range for public listeners.
///
/// The host part may be empty (`:8001-9000`), meaning all interfaces; the
/// empty form is kept verbatim for advertised addresses and normalized to
/// `0.0.0.0` only when binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    pub host: String,
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    /// Host usable with `TcpListener::bind`.
    pub fn bind_host(&self) -> &str {
        if self.host.is_empty() { "0.0.0.0" } else { &self.host }
    }

    /// The address text advertised to origins for `port`.
    pub fn advertised_addr(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }

    /// The address the relay actually binds for `port`.
    pub fn bind_addr(&self, port: u16) -> String {
        format!("{}:{}", self.bind_host(), port)
    }

    /// Number of ports in the (inclusive) range.
    pub fn size(&self) -> usize {
        usize::from(self.high - self.low) + 1
    }
}

impl FromStr for PortRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (host, range) = s
            .split_once(':')
            .context("port range must be <bind_addr>:<low>-<high>")?;
        let (low, high) = range
            .split_once('-')
            .context("port range must be <bind_addr>:<low>-<high>")?;
        let low: u16 = low.parse().context("invalid low port")?;
        let high: u16 = high.parse().context("invalid high port")?;
        ensure!(low <= high, "port range is inverted ({low} > {high})");
        Ok(PortRange {
            host: host.to_string(),
            low,
            high,
        })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.host, self.low, self.high)
    }
}

/// Process-wide set of in-use public ports.
///
/// A port is marked used strictly between `allocate` and `release`; no two
/// live sessions ever hold the same port. The lock guards only the in-memory
/// set, never I/O.
pub struct PortAllocator {
    range: PortRange,
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        PortAllocator {
            range,
            used: Mutex::new(HashSet::new()),
        }
    }

    pub fn range(&self) -> &PortRange {
        &self.range
    }

    /// Claim the lowest unused port in the range, or `None` when the range is
    /// exhausted. Exhaustion leaves the used set untouched.
    pub fn allocate(&self) -> Option<u16> {
        let mut used = self.used.lock().expect("port set poisoned");
        for port in self.range.low..=self.range.high {
            if used.insert(port) {
                return Some(port);
            }
        }
        None
    }

    /// Return a port to the pool. Releasing an unallocated port is a no-op.
    pub fn release(&self, port: u16) {
        self.used.lock().expect("port set poisoned").remove(&port);
    }

    #[cfg(test)]
    fn in_use(&self) -> usize {
        self.used.lock().expect("port set poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(low: u16, high: u16) -> PortRange {
        PortRange {
            host: "127.0.0.1".to_string(),
            low,
            high,
        }
    }

    #[test]
    fn allocates_lowest_first() {
        let alloc = PortAllocator::new(range(8001, 8003));
        assert_eq!(alloc.allocate(), Some(8001));
        assert_eq!(alloc.allocate(), Some(8002));
        assert_eq!(alloc.allocate(), Some(8003));
        assert_eq!(alloc.allocate(), None);
    }

    #[test]
    fn exhaustion_leaves_set_unchanged() {
        let alloc = PortAllocator::new(range(9000, 9000));
        assert_eq!(alloc.allocate(), Some(9000));
        assert_eq!(alloc.in_use(), 1);
        assert_eq!(alloc.allocate(), None);
        assert_eq!(alloc.in_use(), 1);
        // The failed allocation must not have poisoned the set: releasing the
        // one real port makes it allocatable again.
        alloc.release(9000);
        assert_eq!(alloc.allocate(), Some(9000));
    }

    #[test]
    fn release_is_idempotent() {
        let alloc = PortAllocator::new(range(8001, 8002));
        let port = alloc.allocate().unwrap();
        alloc.release(port);
        alloc.release(port);
        alloc.release(7000);
        assert_eq!(alloc.allocate(), Some(port));
    }

    #[test]
    fn freed_port_is_reused_lowest_first() {
        let alloc = PortAllocator::new(range(8001, 8003));
        assert_eq!(alloc.allocate(), Some(8001));
        assert_eq!(alloc.allocate(), Some(8002));
        alloc.release(8001);
        assert_eq!(alloc.allocate(), Some(8001));
    }

    #[test]
    fn parse_full_form() {
        let range: PortRange = "127.0.0.1:8001-9000".parse().unwrap();
        assert_eq!(range.host, "127.0.0.1");
        assert_eq!(range.low, 8001);
        assert_eq!(range.high, 9000);
        assert_eq!(range.size(), 1000);
        assert_eq!(range.to_string(), "127.0.0.1:8001-9000");
    }

    #[test]
    fn parse_empty_host_binds_all_interfaces() {
        let range: PortRange = ":8001-9000".parse().unwrap();
        assert_eq!(range.host, "");
        assert_eq!(range.bind_host(), "0.0.0.0");
        assert_eq!(range.advertised_addr(8001), ":8001");
        assert_eq!(range.bind_addr(8001), "0.0.0.0:8001");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("8001-9000".parse::<PortRange>().is_err());
        assert!("127.0.0.1:8001".parse::<PortRange>().is_err());
        assert!("127.0.0.1:low-9000".parse::<PortRange>().is_err());
        assert!("127.0.0.1:9000-8001".parse::<PortRange>().is_err());
        assert!("127.0.0.1:8001-99999".parse::<PortRange>().is_err());
    }

    #[test]
    fn single_port_range() {
        let range: PortRange = "127.0.0.1:8001-8001".parse().unwrap();
        assert_eq!(range.size(), 1);
    }
}
