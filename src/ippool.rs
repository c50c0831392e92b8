//! Bounded pool of virtual IPs handed out to tunnel clients.
//!
//! On construction the pool enumerates successor addresses in lexicographic
//! byte order between `start` and `end`, excluding *both* endpoints, up to
//! a hard cap of 512,000 addresses.

use std::collections::VecDeque;
use std::net::IpAddr;

use parking_lot::Mutex;
use thiserror::Error;

/// Errors returned constructing or using an [`IpPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// `start` and `end` were not the same IP version.
    #[error("start and end address must be the same IP version")]
    VersionMismatch,
    /// `start >= end`, leaving no addresses to enumerate.
    #[error("start address must be strictly less than end address")]
    EmptyRange,
}

const MAX_POOL_SIZE: usize = 512_000;

fn to_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn from_bytes(bytes: &[u8]) -> IpAddr {
    if bytes.len() == 4 {
        let a: [u8; 4] = bytes.try_into().unwrap();
        IpAddr::from(a)
    } else {
        let a: [u8; 16] = bytes.try_into().unwrap();
        IpAddr::from(a)
    }
}

fn increment(bytes: &mut [u8]) -> bool {
    for b in bytes.iter_mut().rev() {
        if *b == 0xff {
            *b = 0;
        } else {
            *b += 1;
            return true;
        }
    }
    false // overflowed past the top of the address space
}

/// A FIFO free-list of allocatable addresses within `(start, end)`.
pub struct IpPool {
    free: Mutex<VecDeque<Vec<u8>>>,
}

impl IpPool {
    /// Build the pool, excluding both `start` and `end`.
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self, PoolError> {
        match (start, end) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {}
            _ => return Err(PoolError::VersionMismatch),
        }
        if start >= end {
            return Err(PoolError::EmptyRange);
        }

        let mut cursor = to_bytes(start);
        if !increment(&mut cursor) {
            return Err(PoolError::EmptyRange);
        }

        let mut free = VecDeque::new();
        loop {
            let current = from_bytes(&cursor);
            if current >= end {
                break;
            }
            free.push_back(cursor.clone());
            if free.len() >= MAX_POOL_SIZE {
                break;
            }
            if !increment(&mut cursor) {
                break;
            }
        }

        Ok(Self {
            free: Mutex::new(free),
        })
    }

    /// Pop an address from the front of the free list. Returns `None` when
    /// the pool is depleted, never blocking.
    pub fn allocate(&self) -> Option<IpAddr> {
        self.free.lock().pop_front().map(|bytes| from_bytes(&bytes))
    }

    /// Push an address to the back of the free list.
    pub fn free(&self, ip: IpAddr) {
        self.free.lock().push_back(to_bytes(ip));
    }

    /// Number of addresses currently available.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_both_endpoints_and_caps_allocation_count() {
        let pool = IpPool::new(
            "192.168.0.0".parse().unwrap(),
            "192.168.255.255".parse().unwrap(),
        )
        .unwrap();
        let mut allocated = Vec::new();
        while let Some(ip) = pool.allocate() {
            allocated.push(ip);
        }
        assert_eq!(allocated.len(), 65_534);
        assert!(!allocated.contains(&"192.168.0.0".parse().unwrap()));
        assert!(!allocated.contains(&"192.168.255.255".parse().unwrap()));
    }

    #[test]
    fn conservation_after_free() {
        let pool = IpPool::new("10.0.0.0".parse().unwrap(), "10.0.0.10".parse().unwrap()).unwrap();
        let total = pool.available();
        let mut taken = Vec::new();
        while let Some(ip) = pool.allocate() {
            taken.push(ip);
        }
        assert!(pool.allocate().is_none());
        for ip in taken {
            pool.free(ip);
        }
        assert_eq!(pool.available(), total);
    }

    #[test]
    fn rejects_mismatched_versions_and_empty_ranges() {
        assert!(IpPool::new("10.0.0.0".parse().unwrap(), "::1".parse().unwrap()).is_err());
        assert!(IpPool::new("10.0.0.5".parse().unwrap(), "10.0.0.5".parse().unwrap()).is_err());
    }
}
