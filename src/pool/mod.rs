//! Virtual address pool
//!
//! Clients are handed odd host offsets of the virtual subnet (3, 5, 7, ...)
//! so that every client address `a` has an even neighbour `a - 1` to act as
//! the server side of its point-to-point link. Occupancy is a table of
//! atomic flags, one per candidate, claimed with compare-and-swap; the pool
//! is therefore shared by reference without a lock.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// First host offset handed to a client
const FIRST_OFFSET: u32 = 3;

/// Shortest prefix accepted for the virtual subnet
const MIN_PREFIX: u8 = 16;

/// Address pool errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("no free address in {0}")]
    Exhausted(Ipv4Net),

    #[error("subnet {0} has no assignable client address")]
    SubnetTooSmall(Ipv4Net),

    #[error("subnet {0} is larger than /16")]
    SubnetTooLarge(Ipv4Net),
}

/// Lock-free allocator of client addresses within one subnet
#[derive(Debug)]
pub struct AddressPool {
    subnet: Ipv4Net,
    slots: Box<[AtomicBool]>,
    reserved: Option<usize>,
}

impl AddressPool {
    /// Create a pool covering `subnet` (host bits are ignored)
    pub fn new(subnet: Ipv4Net) -> Result<Self, PoolError> {
        let subnet = subnet.trunc();
        if subnet.prefix_len() < MIN_PREFIX {
            return Err(PoolError::SubnetTooLarge(subnet));
        }

        let broadcast = broadcast_offset(&subnet);
        let count = broadcast.saturating_sub(FIRST_OFFSET) / 2;
        if count == 0 {
            return Err(PoolError::SubnetTooSmall(subnet));
        }

        let slots = (0..count).map(|_| AtomicBool::new(false)).collect();
        Ok(Self {
            subnet,
            slots,
            reserved: None,
        })
    }

    /// Create a pool from the server's own interface address.
    ///
    /// If the server address lands on a candidate slot that slot is taken
    /// permanently.
    pub fn with_server(server: Ipv4Net) -> Result<Self, PoolError> {
        let mut pool = Self::new(server)?;
        if let Some(slot) = pool.slot_of(server.addr()) {
            pool.slots[slot].store(true, Ordering::Release);
            pool.reserved = Some(slot);
        }
        Ok(pool)
    }

    /// Claim the lowest free address
    pub fn allocate(&self) -> Result<Ipv4Net, PoolError> {
        for (slot, flag) in self.slots.iter().enumerate() {
            if flag
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(self.host(slot));
            }
        }
        Err(PoolError::Exhausted(self.subnet))
    }

    /// Return an address to the pool.
    ///
    /// Returns `false` if the address is not a client slot of this pool, is
    /// the reserved server slot, or was not held.
    pub fn release(&self, addr: Ipv4Addr) -> bool {
        match self.slot_of(addr) {
            Some(slot) if Some(slot) != self.reserved => {
                self.slots[slot].swap(false, Ordering::AcqRel)
            }
            _ => false,
        }
    }

    /// The virtual subnet
    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// Number of addresses clients can hold at once
    pub fn capacity(&self) -> usize {
        self.slots.len() - usize::from(self.reserved.is_some())
    }

    /// Number of addresses currently held by clients
    pub fn in_use(&self) -> usize {
        let taken = self
            .slots
            .iter()
            .filter(|flag| flag.load(Ordering::Acquire))
            .count();
        taken - usize::from(self.reserved.is_some())
    }

    fn slot_of(&self, addr: Ipv4Addr) -> Option<usize> {
        if !self.subnet.contains(&addr) {
            return None;
        }
        let offset = u32::from(addr) - u32::from(self.subnet.network());
        if offset < FIRST_OFFSET || offset % 2 == 0 {
            return None;
        }
        let slot = ((offset - FIRST_OFFSET) / 2) as usize;
        (slot < self.slots.len()).then_some(slot)
    }

    fn host(&self, slot: usize) -> Ipv4Net {
        let offset = FIRST_OFFSET + 2 * slot as u32;
        let addr = Ipv4Addr::from(u32::from(self.subnet.network()) + offset);
        Ipv4Net::new(addr, self.subnet.prefix_len()).unwrap_or_else(|_| Ipv4Net::from(addr))
    }
}

fn broadcast_offset(subnet: &Ipv4Net) -> u32 {
    u32::from(subnet.broadcast()) - u32::from(subnet.network())
}
