use super::next_multiple;
use crate::error::Error;
use crate::sync::{Arc, Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;

/// First address handed out for device allocations.
pub const GLOBAL_BASE: u64 = 0x1_0000_0000;
pub const ALIGNMENT_BYTES: u64 = 256;

/// Device global memory as seen by running kernels.
pub trait GlobalMemory: Send + Sync {
    /// Read `data.len()` bytes starting at `address`.
    fn read(&self, address: u64, data: &mut [u8]) -> Result<(), Error>;

    /// Write `data` starting at `address`.
    fn write(&self, address: u64, data: &[u8]) -> Result<(), Error>;

    /// Atomically replace the `size` byte value at `address` with `update(old)`.
    ///
    /// Returns the old value.
    fn atomic(
        &self,
        address: u64,
        size: u64,
        update: &mut dyn FnMut(u64) -> u64,
    ) -> Result<u64, Error>;

    /// Whether `[address, address+size)` lies inside a single allocation.
    fn contains(&self, address: u64, size: u64) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AllocationInfo {
    pub address: u64,
    pub size: u64,
    /// Allocated as host memory mapped into the device address space.
    pub host: bool,
}

impl std::fmt::Display for AllocationInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:#x}, {:#x}) {}{}",
            self.address,
            self.address + self.size,
            human_bytes::human_bytes(self.size as f64),
            if self.host { " (host)" } else { "" }
        )
    }
}

#[derive(Debug)]
pub struct Allocation {
    pub info: AllocationInfo,
    data: Mutex<Vec<u8>>,
}

impl Allocation {
    fn range(&self, address: u64, size: u64) -> Option<std::ops::Range<usize>> {
        let start = address.checked_sub(self.info.address)?;
        let end = start.checked_add(size)?;
        if end > self.info.size {
            return None;
        }
        Some(start as usize..end as usize)
    }
}

/// Allocation table of one device.
///
/// Each allocation has its own lock, so atomics are serialised per allocation.
#[derive(Debug)]
pub struct Allocations {
    allocations: RwLock<BTreeMap<u64, Arc<Allocation>>>,
    heap: Mutex<Heap>,
    capacity: u64,
}

#[derive(Debug)]
struct Heap {
    next: u64,
    used: u64,
}

impl Allocations {
    /// An empty table holding at most `capacity` bytes.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            allocations: RwLock::new(BTreeMap::new()),
            heap: Mutex::new(Heap {
                next: GLOBAL_BASE,
                used: 0,
            }),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Allocate `size` zeroed bytes.
    pub fn allocate(&self, size: u64, host: bool) -> Result<u64, Error> {
        let address = {
            let mut heap = self.heap.lock();
            let available = self.capacity.saturating_sub(heap.used);
            let out_of_memory = Error::OutOfDeviceMemory {
                requested: size,
                available,
                capacity: self.capacity,
            };
            if size > available {
                return Err(out_of_memory);
            }
            let address = next_multiple(heap.next, ALIGNMENT_BYTES);
            // keep distinct allocations apart even when empty
            let next = address
                .checked_add(size.max(1))
                .and_then(|end| end.checked_next_multiple_of(ALIGNMENT_BYTES));
            let Some(next) = next else {
                return Err(out_of_memory);
            };
            heap.next = next;
            heap.used += size;
            address
        };
        let info = AllocationInfo {
            address,
            size,
            host,
        };
        log::debug!("allocate {info}");
        let allocation = Allocation {
            info,
            data: Mutex::new(vec![0; size as usize]),
        };
        self.allocations.write().insert(address, Arc::new(allocation));
        Ok(address)
    }

    /// Release the allocation starting at `address`.
    pub fn free(&self, address: u64) -> Result<(), Error> {
        let allocation = self.allocations.write().remove(&address);
        match allocation {
            Some(allocation) => {
                log::debug!("free {}", allocation.info);
                let mut heap = self.heap.lock();
                heap.used = heap.used.saturating_sub(allocation.info.size);
                Ok(())
            }
            None => Err(Error::InvalidDevicePointer(address)),
        }
    }

    /// Allocation containing `address`.
    #[must_use]
    pub fn get(&self, address: u64) -> Option<Arc<Allocation>> {
        let allocations = self.allocations.read();
        let (_, allocation) = allocations.range(..=address).next_back()?;
        let info = allocation.info;
        if address < info.address + info.size.max(1) {
            Some(Arc::clone(allocation))
        } else {
            None
        }
    }

    #[must_use]
    pub fn info(&self, address: u64) -> Option<AllocationInfo> {
        self.get(address).map(|allocation| allocation.info)
    }

    /// The allocations immediately below and above `address`.
    #[must_use]
    pub fn nearby(&self, address: u64) -> Vec<AllocationInfo> {
        let allocations = self.allocations.read();
        let below = allocations.range(..=address).next_back();
        let above = allocations
            .range(address.saturating_add(1)..)
            .next();
        below
            .into_iter()
            .chain(above)
            .map(|(_, allocation)| allocation.info)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.allocations
            .read()
            .values()
            .map(|allocation| allocation.info.size)
            .sum()
    }

    fn with_range<T>(
        &self,
        address: u64,
        size: u64,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> Result<T, Error> {
        let allocation = self
            .get(address)
            .ok_or(Error::InvalidDevicePointer(address))?;
        let range = allocation
            .range(address, size)
            .ok_or(Error::InvalidDevicePointer(address))?;
        let mut data = allocation.data.lock();
        Ok(f(&mut data[range]))
    }
}

impl GlobalMemory for Allocations {
    fn read(&self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        self.with_range(address, data.len() as u64, |bytes| {
            data.copy_from_slice(bytes);
        })
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<(), Error> {
        self.with_range(address, data.len() as u64, |bytes| {
            bytes.copy_from_slice(data);
        })
    }

    fn atomic(
        &self,
        address: u64,
        size: u64,
        update: &mut dyn FnMut(u64) -> u64,
    ) -> Result<u64, Error> {
        self.with_range(address, size, |bytes| {
            let old = super::read_value(bytes, size);
            super::write_value(bytes, size, update(old));
            old
        })
    }

    fn contains(&self, address: u64, size: u64) -> bool {
        self.get(address)
            .is_some_and(|allocation| size > 0 && allocation.range(address, size).is_some())
    }
}
