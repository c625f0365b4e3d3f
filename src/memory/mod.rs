//! Per kernel memory segments.
//!
//! Every segment lives in its own window of a single unified address space,
//! so an address alone identifies the segment it belongs to. Device global
//! memory sits above all windows, starting at [`global::GLOBAL_BASE`].

pub mod global;

pub use global::{AllocationInfo, Allocations, GlobalMemory};

use crate::{config, error::Error};
use indexmap::IndexMap;
use rangemap::RangeMap;
use serde::Serialize;

pub const WINDOW_SIZE: u64 = 0x0800_0000;

pub const PARAM_BASE: u64 = 0x1000_0000;
pub const CONST_BASE: u64 = 0x2000_0000;
pub const SHARED_BASE: u64 = 0x3000_0000;
pub const GLOBAL_SHARED_BASE: u64 = 0x3800_0000;
pub const LOCAL_BASE: u64 = 0x4000_0000;
pub const STACK_BASE: u64 = 0x5000_0000;
pub const TEXTURE_BASE: u64 = 0x6000_0000;

#[derive(
    Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, strum::Display, strum::EnumIter, Serialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum Segment {
    Param,
    Const,
    Shared,
    /// Module scope shared variables.
    GlobalShared,
    Local,
    Stack,
    Texture,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, strum::Display, Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum AccessKind {
    Read,
    Write,
    Atomic,
}

/// Who shares the storage behind a region.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, strum::Display, Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum Scope {
    Thread,
    Block,
    Kernel,
}

impl Segment {
    #[must_use]
    pub fn base(&self) -> u64 {
        match self {
            Self::Param => PARAM_BASE,
            Self::Const => CONST_BASE,
            Self::Shared => SHARED_BASE,
            Self::GlobalShared => GLOBAL_SHARED_BASE,
            Self::Local => LOCAL_BASE,
            Self::Stack => STACK_BASE,
            Self::Texture => TEXTURE_BASE,
        }
    }

    #[must_use]
    pub fn scope(&self) -> Scope {
        match self {
            Self::Param | Self::Const | Self::Texture => Scope::Kernel,
            Self::Shared | Self::GlobalShared => Scope::Block,
            Self::Local | Self::Stack => Scope::Thread,
        }
    }

    /// The instruction state space that addresses this segment.
    #[must_use]
    pub fn space(&self) -> ptx::Space {
        match self {
            Self::Param => ptx::Space::Param,
            Self::Const => ptx::Space::Const,
            Self::Shared | Self::GlobalShared => ptx::Space::Shared,
            Self::Local | Self::Stack => ptx::Space::Local,
            Self::Texture => ptx::Space::Texture,
        }
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::Param | Self::Const | Self::Texture)
    }

    /// Segment whose window contains `address`.
    #[must_use]
    pub fn of(address: u64) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|segment| {
            let base = segment.base();
            (base..base + WINDOW_SIZE).contains(&address)
        })
    }

    fn capacity(&self, config: &config::Emulator) -> u64 {
        let capacity = match self {
            Self::Param => config.param_memory_size,
            Self::Const => config.const_memory_size,
            Self::Shared | Self::GlobalShared => config.shared_memory_per_block,
            Self::Local => config.local_memory_per_thread,
            Self::Stack => config.stack_size_per_thread,
            Self::Texture => config.texture_memory_size,
        };
        capacity.min(WINDOW_SIZE)
    }
}

/// A named area inside a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub segment: Segment,
    pub name: String,
    /// Offset from the segment base.
    pub offset: u64,
    pub size: u64,
    pub scope: Scope,
}

impl Region {
    #[must_use]
    pub fn address(&self) -> u64 {
        self.segment.base() + self.offset
    }
}

#[must_use]
pub fn next_multiple(value: u64, multiple_of: u64) -> u64 {
    let multiple_of = multiple_of.max(1);
    value.div_ceil(multiple_of) * multiple_of
}

#[derive(Debug, Clone)]
struct Layout {
    capacity: u64,
    used: u64,
    regions: IndexMap<String, Region>,
}

/// Memory regions of one kernel.
#[derive(Debug, Clone)]
pub struct Memory {
    owner: String,
    layouts: IndexMap<Segment, Layout>,
    by_address: RangeMap<u64, (Segment, usize)>,
    /// Parameter memory contents.
    pub param: Vec<u8>,
    /// Constant memory contents.
    pub constant: Vec<u8>,
}

impl Memory {
    #[must_use]
    pub fn new(owner: &str, config: &config::Emulator) -> Self {
        use strum::IntoEnumIterator;
        let layouts = Segment::iter()
            .map(|segment| {
                let layout = Layout {
                    capacity: segment.capacity(config),
                    used: 0,
                    regions: IndexMap::new(),
                };
                (segment, layout)
            })
            .collect();
        Self {
            owner: owner.to_string(),
            layouts,
            by_address: RangeMap::new(),
            param: Vec::new(),
            constant: Vec::new(),
        }
    }

    fn layout(&self, segment: Segment) -> &Layout {
        &self.layouts[&segment]
    }

    fn layout_mut(&mut self, segment: Segment) -> &mut Layout {
        self.layouts
            .get_mut(&segment)
            .unwrap_or_else(|| unreachable!("every segment has a layout"))
    }

    /// Reserve `size` bytes in `segment` and return their offset.
    pub fn allocate(&mut self, segment: Segment, size: u64, align: u64) -> Result<u64, Error> {
        let layout = self.layout_mut(segment);
        let offset = next_multiple(layout.used, align);
        let available = layout.capacity.saturating_sub(layout.used);
        if offset.checked_add(size).map_or(true, |end| end > layout.capacity) {
            return Err(Error::OutOfMemory {
                segment,
                requested: size,
                available,
                capacity: layout.capacity,
            });
        }
        layout.used = offset + size;
        Ok(offset)
    }

    /// Allocate and name a region.
    pub fn declare(
        &mut self,
        segment: Segment,
        name: &str,
        size: u64,
        align: u64,
    ) -> Result<Region, Error> {
        if self.layout(segment).regions.contains_key(name) {
            return Err(Error::invalid_kernel(
                &self.owner,
                format!("{name:?} is declared twice in {segment} memory"),
            ));
        }
        let offset = self.allocate(segment, size, align)?;
        let region = Region {
            segment,
            name: name.to_string(),
            offset,
            size,
            scope: segment.scope(),
        };
        log::trace!(
            "{}: {segment}[{name}] at {:#x} ({} bytes)",
            self.owner,
            region.address(),
            size
        );
        let layout = self.layout_mut(segment);
        let (index, _) = layout.regions.insert_full(name.to_string(), region.clone());
        if size > 0 {
            let start = region.address();
            self.by_address.insert(start..start + size, (segment, index));
        }
        Ok(region)
    }

    #[must_use]
    pub fn resolve(&self, segment: Segment, name: &str) -> Option<&Region> {
        self.layout(segment).regions.get(name)
    }

    /// Find a region by name in any segment.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Region> {
        self.layouts
            .values()
            .find_map(|layout| layout.regions.get(name))
    }

    /// Region containing `address`.
    #[must_use]
    pub fn region_at(&self, address: u64) -> Option<&Region> {
        let (segment, index) = self.by_address.get(&address)?;
        self.layout(*segment)
            .regions
            .get_index(*index)
            .map(|(_, region)| region)
    }

    /// Whether `[address, address+size)` lies inside exactly one region whose
    /// segment permits `kind`.
    #[must_use]
    pub fn check_access(&self, address: u64, size: u64, kind: AccessKind) -> bool {
        if size == 0 {
            return false;
        }
        let Some(region) = self.region_at(address) else {
            return false;
        };
        let Some(end) = address.checked_add(size) else {
            return false;
        };
        let permitted = kind == AccessKind::Read || region.segment.is_writable();
        permitted && end <= region.address() + region.size
    }

    /// Bytes in use in `segment`.
    #[must_use]
    pub fn size(&self, segment: Segment) -> u64 {
        self.layout(segment).used
    }

    pub fn regions(&self, segment: Segment) -> impl Iterator<Item = &Region> + '_ {
        self.layout(segment).regions.values()
    }

    /// Drop every region of `segment`.
    pub fn reset(&mut self, segment: Segment) {
        let layout = self.layout_mut(segment);
        layout.used = 0;
        let regions = std::mem::take(&mut layout.regions);
        for region in regions.values().filter(|region| region.size > 0) {
            let start = region.address();
            self.by_address.remove(start..start + region.size);
        }
    }
}

/// Little endian load of a `size` byte value.
#[must_use]
pub fn read_value(bytes: &[u8], size: u64) -> u64 {
    let mut buf = [0u8; 8];
    let size = (size as usize).min(8).min(bytes.len());
    buf[..size].copy_from_slice(&bytes[..size]);
    u64::from_le_bytes(buf)
}

/// Little endian store of the low `size` bytes of `value`.
pub fn write_value(bytes: &mut [u8], size: u64, value: u64) {
    let size = (size as usize).min(8).min(bytes.len());
    bytes[..size].copy_from_slice(&value.to_le_bytes()[..size]);
}

#[cfg(test)]
mod tests {
    use super::{AccessKind, Memory, Segment, CONST_BASE, SHARED_BASE};
    use crate::{config, error::Error};
    use color_eyre::eyre;
    use similar_asserts as diff;

    fn memory() -> Memory {
        Memory::new("test", &config::Emulator::default())
    }

    #[test]
    fn test_check_access_requires_exactly_one_region() -> eyre::Result<()> {
        let mut mem = memory();
        let a = mem.declare(Segment::Shared, "a", 16, 4)?;
        let b = mem.declare(Segment::Shared, "b", 16, 4)?;
        diff::assert_eq!(have: a.address(), want: SHARED_BASE);
        diff::assert_eq!(have: b.address(), want: SHARED_BASE + 16);

        assert!(mem.check_access(a.address(), 16, AccessKind::Write));
        assert!(mem.check_access(a.address() + 12, 4, AccessKind::Read));
        // spans a and b
        assert!(!mem.check_access(a.address() + 12, 8, AccessKind::Read));
        // past the last region
        assert!(!mem.check_access(b.address() + 16, 4, AccessKind::Read));
        assert!(!mem.check_access(0, 4, AccessKind::Read));
        assert!(!mem.check_access(a.address(), 0, AccessKind::Read));
        Ok(())
    }

    #[test]
    fn test_read_only_segments() -> eyre::Result<()> {
        let mut mem = memory();
        let c = mem.declare(Segment::Const, "c", 8, 8)?;
        diff::assert_eq!(have: c.address(), want: CONST_BASE);
        assert!(mem.check_access(c.address(), 8, AccessKind::Read));
        assert!(!mem.check_access(c.address(), 8, AccessKind::Write));
        assert!(!mem.check_access(c.address(), 8, AccessKind::Atomic));
        Ok(())
    }

    #[test]
    fn test_alignment_and_out_of_memory() -> eyre::Result<()> {
        let mut mem = memory();
        let capacity = config::Emulator::default().shared_memory_per_block;
        mem.declare(Segment::Shared, "byte", 1, 1)?;
        let word = mem.declare(Segment::Shared, "word", 8, 8)?;
        diff::assert_eq!(have: word.offset, want: 8);
        let err = mem.declare(Segment::Shared, "huge", capacity, 4).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { segment: Segment::Shared, .. }), "{err}");
        Ok(())
    }

    #[test]
    fn test_reset_removes_regions() -> eyre::Result<()> {
        let mut mem = memory();
        let a = mem.declare(Segment::Local, "a", 4, 4)?;
        mem.reset(Segment::Local);
        assert!(!mem.check_access(a.address(), 4, AccessKind::Read));
        assert!(mem.resolve(Segment::Local, "a").is_none());
        diff::assert_eq!(have: mem.size(Segment::Local), want: 0);
        Ok(())
    }

    #[test]
    fn test_duplicate_declaration_is_invalid() -> eyre::Result<()> {
        let mut mem = memory();
        mem.declare(Segment::Const, "c", 4, 4)?;
        assert!(matches!(
            mem.declare(Segment::Const, "c", 4, 4),
            Err(Error::InvalidKernel { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_segment_of_address() {
        diff::assert_eq!(have: Segment::of(SHARED_BASE + 3), want: Some(Segment::Shared));
        diff::assert_eq!(have: Segment::of(super::GLOBAL_SHARED_BASE), want: Some(Segment::GlobalShared));
        diff::assert_eq!(have: Segment::of(super::global::GLOBAL_BASE), want: None);
    }
}
