//! Region descriptors — base/length/permission records for enclave memory
//!
//! Every memory range the monitor hands to an enclave is described by a
//! `RegionDescriptor`. Descriptors are validated once when they are created
//! and treated as opaque, immutable values afterwards.
//!
//! A loaded image is described by a `Layout`: four page-aligned addresses
//! inside the exclusive region, ordered `loader < runtime < application < free`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one measured page in bytes
pub const PAGE_SIZE: usize = 4096;

/// Round a byte length up to a whole number of pages
pub fn page_round_up(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Number of pages needed to hold `len` bytes
pub fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE)
}

/// Access permission granted on a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    /// Read, write and execute (exclusive code/data memory)
    ReadWriteExecute,
    /// Read and write (shared memory)
    ReadWrite,
}

/// What a region is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    /// Exclusive code/data region, measured at finalize
    Exclusive,
    /// Untrusted memory shared with the host
    Untrusted,
    /// Connector region, mapped into a peer by the connection protocol
    Connector,
}

/// Base + length + permission record for a memory range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    base: u64,
    len: u64,
    perm: Permission,
    kind: RegionKind,
}

impl RegionDescriptor {
    /// Build a descriptor. Base and length must be page aligned, the length
    /// non-zero, and the range must not wrap the address space.
    pub fn new(base: u64, len: u64, perm: Permission, kind: RegionKind) -> Result<Self, String> {
        let page = PAGE_SIZE as u64;
        if len == 0 {
            return Err(format!("{:?} region has zero length", kind));
        }
        if base % page != 0 || len % page != 0 {
            return Err(format!(
                "{:?} region {:#x}+{:#x} is not page aligned",
                kind, base, len
            ));
        }
        if base.checked_add(len).is_none() {
            return Err(format!("{:?} region {:#x}+{:#x} wraps", kind, base, len));
        }
        Ok(Self {
            base,
            len,
            perm,
            kind,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last address of the region
    pub fn end(&self) -> u64 {
        self.base + self.len
    }

    pub fn perm(&self) -> Permission {
        self.perm
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn pages(&self) -> usize {
        (self.len as usize) / PAGE_SIZE
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn overlaps(&self, other: &RegionDescriptor) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

impl fmt::Display for RegionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}[{:#x}..{:#x}) {:?}",
            self.kind,
            self.base,
            self.end(),
            self.perm
        )
    }
}

/// Placement of a loaded image inside the exclusive region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub loader_base: u64,
    pub runtime_base: u64,
    pub app_base: u64,
    pub free_base: u64,
}

impl Layout {
    /// Size triple bound into the measurement: (runtime − loader, app − runtime, free − app).
    /// Only meaningful after `validate` succeeded.
    pub fn sizes(&self) -> [u64; 3] {
        [
            self.runtime_base - self.loader_base,
            self.app_base - self.runtime_base,
            self.free_base - self.app_base,
        ]
    }

    /// Check ordering, alignment and containment against the exclusive region
    /// and make sure the image does not overlap any other region.
    pub fn validate(
        &self,
        exclusive: &RegionDescriptor,
        others: &[RegionDescriptor],
    ) -> Result<(), String> {
        let page = PAGE_SIZE as u64;
        let bases = [
            ("loader", self.loader_base),
            ("runtime", self.runtime_base),
            ("application", self.app_base),
            ("free", self.free_base),
        ];

        for (name, addr) in bases {
            if addr % page != 0 {
                return Err(format!("{} base {:#x} is not page aligned", name, addr));
            }
        }

        for pair in bases.windows(2) {
            let (lo_name, lo) = pair[0];
            let (hi_name, hi) = pair[1];
            if lo >= hi {
                return Err(format!(
                    "{} base {:#x} must lie below {} base {:#x}",
                    lo_name, lo, hi_name, hi
                ));
            }
        }

        if self.loader_base != exclusive.base() {
            return Err(format!(
                "loader base {:#x} does not start the exclusive region at {:#x}",
                self.loader_base,
                exclusive.base()
            ));
        }
        if self.free_base > exclusive.end() {
            return Err(format!(
                "free base {:#x} lies past the exclusive region end {:#x}",
                self.free_base,
                exclusive.end()
            ));
        }

        let image = RegionDescriptor::new(
            self.loader_base,
            self.free_base - self.loader_base,
            exclusive.perm(),
            RegionKind::Exclusive,
        )?;
        if let Some(other) = others.iter().find(|r| r.overlaps(&image)) {
            return Err(format!("image {} overlaps {}", image, other));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exclusive(base: u64, pages: u64) -> RegionDescriptor {
        RegionDescriptor::new(
            base,
            pages * PAGE_SIZE as u64,
            Permission::ReadWriteExecute,
            RegionKind::Exclusive,
        )
        .unwrap()
    }

    fn layout(base: u64, l: u64, r: u64, a: u64) -> Layout {
        let p = PAGE_SIZE as u64;
        Layout {
            loader_base: base,
            runtime_base: base + l * p,
            app_base: base + (l + r) * p,
            free_base: base + (l + r + a) * p,
        }
    }

    #[test]
    fn test_descriptor_rejects_misaligned() {
        assert!(RegionDescriptor::new(0x1001, 4096, Permission::ReadWrite, RegionKind::Untrusted).is_err());
        assert!(RegionDescriptor::new(0x1000, 100, Permission::ReadWrite, RegionKind::Untrusted).is_err());
        assert!(RegionDescriptor::new(0x1000, 0, Permission::ReadWrite, RegionKind::Untrusted).is_err());
    }

    #[test]
    fn test_overlap() {
        let a = exclusive(0x10000, 4);
        let b = RegionDescriptor::new(0x13000, 0x2000, Permission::ReadWrite, RegionKind::Untrusted).unwrap();
        let c = RegionDescriptor::new(0x14000, 0x2000, Permission::ReadWrite, RegionKind::Untrusted).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(a.contains(0x13fff));
        assert!(!a.contains(0x14000));
    }

    #[test]
    fn test_valid_layout() {
        let region = exclusive(0x8000_0000, 16);
        let l = layout(0x8000_0000, 1, 2, 3);
        assert!(l.validate(&region, &[]).is_ok());
        let p = PAGE_SIZE as u64;
        assert_eq!(l.sizes(), [p, 2 * p, 3 * p]);
    }

    #[test]
    fn test_misordered_layout_rejected() {
        let region = exclusive(0x8000_0000, 16);
        let mut l = layout(0x8000_0000, 1, 2, 3);
        std::mem::swap(&mut l.runtime_base, &mut l.app_base);
        let err = l.validate(&region, &[]).unwrap_err();
        assert!(err.contains("must lie below"));

        let mut empty_runtime = layout(0x8000_0000, 1, 2, 3);
        empty_runtime.app_base = empty_runtime.runtime_base;
        assert!(empty_runtime.validate(&region, &[]).is_err());
    }

    #[test]
    fn test_layout_outside_region_rejected() {
        let region = exclusive(0x8000_0000, 4);
        let l = layout(0x8000_0000, 1, 2, 3);
        assert!(l.validate(&region, &[]).is_err());

        let shifted = layout(0x8000_1000, 1, 1, 1);
        assert!(shifted.validate(&region, &[]).is_err());
    }

    #[test]
    fn test_layout_overlapping_other_region_rejected() {
        let region = exclusive(0x8000_0000, 16);
        let untrusted = RegionDescriptor::new(
            0x8000_2000,
            0x1000,
            Permission::ReadWrite,
            RegionKind::Untrusted,
        )
        .unwrap();
        let l = layout(0x8000_0000, 1, 2, 3);
        assert!(l.validate(&region, &[untrusted]).is_err());
    }

    #[test]
    fn test_page_helpers() {
        assert_eq!(page_round_up(0), 0);
        assert_eq!(page_round_up(1), PAGE_SIZE);
        assert_eq!(page_round_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }
}
