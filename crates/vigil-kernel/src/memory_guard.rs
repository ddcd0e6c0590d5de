//! [`MemoryGuard`] – CRC-backed protected memory regions.
//!
//! Collaborating modules register the address ranges that hold safety
//! parameters ([`MemoryGuard::protect`]), optionally as mirrored pairs
//! ([`MemoryGuard::pair`]). The safety-monitor thread recomputes each
//! region's CRC-32 on a 1 s cadence ([`MemoryGuard::periodic_check`]); a
//! mismatch is corruption, repaired from the mirror when the mirror itself
//! still checks clean, escalated otherwise.
//!
//! Memory access goes through the [`MemoryBus`] trait so the same guard
//! runs against the real address space in firmware and against the
//! [`SramBus`] simulation in tests and the demo binary.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, warn};
use vigil_types::VigilError;

use crate::crc32::crc32;

// ────────────────────────────────────────────────────────────────────────────
// Bus abstraction
// ────────────────────────────────────────────────────────────────────────────

/// Byte-addressed access to the memory the guard watches.
pub trait MemoryBus: Send {
    /// Fill `buf` from `addr`. Errors with [`VigilError::BusFault`] when the
    /// range is not backed.
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), VigilError>;

    /// Write `data` at `addr` (used only for mirror restoration).
    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), VigilError>;
}

/// Shared handle to a bus; collaborators keep a clone to perform their own
/// writes while the guard reads through the same handle.
pub type SharedBus = Arc<Mutex<dyn MemoryBus>>;

/// In-memory bus simulation backing a contiguous SRAM window.
pub struct SramBus {
    base: usize,
    cells: Vec<u8>,
}

impl SramBus {
    /// A zero-filled window of `size` bytes starting at `base`.
    pub fn new(base: usize, size: usize) -> Self {
        Self {
            base,
            cells: vec![0; size],
        }
    }

    /// Wrap into the shared handle the guard consumes.
    pub fn shared(base: usize, size: usize) -> SharedBus {
        Arc::new(Mutex::new(Self::new(base, size)))
    }

    fn offset(&self, addr: usize, len: usize) -> Result<usize, VigilError> {
        let end = addr.checked_add(len);
        if addr < self.base || end.is_none_or(|e| e > self.base + self.cells.len()) {
            return Err(VigilError::BusFault { addr, len });
        }
        Ok(addr - self.base)
    }
}

impl MemoryBus for SramBus {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), VigilError> {
        let off = self.offset(addr, buf.len())?;
        buf.copy_from_slice(&self.cells[off..off + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), VigilError> {
        let off = self.offset(addr, data.len())?;
        self.cells[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Regions
// ────────────────────────────────────────────────────────────────────────────

/// Handle to a protected region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub(crate) usize);

impl RegionId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Permission and criticality flags of a protected region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionFlags {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    /// Corruption of a critical region with no usable mirror forces a cold
    /// reset instead of the recovery engine.
    pub critical: bool,
}

impl RegionFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            execute: false,
            critical: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            write: true,
            ..Self::read_only()
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// Result of checking one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionOutcome {
    /// CRC matched the baseline.
    Clean,
    /// CRC mismatched but the mirror checked clean; contents were copied
    /// back and the baseline re-taken.
    RestoredFromMirror,
    /// CRC mismatched and no usable mirror exists.
    Corrupted { critical: bool },
}

struct Region {
    addr: usize,
    size: usize,
    flags: RegionFlags,
    baseline_crc: u32,
    mirror: Option<RegionId>,
}

/// Table of protected regions plus the bus they live on.
pub struct MemoryGuard {
    bus: SharedBus,
    regions: Vec<Region>,
    max_regions: usize,
    page_size: usize,
}

impl MemoryGuard {
    pub fn new(bus: SharedBus, max_regions: usize, page_size: usize) -> Self {
        Self {
            bus,
            regions: Vec::with_capacity(max_regions),
            max_regions,
            page_size,
        }
    }

    /// Register `[addr, addr + size)` as protected and take its baseline
    /// CRC.
    ///
    /// # Errors
    ///
    /// - [`VigilError::NotAligned`] – `addr` or `size` is not a multiple of
    ///   the page size (or `size` is zero).
    /// - [`VigilError::Overlap`] – the range intersects an existing region.
    /// - [`VigilError::CapacityExceeded`] – all region slots are in use.
    /// - [`VigilError::BusFault`] – the range is not backed by the bus.
    pub fn protect(
        &mut self,
        addr: usize,
        size: usize,
        flags: RegionFlags,
    ) -> Result<RegionId, VigilError> {
        if self.regions.len() >= self.max_regions {
            return Err(VigilError::CapacityExceeded {
                what: "protected regions",
                capacity: self.max_regions,
            });
        }
        if addr % self.page_size != 0 {
            return Err(VigilError::NotAligned {
                addr,
                page_size: self.page_size,
            });
        }
        if size == 0 || size % self.page_size != 0 {
            return Err(VigilError::NotAligned {
                addr: size,
                page_size: self.page_size,
            });
        }
        if self
            .regions
            .iter()
            .any(|r| addr < r.addr + r.size && r.addr < addr + size)
        {
            return Err(VigilError::Overlap { addr, size });
        }

        let baseline_crc = self.read_crc(addr, size)?;
        let id = RegionId(self.regions.len());
        debug!(region = id.0, addr = format_args!("{addr:#x}"), size, "protected region");
        self.regions.push(Region {
            addr,
            size,
            flags,
            baseline_crc,
            mirror: None,
        });
        Ok(id)
    }

    /// Register `primary` and `secondary` as a reciprocal mirror pair.
    /// Requires two free capacity slots; both ranges obey the same
    /// alignment and overlap rules as [`MemoryGuard::protect`].
    pub fn pair(
        &mut self,
        primary: usize,
        secondary: usize,
        size: usize,
        flags: RegionFlags,
    ) -> Result<(RegionId, RegionId), VigilError> {
        if self.regions.len() + 2 > self.max_regions {
            return Err(VigilError::CapacityExceeded {
                what: "protected regions",
                capacity: self.max_regions,
            });
        }
        let a = self.protect(primary, size, flags)?;
        // Registration must be all-or-nothing: a failed second half would
        // otherwise leave an orphan region occupying a slot with no way to
        // release it.
        let b = match self.protect(secondary, size, flags) {
            Ok(b) => b,
            Err(e) => {
                self.regions.pop();
                return Err(e);
            }
        };
        self.regions[a.0].mirror = Some(b);
        self.regions[b.0].mirror = Some(a);
        Ok((a, b))
    }

    /// Recompute every region's CRC, restoring from mirrors where possible.
    /// Returns the regions that were not clean, in table order.
    pub fn periodic_check(&mut self) -> Vec<(RegionId, RegionOutcome)> {
        (0..self.regions.len())
            .filter_map(|i| {
                let id = RegionId(i);
                match self.check_region(id) {
                    Ok(RegionOutcome::Clean) => None,
                    Ok(outcome) => Some((id, outcome)),
                    // A bus fault while checking is indistinguishable from
                    // corruption of the backing store.
                    Err(_) => {
                        let critical = self.regions[i].flags.critical;
                        Some((id, RegionOutcome::Corrupted { critical }))
                    }
                }
            })
            .collect()
    }

    /// Check a single region, attempting mirror restoration on mismatch.
    pub fn check_region(&mut self, id: RegionId) -> Result<RegionOutcome, VigilError> {
        let (addr, size, baseline, mirror, critical) = {
            let r = self.region(id)?;
            (r.addr, r.size, r.baseline_crc, r.mirror, r.flags.critical)
        };
        if self.read_crc(addr, size)? == baseline {
            return Ok(RegionOutcome::Clean);
        }

        if let Some(mid) = mirror {
            let (m_addr, m_size, m_baseline) = {
                let m = self.region(mid)?;
                (m.addr, m.size, m.baseline_crc)
            };
            // Only restore from a mirror that itself still checks clean.
            if self.read_crc(m_addr, m_size)? == m_baseline {
                let mut contents = vec![0u8; m_size];
                {
                    let mut bus = self.lock_bus();
                    bus.read(m_addr, &mut contents)?;
                    bus.write(addr, &contents)?;
                }
                self.regions[id.0].baseline_crc = m_baseline;
                warn!(region = id.0, mirror = mid.0, "corrupted region restored from mirror");
                return Ok(RegionOutcome::RestoredFromMirror);
            }
        }

        error!(
            region = id.0,
            addr = format_args!("{addr:#x}"),
            critical,
            "memory corruption with no usable mirror"
        );
        Ok(RegionOutcome::Corrupted { critical })
    }

    /// Fault-handler entry point: locate the region owning `addr` and run
    /// the same check/restore path as the periodic scan on it.
    ///
    /// `None` when the faulting address is outside every protected region.
    pub fn handle_fault(&mut self, addr: usize) -> Option<(RegionId, RegionOutcome)> {
        let id = self.owning_region(addr)?;
        error!(region = id.0, addr = format_args!("{addr:#x}"), "memory fault in protected region");
        let outcome = self.check_region(id).unwrap_or(RegionOutcome::Corrupted {
            critical: self.regions[id.0].flags.critical,
        });
        Some((id, outcome))
    }

    /// The region containing `addr`, if any. Linear scan; the table is
    /// bounded by `max_protected_regions`.
    pub fn owning_region(&self, addr: usize) -> Option<RegionId> {
        self.regions
            .iter()
            .position(|r| addr >= r.addr && addr < r.addr + r.size)
            .map(RegionId)
    }

    /// Recovery-engine corrective action for memory corruption: re-check
    /// everything and report whether the table is clean afterwards
    /// (restored regions count as clean).
    pub fn restore_corrupted(&mut self) -> bool {
        self.periodic_check()
            .iter()
            .all(|(_, outcome)| !matches!(outcome, RegionOutcome::Corrupted { .. }))
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn flags(&self, id: RegionId) -> Result<RegionFlags, VigilError> {
        Ok(self.region(id)?.flags)
    }

    fn region(&self, id: RegionId) -> Result<&Region, VigilError> {
        self.regions.get(id.0).ok_or(VigilError::UnknownRegion(id.0))
    }

    fn read_crc(&self, addr: usize, size: usize) -> Result<u32, VigilError> {
        let mut buf = vec![0u8; size];
        self.lock_bus().read(addr, &mut buf)?;
        Ok(crc32(&buf))
    }

    fn lock_bus(&self) -> MutexGuard<'_, dyn MemoryBus + 'static> {
        // A poisoned bus lock still refers to coherent memory; recover the
        // guard rather than aborting the safety monitor.
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
