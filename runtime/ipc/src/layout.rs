//! Shared region layout
//!
//! # Memory Layout
//! ```text
//! offset 0   RegionHeader { magic, version, reserved_pages, max_sessions, rfu }
//!            notif_ns_to_s: u32, notif_s_to_ns: u32
//!            signals_ns_to_s[MAX_SESSIONS]: u32
//!            signals_s_to_ns[MAX_SESSIONS]: u32
//!            ring_ns_to_s: MessageRing
//!            ring_s_to_ns: MessageRing
//! ---------- RESERVED_PAGES pages end here
//!            session buffer pages (BlockAllocator)
//! ```
//!
//! The host owns initialisation: it zeroes the control block, fills in the
//! geometry and publishes `MAGIC_1` last. The peer validates the geometry,
//! writes its own version and replaces the magic with `MAGIC_2`.

use core::mem::size_of;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

use static_assertions::{assert_eq_size, const_assert};

use crate::notify::NotificationRegister;
use crate::ring::MessageRing;
use crate::{IpcError, Result};

/// Shared memory page size
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of concurrent sessions
///
/// Bits 0..MAX_SESSIONS of a notification word are per-session signal bits;
/// the top bits are reserved for RESET and MESSAGE.
pub const MAX_SESSIONS: usize = 28;

const_assert!(MAX_SESSIONS <= 28);

/// Magic written by the host when the region is initialised ("PNC1")
pub const MAGIC_1: u32 = 0x504e_4331;

/// Magic written by the peer once it has synchronised ("PNC2")
pub const MAGIC_2: u32 = 0x504e_4332;

/// Protocol version advertised by this implementation (major << 16 | minor)
pub const PROTOCOL_VERSION: u32 = 1 << 16;

/// Region header, first field of the control block
#[repr(C)]
#[derive(Default)]
pub struct RegionHeader {
    magic: AtomicU32,
    version: AtomicU32,
    reserved_pages: AtomicU16,
    max_sessions: AtomicU16,
    rfu: AtomicU32,
}

assert_eq_size!(RegionHeader, [u8; 16]);

impl RegionHeader {
    pub fn magic(&self) -> u32 {
        self.magic.load(Ordering::Acquire)
    }

    /// Publish a magic value; everything written before becomes visible
    pub fn set_magic(&self, magic: u32) {
        self.magic.store(magic, Ordering::Release);
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::Release);
    }

    pub fn reserved_pages(&self) -> u16 {
        self.reserved_pages.load(Ordering::Acquire)
    }

    pub fn max_sessions(&self) -> u16 {
        self.max_sessions.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.magic.store(0, Ordering::Relaxed);
        self.version.store(0, Ordering::Relaxed);
        self.reserved_pages.store(0, Ordering::Relaxed);
        self.max_sessions.store(0, Ordering::Relaxed);
        self.rfu.store(0, Ordering::Relaxed);
    }
}

/// Protocol control block at the start of the shared region
#[repr(C)]
pub struct ControlBlock {
    pub header: RegionHeader,
    notif_ns_to_s: AtomicU32,
    notif_s_to_ns: AtomicU32,
    signals_ns_to_s: [AtomicU32; MAX_SESSIONS],
    signals_s_to_ns: [AtomicU32; MAX_SESSIONS],
    pub ring_ns_to_s: MessageRing,
    pub ring_s_to_ns: MessageRing,
}

/// Pages taken by the control block, rounded up
pub const RESERVED_PAGES: usize = size_of::<ControlBlock>().div_ceil(PAGE_SIZE);

/// Largest region whose page numbers fit a block descriptor
pub const MAX_REGION_PAGES: usize = u16::MAX as usize;

impl Default for ControlBlock {
    fn default() -> Self {
        Self {
            header: RegionHeader::default(),
            notif_ns_to_s: AtomicU32::new(0),
            notif_s_to_ns: AtomicU32::new(0),
            signals_ns_to_s: Default::default(),
            signals_s_to_ns: Default::default(),
            ring_ns_to_s: MessageRing::default(),
            ring_s_to_ns: MessageRing::default(),
        }
    }
}

impl ControlBlock {
    /// Zero every field, header included
    pub fn clear(&self) {
        self.header.clear();
        self.notif_ns_to_s.store(0, Ordering::Relaxed);
        self.notif_s_to_ns.store(0, Ordering::Relaxed);
        for signal in self.signals_ns_to_s.iter().chain(&self.signals_s_to_ns) {
            signal.store(0, Ordering::Relaxed);
        }
        self.ring_ns_to_s.reset();
        self.ring_s_to_ns.reset();
    }

    /// Notification word raised by NS and drained by S
    pub fn notif_ns_to_s(&self) -> NotificationRegister<'_> {
        NotificationRegister::new(&self.notif_ns_to_s)
    }

    /// Notification word raised by S and drained by NS
    pub fn notif_s_to_ns(&self) -> NotificationRegister<'_> {
        NotificationRegister::new(&self.notif_s_to_ns)
    }

    /// Per-session application signal word, NS to S
    pub fn signal_ns_to_s(&self, index: usize) -> Result<&AtomicU32> {
        self.signals_ns_to_s
            .get(index)
            .ok_or(IpcError::BadSessionIndex { index })
    }

    /// Per-session application signal word, S to NS
    pub fn signal_s_to_ns(&self, index: usize) -> Result<&AtomicU32> {
        self.signals_s_to_ns
            .get(index)
            .ok_or(IpcError::BadSessionIndex { index })
    }
}

/// The whole shared region: control block plus session buffer pages
///
/// Both sides hold the same `SharedRegion` (through an `Arc` when simulated
/// in one process). Byte offsets handed out by the block allocator are
/// relative to the start of the region.
pub struct SharedRegion {
    control: Box<ControlBlock>,
    data: Box<[AtomicU8]>,
    total_pages: usize,
}

impl SharedRegion {
    /// Allocate a zeroed region of `total_pages` pages
    ///
    /// # Errors
    /// - `IpcError::RegionTooSmall` unless at least one page remains after
    ///   the control block
    /// - `IpcError::RegionTooLarge` if page numbers no longer fit the 16-bit
    ///   descriptor fields
    pub fn new(total_pages: usize) -> Result<Self> {
        if total_pages <= RESERVED_PAGES {
            return Err(IpcError::RegionTooSmall {
                pages: total_pages,
                reserved: RESERVED_PAGES,
            });
        }
        if total_pages > MAX_REGION_PAGES {
            return Err(IpcError::RegionTooLarge {
                pages: total_pages,
                max: MAX_REGION_PAGES,
            });
        }

        let data_bytes = (total_pages - RESERVED_PAGES) * PAGE_SIZE;
        let data = (0..data_bytes).map(|_| AtomicU8::new(0)).collect();

        Ok(Self {
            control: Box::default(),
            data,
            total_pages,
        })
    }

    pub fn control(&self) -> &ControlBlock {
        &self.control
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn reserved_pages(&self) -> usize {
        RESERVED_PAGES
    }

    /// Zero the control block and publish the host header with `MAGIC_1`
    pub fn initialize(&self, version: u32) {
        let control = self.control();
        control.clear();

        let header = &control.header;
        header
            .reserved_pages
            .store(RESERVED_PAGES as u16, Ordering::Relaxed);
        header
            .max_sessions
            .store(MAX_SESSIONS as u16, Ordering::Relaxed);
        header.version.store(version, Ordering::Relaxed);
        header.set_magic(MAGIC_1);
    }

    /// Copy bytes into the buffer pages at a region offset
    ///
    /// # Errors
    /// Returns `IpcError::OutOfBounds` if the range is not inside the buffer pages
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let cells = self.cells(offset, bytes.len())?;
        for (cell, byte) in cells.iter().zip(bytes) {
            cell.store(*byte, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy bytes out of the buffer pages at a region offset
    ///
    /// # Errors
    /// Returns `IpcError::OutOfBounds` if the range is not inside the buffer pages
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let cells = self.cells(offset, buf.len())?;
        for (byte, cell) in buf.iter_mut().zip(cells) {
            *byte = cell.load(Ordering::Relaxed);
        }
        Ok(())
    }

    fn cells(&self, offset: usize, len: usize) -> Result<&[AtomicU8]> {
        let base = RESERVED_PAGES * PAGE_SIZE;
        let out_of_bounds = IpcError::OutOfBounds {
            offset,
            len,
            size: self.total_pages * PAGE_SIZE,
        };

        let start = offset.checked_sub(base).ok_or(out_of_bounds)?;
        let end = start.checked_add(len).ok_or(out_of_bounds)?;
        self.data.get(start..end).ok_or(out_of_bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MESSAGE_SIZE;
    use crate::ring::RING_CAPACITY;

    #[test]
    fn test_control_block_size() {
        let fixed = 16 + 8 + 2 * 4 * MAX_SESSIONS;
        let ring = 8 + RING_CAPACITY * MESSAGE_SIZE;
        assert_eq!(size_of::<ControlBlock>(), fixed + 2 * ring);
        assert_eq!(RESERVED_PAGES, 4);
    }

    #[test]
    fn test_region_too_small() {
        assert!(matches!(
            SharedRegion::new(RESERVED_PAGES),
            Err(IpcError::RegionTooSmall { .. })
        ));
        assert!(SharedRegion::new(RESERVED_PAGES + 1).is_ok());
    }

    #[test]
    fn test_region_too_large() {
        assert!(matches!(
            SharedRegion::new(MAX_REGION_PAGES + 1),
            Err(IpcError::RegionTooLarge { pages, max: MAX_REGION_PAGES })
                if pages == MAX_REGION_PAGES + 1
        ));
    }

    #[test]
    fn test_initialize_publishes_geometry() {
        let region = SharedRegion::new(16).unwrap();
        region.control().notif_s_to_ns().raise(crate::NotifyBits::MESSAGE);

        region.initialize(PROTOCOL_VERSION);

        let header = &region.control().header;
        assert_eq!(header.magic(), MAGIC_1);
        assert_eq!(header.version(), PROTOCOL_VERSION);
        assert_eq!(header.reserved_pages() as usize, RESERVED_PAGES);
        assert_eq!(header.max_sessions() as usize, MAX_SESSIONS);
        assert!(region.control().notif_s_to_ns().peek().is_empty());
    }

    #[test]
    fn test_buffer_bounds() {
        let region = SharedRegion::new(RESERVED_PAGES + 2).unwrap();
        let base = RESERVED_PAGES * PAGE_SIZE;

        region.write_bytes(base + 10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        region.read_bytes(base + 10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // Control block is not reachable through the buffer accessors
        assert!(region.write_bytes(0, b"x").is_err());
        // Nor is anything past the last page
        assert!(region.write_bytes(base + 2 * PAGE_SIZE - 1, b"xy").is_err());
        assert!(region.read_bytes(usize::MAX, &mut buf).is_err());
    }

    #[test]
    fn test_signal_index_bounds() {
        let region = SharedRegion::new(8).unwrap();
        assert!(region.control().signal_ns_to_s(MAX_SESSIONS - 1).is_ok());
        assert_eq!(
            region.control().signal_s_to_ns(MAX_SESSIONS).err(),
            Some(IpcError::BadSessionIndex {
                index: MAX_SESSIONS
            })
        );
    }
}
