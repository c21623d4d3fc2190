//! Shared Ring Storage
//!
//! Page-aligned storage shared between program and device.
//!
//! # Layout
//!
//! ```text
//! ┌────────────────────┬──────────────┬───────────────────────────┐
//! │ state bytes (128)  │   reserved   │ storage list (128 x u64)  │
//! └────────────────────┴──────────────┴───────────────────────────┘
//! 0                   128           2048                        3072
//! ```
//!
//! - One page per queue, zeroed on allocation
//! - State bytes are accessed as atomics so both sides see whole bytes
//! - Storage list holds the address of each slot's buffer descriptor

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::{QDIO_MAX_BUFFERS_PER_Q, QDIO_MAX_ELEMENTS_PER_BUFFER};

/// Ring page size
pub const PAGE_SIZE: usize = 4096;

const SLSB_OFFSET: usize = 0;
const SL_OFFSET: usize = 2048;

/// Element flag: last element of the buffer
pub const SBAL_EFLAGS_LAST_ENTRY: u8 = 0x40;

/// Element 15 status flag: output target had no empty buffer
pub const SBAL_SFLAGS_TARGET_FULL: u8 = 0x10;

/// One page of ring storage
pub struct RingPage {
    ptr: NonNull<u8>,
}

unsafe impl Send for RingPage {}
unsafe impl Sync for RingPage {}

impl RingPage {
    fn layout() -> Layout {
        // PAGE_SIZE is a non-zero power of two
        unsafe { Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE) }
    }

    /// Allocate a zeroed page, `None` if the allocator is exhausted
    pub fn new() -> Option<Self> {
        let ptr = unsafe { alloc_zeroed(Self::layout()) };
        NonNull::new(ptr).map(|ptr| Self { ptr })
    }

    /// State byte ring
    #[inline(always)]
    pub fn slsb(&self) -> &[AtomicU8] {
        // AtomicU8 has the layout of u8; the page outlives the borrow
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.as_ptr().add(SLSB_OFFSET) as *const AtomicU8,
                QDIO_MAX_BUFFERS_PER_Q,
            )
        }
    }

    /// Storage list (buffer descriptor addresses)
    #[inline]
    pub fn storage_list(&self) -> &[AtomicU64] {
        // offset is 8-aligned inside a page-aligned block
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.as_ptr().add(SL_OFFSET) as *const AtomicU64,
                QDIO_MAX_BUFFERS_PER_Q,
            )
        }
    }

    /// Address of the page
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Zero the whole page
    pub fn clear(&self) {
        for slot in self.slsb() {
            slot.store(0, Ordering::Relaxed);
        }
        for entry in self.storage_list() {
            entry.store(0, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::SeqCst);
    }
}

impl Drop for RingPage {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr(), Self::layout());
        }
    }
}

/// One element of a buffer descriptor
#[derive(Debug, Default)]
#[repr(C)]
pub struct SbalElement {
    eflags: AtomicU8,
    sflags: AtomicU8,
    length: AtomicU32,
    addr: AtomicU64,
}

impl SbalElement {
    /// Element flags
    pub fn eflags(&self) -> u8 {
        self.eflags.load(Ordering::Acquire)
    }

    /// Set element flags
    pub fn set_eflags(&self, flags: u8) {
        self.eflags.store(flags, Ordering::Release);
    }

    /// Status flags written by the device
    pub fn sflags(&self) -> u8 {
        self.sflags.load(Ordering::Acquire)
    }

    /// Set status flags
    pub fn set_sflags(&self, flags: u8) {
        self.sflags.store(flags, Ordering::Release);
    }

    /// Payload length
    pub fn length(&self) -> u32 {
        self.length.load(Ordering::Acquire)
    }

    /// Payload address
    pub fn addr(&self) -> u64 {
        self.addr.load(Ordering::Acquire)
    }

    /// Point this element at a payload
    pub fn set(&self, addr: u64, length: u32, eflags: u8) {
        self.addr.store(addr, Ordering::Relaxed);
        self.length.store(length, Ordering::Relaxed);
        self.eflags.store(eflags, Ordering::Release);
    }

    /// Reset all fields
    pub fn clear(&self) {
        self.set(0, 0, 0);
        self.sflags.store(0, Ordering::Release);
    }
}

/// Buffer descriptor: a scatter list of payload elements
#[derive(Debug, Default)]
#[repr(C, align(256))]
pub struct Sbal {
    elements: [SbalElement; QDIO_MAX_ELEMENTS_PER_BUFFER],
}

impl Sbal {
    /// Element `idx`
    pub fn element(&self, idx: usize) -> Option<&SbalElement> {
        self.elements.get(idx)
    }

    /// All elements
    pub fn elements(&self) -> &[SbalElement] {
        &self.elements
    }

    /// Last element, carries device status for some device classes
    pub fn trailer(&self) -> &SbalElement {
        &self.elements[QDIO_MAX_ELEMENTS_PER_BUFFER - 1]
    }

    /// Reset every element
    pub fn clear(&self) {
        for element in &self.elements {
            element.clear();
        }
    }

    /// Address handed to the device through the storage list
    pub fn addr(&self) -> u64 {
        self as *const Sbal as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment() {
        let page = RingPage::new().unwrap();
        assert_eq!(page.addr() % PAGE_SIZE as u64, 0);
        assert_eq!(page.slsb().len(), QDIO_MAX_BUFFERS_PER_Q);
        assert_eq!(page.storage_list().len(), QDIO_MAX_BUFFERS_PER_Q);
    }

    #[test]
    fn test_page_zeroed_and_clear() {
        let page = RingPage::new().unwrap();
        assert!(page.slsb().iter().all(|b| b.load(Ordering::Relaxed) == 0));

        page.slsb()[3].store(0x82, Ordering::Relaxed);
        page.storage_list()[3].store(0xdead_beef, Ordering::Relaxed);
        page.clear();

        assert_eq!(page.slsb()[3].load(Ordering::Relaxed), 0);
        assert_eq!(page.storage_list()[3].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_sbal_trailer() {
        let sbal = Sbal::default();
        sbal.trailer().set_sflags(SBAL_SFLAGS_TARGET_FULL);
        assert_eq!(sbal.element(15).unwrap().sflags(), SBAL_SFLAGS_TARGET_FULL);
        assert!(sbal.element(16).is_none());

        sbal.element(0).unwrap().set(0x1000, 64, SBAL_EFLAGS_LAST_ENTRY);
        assert_eq!(sbal.element(0).unwrap().length(), 64);
        sbal.clear();
        assert_eq!(sbal.trailer().sflags(), 0);
        assert_eq!(sbal.element(0).unwrap().addr(), 0);
    }
}
