// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::mem::size_of;
use hyp_pages::{PhysAddr, PAGE_SIZE};
use static_assertions::const_assert_eq;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;

use super::error::*;

/// An entry in the invalidation queue. Used to invalidate the unit's context, IOTLB and interrupt
/// entry caches.
///
/// Completion of the queue up to a descriptor implies completion of the invalidation it requests.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub lo: u64,
    pub hi: u64,
}

const_assert_eq!(size_of::<Descriptor>(), 16);

/// Descriptor types understood by the unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorType {
    Context = 1,
    Iotlb = 2,
    DeviceTlb = 3,
    InterruptEntry = 4,
    Wait = 5,
}

/// Scope of a context-cache or IOTLB invalidation. The encoding is shared by the descriptors and
/// the direct command registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Granularity {
    Global = 1,
    Domain = 2,
    Device = 3,
}

const TYPE_MASK: u64 = 0xf;
const GRANULARITY_SHIFT: u64 = 4;
const DOMAIN_SHIFT: u64 = 16;

impl Descriptor {
    fn new(kind: DescriptorType, granularity: u64, domain: u16) -> Self {
        Self {
            lo: kind as u64 | granularity << GRANULARITY_SHIFT | (domain as u64) << DOMAIN_SHIFT,
            hi: 0,
        }
    }

    /// Invalidates cached context entries, either everywhere or for one domain.
    pub fn context(granularity: Granularity, domain: u16) -> Self {
        Self::new(DescriptorType::Context, granularity as u64, domain)
    }

    /// Invalidates cached second-level translations, either everywhere or for one domain.
    pub fn iotlb(granularity: Granularity, domain: u16) -> Self {
        Self::new(DescriptorType::Iotlb, granularity as u64, domain)
    }

    /// Invalidates every cached interrupt-remap entry.
    pub fn interrupt_entries() -> Self {
        Self::new(DescriptorType::InterruptEntry, 0, 0)
    }

    /// Returns the raw type field.
    pub fn kind(&self) -> u64 {
        self.lo & TYPE_MASK
    }

    /// Returns the raw granularity field.
    pub fn granularity(&self) -> u64 {
        (self.lo >> GRANULARITY_SHIFT) & 0x3
    }

    /// Returns the domain the descriptor targets.
    pub fn domain(&self) -> u16 {
        (self.lo >> DOMAIN_SHIFT) as u16
    }
}

/// Number of descriptors held by the single-page queue.
pub const QUEUE_ENTRIES: usize = PAGE_SIZE as usize / size_of::<Descriptor>();

// Queue pointers count 16-byte descriptors from bit 4.
const POINTER_SHIFT: u64 = 4;

// A descriptor slot of the queue page, read by the unit.
#[repr(C)]
struct QueueSlot {
    lo: ReadWrite<u64>,
    hi: ReadWrite<u64>,
}

const_assert_eq!(size_of::<QueueSlot>(), size_of::<Descriptor>());

/// The invalidation queue, used to send invalidation requests from software to the unit. The
/// queue is a page-aligned ring buffer of descriptors; software produces at the tail, hardware
/// consumes at the head. For simplicity, we use a single 4kB page for queue storage.
pub struct InvalidationQueue {
    slots: &'static [QueueSlot],
    head: usize,
    tail: usize,
}

// Safety: the queue page is owned by the queue, and every access needs `&mut self` or goes
// through a volatile register cell.
unsafe impl Send for InvalidationQueue {}

impl InvalidationQueue {
    /// Creates an empty queue stored in the page at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be a page exclusively owned by the queue for as long as it is used.
    pub unsafe fn new(base: PhysAddr) -> Self {
        Self {
            slots: core::slice::from_raw_parts(base.as_ptr::<QueueSlot>(), QUEUE_ENTRIES),
            head: 0,
            tail: 0,
        }
    }

    /// Returns the base physical address of this queue.
    pub fn base_address(&self) -> PhysAddr {
        PhysAddr::from_ptr(self.slots.as_ptr())
    }

    /// Returns the total number of descriptor slots.
    pub fn capacity(&self) -> usize {
        QUEUE_ENTRIES
    }

    /// Returns if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Returns if the queue is full.
    pub fn is_full(&self) -> bool {
        (self.tail + 1) & (QUEUE_ENTRIES - 1) == self.head
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Returns the value of the tail register matching the software tail.
    pub fn tail_register(&self) -> u64 {
        (self.tail as u64) << POINTER_SHIFT
    }

    /// Returns the physical address of the descriptor slot `index`.
    pub fn slot_address(&self, index: usize) -> PhysAddr {
        PhysAddr::from_ptr(&self.slots[index])
    }

    /// Returns the descriptor stored in slot `index`.
    pub fn descriptor(&self, index: usize) -> Descriptor {
        let slot = &self.slots[index];
        Descriptor {
            lo: slot.lo.get(),
            hi: slot.hi.get(),
        }
    }

    /// Updates the head pointer of the queue to `head`. Expected to be used to update the queue's
    /// software head pointer with a head pointer read from the unit's head register.
    pub fn update_head(&mut self, head: usize) -> Result<()> {
        // Make sure `head` isn't being advanced past `self.tail`. Silence clippy as its suggestion
        // is less readable and is just as many comparisons.
        #[allow(clippy::nonminimal_bool)]
        if head >= QUEUE_ENTRIES
            || (self.head <= self.tail && (head > self.tail || self.head > head))
            || (self.head > self.tail && self.tail < head && head < self.head)
        {
            return Err(Error::InvalidQueuePointer(head));
        }
        self.head = head;
        Ok(())
    }

    /// Pushes a descriptor to the tail of the queue.
    pub fn push(&mut self, desc: Descriptor) -> Result<()> {
        if self.is_full() {
            return Err(Error::QueueFull);
        }
        // The unit only reads slots between the head and the published tail.
        let slot = &self.slots[self.tail];
        slot.lo.set(desc.lo);
        slot.hi.set(desc.hi);
        self.tail = (self.tail + 1) & (QUEUE_ENTRIES - 1);
        Ok(())
    }
}

/// Converts a head or tail register value to a descriptor index.
pub fn pointer_index(reg: u64) -> usize {
    (reg >> POINTER_SHIFT) as usize & (QUEUE_ENTRIES - 1)
}

/// Returns if the descriptor just before index `end` is still between `head` and `tail`, i.e. not
/// yet consumed by the unit.
pub fn is_pending(end: usize, head: usize, tail: usize) -> bool {
    let last = end.wrapping_sub(1) & (QUEUE_ENTRIES - 1);
    let outstanding = tail.wrapping_sub(head) & (QUEUE_ENTRIES - 1);
    last.wrapping_sub(head) & (QUEUE_ENTRIES - 1) < outstanding
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyp_pages::test_stubs::HeapPages;
    use hyp_pages::{Fill, PageAllocator};

    fn queue() -> InvalidationQueue {
        unsafe { InvalidationQueue::new(HeapPages::leaked().alloc(0, Fill::Bits0).unwrap()) }
    }

    fn stored(q: &InvalidationQueue, index: usize) -> Descriptor {
        q.descriptor(index)
    }

    #[test]
    fn descriptor_encoding() {
        let ctx = Descriptor::context(Granularity::Global, 0);
        assert_eq!(ctx, Descriptor { lo: 0x11, hi: 0 });
        let tlb = Descriptor::iotlb(Granularity::Domain, 0x42);
        assert_eq!(tlb.lo, 0x42_0022);
        assert_eq!(tlb.kind(), DescriptorType::Iotlb as u64);
        assert_eq!(tlb.granularity(), Granularity::Domain as u64);
        assert_eq!(tlb.domain(), 0x42);
        assert_eq!(Descriptor::interrupt_entries().lo, 0x4);
    }

    #[test]
    fn fills_and_refuses_overrun() {
        let mut q = queue();
        assert!(q.is_empty());
        for i in 0..QUEUE_ENTRIES - 1 {
            q.push(Descriptor::iotlb(Granularity::Domain, i as u16)).unwrap();
        }
        assert!(q.is_full());
        assert_eq!(
            q.push(Descriptor::interrupt_entries()),
            Err(Error::QueueFull)
        );
        assert_eq!(stored(&q, 7).domain(), 7);
        assert_eq!(q.tail_register(), ((QUEUE_ENTRIES - 1) << 4) as u64);
    }

    #[test]
    fn wraps_to_zero() {
        let mut q = queue();
        for _ in 0..QUEUE_ENTRIES - 1 {
            q.push(Descriptor::context(Granularity::Global, 0)).unwrap();
        }
        // Hardware consumed everything so far.
        q.update_head(QUEUE_ENTRIES - 1).unwrap();
        q.push(Descriptor::interrupt_entries()).unwrap();
        assert_eq!(q.tail(), 0);
        assert_eq!(stored(&q, QUEUE_ENTRIES - 1), Descriptor::interrupt_entries());
        q.push(Descriptor::iotlb(Granularity::Global, 0)).unwrap();
        assert_eq!(q.tail(), 1);
        assert_eq!(stored(&q, 0), Descriptor::iotlb(Granularity::Global, 0));
    }

    #[test]
    fn head_cannot_pass_tail() {
        let mut q = queue();
        for _ in 0..4 {
            q.push(Descriptor::interrupt_entries()).unwrap();
        }
        assert_eq!(q.update_head(5), Err(Error::InvalidQueuePointer(5)));
        assert_eq!(
            q.update_head(QUEUE_ENTRIES),
            Err(Error::InvalidQueuePointer(QUEUE_ENTRIES))
        );
        q.update_head(4).unwrap();
        assert!(q.is_empty());
        assert_eq!(q.update_head(2), Err(Error::InvalidQueuePointer(2)));
    }

    #[test]
    fn pending_tracks_consumption() {
        assert_eq!(pointer_index(0x30), 3);
        // Our last descriptor is index 4; head 2 and tail 6 leave 2..6 outstanding.
        assert!(is_pending(5, 2, 6));
        assert!(!is_pending(5, 5, 6));
        assert!(!is_pending(5, 6, 6));
        // Across the wrap.
        assert!(is_pending(1, 250, 3));
        assert!(!is_pending(1, 1, 3));
        assert!(!is_pending(0, 0, 0));
    }
}
