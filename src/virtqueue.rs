//! The virtqueue engine: the active state machine wrapping a vring.
//!
//! Construction, buffer enqueue/dequeue, notification suppression, and
//! the memory-ordering discipline that makes the protocol correct
//! across two uncoordinated processors.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::Cell;
use core::sync::atomic::{fence, Ordering};

use crate::device::Role;
use crate::error::VqError;
use crate::platform::Platform;
use crate::vring::{
    AvailHdr, Desc, UsedElem, UsedHdr, VringLayout, AVAIL_F_NO_INTERRUPT, CHAIN_END,
    DESC_F_INDIRECT, DESC_F_NEXT, DESC_F_WRITE, USED_F_NO_NOTIFY,
};

/// One buffer segment handed to [`Virtqueue::add_buffer`]. `vaddr` is
/// translated to a physical address via the platform before it is
/// written into the descriptor — the engine never dereferences it.
#[derive(Clone, Copy)]
pub struct VirtqueueBuf {
    pub vaddr: *const u8,
    pub len: u32,
}

#[derive(Clone, Copy)]
struct ChainEntry {
    cookie: usize,
    ndescs: u16,
}

/// Queue lifecycle state. `busy` (see [`BusyGuard`]) is a reentrancy
/// guard, not a state in this machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueueState {
    Created,
    Running,
    Disabled,
}

struct BusyGuard<'a>(&'a Cell<bool>);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a Cell<bool>) -> Self {
        if flag.get() {
            log::error!("virtqueue: reentrant access from caller's own side");
        }
        debug_assert!(!flag.get(), "virtqueue: reentrant access");
        flag.set(true);
        BusyGuard(flag)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// 16-bit wraparound "does `new` cross `event`, coming from `old`?" test
/// used by event-index notification suppression.
fn need_event(event: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(old)
}

/// An active split virtqueue: a vring plus the private bookkeeping
/// (free list, consumption indices, cookie side-table) needed to drive
/// it from one side.
///
/// `base` points at caller-owned shared memory; this type never
/// allocates or frees it. `P` supplies cache flush/invalidate and
/// virtual-to-physical translation.
pub struct Virtqueue<P: Platform> {
    base: *mut u8,
    layout: VringLayout,
    role: Role,
    platform: P,
    queue_index: u16,

    free_head: u16,
    free_count: u16,
    queued_count: u16,
    used_cons_idx: u16,
    avail_cons_idx: u16,

    event_idx: bool,
    state: QueueState,
    busy: Cell<bool>,

    cookies: Vec<Option<ChainEntry>>,
    notify: Option<Box<dyn FnMut(u16)>>,
    callback: Option<Box<dyn FnMut()>>,
}

// The vring lives in memory the caller guarantees is valid for the
// queue's lifetime and accessed by exactly one side at a time; callers
// that move a Virtqueue across threads must provide their own
// synchronization, matching the single-actor-per-side protocol model.
unsafe impl<P: Platform + Send> Send for Virtqueue<P> {}

impl<P: Platform> Virtqueue<P> {
    /// Construct a queue over `base`, a pointer to `num_descs *`-sized
    /// shared memory already laid out per [`VringLayout`].
    ///
    /// # Safety
    /// `base` must be valid, live, and exclusively owned by this queue
    /// (modulo the peer's documented shared-memory access) for as long
    /// as the returned `Virtqueue` exists.
    pub unsafe fn new(
        base: *mut u8,
        role: Role,
        num_descs: u16,
        align: usize,
        queue_index: u16,
        event_idx: bool,
        platform: P,
    ) -> Result<Self, VqError> {
        if base.is_null() {
            return Err(VqError::InvalidParam);
        }
        if num_descs == 0 {
            return Err(VqError::InvalidParam);
        }
        if !num_descs.is_power_of_two() {
            return Err(VqError::InvalidParam);
        }
        if align == 0 || align & (align - 1) != 0 {
            return Err(VqError::Align);
        }

        let layout = VringLayout::new(num_descs, align);
        let mut cookies = Vec::new();
        cookies
            .try_reserve_exact(num_descs as usize)
            .map_err(|_| VqError::NoMem)?;
        cookies.resize(num_descs as usize, None);

        let mut vq = Virtqueue {
            base,
            layout,
            role,
            platform,
            queue_index,
            free_head: 0,
            free_count: num_descs,
            queued_count: 0,
            used_cons_idx: 0,
            avail_cons_idx: 0,
            event_idx,
            state: QueueState::Created,
            busy: Cell::new(false),
            cookies,
            notify: None,
            callback: None,
        };

        if role == Role::Driver {
            for i in 0..num_descs {
                let next = if i + 1 < num_descs { i + 1 } else { CHAIN_END };
                let d = vq.desc_ptr(i);
                (*d).next = next;
                (*d).flags = 0;
            }
            // Only desc.next is set up here and it is driver-private
            // until a chain is published, so no flush is needed yet.
        }

        Ok(vq)
    }

    pub fn set_notify(&mut self, f: impl FnMut(u16) + 'static) {
        self.notify = Some(Box::new(f));
    }

    pub fn set_callback(&mut self, f: impl FnMut() + 'static) {
        self.callback = Some(Box::new(f));
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn queue_index(&self) -> u16 {
        self.queue_index
    }

    pub fn free_count(&self) -> u16 {
        self.free_count
    }

    pub fn num_descs(&self) -> u16 {
        self.layout.num
    }

    /// Physical address of the descriptor table (the vring base),
    /// suitable for the legacy `QUEUE_PFN` register.
    pub fn phys_addr(&self) -> u64 {
        self.platform.translate(self.base)
    }

    fn cache_flush(&self, addr: *const u8, len: usize) {
        #[cfg(not(feature = "uncached-shmem"))]
        self.platform.flush(addr, len);
        #[cfg(feature = "uncached-shmem")]
        let _ = (addr, len);
    }

    fn cache_invalidate(&self, addr: *const u8, len: usize) {
        #[cfg(not(feature = "uncached-shmem"))]
        self.platform.invalidate(addr, len);
        #[cfg(feature = "uncached-shmem")]
        let _ = (addr, len);
    }

    unsafe fn desc_ptr(&self, idx: u16) -> *mut Desc {
        self.base
            .add(self.layout.desc_off + idx as usize * core::mem::size_of::<Desc>())
            .cast()
    }

    unsafe fn avail_hdr_ptr(&self) -> *mut AvailHdr {
        self.base.add(self.layout.avail_off).cast()
    }

    unsafe fn avail_ring_ptr(&self) -> *mut u16 {
        self.base
            .add(self.layout.avail_off + core::mem::size_of::<AvailHdr>())
            .cast()
    }

    /// Trailing word of the avail ring. Written by the driver to tell
    /// the device when to interrupt it about used-ring completions.
    unsafe fn used_event_ptr(&self) -> *mut u16 {
        self.base
            .add(
                self.layout.avail_off
                    + core::mem::size_of::<AvailHdr>()
                    + 2 * self.layout.num as usize,
            )
            .cast()
    }

    unsafe fn used_hdr_ptr(&self) -> *mut UsedHdr {
        self.base.add(self.layout.used_off).cast()
    }

    unsafe fn used_ring_ptr(&self) -> *mut UsedElem {
        self.base
            .add(self.layout.used_off + core::mem::size_of::<UsedHdr>())
            .cast()
    }

    /// Trailing word of the used ring. Written by the device to tell
    /// the driver when to kick it about newly available buffers.
    unsafe fn avail_event_ptr(&self) -> *mut u16 {
        self.base
            .add(
                self.layout.used_off
                    + core::mem::size_of::<UsedHdr>()
                    + core::mem::size_of::<UsedElem>() * self.layout.num as usize,
            )
            .cast()
    }

    /// Enqueue a chain of `bufs.len()` descriptors, the first `readable`
    /// device-readable and the rest device-writable, and publish it to
    /// the available ring. Driver side only.
    pub fn add_buffer(
        &mut self,
        bufs: &[VirtqueueBuf],
        readable: u16,
        cookie: usize,
    ) -> Result<(), VqError> {
        let _guard = BusyGuard::acquire(&self.busy);

        let n = bufs.len() as u16;
        if n == 0 {
            return Err(VqError::InvalidParam);
        }
        if readable > n {
            return Err(VqError::InvalidParam);
        }
        if n > self.free_count {
            return Err(VqError::VringFull);
        }

        let head = self.free_head;
        let mut idx = head;
        for (i, buf) in bufs.iter().enumerate() {
            let i = i as u16;
            let is_last = i == n - 1;
            let writable = i >= readable;

            unsafe {
                let d = self.desc_ptr(idx);

                (*d).addr = self.platform.translate(buf.vaddr);
                (*d).len = buf.len;
                (*d).flags = if is_last { 0 } else { DESC_F_NEXT } | if writable { DESC_F_WRITE } else { 0 };
                self.cache_flush(d.cast(), core::mem::size_of::<Desc>());

                // `next` is never written above, so this is exactly the
                // free-list's next pointer, which becomes the new
                // chain's link and, after the last iteration, the
                // queue's new free_head.
                idx = (*d).next;
            }
        }

        self.cookies[head as usize] = Some(ChainEntry { cookie, ndescs: n });
        self.free_head = idx;
        self.free_count -= n;

        self.state = QueueState::Running;

        self.publish_avail(head);

        Ok(())
    }

    fn publish_avail(&mut self, head_idx: u16) {
        unsafe {
            let avail = self.avail_hdr_ptr();
            let avail_idx = (*avail).idx;
            let slot = self.layout.mask(avail_idx);
            let ring = self.avail_ring_ptr().add(slot as usize);
            core::ptr::write_volatile(ring, head_idx);
            self.cache_flush(ring.cast(), 2);

            fence(Ordering::SeqCst);

            let new_idx = avail_idx.wrapping_add(1);
            core::ptr::write_volatile(&mut (*avail).idx, new_idx);
            self.cache_flush((&(*avail).idx as *const u16).cast(), 2);
        }
        self.queued_count += 1;
    }

    /// Full fence, decide whether to notify the peer, reset the pending
    /// publication counter. Returns whether the peer was notified.
    pub fn kick(&mut self) -> bool {
        let _guard = BusyGuard::acquire(&self.busy);

        fence(Ordering::SeqCst);

        let should_notify = self.must_notify();
        if should_notify {
            if let Some(notify) = self.notify.as_mut() {
                notify(self.queue_index);
            }
        }
        self.queued_count = 0;
        should_notify
    }

    fn must_notify(&self) -> bool {
        if self.event_idx {
            unsafe {
                match self.role {
                    Role::Driver => {
                        let new_idx = (*self.avail_hdr_ptr()).idx;
                        let prev_idx = new_idx.wrapping_sub(self.queued_count);
                        self.cache_invalidate(self.avail_event_ptr().cast(), 2);
                        let event = core::ptr::read_volatile(self.avail_event_ptr());
                        need_event(event, new_idx, prev_idx)
                    }
                    Role::Device => {
                        let new_idx = (*self.used_hdr_ptr()).idx;
                        let prev_idx = new_idx.wrapping_sub(self.queued_count);
                        self.cache_invalidate(self.used_event_ptr().cast(), 2);
                        let event = core::ptr::read_volatile(self.used_event_ptr());
                        need_event(event, new_idx, prev_idx)
                    }
                }
            }
        } else {
            unsafe {
                match self.role {
                    Role::Driver => {
                        self.cache_invalidate((&(*self.used_hdr_ptr()).flags as *const u16).cast(), 2);
                        (*self.used_hdr_ptr()).flags & USED_F_NO_NOTIFY == 0
                    }
                    Role::Device => {
                        self.cache_invalidate(
                            (&(*self.avail_hdr_ptr()).flags as *const u16).cast(),
                            2,
                        );
                        (*self.avail_hdr_ptr()).flags & AVAIL_F_NO_INTERRUPT == 0
                    }
                }
            }
        }
    }

    /// Consume the next completion. Driver side only. Returns
    /// `(cookie, len, used_slot_index)`.
    pub fn get_buffer(&mut self) -> Option<(usize, u32, u16)> {
        let _guard = BusyGuard::acquire(&self.busy);

        unsafe {
            self.cache_invalidate((&(*self.used_hdr_ptr()).idx as *const u16).cast(), 2);
            let used_idx = (*self.used_hdr_ptr()).idx;
            if used_idx == self.used_cons_idx {
                return None;
            }

            let slot = self.layout.mask(self.used_cons_idx);
            self.used_cons_idx = self.used_cons_idx.wrapping_add(1);

            fence(Ordering::SeqCst);

            let elem_ptr = self.used_ring_ptr().add(slot as usize);
            self.cache_invalidate(elem_ptr.cast(), core::mem::size_of::<UsedElem>());
            let elem = core::ptr::read_volatile(elem_ptr);

            let desc_idx = elem.id as u16;
            let len = elem.len;

            self.free_chain(desc_idx);
            let entry = self.cookies[desc_idx as usize].take();
            let cookie = entry.map(|e| e.cookie).unwrap_or(0);

            Some((cookie, len, slot))
        }
    }

    /// Consume the next available chain head. Device side only. Returns
    /// `(head_idx, physical_addr, len)` of the chain's first descriptor.
    pub fn get_available_buffer(&mut self) -> Option<(u16, u64, u32)> {
        let _guard = BusyGuard::acquire(&self.busy);

        unsafe {
            fence(Ordering::SeqCst);

            self.cache_invalidate((&(*self.avail_hdr_ptr()).idx as *const u16).cast(), 2);
            let avail_idx = (*self.avail_hdr_ptr()).idx;
            if avail_idx == self.avail_cons_idx {
                return None;
            }

            let slot = self.layout.mask(self.avail_cons_idx);
            self.avail_cons_idx = self.avail_cons_idx.wrapping_add(1);

            let ring_ptr = self.avail_ring_ptr().add(slot as usize);
            self.cache_invalidate(ring_ptr.cast(), 2);
            let head_idx = core::ptr::read_volatile(ring_ptr);

            let d = self.desc_ptr(head_idx);
            self.cache_invalidate(d.cast(), core::mem::size_of::<Desc>());
            let addr = (*d).addr;
            let len = (*d).len;

            self.state = QueueState::Running;

            Some((head_idx, addr, len))
        }
    }

    /// Publish a completion for the chain headed at `head_idx`. Device
    /// side only.
    pub fn add_consumed_buffer(&mut self, head_idx: u16, len: u32) -> Result<(), VqError> {
        let _guard = BusyGuard::acquire(&self.busy);

        if head_idx >= self.layout.num {
            return Err(VqError::NoBuff);
        }

        unsafe {
            let used = self.used_hdr_ptr();
            let slot = self.layout.mask((*used).idx);
            let elem_ptr = self.used_ring_ptr().add(slot as usize);

            core::ptr::write_volatile(
                elem_ptr,
                UsedElem {
                    id: head_idx as u32,
                    len,
                },
            );
            self.cache_flush(elem_ptr.cast(), core::mem::size_of::<UsedElem>());

            fence(Ordering::SeqCst);

            let new_idx = (*used).idx.wrapping_add(1);
            core::ptr::write_volatile(&mut (*used).idx, new_idx);
            self.cache_flush((&(*used).idx as *const u16).cast(), 2);
        }

        self.queued_count += 1;
        Ok(())
    }

    /// Walk the `next` chain from `desc_idx`, splice it onto the front
    /// of the free list. Asserts the walked length matches the cookie
    /// table's recorded chain length — a mismatch is a corruption bug,
    /// not a contract error.
    fn free_chain(&mut self, desc_idx: u16) {
        let entry = self.cookies[desc_idx as usize];
        let ndescs = entry.map(|e| e.ndescs).unwrap_or(1);

        let mut walked = 1u16;
        let mut tail = desc_idx;
        unsafe {
            let mut d = self.desc_ptr(tail);
            while (*d).flags & DESC_F_NEXT != 0 && (*d).flags & DESC_F_INDIRECT == 0 {
                tail = (*d).next;
                d = self.desc_ptr(tail);
                walked += 1;
            }
            if walked != ndescs {
                log::error!(
                    "virtqueue: freed chain length {} does not match recorded length {}",
                    walked,
                    ndescs
                );
            }
            debug_assert_eq!(
                walked, ndescs,
                "virtqueue: freed chain length does not match recorded length"
            );
            (*d).next = self.free_head;
        }
        self.free_head = desc_idx;
        self.free_count += ndescs;
    }

    /// Arm notifications at the current consumption point plus
    /// `threshold`. Returns `true` if the peer already advanced past the
    /// newly armed point, meaning the caller should process immediately
    /// rather than wait for the next edge.
    pub fn enable_notifications(&mut self, threshold: u16) -> bool {
        let _guard = BusyGuard::acquire(&self.busy);
        self.arm(threshold);
        fence(Ordering::SeqCst);

        match self.role {
            Role::Driver => self.nused() > threshold,
            Role::Device => self.navail() > threshold,
        }
    }

    pub fn disable_notifications(&mut self) {
        let _guard = BusyGuard::acquire(&self.busy);
        if self.event_idx {
            match self.role {
                // The driver arms the threshold the device consults
                // (physically the word past the avail ring); the device
                // arms the one the driver consults (past the used ring).
                Role::Driver => unsafe {
                    let far_past = self
                        .used_cons_idx
                        .wrapping_sub(self.layout.num)
                        .wrapping_sub(1);
                    core::ptr::write_volatile(self.used_event_ptr(), far_past);
                    self.cache_flush(self.used_event_ptr().cast(), 2);
                },
                Role::Device => unsafe {
                    let far_past = self
                        .avail_cons_idx
                        .wrapping_sub(self.layout.num)
                        .wrapping_sub(1);
                    core::ptr::write_volatile(self.avail_event_ptr(), far_past);
                    self.cache_flush(self.avail_event_ptr().cast(), 2);
                },
            }
        } else {
            unsafe {
                match self.role {
                    Role::Driver => {
                        (*self.avail_hdr_ptr()).flags |= AVAIL_F_NO_INTERRUPT;
                        self.cache_flush(
                            (&(*self.avail_hdr_ptr()).flags as *const u16).cast(),
                            2,
                        );
                    }
                    Role::Device => {
                        (*self.used_hdr_ptr()).flags |= USED_F_NO_NOTIFY;
                        self.cache_flush((&(*self.used_hdr_ptr()).flags as *const u16).cast(), 2);
                    }
                }
            }
        }
    }

    fn arm(&mut self, threshold: u16) {
        if self.event_idx {
            match self.role {
                Role::Driver => unsafe {
                    let target = self.used_cons_idx.wrapping_add(threshold);
                    core::ptr::write_volatile(self.used_event_ptr(), target);
                    self.cache_flush(self.used_event_ptr().cast(), 2);
                },
                Role::Device => unsafe {
                    let target = self.avail_cons_idx.wrapping_add(threshold);
                    core::ptr::write_volatile(self.avail_event_ptr(), target);
                    self.cache_flush(self.avail_event_ptr().cast(), 2);
                },
            }
        } else {
            unsafe {
                match self.role {
                    Role::Driver => {
                        (*self.avail_hdr_ptr()).flags &= !AVAIL_F_NO_INTERRUPT;
                        self.cache_flush(
                            (&(*self.avail_hdr_ptr()).flags as *const u16).cast(),
                            2,
                        );
                    }
                    Role::Device => {
                        (*self.used_hdr_ptr()).flags &= !USED_F_NO_NOTIFY;
                        self.cache_flush((&(*self.used_hdr_ptr()).flags as *const u16).cast(), 2);
                    }
                }
            }
        }
    }

    fn nused(&self) -> u16 {
        let used_idx = unsafe {
            self.cache_invalidate((&(*self.used_hdr_ptr()).idx as *const u16).cast(), 2);
            (*self.used_hdr_ptr()).idx
        };
        let nused = used_idx.wrapping_sub(self.used_cons_idx);
        debug_assert!(nused <= self.layout.num, "used more than available");
        nused
    }

    fn navail(&self) -> u16 {
        let avail_idx = unsafe {
            self.cache_invalidate((&(*self.avail_hdr_ptr()).idx as *const u16).cast(), 2);
            (*self.avail_hdr_ptr()).idx
        };
        let navail = avail_idx.wrapping_sub(self.avail_cons_idx);
        debug_assert!(navail <= self.layout.num, "avail more than available");
        navail
    }

    /// Invoke the completion callback, if any, under a full fence.
    pub fn notification(&mut self) {
        fence(Ordering::SeqCst);
        if let Some(cb) = self.callback.as_mut() {
            cb();
        }
    }

    /// `free_count + in_flight_chain_lengths == num` — exposed for tests.
    #[cfg(test)]
    fn invariant_free_plus_in_flight(&self) -> u16 {
        let in_flight: u16 = self
            .cookies
            .iter()
            .filter_map(|c| c.map(|e| e.ndescs))
            .sum();
        self.free_count + in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NullPlatform;
    use alloc::vec;

    fn new_queue(num: u16, role: Role, mem: &mut [u8], event_idx: bool) -> Virtqueue<NullPlatform> {
        unsafe {
            Virtqueue::new(
                mem.as_mut_ptr(),
                role,
                num,
                4096,
                0,
                event_idx,
                NullPlatform,
            )
            .unwrap()
        }
    }

    fn alloc_mem(num: u16) -> Vec<u8> {
        vec![0u8; crate::vring::vring_size(num, 4096)]
    }

    #[test]
    fn s1_basic_publish_complete() {
        let mut mem = alloc_mem(8);
        let mut driver = new_queue(8, Role::Driver, &mut mem, false);

        let payload = 0x1000usize as *const u8;
        driver
            .add_buffer(&[VirtqueueBuf { vaddr: payload, len: 64 }], 1, 0xC0)
            .unwrap();
        assert_eq!(driver.free_count(), 7);

        let mut device = new_queue(8, Role::Device, &mut mem, false);
        let (head, addr, len) = device.get_available_buffer().unwrap();
        assert_eq!(head, 0);
        assert_eq!(addr, payload as u64);
        assert_eq!(len, 64);

        device.add_consumed_buffer(head, 64).unwrap();

        let (cookie, len, _idx) = driver.get_buffer().unwrap();
        assert_eq!(cookie, 0xC0);
        assert_eq!(len, 64);
        assert_eq!(driver.free_count(), 8);
        assert_eq!(driver.invariant_free_plus_in_flight(), 8);
    }

    #[test]
    fn s2_readable_then_writable_chain() {
        let mut mem = alloc_mem(16);
        let mut driver = new_queue(16, Role::Driver, &mut mem, false);

        let a = 0xA000usize as *const u8;
        let b = 0xB000usize as *const u8;
        let c = 0xC000usize as *const u8;
        driver
            .add_buffer(
                &[
                    VirtqueueBuf { vaddr: a, len: 16 },
                    VirtqueueBuf { vaddr: b, len: 16 },
                    VirtqueueBuf { vaddr: c, len: 32 },
                ],
                2,
                0xC1,
            )
            .unwrap();
        assert_eq!(driver.free_count(), 13);

        unsafe {
            let d0 = &*driver.desc_ptr(0);
            let d1 = &*driver.desc_ptr(1);
            let d2 = &*driver.desc_ptr(2);
            assert_eq!(d0.flags & DESC_F_NEXT, DESC_F_NEXT);
            assert_eq!(d0.flags & DESC_F_WRITE, 0);
            assert_eq!(d1.flags & DESC_F_NEXT, DESC_F_NEXT);
            assert_eq!(d1.flags & DESC_F_WRITE, 0);
            assert_eq!(d2.flags & DESC_F_NEXT, 0);
            assert_eq!(d2.flags & DESC_F_WRITE, DESC_F_WRITE);
        }

        let mut device = new_queue(16, Role::Device, &mut mem, false);
        let (head, _addr, _len) = device.get_available_buffer().unwrap();
        device.add_consumed_buffer(head, 32).unwrap();

        let (cookie, len, _idx) = driver.get_buffer().unwrap();
        assert_eq!(cookie, 0xC1);
        assert_eq!(len, 32);
    }

    #[test]
    fn s3_ring_full_backpressure() {
        let mut mem = alloc_mem(4);
        let mut driver = new_queue(4, Role::Driver, &mut mem, false);

        for i in 0..4 {
            driver
                .add_buffer(&[VirtqueueBuf { vaddr: 0x1000 as *const u8, len: 8 }], 1, i)
                .unwrap();
        }
        assert_eq!(driver.free_count(), 0);

        let before = driver.free_count();
        let err = driver
            .add_buffer(&[VirtqueueBuf { vaddr: 0x1000 as *const u8, len: 8 }], 1, 99)
            .unwrap_err();
        assert_eq!(err, VqError::VringFull);
        assert_eq!(driver.free_count(), before);
    }

    #[test]
    fn s4_event_index_notify_window() {
        let mut mem = alloc_mem(8);
        let mut device = new_queue(8, Role::Device, &mut mem, true);
        let mut driver = new_queue(8, Role::Driver, &mut mem, true);

        // Driver arms a signal at used_event = 5 (physically the word
        // trailing the avail ring, which the device's kick consults).
        unsafe {
            core::ptr::write_volatile(driver.used_event_ptr(), 5);
        }

        for i in 0..4u16 {
            device.add_consumed_buffer(i, 8).unwrap();
        }
        // used.idx now at 4, queued_count=4 -> prev=0, new=4: window (0,4], event=5 not crossed.
        assert!(!device.kick());

        device.add_consumed_buffer(4, 8).unwrap();
        // new=5, prev=4: window (4,5] does not cross event=5 (need new > event).
        assert!(!device.kick());

        device.add_consumed_buffer(5, 8).unwrap();
        // new=6, prev=5: window (5,6] crosses event=5 -> notify.
        assert!(device.kick());
    }

    #[test]
    fn free_list_threading_terminates_at_chain_end() {
        let mut mem = alloc_mem(4);
        let driver = new_queue(4, Role::Driver, &mut mem, false);
        let mut seen = alloc::collections::BTreeSet::new();
        let mut idx = driver.free_head;
        let mut steps = 0;
        while idx != CHAIN_END {
            assert!(seen.insert(idx), "index visited twice");
            idx = unsafe { (*driver.desc_ptr(idx)).next };
            steps += 1;
            assert!(steps <= 4);
        }
        assert_eq!(seen.len(), 4);
    }
}
