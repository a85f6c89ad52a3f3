//! Shared memory regions.
//!
//! A region is a run of logical pages, each backed by at most one frame.
//! Lazily allocated regions start with every slot unbacked; the first
//! touch either allocates the page (creator faulting, or creator gone) or
//! parks the faulting thread and asks the creator to supply the page.
//! Regions are refcounted by their joins and released with their frames
//! when the last joiner leaves.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    vec,
    vec::Vec,
};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::{
    ipc,
    mm::{self, frame_allocator, PhysAddr, PAGE_SIZE},
    process::{self, Process, ProcessId, Thread},
    sched,
};

bitflags! {
    /// Flags a region is created with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SharedMemoryFlags: u64 {
        /// Pages are allocated on first touch instead of eagerly.
        const LAZILY_ALLOCATED = 1 << 0;
        /// Joiners other than the creator may write.
        const JOINERS_CAN_WRITE = 1 << 1;
    }
}

bitflags! {
    /// Flag word of the get-details operation, relative to a process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SharedMemoryDetails: u64 {
        const EXISTS = 1 << 0;
        const CAN_WRITE = 1 << 1;
        const LAZILY_ALLOCATED = 1 << 2;
        const CAN_ASSIGN_PAGES = 1 << 3;
    }
}

/// A thread parked on an unbacked lazy slot.
struct Waiter {
    thread: Arc<Thread>,
    page: usize,
}

/// A block of shared memory.
pub struct SharedMemory {
    pub id: u64,
    pub flags: SharedMemoryFlags,
    pub creator_pid: ProcessId,
    /// Message id delivered to the creator when a joiner touches an
    /// unbacked lazy page.
    pub lazy_message_id: u64,

    /// One backing frame per page; `None` while unbacked.
    slots: Mutex<Vec<Option<PhysAddr>>>,
    /// Pids permitted to supply pages.
    allowed_assigners: Mutex<BTreeSet<u64>>,
    /// Processes this region is mapped into, with the mapping address.
    joined: Mutex<Vec<(ProcessId, u64)>>,
    /// Threads waiting for slots to become backed.
    waiters: Mutex<Vec<Waiter>>,
    /// Distinct joins across all processes.
    joiner_count: AtomicUsize,
}

impl SharedMemory {
    fn new(
        id: u64,
        pages: usize,
        flags: SharedMemoryFlags,
        creator_pid: ProcessId,
        lazy_message_id: u64,
    ) -> Self {
        let mut allowed = BTreeSet::new();
        allowed.insert(creator_pid.0);
        Self {
            id,
            flags,
            creator_pid,
            lazy_message_id,
            slots: Mutex::new(vec![None; pages]),
            allowed_assigners: Mutex::new(allowed),
            joined: Mutex::new(Vec::new()),
            waiters: Mutex::new(Vec::new()),
            joiner_count: AtomicUsize::new(0),
        }
    }

    pub fn size_in_pages(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn joiner_count(&self) -> usize {
        self.joiner_count.load(Ordering::Acquire)
    }

    /// The creator can always write; joiners only with the flag.
    pub fn can_process_write(&self, pid: ProcessId) -> bool {
        self.flags.contains(SharedMemoryFlags::JOINERS_CAN_WRITE) || self.creator_pid == pid
    }

    pub fn is_lazy(&self) -> bool {
        self.flags.contains(SharedMemoryFlags::LAZILY_ALLOCATED)
    }
}

/// A region mapped into one process.
pub struct SharedMemoryJoin {
    pub region: Arc<SharedMemory>,
    pub virtual_address: u64,
    /// Joins from the same process deduplicate into this count.
    pub references: usize,
}

static SHARED_MEMORIES: Mutex<BTreeMap<u64, Arc<SharedMemory>>> = Mutex::new(BTreeMap::new());
static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

pub fn region_from_id(id: u64) -> Option<Arc<SharedMemory>> {
    SHARED_MEMORIES.lock().get(&id).cloned()
}

/// Create a region and map it into the creating process. Returns the
/// region and the virtual address it was mapped at.
pub fn create_and_map(
    process: &Arc<Process>,
    pages: usize,
    flags: SharedMemoryFlags,
    lazy_message_id: u64,
) -> Option<(Arc<SharedMemory>, u64)> {
    if pages == 0 {
        return None;
    }
    let id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
    let region = Arc::new(SharedMemory::new(
        id,
        pages,
        flags,
        process.pid,
        lazy_message_id,
    ));

    if !region.is_lazy() {
        // Eager regions get every frame up front; failure releases what
        // was obtained.
        let mut slots = region.slots.lock();
        for page in 0..pages {
            match frame_allocator::allocate() {
                Some(frame) => slots[page] = Some(frame),
                None => {
                    for slot in slots.iter_mut().take(page) {
                        if let Some(frame) = slot.take() {
                            frame_allocator::free(frame);
                        }
                    }
                    return None;
                }
            }
        }
    }

    SHARED_MEMORIES.lock().insert(id, region.clone());

    match map_into_process(process, &region) {
        Some(virtual_address) => Some((region, virtual_address)),
        None => {
            release_region(&region);
            None
        }
    }
}

/// Map a region into a process at a freshly reserved range.
fn map_into_process(process: &Arc<Process>, region: &Arc<SharedMemory>) -> Option<u64> {
    let pages = region.size_in_pages() as u64;
    let virtual_address = process.address_space.lock().reserve_range(pages)?;
    map_into_process_at(process, region, virtual_address)
}

/// Map a region into a process at an already reserved address: backed
/// slots map their frame, unbacked slots get the dud entry that faults on
/// access.
fn map_into_process_at(
    process: &Arc<Process>,
    region: &Arc<SharedMemory>,
    virtual_address: u64,
) -> Option<u64> {
    let can_write = region.can_process_write(process.pid);
    let slots = region.slots.lock().clone();

    {
        let mut space = process.address_space.lock();
        for (page, slot) in slots.iter().enumerate() {
            let page_address = virtual_address + (page * PAGE_SIZE) as u64;
            let result = match slot {
                Some(frame) => space.map_page_at(page_address, *frame, false, can_write, false),
                None => space.map_page_at(page_address, PhysAddr::new(0), false, false, true),
            };
            if let Err(e) = result {
                log::error!("mapping shared memory {} page {}: {}", region.id, page, e);
            }
        }
    }

    region.joined.lock().push((process.pid, virtual_address));
    region.joiner_count.fetch_add(1, Ordering::AcqRel);
    process
        .joined_shared_memories
        .lock()
        .push(SharedMemoryJoin {
            region: region.clone(),
            virtual_address,
            references: 1,
        });
    Some(virtual_address)
}

/// Join a region by id. Joins from the same process deduplicate; the
/// existing mapping address is returned with its refcount bumped.
pub fn join(process: &Arc<Process>, region_id: u64) -> Option<(Arc<SharedMemory>, u64)> {
    {
        let mut joins = process.joined_shared_memories.lock();
        if let Some(join) = joins.iter_mut().find(|j| j.region.id == region_id) {
            join.references += 1;
            return Some((join.region.clone(), join.virtual_address));
        }
    }

    let region = region_from_id(region_id)?;
    let virtual_address = map_into_process(process, &region)?;
    Some((region, virtual_address))
}

/// Join a creating-state child to a region at a caller-chosen address.
pub fn join_child_at(
    parent: &Arc<Process>,
    child: &Arc<Process>,
    region_id: u64,
    starting_address: u64,
) -> bool {
    if !process::is_child_of(parent, child) {
        return false;
    }
    let region = match region_from_id(region_id) {
        Some(region) => region,
        None => return false,
    };

    let starting_address = if mm::is_page_aligned(starting_address) {
        starting_address
    } else {
        log::warn!(
            "join_child_at called with non-page-aligned address {:#x}",
            starting_address
        );
        mm::round_down_to_page(starting_address)
    };

    if !child
        .address_space
        .lock()
        .reserve_at(starting_address, region.size_in_pages() as u64)
    {
        return false;
    }
    map_into_process_at(child, &region, starting_address).is_some()
}

/// Drop one reference to a joined region; the last reference unmaps it and
/// may release the region itself.
pub fn leave(process: &Arc<Process>, region_id: u64) {
    let join = {
        let mut joins = process.joined_shared_memories.lock();
        let index = match joins.iter().position(|j| j.region.id == region_id) {
            Some(index) => index,
            None => return,
        };
        joins[index].references -= 1;
        if joins[index].references > 0 {
            return;
        }
        joins.remove(index)
    };
    unmap_join(process, &join);
}

/// Drop every join of a dying process.
pub fn leave_all(process: &Arc<Process>) {
    loop {
        let join = match process.joined_shared_memories.lock().pop() {
            Some(join) => join,
            None => break,
        };
        unmap_join(process, &join);
    }
}

fn unmap_join(process: &Arc<Process>, join: &SharedMemoryJoin) {
    let region = &join.region;
    // The frames stay with the region; only the window goes away.
    process
        .address_space
        .lock()
        .release_pages(join.virtual_address, region.size_in_pages() as u64);

    region
        .joined
        .lock()
        .retain(|&(pid, _)| pid != process.pid);
    if region.joiner_count.fetch_sub(1, Ordering::AcqRel) == 1 {
        release_region(region);
    }
}

/// Free a region's frames and forget it. Only valid with no joins left.
fn release_region(region: &Arc<SharedMemory>) {
    if region.joiner_count.load(Ordering::Acquire) > 0 {
        log::error!("releasing shared memory {} that still has joiners", region.id);
        return;
    }
    if !region.waiters.lock().is_empty() {
        log::error!(
            "releasing shared memory {} that still blocks threads",
            region.id
        );
    }
    let mut slots = region.slots.lock();
    for slot in slots.iter_mut() {
        if let Some(frame) = slot.take() {
            frame_allocator::free(frame);
        }
    }
    SHARED_MEMORIES.lock().remove(&region.id);
}

/// Back `page` with `frame`: replace (and free) any previous frame, map
/// the new one into every joined process, and wake the threads waiting on
/// this slot.
fn install_page(region: &Arc<SharedMemory>, page: usize, frame: PhysAddr) {
    {
        let mut slots = region.slots.lock();
        if page >= slots.len() {
            frame_allocator::free(frame);
            return;
        }
        let old = slots[page];
        if old == Some(frame) {
            return;
        }
        if let Some(old_frame) = old {
            // Unmap the stale frame everywhere before freeing it, so no
            // joiner keeps a window onto a recycled frame.
            for &(pid, virtual_address) in region.joined.lock().iter() {
                if let Some(joined) = process::process_from_pid(pid) {
                    joined
                        .address_space
                        .lock()
                        .release_pages(virtual_address + (page * PAGE_SIZE) as u64, 1);
                }
            }
            frame_allocator::free(old_frame);
        }
        slots[page] = Some(frame);
    }

    // Project the new frame into every joiner.
    for &(pid, virtual_address) in region.joined.lock().iter() {
        if let Some(joined) = process::process_from_pid(pid) {
            let can_write = region.can_process_write(pid);
            let result = joined.address_space.lock().map_page_at(
                virtual_address + (page * PAGE_SIZE) as u64,
                frame,
                false,
                can_write,
                false,
            );
            if let Err(e) = result {
                log::error!("mapping shared page into process {}: {}", pid, e);
            }
        }
    }

    wake_waiters_for_page(region, page);
}

fn wake_waiters_for_page(region: &Arc<SharedMemory>, page: usize) {
    let mut woken = Vec::new();
    region.waiters.lock().retain(|waiter| {
        if waiter.page == page {
            woken.push(waiter.thread.clone());
            false
        } else {
            true
        }
    });
    for thread in woken {
        *thread.waiting_for_shared_page.lock() = None;
        sched::schedule_thread(&thread);
    }
}

/// Move a page out of the caller's address space into a slot of the
/// region. The caller must own the page; it is unmapped from the caller
/// regardless of what happens afterwards.
pub fn move_page_into(
    process: &Arc<Process>,
    region_id: u64,
    offset_in_region: u64,
    page_address: u64,
) {
    let phys = {
        let mut space = process.address_space.lock();
        let phys = match space.translate(page_address, true) {
            Some(phys) => phys,
            // Unmapped, or not ours to give away.
            None => return,
        };
        space.release_pages(page_address, 1);
        phys
    };

    let region = match region_from_id(region_id) {
        Some(region) => region,
        None => {
            frame_allocator::free(phys);
            return;
        }
    };

    let page = (offset_in_region / PAGE_SIZE as u64) as usize;
    if page >= region.size_in_pages() {
        frame_allocator::free(phys);
        return;
    }

    install_page(&region, page, phys);
}

/// The page-fault hook: returns whether the fault at `fault_address` was a
/// touch of an unbacked lazy slot and has been handled (by backing the
/// slot or parking the thread).
pub fn handle_page_fault(fault_address: u64) -> bool {
    let thread = match sched::running_thread() {
        Some(thread) => thread,
        // Faults with no running thread are kernel faults, not ours.
        None => return false,
    };
    let process = match thread.process.upgrade() {
        Some(process) => process,
        None => return false,
    };

    let address = mm::round_down_to_page(fault_address);

    let joins: Vec<(Arc<SharedMemory>, u64)> = process
        .joined_shared_memories
        .lock()
        .iter()
        .map(|j| (j.region.clone(), j.virtual_address))
        .collect();

    for (region, virtual_address) in joins {
        if address < virtual_address {
            continue;
        }
        let page = ((address - virtual_address) / PAGE_SIZE as u64) as usize;
        if page >= region.size_in_pages() {
            continue;
        }

        // The address falls inside this region.
        if !region.is_lazy() {
            return false;
        }
        if region.slots.lock()[page].is_some() {
            // Backed already; the fault is a permission problem, not a
            // missing page.
            return false;
        }

        let creator = process::process_from_pid(region.creator_pid);
        return match creator {
            Some(creator) if !Arc::ptr_eq(&creator, &process) => {
                // Park the thread and ask the creator for the page.
                region.waiters.lock().push(Waiter {
                    thread: thread.clone(),
                    page,
                });
                *thread.waiting_for_shared_page.lock() = Some((region.id, page));
                sched::unschedule_thread(&thread);
                ipc::send_kernel_message_to_process(
                    &creator,
                    region.lazy_message_id,
                    (page * PAGE_SIZE) as u64,
                    0,
                    0,
                    0,
                    0,
                );
                true
            }
            _ => {
                // Creator faulting on its own lazy region, or the creator
                // is gone: back the slot here and now.
                match frame_allocator::allocate() {
                    Some(frame) => {
                        install_page(&region, page, frame);
                        true
                    }
                    None => false,
                }
            }
        };
    }

    false
}

/// Unhook a thread from whatever slot it waits on (thread teardown).
pub fn remove_waiter(thread: &Arc<Thread>) {
    let parked_on = thread.waiting_for_shared_page.lock().take();
    if let Some((region_id, _)) = parked_on {
        if let Some(region) = region_from_id(region_id) {
            region
                .waiters
                .lock()
                .retain(|waiter| !Arc::ptr_eq(&waiter.thread, thread));
        }
    }
}

/// Let another process supply pages too. The grantor must already hold the
/// permission.
pub fn grant_assign_permission(grantor: &Arc<Process>, region_id: u64, grantee_pid: u64) {
    if let Some(region) = region_from_id(region_id) {
        let mut allowed = region.allowed_assigners.lock();
        if allowed.contains(&grantor.pid.0) {
            allowed.insert(grantee_pid);
        }
    }
}

/// Whether the page at `offset_in_region` is backed.
pub fn is_page_allocated(region_id: u64, offset_in_region: u64) -> bool {
    page_physical_address(region_id, offset_in_region).is_some()
}

/// Physical address of a backed page (driver surface).
pub fn page_physical_address(region_id: u64, offset_in_region: u64) -> Option<PhysAddr> {
    let region = region_from_id(region_id)?;
    let page = (offset_in_region / PAGE_SIZE as u64) as usize;
    let slots = region.slots.lock();
    slots.get(page).copied().flatten()
}

/// Details of a region as they pertain to one process: flag word plus size
/// in bytes. A missing region reads as zeroes.
pub fn details_for_process(process: &Arc<Process>, region_id: u64) -> (u64, u64) {
    let region = match region_from_id(region_id) {
        Some(region) => region,
        None => return (0, 0),
    };

    let mut details = SharedMemoryDetails::EXISTS;
    if region.can_process_write(process.pid) {
        details |= SharedMemoryDetails::CAN_WRITE;
    }
    if region.is_lazy() {
        details |= SharedMemoryDetails::LAZILY_ALLOCATED;
    }
    // Page assignment is not narrowed per process yet; every process that
    // can see the region may ask its creator to accept pages.
    details |= SharedMemoryDetails::CAN_ASSIGN_PAGES;

    (
        details.bits(),
        (region.size_in_pages() * PAGE_SIZE) as u64,
    )
}

/// Grow a joined region to `new_page_count` pages. The calling process
/// must be able to extend its own mapping in place; other joiners are
/// extended best effort.
pub fn grow(
    process: &Arc<Process>,
    region_id: u64,
    new_page_count: usize,
) -> Option<(usize, u64)> {
    let region = region_from_id(region_id)?;
    let my_virtual_address = process
        .joined_shared_memories
        .lock()
        .iter()
        .find(|j| j.region.id == region_id)
        .map(|j| j.virtual_address)?;

    let old = region.size_in_pages();
    if new_page_count <= old {
        return Some((old, my_virtual_address));
    }
    let extra = (new_page_count - old) as u64;

    // The caller's own mapping must extend contiguously.
    if !process
        .address_space
        .lock()
        .reserve_at(my_virtual_address + (old * PAGE_SIZE) as u64, extra)
    {
        return None;
    }

    // Eager regions back the new pages immediately.
    let mut new_frames: Vec<Option<PhysAddr>> = vec![None; extra as usize];
    if !region.is_lazy() {
        for slot in new_frames.iter_mut() {
            match frame_allocator::allocate() {
                Some(frame) => *slot = Some(frame),
                None => {
                    for slot in new_frames.iter_mut() {
                        if let Some(frame) = slot.take() {
                            frame_allocator::free(frame);
                        }
                    }
                    process
                        .address_space
                        .lock()
                        .mark_free(my_virtual_address + (old * PAGE_SIZE) as u64, extra);
                    return None;
                }
            }
        }
    }

    region.slots.lock().extend(new_frames.iter().copied());

    for &(pid, virtual_address) in region.joined.lock().iter() {
        let joined = match process::process_from_pid(pid) {
            Some(joined) => joined,
            None => continue,
        };
        let mut space = joined.address_space.lock();
        if pid != process.pid
            && !space.reserve_at(virtual_address + (old * PAGE_SIZE) as u64, extra)
        {
            log::warn!(
                "cannot extend shared memory {} mapping in process {}",
                region.id,
                pid
            );
            continue;
        }
        let can_write = region.can_process_write(pid);
        for (i, slot) in new_frames.iter().enumerate() {
            let page_address = virtual_address + ((old + i) * PAGE_SIZE) as u64;
            let result = match slot {
                Some(frame) => space.map_page_at(page_address, *frame, false, can_write, false),
                None => space.map_page_at(page_address, PhysAddr::new(0), false, false, true),
            };
            if let Err(e) = result {
                log::error!("extending shared memory {} in process {}: {}", region.id, pid, e);
            }
        }
    }

    Some((new_page_count, my_virtual_address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Weak;
    use core::sync::atomic::{AtomicBool, AtomicU64 as TestAtomicU64};

    use crate::arch::context::{FpuState, Registers};
    use crate::process::ThreadId;

    fn detached_region(pages: usize, flags: SharedMemoryFlags) -> Arc<SharedMemory> {
        Arc::new(SharedMemory::new(99, pages, flags, ProcessId(42), 7))
    }

    fn detached_thread(id: u64) -> Arc<Thread> {
        Arc::new(Thread {
            id: ThreadId(id),
            process: Weak::new(),
            regs: Mutex::new(Registers::default()),
            fpu: Mutex::new(FpuState::default()),
            uses_fpu: AtomicBool::new(false),
            stack: 0,
            awake: AtomicBool::new(false),
            waiting_for_message: AtomicBool::new(false),
            waiting_for_shared_page: Mutex::new(None),
            time_slices: TestAtomicU64::new(0),
            fs_base: TestAtomicU64::new(0),
            clear_on_termination: TestAtomicU64::new(0),
        })
    }

    #[test]
    fn creator_can_always_write_joiners_only_with_flag() {
        let read_only = detached_region(2, SharedMemoryFlags::empty());
        assert!(read_only.can_process_write(ProcessId(42)));
        assert!(!read_only.can_process_write(ProcessId(43)));

        let writable = detached_region(2, SharedMemoryFlags::JOINERS_CAN_WRITE);
        assert!(writable.can_process_write(ProcessId(43)));
    }

    #[test]
    fn waiters_for_a_slot_wake_together_and_only_them() {
        let region = detached_region(3, SharedMemoryFlags::LAZILY_ALLOCATED);
        let waiting_a = detached_thread(1);
        let waiting_b = detached_thread(2);
        let other = detached_thread(3);

        for (thread, page) in [(&waiting_a, 1usize), (&waiting_b, 1), (&other, 2)] {
            region.waiters.lock().push(Waiter {
                thread: (*thread).clone(),
                page,
            });
            *thread.waiting_for_shared_page.lock() = Some((region.id, page));
        }

        wake_waiters_for_page(&region, 1);

        assert!(waiting_a.awake.load(Ordering::Acquire));
        assert!(waiting_b.awake.load(Ordering::Acquire));
        assert!(!other.awake.load(Ordering::Acquire));
        assert!(waiting_a.waiting_for_shared_page.lock().is_none());
        assert_eq!(region.waiters.lock().len(), 1);
    }

    #[test]
    fn slot_vector_starts_unbacked() {
        let region = detached_region(4, SharedMemoryFlags::LAZILY_ALLOCATED);
        assert_eq!(region.size_in_pages(), 4);
        assert!(region.slots.lock().iter().all(|s| s.is_none()));
        assert_eq!(region.joiner_count(), 0);
    }
}
