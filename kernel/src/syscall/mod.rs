//! System call dispatch.
//!
//! One numeric opcode arrives in `rdi`; every argument and result travels
//! in the caller's saved register snapshot, which the SYSCALL stub wrote
//! before calling [`handle`] and restores afterwards. Multi-word names are
//! packed 8 bytes per register across a fixed register sequence.
//!
//! Errors are in-band: a status or sentinel value in the return register,
//! never a fault. Unknown opcodes log a diagnostic and change nothing.

use core::sync::atomic::Ordering;

use crate::{
    arch::context::Registers,
    boot, interrupts, ipc,
    ipc::{registry, registry::ServiceName, shared_memory, shared_memory::SharedMemoryFlags},
    mm::{frame_allocator, MemoryRights, PAGE_SIZE},
    process::{self, thread, ProcessId, ProcessName, ThreadId},
    sched, timer,
};

/// In-band failure value of the memory-family calls. 1 is never a valid
/// page-aligned address.
const OUT_OF_MEMORY: u64 = 1;

/// Stable syscall opcodes.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    // Debug
    PrintDebugCharacter = 0,
    PrintRegistersAndStack = 1,

    // Threads
    CreateThread = 2,
    GetThisThreadId = 3,
    TerminateThisThread = 4,
    TerminateThread = 5,
    Yield = 6,
    SetThreadSegment = 7,
    SetAddressToClearOnThreadTermination = 8,

    // Memory
    AllocateMemoryPages = 9,
    AllocateMemoryPagesBelowPhysicalBase = 10,
    ReleaseMemoryPages = 11,
    MapPhysicalMemory = 12,
    GetPhysicalAddressOfVirtualAddress = 13,
    GetFreeSystemMemory = 14,
    GetMemoryUsedByProcess = 15,
    GetTotalSystemMemory = 16,
    SetMemoryAccessRights = 17,

    // Shared memory
    CreateSharedMemory = 18,
    JoinSharedMemory = 19,
    JoinChildProcessInSharedMemory = 20,
    LeaveSharedMemory = 21,
    GetSharedMemoryDetails = 22,
    MovePageIntoSharedMemory = 23,
    GrantPermissionToAllocateIntoSharedMemory = 24,
    IsSharedMemoryPageAllocated = 25,
    GetSharedMemoryPagePhysicalAddress = 26,
    GrowSharedMemory = 27,

    // Processes
    GetThisProcessId = 28,
    TerminateThisProcess = 29,
    TerminateProcess = 30,
    GetProcesses = 31,
    GetNameOfProcess = 32,
    NotifyWhenProcessDisappears = 33,
    StopNotifyingWhenProcessDisappears = 34,
    CreateChildProcess = 35,
    SetChildProcessMemoryPage = 36,
    StartExecutingChildProcess = 37,
    DestroyChildProcess = 38,
    GetMultibootModule = 39,

    // Services
    RegisterService = 40,
    UnregisterService = 41,
    GetServices = 42,
    GetNameOfService = 43,
    NotifyWhenServiceAppears = 44,
    StopNotifyingWhenServiceAppears = 45,
    NotifyWhenServiceDisappears = 46,
    StopNotifyingWhenServiceDisappears = 47,

    // Messaging
    SendMessage = 48,
    PollForMessage = 49,
    SleepForMessage = 50,
    RegisterMessageToSendOnInterrupt = 51,
    UnregisterMessageToSendOnInterrupt = 52,

    // System
    GetMultibootFramebufferInformation = 53,
    SendMessageAfterXMicroseconds = 54,
    SendMessageAtTimestamp = 55,
    GetCurrentTimestamp = 56,
    EnableProfiling = 57,
    DisableAndOutputProfiling = 58,
}

impl TryFrom<u64> for Syscall {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, ()> {
        use Syscall::*;
        Ok(match value {
            0 => PrintDebugCharacter,
            1 => PrintRegistersAndStack,
            2 => CreateThread,
            3 => GetThisThreadId,
            4 => TerminateThisThread,
            5 => TerminateThread,
            6 => Yield,
            7 => SetThreadSegment,
            8 => SetAddressToClearOnThreadTermination,
            9 => AllocateMemoryPages,
            10 => AllocateMemoryPagesBelowPhysicalBase,
            11 => ReleaseMemoryPages,
            12 => MapPhysicalMemory,
            13 => GetPhysicalAddressOfVirtualAddress,
            14 => GetFreeSystemMemory,
            15 => GetMemoryUsedByProcess,
            16 => GetTotalSystemMemory,
            17 => SetMemoryAccessRights,
            18 => CreateSharedMemory,
            19 => JoinSharedMemory,
            20 => JoinChildProcessInSharedMemory,
            21 => LeaveSharedMemory,
            22 => GetSharedMemoryDetails,
            23 => MovePageIntoSharedMemory,
            24 => GrantPermissionToAllocateIntoSharedMemory,
            25 => IsSharedMemoryPageAllocated,
            26 => GetSharedMemoryPagePhysicalAddress,
            27 => GrowSharedMemory,
            28 => GetThisProcessId,
            29 => TerminateThisProcess,
            30 => TerminateProcess,
            31 => GetProcesses,
            32 => GetNameOfProcess,
            33 => NotifyWhenProcessDisappears,
            34 => StopNotifyingWhenProcessDisappears,
            35 => CreateChildProcess,
            36 => SetChildProcessMemoryPage,
            37 => StartExecutingChildProcess,
            38 => DestroyChildProcess,
            39 => GetMultibootModule,
            40 => RegisterService,
            41 => UnregisterService,
            42 => GetServices,
            43 => GetNameOfService,
            44 => NotifyWhenServiceAppears,
            45 => StopNotifyingWhenServiceAppears,
            46 => NotifyWhenServiceDisappears,
            47 => StopNotifyingWhenServiceDisappears,
            48 => SendMessage,
            49 => PollForMessage,
            50 => SleepForMessage,
            51 => RegisterMessageToSendOnInterrupt,
            52 => UnregisterMessageToSendOnInterrupt,
            53 => GetMultibootFramebufferInformation,
            54 => SendMessageAfterXMicroseconds,
            55 => SendMessageAtTimestamp,
            56 => GetCurrentTimestamp,
            57 => EnableProfiling,
            58 => DisableAndOutputProfiling,
            _ => return Err(()),
        })
    }
}

/// The register sequence 11-word process names are packed across.
fn read_name_words(regs: &Registers) -> [u64; process::PROCESS_NAME_WORDS] {
    [
        regs.rax, regs.rbx, regs.rdx, regs.rsi, regs.r8, regs.r9, regs.r10, regs.r12, regs.r13,
        regs.r14, regs.r15,
    ]
}

fn write_name_words(regs: &mut Registers, words: &[u64; process::PROCESS_NAME_WORDS]) {
    regs.rax = words[0];
    regs.rbx = words[1];
    regs.rdx = words[2];
    regs.rsi = words[3];
    regs.r8 = words[4];
    regs.r9 = words[5];
    regs.r10 = words[6];
    regs.r12 = words[7];
    regs.r13 = words[8];
    regs.r14 = words[9];
    regs.r15 = words[10];
}

/// The register sequence 10-word service names are packed across.
fn read_service_name(regs: &Registers) -> [u64; registry::SERVICE_NAME_WORDS] {
    [
        regs.rax, regs.rbx, regs.rdx, regs.rsi, regs.r8, regs.r9, regs.r10, regs.r12, regs.r13,
        regs.r14,
    ]
}

fn write_service_name(regs: &mut Registers, words: &[u64; registry::SERVICE_NAME_WORDS]) {
    regs.rax = words[0];
    regs.rbx = words[1];
    regs.rdx = words[2];
    regs.rsi = words[3];
    regs.r8 = words[4];
    regs.r9 = words[5];
    regs.r10 = words[6];
    regs.r12 = words[7];
    regs.r13 = words[8];
    regs.r14 = words[9];
}

// Per-process boot-console state so interleaved debug prints from
// different processes stay readable.
static LAST_PRINTING_PID: spin::Mutex<(u64, bool)> = spin::Mutex::new((u64::MAX, true));

/// Dispatch one system call for the running thread.
pub fn handle(opcode: u64) {
    let thread = match sched::running_thread() {
        Some(thread) => thread,
        None => {
            log::warn!("syscall {} with no running thread", opcode);
            return;
        }
    };
    let process = match thread.process.upgrade() {
        Some(process) => process,
        None => return,
    };

    let syscall = match Syscall::try_from(opcode) {
        Ok(syscall) => syscall,
        Err(()) => {
            log::warn!(
                "syscall {} from {} ({}) is not known to this kernel",
                opcode,
                process.name,
                process.pid
            );
            return;
        }
    };

    // Arguments come from a copy of the snapshot; results are written back
    // through short-lived locks so subsystem calls may take the regs lock
    // themselves.
    let saved = *thread.regs.lock();

    match syscall {
        Syscall::PrintDebugCharacter => {
            let c = (saved.rax & 0xFF) as u8 as char;
            let mut last = LAST_PRINTING_PID.lock();
            if last.0 != process.pid.0 {
                if !last.1 {
                    crate::println!();
                }
                crate::print!("{}: ", process.name);
                last.0 = process.pid.0;
            }
            crate::print!("{}", c);
            last.1 = c == '\n';
        }
        Syscall::PrintRegistersAndStack => {
            crate::println!(
                "Dump requested by PID {} ({}) in TID {}",
                process.pid,
                process.name,
                thread.id
            );
            interrupts::dump_current_registers();
        }

        Syscall::CreateThread => {
            let created = thread::create_thread(&process, saved.rax, saved.rbx);
            let result = match created {
                Ok(new_thread) => {
                    sched::schedule_thread(&new_thread);
                    new_thread.id.0
                }
                Err(_) => 0,
            };
            thread.regs.lock().rax = result;
        }
        Syscall::GetThisThreadId => {
            thread.regs.lock().rax = thread.id.0;
        }
        Syscall::TerminateThisThread => {
            thread::destroy_thread(&thread, false);
        }
        Syscall::TerminateThread => {
            let target = thread::thread_from_tid(&process, ThreadId(saved.rax));
            if let Some(target) = target {
                thread::destroy_thread(&target, false);
            }
        }
        Syscall::Yield => {
            sched::schedule_next_thread();
        }
        Syscall::SetThreadSegment => {
            thread::set_thread_segment(&thread, saved.rax);
        }
        Syscall::SetAddressToClearOnThreadTermination => {
            // Align to 8 bytes so the zeroing write cannot straddle pages.
            thread
                .clear_on_termination
                .store(saved.rax & !7, Ordering::Release);
        }

        Syscall::AllocateMemoryPages => {
            let address = process.address_space.lock().allocate_pages(saved.rax);
            thread.regs.lock().rax = address.unwrap_or(OUT_OF_MEMORY);
        }
        Syscall::AllocateMemoryPagesBelowPhysicalBase => {
            if process.is_driver {
                let mut space = process.address_space.lock();
                match space.allocate_pages_below(saved.rax, saved.rbx) {
                    Some(address) => {
                        let phys = space
                            .translate(address, false)
                            .map(|p| p.as_u64())
                            .unwrap_or(0);
                        drop(space);
                        let mut regs = thread.regs.lock();
                        regs.rax = address;
                        regs.rbx = phys;
                    }
                    None => {
                        drop(space);
                        let mut regs = thread.regs.lock();
                        regs.rax = OUT_OF_MEMORY;
                        regs.rbx = 0;
                    }
                }
            } else {
                let mut regs = thread.regs.lock();
                regs.rax = OUT_OF_MEMORY;
                regs.rbx = 0;
            }
        }
        Syscall::ReleaseMemoryPages => {
            process.address_space.lock().free_pages(saved.rax, saved.rbx);
        }
        Syscall::MapPhysicalMemory => {
            let result = if process.is_driver {
                process
                    .address_space
                    .lock()
                    .map_physical(crate::mm::PhysAddr::new(saved.rax), saved.rbx)
                    .unwrap_or(OUT_OF_MEMORY)
            } else {
                OUT_OF_MEMORY
            };
            thread.regs.lock().rax = result;
        }
        Syscall::GetPhysicalAddressOfVirtualAddress => {
            let result = if process.is_driver {
                process
                    .address_space
                    .lock()
                    .translate(saved.rax, false)
                    .map(|p| p.as_u64())
                    .unwrap_or(OUT_OF_MEMORY)
            } else {
                0
            };
            thread.regs.lock().rax = result;
        }
        Syscall::GetFreeSystemMemory => {
            thread.regs.lock().rax = (frame_allocator::free_page_count() * PAGE_SIZE) as u64;
        }
        Syscall::GetMemoryUsedByProcess => {
            thread.regs.lock().rax =
                (process.address_space.lock().allocated_pages() * PAGE_SIZE) as u64;
        }
        Syscall::GetTotalSystemMemory => {
            thread.regs.lock().rax = frame_allocator::total_system_memory();
        }
        Syscall::SetMemoryAccessRights => {
            let rights = MemoryRights::from_bits_truncate(saved.rdx);
            let mut space = process.address_space.lock();
            for page in 0..saved.rbx {
                space.set_access_rights(saved.rax + page * PAGE_SIZE as u64, rights);
            }
        }

        Syscall::CreateSharedMemory => {
            let flags = SharedMemoryFlags::from_bits_truncate(saved.rbx);
            let created =
                shared_memory::create_and_map(&process, saved.rax as usize, flags, saved.rdx);
            let mut regs = thread.regs.lock();
            match created {
                Some((region, address)) => {
                    regs.rax = region.id;
                    regs.rbx = address;
                }
                None => {
                    regs.rax = 0;
                    regs.rbx = 0;
                }
            }
        }
        Syscall::JoinSharedMemory => {
            let joined = shared_memory::join(&process, saved.rax);
            let mut regs = thread.regs.lock();
            match joined {
                Some((region, address)) => {
                    regs.rax = region.size_in_pages() as u64;
                    regs.rbx = address;
                    regs.rdx = region.flags.bits();
                }
                None => {
                    regs.rax = 0;
                    regs.rbx = 0;
                    regs.rdx = 0;
                }
            }
        }
        Syscall::JoinChildProcessInSharedMemory => {
            let result = process::process_from_pid(ProcessId(saved.rax))
                .map(|child| shared_memory::join_child_at(&process, &child, saved.rbx, saved.rdx))
                .unwrap_or(false);
            thread.regs.lock().rax = result as u64;
        }
        Syscall::LeaveSharedMemory => {
            shared_memory::leave(&process, saved.rax);
        }
        Syscall::GetSharedMemoryDetails => {
            let (flags, size) = shared_memory::details_for_process(&process, saved.rax);
            let mut regs = thread.regs.lock();
            regs.rax = flags;
            regs.rbx = size;
        }
        Syscall::MovePageIntoSharedMemory => {
            shared_memory::move_page_into(&process, saved.rax, saved.rbx, saved.rdx);
        }
        Syscall::GrantPermissionToAllocateIntoSharedMemory => {
            shared_memory::grant_assign_permission(&process, saved.rax, saved.rbx);
        }
        Syscall::IsSharedMemoryPageAllocated => {
            thread.regs.lock().rax =
                shared_memory::is_page_allocated(saved.rax, saved.rbx) as u64;
        }
        Syscall::GetSharedMemoryPagePhysicalAddress => {
            let result = if process.is_driver {
                shared_memory::page_physical_address(saved.rax, saved.rbx)
                    .map(|p| p.as_u64())
                    .unwrap_or(OUT_OF_MEMORY)
            } else {
                OUT_OF_MEMORY
            };
            thread.regs.lock().rax = result;
        }
        Syscall::GrowSharedMemory => {
            let grown = shared_memory::grow(&process, saved.rax, saved.rbx as usize);
            let mut regs = thread.regs.lock();
            match grown {
                Some((size, address)) => {
                    regs.rax = size as u64;
                    regs.rbx = address;
                }
                None => {
                    regs.rax = 0;
                    regs.rbx = 0;
                }
            }
        }

        Syscall::GetThisProcessId => {
            thread.regs.lock().rax = process.pid.0;
        }
        Syscall::TerminateThisProcess => {
            process::destroy_process(&process);
        }
        Syscall::TerminateProcess => {
            if let Some(target) = process::process_from_pid(ProcessId(saved.rax)) {
                process::destroy_process(&target);
            }
        }
        Syscall::GetProcesses => {
            let name = ProcessName::from_words(read_name_words(&saved));
            let found = process::pids_with_name(&name, ProcessId(saved.rbp));
            let mut pids = [0u64; 12];
            for (slot, pid) in pids.iter_mut().zip(found.iter()) {
                *slot = pid.0;
            }
            let mut regs = thread.regs.lock();
            regs.rdi = found.len() as u64;
            regs.rbp = pids[0];
            write_name_words(
                &mut regs,
                &[
                    pids[1], pids[2], pids[3], pids[4], pids[5], pids[6], pids[7], pids[8],
                    pids[9], pids[10], pids[11],
                ],
            );
        }
        Syscall::GetNameOfProcess => {
            let target = process::process_from_pid(ProcessId(saved.rax));
            let mut regs = thread.regs.lock();
            match target {
                Some(target) => {
                    regs.rdi = 1;
                    write_name_words(&mut regs, target.name.words());
                }
                None => regs.rdi = 0,
            }
        }
        Syscall::NotifyWhenProcessDisappears => {
            let target_pid = ProcessId(saved.rax);
            let event_id = saved.rbx;
            match process::process_from_pid(target_pid) {
                Some(target) => process::notify_on_death(&target, &process, event_id),
                None => {
                    // Possibly died a moment ago; the safe answer is an
                    // immediate notification.
                    ipc::send_kernel_message_to_process(
                        &process,
                        event_id,
                        target_pid.0,
                        0,
                        0,
                        0,
                        0,
                    );
                }
            }
        }
        Syscall::StopNotifyingWhenProcessDisappears => {
            process::stop_notifying_on_death(&process, saved.rax);
        }
        Syscall::CreateChildProcess => {
            let name = ProcessName::from_words(read_name_words(&saved));
            let created = process::create_child_process(&process, name, saved.rbp);
            thread.regs.lock().rax = match created {
                Ok(child) => child.pid.0,
                Err(_) => 0,
            };
        }
        Syscall::SetChildProcessMemoryPage => {
            if let Some(child) = process::process_from_pid(ProcessId(saved.rax)) {
                process::set_child_process_memory_page(&process, &child, saved.rbx, saved.rdx);
            }
        }
        Syscall::StartExecutingChildProcess => {
            if let Some(child) = process::process_from_pid(ProcessId(saved.rax)) {
                process::start_executing_child_process(&process, &child, saved.rbx, saved.rdx);
            }
        }
        Syscall::DestroyChildProcess => {
            if let Some(child) = process::process_from_pid(ProcessId(saved.rax)) {
                process::destroy_child_process(&process, &child);
            }
        }
        Syscall::GetMultibootModule => {
            let loaded = boot::load_next_module_into_process(&process);
            let mut regs = thread.regs.lock();
            match loaded {
                Some(module) => {
                    regs.rdi = module.address_and_flags;
                    regs.rbp = module.size;
                    write_name_words(&mut regs, module.name.words());
                }
                None => {
                    regs.rdi = 0;
                    regs.rbp = 0;
                }
            }
        }

        Syscall::RegisterService => {
            let name = ServiceName::from_words(read_service_name(&saved));
            let notifications = registry::with_directory(|directory| {
                directory.register(process.pid.0, saved.rbp, name)
            });
            registry::dispatch(notifications);
        }
        Syscall::UnregisterService => {
            let notifications = registry::with_directory(|directory| {
                directory.unregister(process.pid.0, saved.rax)
            });
            registry::dispatch(notifications);
        }
        Syscall::GetServices => {
            let name = ServiceName::from_words([
                saved.rbx, saved.rdx, saved.rsi, saved.r8, saved.r9, saved.r10, saved.r12,
                saved.r13, saved.r14, saved.r15,
            ]);
            let min_pid = saved.rbp;
            let min_mid = saved.rax;

            let mut count = 0u64;
            let mut pids = [0u64; 6];
            let mut mids = [0u64; 6];
            registry::with_directory(|directory| {
                for (pid, mid) in directory.matches_from(&name, min_pid, min_mid) {
                    if (count as usize) < 6 {
                        pids[count as usize] = pid;
                        mids[count as usize] = mid;
                    }
                    count += 1;
                }
            });

            let mut regs = thread.regs.lock();
            regs.rdi = count;
            regs.rbp = pids[0];
            regs.rax = mids[0];
            regs.rbx = pids[1];
            regs.rdx = mids[1];
            regs.rsi = pids[2];
            regs.r8 = mids[2];
            regs.r9 = pids[3];
            regs.r10 = mids[3];
            regs.r12 = pids[4];
            regs.r13 = mids[4];
            regs.r14 = pids[5];
            regs.r15 = mids[5];
        }
        Syscall::GetNameOfService => {
            let found = registry::with_directory(|directory| {
                directory.name_of(saved.rax, saved.rbx)
            });
            let mut regs = thread.regs.lock();
            match found {
                Some(name) => {
                    regs.rdi = 1;
                    write_service_name(&mut regs, name.words());
                }
                None => regs.rdi = 0,
            }
        }
        Syscall::NotifyWhenServiceAppears => {
            let name = ServiceName::from_words(read_service_name(&saved));
            let notifications = registry::with_directory(|directory| {
                directory.subscribe_appearance(process.pid.0, name, saved.rbp)
            });
            registry::dispatch(notifications);
        }
        Syscall::StopNotifyingWhenServiceAppears => {
            registry::with_directory(|directory| {
                directory.unsubscribe_appearance(process.pid.0, saved.rbp)
            });
        }
        Syscall::NotifyWhenServiceDisappears => {
            registry::with_directory(|directory| {
                directory.subscribe_disappearance(process.pid.0, saved.rax, saved.rbx, saved.rdx)
            });
        }
        Syscall::StopNotifyingWhenServiceDisappears => {
            registry::with_directory(|directory| {
                directory.unsubscribe_disappearance(process.pid.0, saved.rax)
            });
        }

        Syscall::SendMessage => {
            ipc::send_message_from_thread(&thread);
        }
        Syscall::PollForMessage => {
            ipc::load_next_message_into_thread(&thread);
        }
        Syscall::SleepForMessage => {
            // When the thread goes to sleep the unschedule path has
            // already rotated to the next context.
            let _went_to_sleep = ipc::sleep_thread_until_message(&thread);
        }
        Syscall::RegisterMessageToSendOnInterrupt => {
            interrupts::register_message_on_interrupt(
                saved.rax, &process, saved.rbx, saved.rdx, saved.rsi,
            );
        }
        Syscall::UnregisterMessageToSendOnInterrupt => {
            interrupts::unregister_message_on_interrupt(saved.rax, &process, saved.rbx);
        }

        Syscall::GetMultibootFramebufferInformation => {
            let details = boot::framebuffer_details();
            let mut regs = thread.regs.lock();
            match details {
                Some((address, width, height, pitch, bpp)) => {
                    regs.rax = address;
                    regs.rbx = width;
                    regs.rdx = height;
                    regs.rsi = pitch;
                    regs.r8 = bpp;
                }
                None => regs.rax = 0,
            }
        }
        Syscall::SendMessageAfterXMicroseconds => {
            timer::send_message_at(
                process.pid,
                timer::current_timestamp_micros() + saved.rax,
                saved.rbx,
            );
        }
        Syscall::SendMessageAtTimestamp => {
            timer::send_message_at(process.pid, saved.rax, saved.rbx);
        }
        Syscall::GetCurrentTimestamp => {
            thread.regs.lock().rax = timer::current_timestamp_micros();
        }
        Syscall::EnableProfiling => {
            process.profiling_enabled.fetch_add(1, Ordering::Relaxed);
        }
        Syscall::DisableAndOutputProfiling => {
            let enabled = process.profiling_enabled.load(Ordering::Relaxed);
            if enabled > 0
                && process
                    .profiling_enabled
                    .fetch_sub(1, Ordering::Relaxed)
                    == 1
            {
                crate::println!(
                    "profile of {} ({}): {} cycles while profiled",
                    process.name,
                    process.pid,
                    process.profiled_cycles.swap(0, Ordering::Relaxed)
                );
            }
        }
    }
}
