// Copyright (c) 2024 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use arrayvec::ArrayString;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{debug, trace, warn};
use spin::{Mutex, Once, RwLock};

use crate::arch::{ArchError, ArchVcpu};
use crate::cpu::CpuId;
use crate::hal::VcpuHal;
use crate::smp::{broadcast_reschedule, CpuMask};
use crate::vcpu_irq::VirtIrqBlock;
use crate::vm::Vm;

/// Maximum length of a vCPU debug name.
pub const VCPU_NAME_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The guard table rejected the request. Recoverable; the caller decides
    /// whether this is fatal.
    InvalidTransition { from: VcpuState, to: VcpuState },
    /// Thread or physical-core allocation failed during creation.
    ResourceExhausted,
    /// The architecture backend failed. Fatal to this vCPU only.
    Arch(ArchError),
    /// The vCPU has not reached `Halted`.
    NotHalted,
    /// The backing thread has not left its run loop.
    StillRunning,
    /// The owning VM's vCPU registry is full.
    TooManyVcpus,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Lifecycle state of a vCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuState {
    /// Initial state; also where a vCPU lands when its VM is torn down.
    Unknown,
    /// Runnable, not on a core.
    Ready,
    /// On a core, executing guest code. Entered only by the context-switch
    /// hook when the host scheduler actually dispatches the backing thread.
    Running,
    /// Forced re-initialization pending.
    Reset,
    /// Suspended, resumable.
    Paused,
    /// Terminal; irrecoverable without VM teardown.
    Halted,
}

// The backing thread and its started-once marker.
struct ThreadBinding<T> {
    thread: T,
    started: AtomicBool,
}

impl<T> ThreadBinding<T> {
    fn new(thread: T) -> Self {
        Self {
            thread,
            started: AtomicBool::new(false),
        }
    }

    fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct CycleStats {
    last_mark: u64,
    host: u64,
    running: u64,
    paused: u64,
}

impl CycleStats {
    // Charges the cycles since the previous mark to the bucket matching the
    // state the vCPU is leaving.
    fn charge(&mut self, now: u64, left: VcpuState) {
        let delta = now.wrapping_sub(self.last_mark);
        match left {
            VcpuState::Running => self.running += delta,
            VcpuState::Paused => self.paused += delta,
            _ => self.host += delta,
        }
        self.last_mark = now;
    }
}

/// Accumulated cycle counts for one vCPU. Monotonic; reset only when the
/// vCPU is re-created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleSnapshot {
    pub host: u64,
    pub running: u64,
    pub paused: u64,
}

/// One virtual CPU: a lifecycle state machine wrapped around a host kernel
/// thread that executes guest slices.
///
/// Locking: `state` is written only by the transition paths in this module
/// (the public [`transition`](Self::transition) entry point and the
/// context-switch bookkeeping) and read everywhere else. There is no lock
/// around the vCPU as a whole; a vCPU's backing thread is resident on at
/// most one core at a time, and that host-scheduler guarantee is what orders
/// the mutations.
pub struct Vcpu<A: ArchVcpu, H: VcpuHal> {
    id: u32,
    name: ArrayString<VCPU_NAME_LEN>,
    vm: Arc<Vm>,
    // Write-once at creation; never reassigned (no migration).
    physical_cpu: CpuId,
    state: RwLock<VcpuState>,
    // Set when a resume request arrives while already Running somewhere;
    // consumed by that core's own pause-check path, never by the requester.
    resume_signal: AtomicBool,
    cycles: Mutex<CycleStats>,
    irq_block: VirtIrqBlock,
    binding: ThreadBinding<H::Thread>,
    exited: Once<()>,
    // Touched only from the core the backing thread resides on (run loop and
    // context-switch hook), which is what makes the unsynchronized cell
    // sound. See also the discussion on `state` above.
    arch: UnsafeCell<A>,
}

// Shared across cores for remote transition requests; the architectural
// context stays core-local per the single-residency guarantee.
unsafe impl<A, H> Sync for Vcpu<A, H>
where
    A: ArchVcpu + Send,
    H: VcpuHal,
    H::Thread: Send + Sync,
{
}

unsafe impl<A, H> Send for Vcpu<A, H>
where
    A: ArchVcpu + Send,
    H: VcpuHal,
    H::Thread: Send,
{
}

impl<A: ArchVcpu, H: VcpuHal> core::fmt::Debug for Vcpu<A, H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("physical_cpu", &self.physical_cpu)
            .finish_non_exhaustive()
    }
}

impl<A: ArchVcpu, H: VcpuHal> Vcpu<A, H> {
    pub(crate) fn new(
        hal: &H,
        vm: Arc<Vm>,
        id: u32,
        name: &str,
        physical_cpu: CpuId,
        thread: H::Thread,
        arch: A,
    ) -> Self {
        let stats = CycleStats {
            last_mark: hal.cycle_count(),
            ..CycleStats::default()
        };
        let mut name_buf = ArrayString::new();
        for c in name.chars() {
            if name_buf.try_push(c).is_err() {
                break;
            }
        }
        Self {
            id,
            name: name_buf,
            physical_cpu,
            state: RwLock::new(VcpuState::Unknown),
            resume_signal: AtomicBool::new(false),
            cycles: Mutex::new(stats),
            irq_block: VirtIrqBlock::new(id, vm.id()),
            binding: ThreadBinding::new(thread),
            exited: Once::new(),
            arch: UnsafeCell::new(arch),
            vm,
        }
    }

    /// This vCPU's id, unique within its VM.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning VM.
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// The physical core the backing thread is pinned to.
    pub fn physical_cpu(&self) -> CpuId {
        self.physical_cpu
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VcpuState {
        *self.state.read()
    }

    /// True while a resume raced ahead of the running core's pause check.
    pub fn resume_pending(&self) -> bool {
        self.resume_signal.load(Ordering::Acquire)
    }

    /// The local virtual-interrupt bookkeeping.
    pub fn irq_block(&self) -> &VirtIrqBlock {
        &self.irq_block
    }

    /// True while the guest sits in wait-for-interrupt.
    pub fn waiting_for_interrupt(&self) -> bool {
        self.irq_block.in_wait()
    }

    /// The backing thread handle.
    pub fn thread(&self) -> &H::Thread {
        &self.binding.thread
    }

    /// Accumulated cycle accounting.
    pub fn cycles(&self) -> CycleSnapshot {
        let stats = self.cycles.lock();
        CycleSnapshot {
            host: stats.host,
            running: stats.running,
            paused: stats.paused,
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn arch_mut(&self) -> &mut A {
        // Sound per the single-residency rule documented on `arch`.
        unsafe { &mut *self.arch.get() }
    }

    pub(crate) fn charge_cycles(&self, hal: &H, left: VcpuState) {
        self.cycles.lock().charge(hal.cycle_count(), left);
    }

    /// Single entry point for lifecycle state changes. Requesting the
    /// current state is a no-op success. A rejected request leaves the state
    /// untouched and returns [`Error::InvalidTransition`]; an accepted one
    /// applies the full action sequence before the new state becomes
    /// visible, so there is no guest-observable intermediate.
    pub fn transition(&self, hal: &H, target: VcpuState) -> Result<()> {
        let mut state = self.state.write();
        let current = *state;
        if current == target {
            return Ok(());
        }
        trace!("vcpu {}: {:?} -> {:?}", self.name, current, target);
        match target {
            VcpuState::Ready => self.to_ready(hal, &mut state),
            VcpuState::Running => {
                // Running is an observed consequence of the host scheduler
                // dispatching the thread; requesting it directly changes
                // nothing.
                warn!(
                    "vcpu {}: explicit Running request ignored while {:?}",
                    self.name, current
                );
                Ok(())
            }
            VcpuState::Reset => self.to_reset(hal, &mut state),
            VcpuState::Paused => self.to_paused(hal, &mut state),
            VcpuState::Halted => self.to_halted(hal, &mut state),
            VcpuState::Unknown => Err(Error::InvalidTransition {
                from: current,
                to: target,
            }),
        }
    }

    /// Makes the vCPU schedulable. See [`transition`](Self::transition).
    pub fn ready(&self, hal: &H) -> Result<()> {
        self.transition(hal, VcpuState::Ready)
    }

    /// Suspends the vCPU. See [`transition`](Self::transition).
    pub fn pause(&self, hal: &H) -> Result<()> {
        self.transition(hal, VcpuState::Paused)
    }

    /// Forces re-initialization. See [`transition`](Self::transition).
    pub fn reset(&self, hal: &H) -> Result<()> {
        self.transition(hal, VcpuState::Reset)
    }

    /// Retires the vCPU for good. See [`transition`](Self::transition).
    pub fn halt(&self, hal: &H) -> Result<()> {
        self.transition(hal, VcpuState::Halted)
    }

    fn to_ready(&self, hal: &H, state: &mut VcpuState) -> Result<()> {
        match *state {
            VcpuState::Unknown => {
                if !self.binding.has_started() {
                    hal.start_thread(&self.binding.thread);
                    self.binding.mark_started();
                }
                *state = VcpuState::Ready;
                Ok(())
            }
            VcpuState::Running => {
                // Already on a core somewhere. The running core observes the
                // signal on its own pause check; mutating its queues from
                // here would race it.
                self.resume_signal.store(true, Ordering::Release);
                Ok(())
            }
            VcpuState::Reset | VcpuState::Paused => {
                self.charge_cycles(hal, *state);
                hal.wake_thread(&self.binding.thread);
                *state = VcpuState::Ready;
                Ok(())
            }
            from => Err(Error::InvalidTransition {
                from,
                to: VcpuState::Ready,
            }),
        }
    }

    fn to_reset(&self, hal: &H, state: &mut VcpuState) -> Result<()> {
        match *state {
            VcpuState::Ready => {
                // Requeue alone can leave the thread stale in a remote run
                // queue; the broadcast forces every core to re-pick.
                hal.requeue_thread(&self.binding.thread);
                broadcast_reschedule(hal, CpuMask::all());
            }
            VcpuState::Running | VcpuState::Paused => {
                // Reset in place, not on swap: the thread keeps its queue
                // position and the backend rebuilds the context under it.
                self.arch_mut().reset().map_err(Error::Arch)?;
            }
            from => {
                return Err(Error::InvalidTransition {
                    from,
                    to: VcpuState::Reset,
                })
            }
        }
        self.resume_signal.store(false, Ordering::Release);
        self.charge_cycles(hal, *state);
        *state = VcpuState::Reset;
        Ok(())
    }

    fn to_paused(&self, hal: &H, state: &mut VcpuState) -> Result<()> {
        match *state {
            VcpuState::Ready | VcpuState::Running => {
                let resumed_meanwhile = self.resume_signal.swap(false, Ordering::AcqRel);
                if resumed_meanwhile && self.waiting_for_interrupt() {
                    // The racing resume re-armed the guest's timers while it
                    // was parked in WFI; they must stop before the thread
                    // leaves the runnable set.
                    hal.quiesce_vtimers(self.vm.id(), self.id);
                }
                self.charge_cycles(hal, *state);
                hal.suspend_thread(&self.binding.thread);
                // The core currently holding the thread has to notice the
                // dequeue.
                broadcast_reschedule(hal, CpuMask::all());
                *state = VcpuState::Paused;
                debug!("vcpu {}: paused", self.name);
                Ok(())
            }
            from => Err(Error::InvalidTransition {
                from,
                to: VcpuState::Paused,
            }),
        }
    }

    fn to_halted(&self, hal: &H, state: &mut VcpuState) -> Result<()> {
        match *state {
            VcpuState::Ready | VcpuState::Running | VcpuState::Paused => {
                hal.quiesce_vtimers(self.vm.id(), self.id);
                // Sticky: the scheduler must keep honoring this across any
                // later wake attempt.
                hal.retire_thread(&self.binding.thread);
                broadcast_reschedule(hal, CpuMask::all());
                self.charge_cycles(hal, *state);
                *state = VcpuState::Halted;
                debug!("vcpu {}: halted", self.name);
                Ok(())
            }
            VcpuState::Reset | VcpuState::Unknown => {
                // A halt request for a vCPU that never became schedulable
                // again means the VM is going away, not being suspended.
                *state = VcpuState::Unknown;
                hal.vm_delete(self.vm.id());
                Ok(())
            }
            // Halted == Halted was already handled as a no-op.
            VcpuState::Halted => unreachable!(),
        }
    }

    // Context-switch bookkeeping: the outgoing half. Only an actually
    // Running vCPU falls back to Ready; Paused/Reset/Halted keep the state
    // their transition established.
    pub(crate) fn demote_to_ready(&self, hal: &H) {
        let mut state = self.state.write();
        if *state == VcpuState::Running {
            self.charge_cycles(hal, VcpuState::Running);
            *state = VcpuState::Ready;
        }
    }

    // Context-switch bookkeeping: the incoming half.
    pub(crate) fn promote_to_running(&self, hal: &H) {
        let mut state = self.state.write();
        if *state != VcpuState::Ready {
            warn!(
                "vcpu {}: dispatched while {:?}, expected Ready",
                self.name, *state
            );
        }
        self.charge_cycles(hal, *state);
        *state = VcpuState::Running;
        self.resume_signal.store(false, Ordering::Release);
    }

    /// The body executed by the backing thread: runs guest slices until the
    /// owning VM signals halt (or the backend faults), then signals
    /// completion to anyone joining the shutdown.
    pub fn run_loop(&self) -> Result<()> {
        let result = loop {
            if self.vm.is_halting() {
                break Ok(());
            }
            if let Err(e) = self.arch_mut().run() {
                warn!("vcpu {}: guest slice faulted ({:?})", self.name, e);
                break Err(Error::Arch(e));
            }
        };
        self.exited.call_once(|| ());
        result
    }

    /// True once the backing thread has left its run loop.
    pub fn has_exited(&self) -> bool {
        self.exited.is_completed()
    }

    /// Blocks until the backing thread leaves its run loop.
    pub fn wait_exited(&self) {
        self.exited.wait();
    }

    /// Converts the vCPU into its teardown token. Succeeds only once the
    /// state machine has reached `Halted` and the backing thread has left
    /// its run loop; destruction any earlier is unrepresentable.
    pub fn into_halted(self) -> core::result::Result<HaltedVcpu<A, H>, (Self, Error)> {
        if self.state() != VcpuState::Halted {
            return Err((self, Error::NotHalted));
        }
        if self.binding.has_started() && !self.has_exited() {
            return Err((self, Error::StillRunning));
        }
        Ok(HaltedVcpu(self))
    }
}

/// Proof that a vCPU finished its lifecycle: the state machine reached
/// `Halted` and the backing thread exited. The only currency
/// [`VcpuManager::destroy_vcpu`](crate::VcpuManager::destroy_vcpu) accepts.
pub struct HaltedVcpu<A: ArchVcpu, H: VcpuHal>(pub(crate) Vcpu<A, H>);

impl<A: ArchVcpu, H: VcpuHal> HaltedVcpu<A, H> {
    /// The halted vCPU's id.
    pub fn id(&self) -> u32 {
        self.0.id
    }

    pub(crate) fn into_parts(self) -> (Arc<Vm>, u32, CpuId, H::Thread, A) {
        let vcpu = self.0;
        (
            vcpu.vm,
            vcpu.id,
            vcpu.physical_cpu,
            vcpu.binding.thread,
            vcpu.arch.into_inner(),
        )
    }
}
