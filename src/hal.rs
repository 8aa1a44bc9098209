// Copyright (c) 2024 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use crate::cpu::CpuId;
use crate::smp::CpuMask;
use crate::vm::VmId;

/// Scheduling priority tier for a vCPU's backing thread. Chosen once at
/// creation from the owning VM's OS-type hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedClass {
    /// The guest runs a real-time OS; its threads get the higher tier.
    Rtos,
    /// General-purpose guest.
    General,
}

/// The host-kernel services this core consumes.
///
/// Implemented by the surrounding hypervisor over the host scheduler, the
/// virtual-timer subsystem and the virtual-device layer. All methods take
/// `&self`; the implementation is shared across cores.
pub trait VcpuHal {
    /// Handle to a host kernel thread. The thread's control block and stack
    /// are owned through this handle and released by
    /// [`free_thread`](Self::free_thread).
    type Thread;

    /// Creates a thread pinned to `cpu` in the suspended, not-yet-started
    /// state. The host wires its entry to [`Vcpu::run_loop`](crate::Vcpu::run_loop).
    /// Returns `None` when thread or stack allocation fails.
    fn spawn_thread(&self, name: &str, class: SchedClass, cpu: CpuId) -> Option<Self::Thread>;

    /// Releases `thread`'s control block and stack. The thread must no
    /// longer be runnable.
    fn free_thread(&self, thread: Self::Thread);

    /// Makes a never-started thread runnable for the first time.
    fn start_thread(&self, thread: &Self::Thread);

    /// Wakes a suspended thread.
    fn wake_thread(&self, thread: &Self::Thread);

    /// Removes a thread from its core's ready queue. The thread keeps
    /// running until the core holding it switches away.
    fn suspend_thread(&self, thread: &Self::Thread);

    /// Moves a runnable thread to the back of its priority queue.
    fn requeue_thread(&self, thread: &Self::Thread);

    /// Marks a thread permanently non-switchable. Sticky: honored by the
    /// scheduler across any later wake attempt.
    fn retire_thread(&self, thread: &Self::Thread);

    /// Sends the reschedule IPI to the cores in `mask`.
    fn ipi_reschedule(&self, mask: CpuMask);

    /// Stops the virtual timers backing the given vCPU's timer context.
    fn quiesce_vtimers(&self, vm: VmId, vcpu: u32);

    /// Tells the virtual-device layer that the given vCPU is no longer
    /// executing.
    fn vdev_pause(&self, vm: VmId, vcpu: u32);

    /// VM-wide teardown. Invoked only when a halt request arrives for a vCPU
    /// that never became schedulable.
    fn vm_delete(&self, vm: VmId);

    /// Free-running cycle counter, sampled at transition boundaries for the
    /// per-vCPU accounting counters.
    fn cycle_count(&self) -> u64;
}
