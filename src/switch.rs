// Copyright (c) 2024 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The thread-swap hook. The host scheduler registers [`context_switch`]
//! once, globally, and invokes it around every thread swap in the system;
//! swaps that involve no vCPU thread take the early exit. Runs in scheduler
//! context: nothing here blocks or allocates.

#[cfg(feature = "smp")]
use log::warn;

use crate::arch::ArchVcpu;
use crate::hal::VcpuHal;
#[cfg(feature = "smp")]
use crate::vcpu::VcpuState;
use crate::vcpu::Vcpu;

/// Called for every thread swap with the vCPUs (if any) bound to the
/// outgoing and incoming threads. The host resolves thread → vCPU; passing
/// two `None`s is the common non-vCPU case and costs two branches.
pub fn context_switch<A: ArchVcpu, H: VcpuHal>(
    hal: &H,
    outgoing: Option<&Vcpu<A, H>>,
    incoming: Option<&Vcpu<A, H>>,
) {
    if let Some(vcpu) = outgoing {
        thread_swap_out(hal, vcpu);
    }
    if let Some(vcpu) = incoming {
        thread_swap_in(hal, vcpu);
    }
}

/// Outgoing half: the backing thread is leaving its core. The architectural
/// context is saved unconditionally; what happens next depends on the
/// logical state the state machine established before the scheduler got
/// here.
pub fn thread_swap_out<A: ArchVcpu, H: VcpuHal>(hal: &H, vcpu: &Vcpu<A, H>) {
    vcpu.arch_mut().save_context();

    #[cfg(feature = "smp")]
    match vcpu.state() {
        // An ordinary end of timeslice: back to the runnable set.
        VcpuState::Running => vcpu.demote_to_ready(hal),
        // Reset is applied in place, not on swap-out.
        VcpuState::Reset => {}
        // The transition already dequeued the thread; this core is the one
        // that finally stops executing it, so the guest-facing side winds
        // down here.
        VcpuState::Paused | VcpuState::Halted => {
            vcpu.charge_cycles(hal, vcpu.state());
            hal.quiesce_vtimers(vcpu.vm().id(), vcpu.id());
            hal.vdev_pause(vcpu.vm().id(), vcpu.id());
        }
        state => warn!(
            "vcpu {}: swapped out while {:?}",
            vcpu.name(),
            state
        ),
    }

    #[cfg(not(feature = "smp"))]
    let _ = hal;
}

/// Incoming half: the backing thread is entering a core. Loads the
/// architectural context and records the dispatch.
pub fn thread_swap_in<A: ArchVcpu, H: VcpuHal>(hal: &H, vcpu: &Vcpu<A, H>) {
    vcpu.arch_mut().load_context();

    // On a single core every scheduling decision was made synchronously
    // right here, so there is no logical state to reconcile.
    #[cfg(feature = "smp")]
    vcpu.promote_to_running(hal);

    #[cfg(not(feature = "smp"))]
    let _ = hal;
}
