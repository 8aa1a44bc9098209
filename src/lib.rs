// Copyright (c) 2024 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! vCPU lifecycle and scheduling core for an embedded hypervisor layered on a
//! real-time kernel's thread scheduler.
//!
//! Each guest VM exposes one or more vCPUs; each vCPU is backed by a host
//! kernel thread that alternately executes guest code and traps back into the
//! hypervisor. This crate drives a vCPU through its lifecycle state machine
//! (ready → running → paused/reset/halted), hooks every host context switch
//! to save/restore guest architectural state, keeps the per-vCPU
//! virtual-interrupt bookkeeping, and stays correct under SMP, where the
//! thread implementing a vCPU may have to re-evaluate a scheduling decision
//! on a different physical core than the one that issued the state change.
//!
//! Architecture-specific register transfer and the host kernel's thread and
//! IPI primitives are collaborators behind the [`ArchVcpu`] and [`VcpuHal`]
//! traits; their internals are out of scope here.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod arch;
mod cpu;
mod hal;
mod smp;
mod switch;
#[cfg(test)]
mod test_utils;
mod vcpu;
mod vcpu_irq;
mod vm;

pub use arch::{ArchError, ArchResult, ArchVcpu};
pub use cpu::{CpuId, IdleCpuPool, MAX_CPUS};
pub use hal::{SchedClass, VcpuHal};
pub use smp::{broadcast_reschedule, CpuMask};
pub use switch::{context_switch, thread_swap_in, thread_swap_out};
pub use vcpu::{
    CycleSnapshot, Error, HaltedVcpu, Result, Vcpu, VcpuState, VCPU_NAME_LEN,
};
pub use vcpu_irq::{
    Error as VirtIrqError, Result as VirtIrqResult, VirtIrqBlock, VirtIrqDesc, LOCAL_VIRQ_COUNT,
    VIRQ_INVALID,
};
pub use vm::{VcpuManager, Vm, VmId, VM_VCPUS_MAX};
