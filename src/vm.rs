// Copyright (c) 2024 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{debug, warn};
use spin::Mutex;

use crate::arch::ArchVcpu;
use crate::cpu::IdleCpuPool;
use crate::hal::{SchedClass, VcpuHal};
use crate::vcpu::{Error, HaltedVcpu, Result, Vcpu};

/// Maximum number of vCPUs per VM.
pub const VM_VCPUS_MAX: usize = 8;

/// Identifies a VM within the hypervisor.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq, Ord)]
pub struct VmId(u32);

impl VmId {
    /// Creates a `VmId` from the raw value.
    pub fn new(raw: u32) -> Self {
        VmId(raw)
    }

    /// Returns the raw value of the VM ID.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// A guest VM as this core sees it: the owner of a set of vCPUs, an OS-type
/// hint that picks the scheduling tier, the protected vCPU-id counter, and
/// the aggregate halt flag the run loops poll.
///
/// Created by the VM manager and handed in as `Arc<Vm>`; the manager tears
/// it down only after every owned vCPU has been halted and destroyed.
pub struct Vm {
    id: VmId,
    is_rtos: bool,
    // The one field in this core guarded by its own explicit lock.
    next_vcpu_id: Mutex<u32>,
    vcpus: Mutex<ArrayVec<u32, VM_VCPUS_MAX>>,
    halt_requested: AtomicBool,
}

impl Vm {
    pub fn new(id: VmId, is_rtos: bool) -> Self {
        Self {
            id,
            is_rtos,
            next_vcpu_id: Mutex::new(0),
            vcpus: Mutex::new(ArrayVec::new()),
            halt_requested: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    /// True if the guest runs a real-time OS.
    pub fn is_rtos(&self) -> bool {
        self.is_rtos
    }

    /// Scheduling tier for this VM's backing threads.
    pub fn sched_class(&self) -> SchedClass {
        if self.is_rtos {
            SchedClass::Rtos
        } else {
            SchedClass::General
        }
    }

    /// Number of vCPUs currently owned by this VM.
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.lock().len()
    }

    /// Asks every vCPU run loop to wind down.
    pub fn signal_halt(&self) {
        self.halt_requested.store(true, Ordering::Release);
    }

    /// Polled by the run loops between guest slices.
    pub fn is_halting(&self) -> bool {
        self.halt_requested.load(Ordering::Acquire)
    }

    fn alloc_vcpu_id(&self) -> u32 {
        let mut next = self.next_vcpu_id.lock();
        let id = *next;
        *next += 1;
        id
    }

    fn register_vcpu(&self, vcpu_id: u32) -> Result<()> {
        self.vcpus
            .lock()
            .try_push(vcpu_id)
            .map_err(|_| Error::TooManyVcpus)
    }

    fn unregister_vcpu(&self, vcpu_id: u32) {
        let mut vcpus = self.vcpus.lock();
        if let Some(pos) = vcpus.iter().position(|&id| id == vcpu_id) {
            vcpus.remove(pos);
        }
    }
}

/// Allocates and tears down vCPUs. Owns the idle-core pool; everything else
/// a vCPU needs comes from the HAL and the architecture backend.
pub struct VcpuManager {
    idle_cpus: IdleCpuPool,
}

impl VcpuManager {
    pub fn new(idle_cpus: IdleCpuPool) -> Self {
        Self { idle_cpus }
    }

    /// The pool of physical cores not currently backing a vCPU.
    pub fn idle_cpus(&self) -> &IdleCpuPool {
        &self.idle_cpus
    }

    /// Creates one vCPU for `vm`: draws a physical core from the idle pool,
    /// spawns the suspended backing thread at the VM's scheduling tier,
    /// initializes the architectural state and the (sentineled) virtual-IRQ
    /// table, and registers the vCPU with its VM.
    ///
    /// Any failure unwinds every allocation made so far; a partially
    /// constructed vCPU never escapes. The returned vCPU is in its initial
    /// state and becomes schedulable only through an explicit ready request.
    pub fn create_vcpu<A: ArchVcpu, H: VcpuHal>(
        &self,
        hal: &H,
        vm: &Arc<Vm>,
        index: u32,
        name: &str,
        config: A::Config,
    ) -> Result<Vcpu<A, H>> {
        let cpu = self.idle_cpus.take().ok_or(Error::ResourceExhausted)?;

        let thread = match hal.spawn_thread(name, vm.sched_class(), cpu) {
            Some(thread) => thread,
            None => {
                self.idle_cpus.release(cpu);
                return Err(Error::ResourceExhausted);
            }
        };

        let id = vm.alloc_vcpu_id();
        if id != index {
            warn!(
                "vm {}: vcpu '{}' created at index {} but assigned id {}",
                vm.id().raw(),
                name,
                index,
                id
            );
        }

        let arch = match A::new(vm.id(), id, config) {
            Ok(arch) => arch,
            Err(e) => {
                hal.free_thread(thread);
                self.idle_cpus.release(cpu);
                return Err(Error::Arch(e));
            }
        };

        if let Err(e) = vm.register_vcpu(id) {
            hal.free_thread(thread);
            self.idle_cpus.release(cpu);
            return Err(e);
        }

        debug!(
            "vm {}: created vcpu {} '{}' on cpu {}",
            vm.id().raw(),
            id,
            name,
            cpu.raw()
        );
        Ok(Vcpu::new(hal, vm.clone(), id, name, cpu, thread, arch))
    }

    /// Tears one vCPU down: deinitializes the architectural state, frees the
    /// backing thread, returns the physical core to the idle pool and drops
    /// the VM registration. Only reachable with the token the state machine
    /// hands out once the vCPU is halted and its thread has exited.
    pub fn destroy_vcpu<A: ArchVcpu, H: VcpuHal>(
        &self,
        hal: &H,
        vcpu: HaltedVcpu<A, H>,
    ) -> Result<()> {
        let (vm, id, cpu, thread, mut arch) = vcpu.into_parts();
        let result = arch.deinit().map_err(Error::Arch);
        hal.free_thread(thread);
        self.idle_cpus.release(cpu);
        vm.unregister_vcpu(id);
        debug!("vm {}: destroyed vcpu {}", vm.id().raw(), id);
        result
    }
}
