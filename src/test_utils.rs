// Copyright (c) 2024 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Mock collaborators shared by the per-module tests. Every host and
//! architecture call is recorded in one ordered log so tests can assert
//! both counts and sequencing.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use crate::arch::{ArchError, ArchResult, ArchVcpu};
use crate::cpu::{CpuId, IdleCpuPool};
use crate::hal::{SchedClass, VcpuHal};
use crate::smp::CpuMask;
use crate::vcpu::Vcpu;
use crate::vm::{VcpuManager, Vm, VmId};

pub(crate) const MAX_TEST_CPUS: usize = 16;

pub(crate) type TestVcpu = Vcpu<MockArch, MockHal>;

pub(crate) struct MockHal {
    log: Rc<RefCell<Vec<String>>>,
    cycles: Cell<u64>,
    next_thread: Cell<u32>,
    pub(crate) fail_spawn: Cell<bool>,
    pub(crate) fail_arch_new: Rc<Cell<bool>>,
    pub(crate) fail_arch_reset: Rc<Cell<bool>>,
    pub(crate) fail_arch_run: Rc<Cell<bool>>,
}

impl MockHal {
    pub(crate) fn new() -> Self {
        Self {
            log: Rc::new(RefCell::new(Vec::new())),
            cycles: Cell::new(0),
            next_thread: Cell::new(0),
            fail_spawn: Cell::new(false),
            fail_arch_new: Rc::new(Cell::new(false)),
            fail_arch_reset: Rc::new(Cell::new(false)),
            fail_arch_run: Rc::new(Cell::new(false)),
        }
    }

    fn record(&self, call: &str) {
        self.log.borrow_mut().push(call.into());
    }

    /// Current log position, for slicing out the calls an operation makes.
    pub(crate) fn mark(&self) -> usize {
        self.log.borrow().len()
    }

    pub(crate) fn log_from(&self, mark: usize) -> Vec<String> {
        self.log.borrow()[mark..].to_vec()
    }

    pub(crate) fn calls_of(&self, tag: &str) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|call| call.as_str() == tag || call.starts_with(&format!("{tag}:")))
            .count()
    }

    pub(crate) fn arch_config(&self) -> ArchConfig {
        ArchConfig {
            log: self.log.clone(),
            fail_new: self.fail_arch_new.clone(),
            fail_reset: self.fail_arch_reset.clone(),
            fail_run: self.fail_arch_run.clone(),
        }
    }
}

impl VcpuHal for MockHal {
    type Thread = u32;

    fn spawn_thread(&self, name: &str, _class: SchedClass, _cpu: CpuId) -> Option<u32> {
        if self.fail_spawn.get() {
            return None;
        }
        self.record(&format!("spawn:{name}"));
        let id = self.next_thread.get();
        self.next_thread.set(id + 1);
        Some(id)
    }

    fn free_thread(&self, _thread: u32) {
        self.record("free");
    }

    fn start_thread(&self, _thread: &u32) {
        self.record("start");
    }

    fn wake_thread(&self, _thread: &u32) {
        self.record("wake");
    }

    fn suspend_thread(&self, _thread: &u32) {
        self.record("suspend");
    }

    fn requeue_thread(&self, _thread: &u32) {
        self.record("requeue");
    }

    fn retire_thread(&self, _thread: &u32) {
        self.record("retire");
    }

    fn ipi_reschedule(&self, _mask: CpuMask) {
        self.record("ipi");
    }

    fn quiesce_vtimers(&self, _vm: VmId, _vcpu: u32) {
        self.record("quiesce");
    }

    fn vdev_pause(&self, _vm: VmId, _vcpu: u32) {
        self.record("vdev_pause");
    }

    fn vm_delete(&self, _vm: VmId) {
        self.record("vm_delete");
    }

    // Advances on every read so any two marks are a nonzero span apart.
    // Deliberately unlogged; accounting reads would drown the call log.
    fn cycle_count(&self) -> u64 {
        let now = self.cycles.get() + 100;
        self.cycles.set(now);
        now
    }
}

pub(crate) struct ArchConfig {
    log: Rc<RefCell<Vec<String>>>,
    fail_new: Rc<Cell<bool>>,
    fail_reset: Rc<Cell<bool>>,
    fail_run: Rc<Cell<bool>>,
}

pub(crate) struct MockArch {
    log: Rc<RefCell<Vec<String>>>,
    fail_reset: Rc<Cell<bool>>,
    fail_run: Rc<Cell<bool>>,
}

impl MockArch {
    fn record(&self, call: &str) {
        self.log.borrow_mut().push(call.into());
    }
}

impl ArchVcpu for MockArch {
    type Config = ArchConfig;

    fn new(_vm: VmId, _vcpu_id: u32, config: ArchConfig) -> ArchResult<Self> {
        config.log.borrow_mut().push("arch_new".into());
        if config.fail_new.get() {
            return Err(ArchError(-12));
        }
        Ok(Self {
            log: config.log,
            fail_reset: config.fail_reset,
            fail_run: config.fail_run,
        })
    }

    fn reset(&mut self) -> ArchResult<()> {
        self.record("arch_reset");
        if self.fail_reset.get() {
            return Err(ArchError(-5));
        }
        Ok(())
    }

    fn deinit(&mut self) -> ArchResult<()> {
        self.record("arch_deinit");
        Ok(())
    }

    fn save_context(&mut self) {
        self.record("save");
    }

    fn load_context(&mut self) {
        self.record("load");
    }

    fn run(&mut self) -> ArchResult<()> {
        self.record("run");
        if self.fail_run.get() {
            return Err(ArchError(-14));
        }
        Ok(())
    }
}

pub(crate) fn new_vm(id: u32, is_rtos: bool) -> Arc<Vm> {
    Arc::new(Vm::new(VmId::new(id), is_rtos))
}

pub(crate) fn manager(num_cpus: usize) -> VcpuManager {
    VcpuManager::new(IdleCpuPool::new(num_cpus))
}

pub(crate) fn create_vcpu(mgr: &VcpuManager, hal: &MockHal, vm: &Arc<Vm>, name: &str) -> TestVcpu {
    mgr.create_vcpu(hal, vm, vm.vcpu_count() as u32, name, hal.arch_config())
        .unwrap()
}
