// Copyright (c) 2024 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use spin::Mutex;
use static_assertions::const_assert;

/// The maximum number of physical CPUs we can support.
pub const MAX_CPUS: usize = 64;

// Idle-pool and reschedule masks are single u64 bitmaps.
const_assert!(MAX_CPUS <= u64::BITS as usize);

/// Logical physical-CPU number. Assigned to a vCPU once at creation and
/// stable until the vCPU is destroyed.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq, Ord)]
pub struct CpuId(usize);

impl CpuId {
    /// Creates a `CpuId` from the raw index.
    pub fn new(raw: usize) -> Self {
        CpuId(raw)
    }

    /// Returns the raw value of the CPU ID.
    pub fn raw(&self) -> usize {
        self.0
    }
}

/// The pool of physical cores not currently backing a vCPU. Each vCPU draws
/// one core at creation and returns it at teardown.
///
/// Owned by the [`VcpuManager`](crate::VcpuManager) and passed by reference
/// where needed rather than living in file-scope static state.
pub struct IdleCpuPool {
    idle: Mutex<u64>,
    num_cpus: usize,
}

impl IdleCpuPool {
    /// Creates a pool with all of `num_cpus` cores idle.
    pub fn new(num_cpus: usize) -> Self {
        assert!(num_cpus > 0 && num_cpus <= MAX_CPUS);
        let all = if num_cpus == u64::BITS as usize {
            !0u64
        } else {
            (1u64 << num_cpus) - 1
        };
        Self {
            idle: Mutex::new(all),
            num_cpus,
        }
    }

    /// Total number of cores managed by the pool.
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Claims the lowest-numbered idle core, if any is left.
    pub fn take(&self) -> Option<CpuId> {
        let mut idle = self.idle.lock();
        if *idle == 0 {
            return None;
        }
        let bit = idle.trailing_zeros() as usize;
        *idle &= !(1u64 << bit);
        Some(CpuId::new(bit))
    }

    /// Returns `cpu` to the pool.
    pub fn release(&self, cpu: CpuId) {
        let mut idle = self.idle.lock();
        debug_assert_eq!(*idle & (1u64 << cpu.raw()), 0);
        *idle |= 1u64 << cpu.raw();
    }

    /// Number of cores currently idle.
    pub fn num_idle(&self) -> usize {
        self.idle.lock().count_ones() as usize
    }
}
