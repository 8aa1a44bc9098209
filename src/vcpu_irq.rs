// Copyright (c) 2024 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, MutexGuard};

use crate::vm::VmId;

/// Number of local (per-vCPU) virtual interrupt lines.
pub const LOCAL_VIRQ_COUNT: usize = 32;

/// Sentinel line number marking an unallocated descriptor slot.
pub const VIRQ_INVALID: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    BadVirqId(u32),
    AlreadyPending(u32),
    PendingListFull(u32),
    NotPending(u32),
    NotActive(u32),
}

pub type Result<T> = core::result::Result<T, Error>;

/// One candidate local virtual interrupt line and its routing metadata.
///
/// Slots are claimed and released by the virtual-IRQ-routing subsystem; this
/// core only guarantees the table exists and every slot carries the sentinel
/// identity before first use.
#[derive(Clone, Copy, Debug)]
pub struct VirtIrqDesc {
    /// Physical interrupt backing this line, or `VIRQ_INVALID`.
    pub pirq: u32,
    /// Virtual line number presented to the guest, or `VIRQ_INVALID`.
    pub virq: u32,
    /// Delivery priority.
    pub prio: u8,
    /// Line is raised by a virtual device rather than passed-through hardware.
    pub vdev_trigger: bool,
    /// Raw per-line flag bits, owned by the routing subsystem.
    pub flags: u32,
    /// Owning vCPU.
    pub vcpu_id: u32,
    /// Owning VM.
    pub vm_id: VmId,
}

impl VirtIrqDesc {
    fn unallocated(vcpu_id: u32, vm_id: VmId) -> Self {
        Self {
            pirq: VIRQ_INVALID,
            virq: VIRQ_INVALID,
            prio: 0,
            vdev_trigger: false,
            flags: 0,
            vcpu_id,
            vm_id,
        }
    }

    /// Returns true once the routing subsystem has claimed this slot.
    pub fn is_allocated(&self) -> bool {
        self.virq != VIRQ_INVALID
    }
}

struct IrqLists {
    pending: ArrayVec<u32, LOCAL_VIRQ_COUNT>,
    active: ArrayVec<u32, LOCAL_VIRQ_COUNT>,
}

/// Per-vCPU local virtual-interrupt bookkeeping: the fixed descriptor table
/// plus the pending/active line lists and the wait-for-interrupt flag the
/// routing subsystem synchronizes on.
///
/// Owned by exactly one [`Vcpu`](crate::Vcpu), never aliased. The lists have
/// their own lock so list traffic does not contend with descriptor updates.
pub struct VirtIrqBlock {
    descs: Mutex<[VirtIrqDesc; LOCAL_VIRQ_COUNT]>,
    lists: Mutex<IrqLists>,
    wfi: AtomicBool,
}

impl VirtIrqBlock {
    pub(crate) fn new(vcpu_id: u32, vm_id: VmId) -> Self {
        Self {
            descs: Mutex::new([VirtIrqDesc::unallocated(vcpu_id, vm_id); LOCAL_VIRQ_COUNT]),
            lists: Mutex::new(IrqLists {
                pending: ArrayVec::new(),
                active: ArrayVec::new(),
            }),
            wfi: AtomicBool::new(false),
        }
    }

    /// Locks and returns the descriptor table for the routing subsystem.
    pub fn descriptors(&self) -> MutexGuard<'_, [VirtIrqDesc; LOCAL_VIRQ_COUNT]> {
        self.descs.lock()
    }

    /// Queues `virq` for delivery.
    pub fn post(&self, virq: u32) -> Result<()> {
        if virq as usize >= LOCAL_VIRQ_COUNT {
            return Err(Error::BadVirqId(virq));
        }
        let mut lists = self.lists.lock();
        if lists.pending.contains(&virq) {
            return Err(Error::AlreadyPending(virq));
        }
        lists
            .pending
            .try_push(virq)
            .map_err(|_| Error::PendingListFull(virq))
    }

    /// Moves `virq` from pending to active as delivery begins.
    pub fn ack(&self, virq: u32) -> Result<()> {
        let mut lists = self.lists.lock();
        let pos = lists
            .pending
            .iter()
            .position(|&v| v == virq)
            .ok_or(Error::NotPending(virq))?;
        lists.pending.remove(pos);
        // The active list cannot overflow: both lists are bounded by the
        // line count and a line is never in both.
        lists.active.push(virq);
        Ok(())
    }

    /// Drops `virq` from the active list once the guest completes it.
    pub fn retire(&self, virq: u32) -> Result<()> {
        let mut lists = self.lists.lock();
        let pos = lists
            .active
            .iter()
            .position(|&v| v == virq)
            .ok_or(Error::NotActive(virq))?;
        lists.active.remove(pos);
        Ok(())
    }

    /// Returns true if any line is queued for delivery.
    pub fn has_pending(&self) -> bool {
        !self.lists.lock().pending.is_empty()
    }

    /// Marks the guest as parked on a wait-for-interrupt.
    pub fn enter_wait(&self) {
        self.wfi.store(true, Ordering::Release);
    }

    /// Clears the wait-for-interrupt mark.
    pub fn leave_wait(&self) {
        self.wfi.store(false, Ordering::Release);
    }

    /// Returns true while the guest sits in wait-for-interrupt.
    pub fn in_wait(&self) -> bool {
        self.wfi.load(Ordering::Acquire)
    }
}
