// Copyright (c) 2024 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use crate::vm::VmId;

/// Error reported by an architecture backend, carrying the backend's raw
/// error code. Fatal to the affected vCPU, not to the hypervisor; the
/// VM-level caller decides whether to halt the whole VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchError(pub i32);

pub type ArchResult<T> = core::result::Result<T, ArchError>;

/// Architecture-specific vCPU state and register transfer.
///
/// One instance backs each [`Vcpu`](crate::Vcpu) and is only ever touched by
/// the core its backing thread resides on: the context-switch hook calls
/// [`save_context`](Self::save_context)/[`load_context`](Self::load_context)
/// from scheduler context, and the backing thread itself loops on
/// [`run`](Self::run).
pub trait ArchVcpu: Sized {
    /// Backend-specific creation parameters (entry point, stage-2 root, …).
    type Config;

    /// Allocates and initializes the architectural state for one vCPU.
    ///
    /// Failure here rolls back the whole vCPU construction; no partially
    /// initialized vCPU is ever handed out.
    fn new(vm: VmId, vcpu_id: u32, config: Self::Config) -> ArchResult<Self>;

    /// Re-initializes the state in place, without reallocating. Used when a
    /// vCPU that has already run (or is paused) is forced through a reset.
    fn reset(&mut self) -> ArchResult<()>;

    /// Releases the architectural state. Called exactly once, at teardown.
    fn deinit(&mut self) -> ArchResult<()>;

    /// Saves the guest register state as the backing thread leaves a core.
    fn save_context(&mut self);

    /// Restores the guest register state as the backing thread enters a core.
    fn load_context(&mut self);

    /// Runs one guest slice: enters the guest and returns at the next trap.
    fn run(&mut self) -> ArchResult<()>;
}
