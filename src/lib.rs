// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! VmmSync - cross-vCPU coordination and idle scheduling for ArceOS hypervisors.
//!
//! This crate is the part of a virtual-machine monitor that makes the per-vCPU
//! threads cooperate. It is `no_std` and delegates everything host-specific
//! (wait primitives, time, the identity of the calling thread) to an
//! implementation of the [`VmmHal`] trait, and everything guest-specific
//! (interrupt controller, timers) to an implementation of [`ArchVCpuOps`].
//!
//! # Features
//!
//! - VM-wide and per-vCPU force-action flags, lock-free
//! - Per-vCPU run state (Stopped → Started ⇄ StartedHalted / StartedExecuting)
//! - EMT rendezvous: an n-way barrier running a callback on every vCPU thread
//!   with five ordering policies and bounded recursion
//! - Halt scheduling: spin, block or escalate to the host scheduler when a
//!   guest executes HLT/MWAIT

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Core modules
mod arch_vcpu; // Architecture-specific hooks used by the halt scheduler
mod error; // Error taxonomy of the coordination core
mod exit; // Halt outcomes
mod flags; // Force-action flag sets
mod hal; // Hardware abstraction layer interfaces
mod halt; // Halt scheduler
mod rendezvous; // EMT rendezvous coordinator
mod request; // Requests forwarded to vCPU threads
mod status; // Strict status codes and their merging
mod vcpu; // Per-vCPU execution state
mod vm; // The VM object tying it all together

// Public API exports
pub use arch_vcpu::{ArchVCpuOps, Interruptibility, MonitorWait};
pub use error::{VmmError, VmmResult};
pub use exit::{EscalateReason, HaltExit};
pub use flags::{CpuFlags, ForceFlags, VmFlags};
pub use hal::{VmmHal, WaitEvent, WaitOutcome};
pub use halt::{HaltConfig, HaltCounters, HaltScheduler, HaltStatistics, HALT_HISTORY_PERIOD};
pub use rendezvous::{
    RendezvousFlags, RendezvousFn, RendezvousPolicy, SessionCounts, SessionInfo,
    MAX_RECURSION_DEPTH,
};
pub use status::StrictStatus;
pub use vcpu::{RunState, VCpu};
pub use vm::{Vm, VmConfig, MAX_VCPUS};
