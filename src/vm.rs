use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use core::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};

use axerrno::{ax_err, AxResult};
use log::{debug, info, warn, Level};

use crate::flags::{CpuFlags, ForceFlags, VmFlags};
use crate::hal::{VmmHal, WaitEvent};
use crate::halt::{HaltConfig, HaltScheduler};
use crate::rendezvous::Rendezvous;
use crate::request::RequestQueue;
use crate::vcpu::{RunState, VCpu};
use crate::{StrictStatus, VmmResult};

/// The maximum number of vcpus a VM may have.
pub const MAX_VCPUS: usize = 64;

/// Creation-time configuration of a [`Vm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of vcpus, fixed for the lifetime of the VM.
    pub vcpu_count: usize,
    /// Initial tuning of every vcpu's [`HaltScheduler`].
    pub halt: HaltConfig,
}

impl VmConfig {
    /// A configuration with `vcpu_count` vcpus and default halt tuning.
    pub fn with_vcpus(vcpu_count: usize) -> Self {
        Self {
            vcpu_count,
            halt: HaltConfig::default(),
        }
    }
}

/// The VM-wide state shared by all vcpu threads.
pub struct Vm<H: VmmHal> {
    config: VmConfig,
    pub(crate) vcpus: Vec<VCpu<H>>,
    flags: ForceFlags<VmFlags>,
    destroying: AtomicBool,
    pub(crate) rendezvous: Rendezvous<H>,
    pub(crate) requests: RequestQueue<H>,
    diagnostics_dropped: AtomicU64,
}

impl<H: VmmHal> Vm<H> {
    /// Create a VM with all vcpus [`RunState::Stopped`].
    pub fn new(config: VmConfig) -> AxResult<Self> {
        if config.vcpu_count == 0 || config.vcpu_count > MAX_VCPUS {
            return ax_err!(
                InvalidInput,
                alloc::format!(
                    "vcpu count {} out of range 1..={}",
                    config.vcpu_count,
                    MAX_VCPUS
                )
            );
        }
        let vcpus = (0..config.vcpu_count)
            .map(VCpu::new)
            .collect::<AxResult<Vec<_>>>()?;
        debug!("created vm with {} vcpus", config.vcpu_count);
        Ok(Self {
            config,
            vcpus,
            flags: ForceFlags::new(),
            destroying: AtomicBool::new(false),
            rendezvous: Rendezvous::new()?,
            requests: RequestQueue::new(),
            diagnostics_dropped: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub fn vcpu(&self, id: usize) -> Option<&VCpu<H>> {
        self.vcpus.get(id)
    }

    pub fn vcpus(&self) -> &[VCpu<H>] {
        &self.vcpus
    }

    /// The vcpu owned by the calling thread, if any.
    pub fn current_vcpu(&self) -> Option<&VCpu<H>> {
        H::current_vcpu_id().and_then(|id| self.vcpu(id))
    }

    /// A fresh halt scheduler using this VM's halt tuning.
    pub fn halt_scheduler(&self) -> HaltScheduler {
        HaltScheduler::new(self.config.halt)
    }

    fn vcpu_or_err(&self, id: usize) -> AxResult<&VCpu<H>> {
        match self.vcpu(id) {
            Some(vcpu) => Ok(vcpu),
            None => ax_err!(InvalidInput, "vcpu id out of range"),
        }
    }

    /// Prepare a stopped vcpu for its thread.
    pub fn init_vcpu(&self, id: usize) -> AxResult {
        self.vcpu_or_err(id)?.init()
    }

    /// Transition a vcpu from [`RunState::Stopped`] to [`RunState::Started`].
    pub fn start_vcpu(&self, id: usize) -> AxResult {
        if self.is_destroying() {
            return ax_err!(BadState, "vm is being destroyed");
        }
        self.vcpu_or_err(id)?
            .transition_state(RunState::Stopped, RunState::Started)?;
        info!("vcpu {} started", id);
        Ok(())
    }

    /// Force a vcpu to [`RunState::Stopped`] and kick it out of any block.
    pub fn stop_vcpu(&self, id: usize) -> AxResult {
        let prev = self.vcpu_or_err(id)?.force_stop();
        if prev == RunState::StartedHalted {
            self.vcpus[id].halt_event().signal();
        }
        H::poke_vcpu(id);
        info!("vcpu {} stopped (was {:?})", id, prev);
        Ok(())
    }

    /// Mark the VM as being torn down and wake every vcpu so it notices.
    pub fn begin_destroy(&self) {
        if self.destroying.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("vm destruction started");
        self.set_global_flags(VmFlags::CHECK_VM_STATE);
    }

    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::Acquire)
    }

    /// Number of vcpus that are currently started.
    pub fn active_vcpu_count(&self) -> usize {
        self.vcpus
            .iter()
            .filter(|vcpu| vcpu.run_state().is_started())
            .count()
    }

    /// The VM-wide force-action flags.
    pub fn flags(&self) -> &ForceFlags<VmFlags> {
        &self.flags
    }

    /// Raise VM-wide flags and make sure every vcpu notices them.
    pub fn set_global_flags(&self, flags: VmFlags) {
        self.flags.set(flags);
        self.kick_all();
    }

    pub(crate) fn kick_all(&self) {
        for vcpu in &self.vcpus {
            self.kick(vcpu);
        }
    }

    pub fn clear_global_flags(&self, flags: VmFlags) {
        self.flags.clear(flags);
    }

    /// Whether a rendezvous is waiting for vcpus to enter it.
    pub fn is_rendezvous_pending(&self) -> bool {
        self.flags.is_any_set(VmFlags::EMT_RENDEZVOUS)
    }

    /// Raise per-vcpu flags on vcpu `id` and wake it if it is halted.
    pub fn notify_vcpu(&self, id: usize, flags: CpuFlags) -> bool {
        match self.vcpu(id) {
            Some(vcpu) => {
                vcpu.set_flags(flags);
                self.kick(vcpu)
            }
            None => false,
        }
    }

    /// Wake vcpu `id` if it is blocked in the halt scheduler.
    ///
    /// Returns whether a wake-up was issued.
    pub fn wake_up(&self, id: usize) -> bool {
        match self.vcpu(id) {
            Some(vcpu) => self.wake_halted(vcpu),
            None => false,
        }
    }

    fn kick(&self, vcpu: &VCpu<H>) -> bool {
        if vcpu.run_state() == RunState::StartedExecuting {
            H::poke_vcpu(vcpu.id());
        }
        self.wake_halted(vcpu)
    }

    fn wake_halted(&self, vcpu: &VCpu<H>) -> bool {
        // Pairs with the fence in the halt path.
        fence(Ordering::SeqCst);
        if vcpu.run_state() == RunState::StartedHalted {
            vcpu.halt_event().signal();
            true
        } else {
            false
        }
    }

    /// Service the VM-wide force actions this crate owns on the calling vcpu
    /// thread: pending rendezvous first, then forwarded requests.
    pub fn process_forced_actions(&self, vcpu: &VCpu<H>) -> VmmResult<StrictStatus> {
        let mut status = StrictStatus::SUCCESS;
        if self.is_rendezvous_pending() && !vcpu.in_rendezvous() {
            status = status.merge(self.process_rendezvous(vcpu)?);
        }
        if self.flags.is_any_set(VmFlags::REQUEST) {
            status = status.merge(self.process_requests(vcpu)?);
        }
        Ok(status)
    }

    /// Hand a snapshot of the coordination state to the diagnostics pipeline.
    ///
    /// Records that the pipeline rejects are counted, see
    /// [`Vm::diagnostics_dropped`].
    pub fn dump_diagnostics(&self) {
        let mut line = String::new();
        let _ = write!(
            line,
            "vm: vcpus={} active={} destroying={} flags={:?}",
            self.vcpu_count(),
            self.active_vcpu_count(),
            self.is_destroying(),
            self.flags.get()
        );
        if let Some(info) = self.rendezvous_session() {
            let _ = write!(
                line,
                " rendezvous={:?}/{:?} depth={} counts={:?} status={}",
                info.policy, info.flags, info.depth, info.counts, info.status
            );
        }
        self.emit_diagnostic(None, Level::Info, &line);

        for vcpu in &self.vcpus {
            line.clear();
            let _ = write!(
                line,
                "vcpu {}: state={:?} flags={:?} in_rendezvous={}",
                vcpu.id(),
                vcpu.run_state(),
                vcpu.flags().get(),
                vcpu.in_rendezvous()
            );
            self.emit_diagnostic(Some(vcpu.id()), Level::Info, &line);
        }
    }

    /// Number of diagnostic records the pipeline dropped.
    pub fn diagnostics_dropped(&self) -> u64 {
        self.diagnostics_dropped.load(Ordering::Relaxed)
    }

    fn emit_diagnostic(&self, vcpu_id: Option<usize>, level: Level, line: &str) {
        if !H::emit_diagnostic(vcpu_id, level, line.as_bytes()) {
            self.diagnostics_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<H: VmmHal> core::fmt::Debug for Vm<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("vcpus", &self.vcpus)
            .field("flags", &self.flags)
            .field("destroying", &self.is_destroying())
            .finish()
    }
}
