use crate::error::Result;
use crate::hook::{Event, EventKind, HookAction};
use crate::mem::GuestMemory;
use crate::paging::Paging;
use crate::registry::{HookRegistry, SharedRegistry};
use crate::state::{Register, State};
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
    /// 32-bit code under IA-32e
    Compat,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Go,
    Stop,
}

/// Requests that a running [`Cpu`] return from [`Cpu::run`].
///
/// Clones share the same flag and can be moved into hook contexts or
/// other threads. The request is honoured at the next step boundary and
/// consumed by the `run` it ends. A request that misses the last step
/// boundary of a run, or is made while the cpu is not running, makes the
/// next `run` return before its first step.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn consume(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingException {
    pub vector: u32,
    pub error_code: Option<u16>,
}

/// Result of a single [`ExecutionCore::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The core reported [`Step::Halt`].
    Halted,
    /// A hook returned [`HookAction::Stop`].
    HookStop,
    /// [`Cpu::stop`] or a [`StopHandle`] was used.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunExit {
    pub reason: ExitReason,
    pub steps: u64,
}

/// The instruction execution engine driven by [`Cpu::run`].
///
/// A step executes at most one instruction (or one iteration of a repeated
/// one), reporting what happened through [`Bus::emit`].
pub trait ExecutionCore {
    fn step(&mut self, cpu: &mut Cpu, bus: &mut Bus<'_>) -> Result<Step>;
}

/// What an execution core sees of the outside world during one step:
/// guest memory and the hooks.
pub struct Bus<'a> {
    mem: &'a GuestMemory,
    hooks: &'a mut HookRegistry,
    stop_requested: bool,
}

impl<'a> Bus<'a> {
    pub fn new(mem: &'a GuestMemory, hooks: &'a mut HookRegistry) -> Self {
        Self {
            mem,
            hooks,
            stop_requested: false,
        }
    }

    pub fn memory(&self) -> &GuestMemory {
        self.mem
    }

    /// Cores may skip building events nobody listens to.
    pub fn is_observed(&self, kind: EventKind) -> bool {
        self.hooks.is_observed(kind)
    }

    /// Dispatch `event` to the hooks. A `Stop` answer ends the run after
    /// the current step.
    pub fn emit(&mut self, event: &Event<'_>) -> HookAction {
        let action = self.hooks.dispatch(event);
        if action == HookAction::Stop {
            self.stop_requested = true;
        }
        action
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn read_virtual(&self, cpu: &Cpu, gva: u64, buf: &mut [u8]) -> Result<()> {
        self.mem.read_virtual(&cpu.paging(), gva, buf)
    }

    pub fn write_virtual(&self, cpu: &Cpu, gva: u64, data: &[u8]) -> Result<()> {
        self.mem.write_virtual(&cpu.paging(), gva, data)
    }

    pub fn read_physical(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
        self.mem.read_physical(gpa, buf)
    }

    pub fn write_physical(&self, gpa: u64, data: &[u8]) -> Result<()> {
        self.mem.write_physical(gpa, data)
    }
}

/// One logical processor.
///
/// Hooks never receive the `Cpu`; they identify it by the id carried in
/// each event and stop it through a [`StopHandle`].
#[derive(Debug)]
pub struct Cpu {
    id: u32,
    state: State,
    pending_exception: Option<PendingException>,
    stop: StopHandle,
}

impl Cpu {
    pub fn new(id: u32) -> Self {
        info!("cpu {} created", id);
        Self {
            id,
            state: State::default(),
            pending_exception: None,
            stop: StopHandle::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn reg(&self, reg: Register) -> u64 {
        self.state.read_reg(reg)
    }

    pub fn set_reg(&mut self, reg: Register, value: u64) {
        self.state.write_reg(reg, value);
    }

    pub fn mode(&self) -> CpuMode {
        self.state.cpu_mode()
    }

    pub fn paging(&self) -> Paging {
        self.state.paging()
    }

    /// Queue an exception for the core to deliver before the next
    /// instruction. Replaces any exception already pending.
    pub fn set_exception(&mut self, vector: u32, error_code: Option<u16>) {
        debug!("cpu {} pending exception {:#x}", self.id, vector);
        self.pending_exception = Some(PendingException { vector, error_code });
    }

    pub fn take_pending_exception(&mut self) -> Option<PendingException> {
        self.pending_exception.take()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn run_state(&self) -> RunState {
        if self.stop.is_stop_requested() {
            RunState::Stop
        } else {
            RunState::Go
        }
    }

    /// Step `core` until it halts, a hook returns [`HookAction::Stop`], or
    /// a stop is requested. Core errors end the run and are returned as is.
    pub fn run<E: ExecutionCore>(
        &mut self,
        core: &mut E,
        mem: &GuestMemory,
        hooks: &mut HookRegistry,
    ) -> Result<RunExit> {
        info!("cpu {} running with {} hooks", self.id, hooks.len());
        let mut steps = 0;
        let result = loop {
            match self.step_once(core, mem, hooks, &mut steps) {
                Ok(Some(reason)) => break Ok(reason),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
        };
        self.finish(result, steps)
    }

    /// Like [`Cpu::run`], locking `hooks` for one step at a time so that
    /// processors sharing the registry interleave.
    pub fn run_shared<E: ExecutionCore>(
        &mut self,
        core: &mut E,
        mem: &GuestMemory,
        hooks: &SharedRegistry,
    ) -> Result<RunExit> {
        info!("cpu {} running with shared hooks", self.id);
        let mut steps = 0;
        let result = loop {
            let mut registry = hooks.lock().unwrap_or_else(PoisonError::into_inner);
            match self.step_once(core, mem, &mut registry, &mut steps) {
                Ok(Some(reason)) => break Ok(reason),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
        };
        self.finish(result, steps)
    }

    fn step_once<E: ExecutionCore>(
        &mut self,
        core: &mut E,
        mem: &GuestMemory,
        hooks: &mut HookRegistry,
        steps: &mut u64,
    ) -> Result<Option<ExitReason>> {
        if self.stop.is_stop_requested() {
            return Ok(Some(ExitReason::Stopped));
        }

        let mut bus = Bus::new(mem, hooks);
        let step = core.step(self, &mut bus)?;
        *steps += 1;

        if bus.stop_requested() {
            Ok(Some(ExitReason::HookStop))
        } else if step == Step::Halt {
            Ok(Some(ExitReason::Halted))
        } else {
            Ok(None)
        }
    }

    fn finish(&mut self, result: Result<ExitReason>, steps: u64) -> Result<RunExit> {
        if matches!(result, Ok(ExitReason::Stopped)) {
            self.stop.consume();
        }
        match result {
            Ok(reason) => {
                info!("cpu {} exited after {} steps: {:?}", self.id, steps, reason);
                Ok(RunExit { reason, steps })
            }
            Err(e) => {
                warn!("cpu {} failed after {} steps: {}", self.id, steps, e);
                Err(e)
            }
        }
    }
}

impl Drop for Cpu {
    fn drop(&mut self) {
        info!("cpu {} released", self.id);
    }
}
