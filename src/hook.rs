//! Hook objects: a typed context plus one optional callback per event kind.
//!
//! These mirror the bochs instrumentation callbacks
//! (<http://bochs.sourceforge.net/cgi-bin/lxr/source/instrument/instrumentation.txt>).
use crate::instr::Instr;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Reset,
    Hlt,
    Mwait,
    CnearBranchTaken,
    CnearBranchNotTaken,
    UcnearBranch,
    FarBranch,
    VmExit,
    Interrupt,
    Exception,
    HwInterrupt,
    TlbCntrl,
    CacheCntrl,
    PrefetchHint,
    Clflush,
    BeforeExecution,
    AfterExecution,
    RepeatIteration,
    Inp,
    Inp2,
    Outp,
    LinAccess,
    PhyAccess,
    Wrmsr,
    Opcode,
}

impl EventKind {
    pub const COUNT: usize = 25;

    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::Reset,
        EventKind::Hlt,
        EventKind::Mwait,
        EventKind::CnearBranchTaken,
        EventKind::CnearBranchNotTaken,
        EventKind::UcnearBranch,
        EventKind::FarBranch,
        EventKind::VmExit,
        EventKind::Interrupt,
        EventKind::Exception,
        EventKind::HwInterrupt,
        EventKind::TlbCntrl,
        EventKind::CacheCntrl,
        EventKind::PrefetchHint,
        EventKind::Clflush,
        EventKind::BeforeExecution,
        EventKind::AfterExecution,
        EventKind::RepeatIteration,
        EventKind::Inp,
        EventKind::Inp2,
        EventKind::Outp,
        EventKind::LinAccess,
        EventKind::PhyAccess,
        EventKind::Wrmsr,
        EventKind::Opcode,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Software,
    Hardware,
}

/// Kind of an unconditional near or far control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Jmp,
    JmpIndirect,
    Call,
    CallIndirect,
    Ret,
    Iret,
    Int,
    Syscall,
    Sysret,
    Sysenter,
    Sysexit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbControl {
    MovCr0,
    MovCr3,
    MovCr4,
    TaskSwitch,
    ContextSwitch,
    Invlpg,
    Invept,
    Invvpid,
    Invpcid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheControl {
    Invd,
    Wbinvd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchKind {
    Nta,
    T0,
    T1,
    T2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Uc,
    Wc,
    Wt,
    Wp,
    Wb,
    UcWeak,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reset {
    pub cpu: u32,
    pub kind: ResetKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hlt {
    pub cpu: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mwait {
    pub cpu: u32,
    pub gpa: u64,
    pub len: usize,
    pub flags: u32,
}

/// Conditional near branch that was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    pub cpu: u32,
    pub from: u64,
    pub to: u64,
}

/// Conditional near branch that fell through; `ip` is the branch itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchNotTaken {
    pub cpu: u32,
    pub ip: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UcnearBranch {
    pub cpu: u32,
    pub kind: BranchKind,
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FarBranch {
    pub cpu: u32,
    pub kind: BranchKind,
    pub prev_cs: u16,
    pub prev_ip: u64,
    pub new_cs: u16,
    pub new_ip: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmExit {
    pub cpu: u32,
    pub reason: u32,
    pub qualification: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupt {
    pub cpu: u32,
    pub vector: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    pub cpu: u32,
    pub vector: u32,
    pub error_code: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwInterrupt {
    pub cpu: u32,
    pub vector: u32,
    pub cs: u16,
    pub ip: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbCntrl {
    pub cpu: u32,
    pub what: TlbControl,
    /// New control register value for the MOV CRx kinds.
    pub new_cr: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheCntrl {
    pub cpu: u32,
    pub what: CacheControl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchHint {
    pub cpu: u32,
    pub what: PrefetchKind,
    pub seg: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clflush {
    pub cpu: u32,
    pub gva: u64,
    pub gpa: u64,
}

/// Instruction boundary: before execution, after execution, or one
/// iteration of a repeated string instruction.
#[derive(Clone, Copy)]
pub struct Execution<'a> {
    pub cpu: u32,
    pub instr: &'a dyn Instr,
}

/// Port read, value not known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortIn {
    pub port: u16,
    pub len: usize,
}

/// Port read with its result, or port write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAccess {
    pub port: u16,
    pub len: usize,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinAccess {
    pub cpu: u32,
    pub gva: u64,
    pub gpa: u64,
    pub len: usize,
    pub memtype: MemType,
    pub rw: AccessKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhyAccess {
    pub cpu: u32,
    pub gpa: u64,
    pub len: usize,
    pub memtype: MemType,
    pub rw: AccessKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wrmsr {
    pub cpu: u32,
    pub msr: u32,
    pub value: u64,
}

/// A decoded instruction together with its raw bytes.
#[derive(Clone, Copy)]
pub struct Opcode<'a> {
    pub cpu: u32,
    pub instr: &'a dyn Instr,
    pub bytes: &'a [u8],
    pub is32: bool,
    pub is64: bool,
}

impl fmt::Debug for Execution<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("cpu", &self.cpu)
            .field("opcode", &self.instr.opcode())
            .field("len", &self.instr.len())
            .finish()
    }
}

impl fmt::Debug for Opcode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opcode")
            .field("cpu", &self.cpu)
            .field("opcode", &self.instr.opcode())
            .field("bytes", &self.bytes)
            .field("is32", &self.is32)
            .field("is64", &self.is64)
            .finish()
    }
}

/// One architectural event, as reported by the execution core.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    Reset(Reset),
    Hlt(Hlt),
    Mwait(Mwait),
    CnearBranchTaken(Branch),
    CnearBranchNotTaken(BranchNotTaken),
    UcnearBranch(UcnearBranch),
    FarBranch(FarBranch),
    VmExit(VmExit),
    Interrupt(Interrupt),
    Exception(Exception),
    HwInterrupt(HwInterrupt),
    TlbCntrl(TlbCntrl),
    CacheCntrl(CacheCntrl),
    PrefetchHint(PrefetchHint),
    Clflush(Clflush),
    BeforeExecution(Execution<'a>),
    AfterExecution(Execution<'a>),
    RepeatIteration(Execution<'a>),
    Inp(PortIn),
    Inp2(PortAccess),
    Outp(PortAccess),
    LinAccess(LinAccess),
    PhyAccess(PhyAccess),
    Wrmsr(Wrmsr),
    Opcode(Opcode<'a>),
}

impl Event<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Reset(_) => EventKind::Reset,
            Event::Hlt(_) => EventKind::Hlt,
            Event::Mwait(_) => EventKind::Mwait,
            Event::CnearBranchTaken(_) => EventKind::CnearBranchTaken,
            Event::CnearBranchNotTaken(_) => EventKind::CnearBranchNotTaken,
            Event::UcnearBranch(_) => EventKind::UcnearBranch,
            Event::FarBranch(_) => EventKind::FarBranch,
            Event::VmExit(_) => EventKind::VmExit,
            Event::Interrupt(_) => EventKind::Interrupt,
            Event::Exception(_) => EventKind::Exception,
            Event::HwInterrupt(_) => EventKind::HwInterrupt,
            Event::TlbCntrl(_) => EventKind::TlbCntrl,
            Event::CacheCntrl(_) => EventKind::CacheCntrl,
            Event::PrefetchHint(_) => EventKind::PrefetchHint,
            Event::Clflush(_) => EventKind::Clflush,
            Event::BeforeExecution(_) => EventKind::BeforeExecution,
            Event::AfterExecution(_) => EventKind::AfterExecution,
            Event::RepeatIteration(_) => EventKind::RepeatIteration,
            Event::Inp(_) => EventKind::Inp,
            Event::Inp2(_) => EventKind::Inp2,
            Event::Outp(_) => EventKind::Outp,
            Event::LinAccess(_) => EventKind::LinAccess,
            Event::PhyAccess(_) => EventKind::PhyAccess,
            Event::Wrmsr(_) => EventKind::Wrmsr,
            Event::Opcode(_) => EventKind::Opcode,
        }
    }

    /// Processor that raised the event. Port I/O events carry none.
    pub fn cpu(&self) -> Option<u32> {
        match self {
            Event::Reset(e) => Some(e.cpu),
            Event::Hlt(e) => Some(e.cpu),
            Event::Mwait(e) => Some(e.cpu),
            Event::CnearBranchTaken(e) => Some(e.cpu),
            Event::CnearBranchNotTaken(e) => Some(e.cpu),
            Event::UcnearBranch(e) => Some(e.cpu),
            Event::FarBranch(e) => Some(e.cpu),
            Event::VmExit(e) => Some(e.cpu),
            Event::Interrupt(e) => Some(e.cpu),
            Event::Exception(e) => Some(e.cpu),
            Event::HwInterrupt(e) => Some(e.cpu),
            Event::TlbCntrl(e) => Some(e.cpu),
            Event::CacheCntrl(e) => Some(e.cpu),
            Event::PrefetchHint(e) => Some(e.cpu),
            Event::Clflush(e) => Some(e.cpu),
            Event::BeforeExecution(e) | Event::AfterExecution(e) | Event::RepeatIteration(e) => {
                Some(e.cpu)
            }
            Event::Inp(_) | Event::Inp2(_) | Event::Outp(_) => None,
            Event::LinAccess(e) => Some(e.cpu),
            Event::PhyAccess(e) => Some(e.cpu),
            Event::Wrmsr(e) => Some(e.cpu),
            Event::Opcode(e) => Some(e.cpu),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookAction {
    /// Continue normal execution
    #[default]
    Continue,
    /// Ask the driving loop to stop once the current event has been
    /// delivered to every hook
    Stop,
}

impl HookAction {
    /// Combine the answers of two hooks for the same event; Stop wins.
    pub fn merge(self, other: HookAction) -> HookAction {
        match (self, other) {
            (HookAction::Continue, HookAction::Continue) => HookAction::Continue,
            _ => HookAction::Stop,
        }
    }
}

impl From<()> for HookAction {
    fn from(_: ()) -> Self {
        HookAction::Continue
    }
}

pub type Callback<C> = Box<dyn FnMut(&mut C, &Event<'_>) -> HookAction + Send>;

/// A set of event callbacks bound to one context value.
///
/// A new hook observes nothing. Callbacks receive `&mut C` followed by the
/// event payload; the context is never inspected by this crate.
pub struct Hook<C> {
    ctx: C,
    slots: [Option<Callback<C>>; EventKind::COUNT],
}

impl<C> Hook<C> {
    pub fn new(ctx: C) -> Self {
        Self {
            ctx,
            slots: std::array::from_fn(|_| None),
        }
    }

    pub fn ctx(&self) -> &C {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut C {
        &mut self.ctx
    }

    /// Replace the context, returning the old one.
    pub fn set_ctx(&mut self, ctx: C) -> C {
        std::mem::replace(&mut self.ctx, ctx)
    }

    pub fn into_ctx(self) -> C {
        self.ctx
    }

    /// Store `callback` in the slot for `kind`; `None` clears the slot.
    pub fn set_slot(&mut self, kind: EventKind, callback: Option<Callback<C>>) -> &mut Self {
        self.slots[kind.index()] = callback;
        self
    }

    /// Observe every event of `kind` with an untyped callback. Prefer the
    /// typed `on_*` setters unless one closure should serve several kinds.
    pub fn set<F>(&mut self, kind: EventKind, callback: F) -> &mut Self
    where
        F: FnMut(&mut C, &Event<'_>) -> HookAction + Send + 'static,
    {
        self.set_slot(kind, Some(Box::new(callback)))
    }

    pub fn clear(&mut self, kind: EventKind) -> &mut Self {
        self.set_slot(kind, None)
    }

    pub fn clear_all(&mut self) -> &mut Self {
        for slot in &mut self.slots {
            *slot = None;
        }
        self
    }

    pub fn observes(&self, kind: EventKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    pub fn observed(&self) -> impl Iterator<Item = EventKind> + '_ {
        EventKind::ALL
            .into_iter()
            .filter(move |&kind| self.observes(kind))
    }

    /// Invoke the callback for `event`'s kind, if there is one.
    pub fn dispatch(&mut self, event: &Event<'_>) -> Option<HookAction> {
        let callback = self.slots[event.kind().index()].as_mut()?;
        Some(callback(&mut self.ctx, event))
    }
}

impl<C: Default> Default for Hook<C> {
    fn default() -> Self {
        Self::new(C::default())
    }
}

impl<C> fmt::Debug for Hook<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("observed", &self.observed().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

macro_rules! typed_setters {
    ($($setter:ident => $kind:ident($payload:ty);)*) => {
        impl<C> Hook<C> {
            $(
                pub fn $setter<F, R>(&mut self, mut callback: F) -> &mut Self
                where
                    F: FnMut(&mut C, &$payload) -> R + Send + 'static,
                    R: Into<HookAction>,
                {
                    self.set(EventKind::$kind, move |ctx, event| match event {
                        Event::$kind(payload) => callback(ctx, payload).into(),
                        _ => HookAction::Continue,
                    })
                }
            )*
        }
    };
}

typed_setters! {
    on_reset => Reset(Reset);
    on_hlt => Hlt(Hlt);
    on_mwait => Mwait(Mwait);
    on_cnear_branch_taken => CnearBranchTaken(Branch);
    on_cnear_branch_not_taken => CnearBranchNotTaken(BranchNotTaken);
    on_ucnear_branch => UcnearBranch(UcnearBranch);
    on_far_branch => FarBranch(FarBranch);
    on_vmexit => VmExit(VmExit);
    on_interrupt => Interrupt(Interrupt);
    on_exception => Exception(Exception);
    on_hw_interrupt => HwInterrupt(HwInterrupt);
    on_tlb_cntrl => TlbCntrl(TlbCntrl);
    on_cache_cntrl => CacheCntrl(CacheCntrl);
    on_prefetch_hint => PrefetchHint(PrefetchHint);
    on_clflush => Clflush(Clflush);
    on_before_execution => BeforeExecution(Execution<'_>);
    on_after_execution => AfterExecution(Execution<'_>);
    on_repeat_iteration => RepeatIteration(Execution<'_>);
    on_inp => Inp(PortIn);
    on_inp2 => Inp2(PortAccess);
    on_outp => Outp(PortAccess);
    on_lin_access => LinAccess(LinAccess);
    on_phy_access => PhyAccess(PhyAccess);
    on_wrmsr => Wrmsr(Wrmsr);
    on_opcode => Opcode(Opcode<'_>);
}
