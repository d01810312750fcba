//! Memory virtualization and instrumentation hooks for x86 emulation cores.
//!
//! Terminology:
//! - Guest: the target being emulated
//! - GPA: Guest Physical Address, the guest's physical address space
//! - GVA: Guest Virtual Address, translated through the guest page tables
//!   rooted at a particular cr3
//! - HVA: Host memory backing a guest page, see [`HostPage`]
pub mod cpu;
pub mod error;
pub mod hook;
pub mod instr;
pub mod mem;
pub mod paging;
pub mod registry;
pub mod state;

pub use cpu::{
    Bus, Cpu, CpuMode, ExecutionCore, ExitReason, PendingException, RunExit, RunState, Step,
    StopHandle,
};
pub use error::{EmuError, Result};
pub use hook::{Event, EventKind, Hook, HookAction};
pub use instr::{Instr, RawInstr};
pub use mem::{GuestMemory, HostPage};
pub use paging::{Paging, PagingMode, PteFlags};
pub use registry::{HookHandle, HookRegistry, SharedRegistry};
pub use state::{GlobalSeg, Register, Seg, State, Zmm};

pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_PATCH: u32 = 0;

/// Guest page size. Every [`HostPage`] is exactly this many bytes.
pub const PAGE_SIZE: u64 = 0x1000;

/// Round `addr` down to the start of its page.
pub const fn page_align(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Offset of `addr` within its page.
pub const fn page_offset(addr: u64) -> usize {
    (addr & (PAGE_SIZE - 1)) as usize
}
