/// The execution core's view of the instruction an event belongs to.
///
/// Before/after-execution, repeat-iteration and opcode hooks receive a
/// `&dyn Instr`. It is only valid for the duration of the callback.
#[allow(clippy::len_without_is_empty)]
pub trait Instr {
    /// Core-specific opcode index of the decoded instruction.
    fn opcode(&self) -> u32;

    /// Encoded length in bytes.
    fn len(&self) -> usize;

    fn imm16(&self) -> u16;
    fn imm32(&self) -> u32;
    fn imm64(&self) -> u64;
}

/// A plain owned [`Instr`], for cores that do not keep a decoded form
/// around and for tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawInstr {
    pub opcode: u32,
    pub len: usize,
    pub imm: u64,
}

impl RawInstr {
    pub fn new(opcode: u32, len: usize) -> Self {
        Self {
            opcode,
            len,
            imm: 0,
        }
    }

    pub fn with_imm(mut self, imm: u64) -> Self {
        self.imm = imm;
        self
    }
}

impl Instr for RawInstr {
    fn opcode(&self) -> u32 {
        self.opcode
    }

    fn len(&self) -> usize {
        self.len
    }

    fn imm16(&self) -> u16 {
        self.imm as u16
    }

    fn imm32(&self) -> u32 {
        self.imm as u32
    }

    fn imm64(&self) -> u64 {
        self.imm
    }
}
