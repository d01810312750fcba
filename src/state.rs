use crate::cpu::CpuMode;
use crate::paging::{Paging, PagingMode};
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, str::FromStr};

const CR0_PE: u64 = 1 << 0;
const CR0_PG: u64 = 1 << 31;
const CR4_PSE: u64 = 1 << 4;
const CR4_PAE: u64 = 1 << 5;
const CR4_LA57: u64 = 1 << 12;
const EFER_LMA: u32 = 1 << 10;
/// CS.L in the packed segment attribute word.
const SEG_ATTR_LONG: u16 = 1 << 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Seg {
    pub present: bool,
    pub selector: u16,
    #[serde(with = "hex_string")]
    pub base: u64,
    pub limit: u32,
    pub attr: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GlobalSeg {
    #[serde(with = "hex_string")]
    pub base: u64,
    pub limit: u16,
}

/// One 512-bit vector register as eight quadwords, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Zmm {
    #[serde(with = "hex_array")]
    pub q: [u64; 8],
}

/// Complete architectural register state of one processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(with = "hex_string")]
    pub rip: u64,
    #[serde(with = "hex_string")]
    pub rflags: u64,
    #[serde(with = "hex_string")]
    pub rax: u64,
    #[serde(with = "hex_string")]
    pub rcx: u64,
    #[serde(with = "hex_string")]
    pub rdx: u64,
    #[serde(with = "hex_string")]
    pub rbx: u64,
    #[serde(with = "hex_string")]
    pub rsp: u64,
    #[serde(with = "hex_string")]
    pub rbp: u64,
    #[serde(with = "hex_string")]
    pub rsi: u64,
    #[serde(with = "hex_string")]
    pub rdi: u64,
    #[serde(with = "hex_string")]
    pub r8: u64,
    #[serde(with = "hex_string")]
    pub r9: u64,
    #[serde(with = "hex_string")]
    pub r10: u64,
    #[serde(with = "hex_string")]
    pub r11: u64,
    #[serde(with = "hex_string")]
    pub r12: u64,
    #[serde(with = "hex_string")]
    pub r13: u64,
    #[serde(with = "hex_string")]
    pub r14: u64,
    #[serde(with = "hex_string")]
    pub r15: u64,

    pub es: Seg,
    pub cs: Seg,
    pub ss: Seg,
    pub ds: Seg,
    pub fs: Seg,
    pub gs: Seg,
    pub ldtr: Seg,
    pub tr: Seg,
    pub gdtr: GlobalSeg,
    pub idtr: GlobalSeg,

    #[serde(with = "hex_string")]
    pub cr0: u64,
    #[serde(with = "hex_string")]
    pub cr2: u64,
    #[serde(with = "hex_string")]
    pub cr3: u64,
    #[serde(with = "hex_string")]
    pub cr4: u64,
    #[serde(with = "hex_string")]
    pub cr8: u64,

    #[serde(with = "hex_string")]
    pub dr0: u64,
    #[serde(with = "hex_string")]
    pub dr1: u64,
    #[serde(with = "hex_string")]
    pub dr2: u64,
    #[serde(with = "hex_string")]
    pub dr3: u64,
    #[serde(with = "hex_string")]
    pub dr6: u64,
    #[serde(with = "hex_string")]
    pub dr7: u64,

    pub xcr0: u32,
    pub efer: u32,

    #[serde(with = "hex_string")]
    pub star: u64,
    #[serde(with = "hex_string")]
    pub lstar: u64,
    #[serde(with = "hex_string")]
    pub cstar: u64,
    #[serde(with = "hex_string")]
    pub sfmask: u64,
    #[serde(with = "hex_string")]
    pub kernel_gs_base: u64,
    #[serde(with = "hex_string")]
    pub sysenter_cs: u64,
    #[serde(with = "hex_string")]
    pub sysenter_esp: u64,
    #[serde(with = "hex_string")]
    pub sysenter_eip: u64,
    #[serde(with = "hex_string")]
    pub pat: u64,
    #[serde(with = "hex_string")]
    pub tsc: u64,
    pub tsc_aux: u32,
    #[serde(with = "hex_string")]
    pub apic_base: u64,

    pub fpcw: u16,
    pub fpsw: u16,
    pub fptw: u16,
    pub fpop: u16,
    #[serde(with = "hex_array")]
    pub fpst: [u64; 8],

    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub zmm: [Zmm; 32],
}

impl Default for State {
    /// Register values after RESET, except that CS.base and RIP are left
    /// at zero.
    fn default() -> Self {
        Self {
            rip: 0,
            rflags: 0x2,
            rax: 0,
            rcx: 0,
            rdx: 0,
            rbx: 0,
            rsp: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            es: Seg::real_mode(0),
            cs: Seg::real_mode(0),
            ss: Seg::real_mode(0),
            ds: Seg::real_mode(0),
            fs: Seg::real_mode(0),
            gs: Seg::real_mode(0),
            ldtr: Seg::default(),
            tr: Seg::default(),
            gdtr: GlobalSeg {
                base: 0,
                limit: 0xffff,
            },
            idtr: GlobalSeg {
                base: 0,
                limit: 0xffff,
            },
            cr0: 0x6000_0010,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            cr8: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0xffff_0ff0,
            dr7: 0x400,
            xcr0: 1,
            efer: 0,
            star: 0,
            lstar: 0,
            cstar: 0,
            sfmask: 0,
            kernel_gs_base: 0,
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
            pat: 0x0007_0406_0007_0406,
            tsc: 0,
            tsc_aux: 0,
            apic_base: 0xfee0_0900,
            fpcw: 0x37f,
            fpsw: 0,
            fptw: 0xffff,
            fpop: 0,
            fpst: [0; 8],
            mxcsr: 0x1f80,
            mxcsr_mask: 0xffff,
            zmm: [Zmm::default(); 32],
        }
    }
}

impl Seg {
    /// Real-mode data segment at `selector << 4`.
    pub fn real_mode(selector: u16) -> Self {
        Self {
            present: true,
            selector,
            base: (selector as u64) << 4,
            limit: 0xffff,
            attr: 0x93,
        }
    }

    pub fn is_long(&self) -> bool {
        self.attr & SEG_ATTR_LONG != 0
    }
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpu_mode(&self) -> CpuMode {
        if self.cr0 & CR0_PE == 0 {
            CpuMode::Real
        } else if self.efer & EFER_LMA != 0 {
            if self.cs.is_long() {
                CpuMode::Long
            } else {
                CpuMode::Compat
            }
        } else {
            CpuMode::Protected
        }
    }

    /// Paging structures selected by CR0, CR4 and EFER.
    pub fn paging(&self) -> Paging {
        let mode = if self.cr0 & CR0_PG == 0 {
            PagingMode::Disabled
        } else if self.cr4 & CR4_PAE == 0 {
            PagingMode::Legacy {
                pse: self.cr4 & CR4_PSE != 0,
            }
        } else if self.efer & EFER_LMA == 0 {
            PagingMode::Pae
        } else if self.cr4 & CR4_LA57 != 0 {
            PagingMode::Long5
        } else {
            PagingMode::Long4
        };
        Paging::new(mode, self.cr3)
    }

    pub fn read_reg(&self, reg: Register) -> u64 {
        use Register::*;
        match reg {
            RAX => self.rax,
            RBX => self.rbx,
            RCX => self.rcx,
            RDX => self.rdx,
            RSI => self.rsi,
            RDI => self.rdi,
            RBP => self.rbp,
            RSP => self.rsp,
            R8 => self.r8,
            R9 => self.r9,
            R10 => self.r10,
            R11 => self.r11,
            R12 => self.r12,
            R13 => self.r13,
            R14 => self.r14,
            R15 => self.r15,
            RIP => self.rip,
            RFLAGS => self.rflags,
            CR0 => self.cr0,
            CR2 => self.cr2,
            CR3 => self.cr3,
            CR4 => self.cr4,
            CR8 => self.cr8,
            EFER => self.efer as u64,
        }
    }

    pub fn write_reg(&mut self, reg: Register, value: u64) {
        use Register::*;
        let slot = match reg {
            RAX => &mut self.rax,
            RBX => &mut self.rbx,
            RCX => &mut self.rcx,
            RDX => &mut self.rdx,
            RSI => &mut self.rsi,
            RDI => &mut self.rdi,
            RBP => &mut self.rbp,
            RSP => &mut self.rsp,
            R8 => &mut self.r8,
            R9 => &mut self.r9,
            R10 => &mut self.r10,
            R11 => &mut self.r11,
            R12 => &mut self.r12,
            R13 => &mut self.r13,
            R14 => &mut self.r14,
            R15 => &mut self.r15,
            RIP => &mut self.rip,
            RFLAGS => &mut self.rflags,
            CR0 => &mut self.cr0,
            CR2 => &mut self.cr2,
            CR3 => &mut self.cr3,
            CR4 => &mut self.cr4,
            CR8 => &mut self.cr8,
            EFER => {
                self.efer = value as u32;
                return;
            }
        };
        *slot = value;
    }

    /// Load a state snapshot from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow!("Failed to read state file {:?}: {}", path.as_ref(), e))?;

        Self::from_toml_str(&contents)
            .map_err(|e| anyhow!("Failed to parse state file {:?}: {}", path.as_ref(), e))
    }

    /// Save the state to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = self.to_toml_string()?;

        fs::write(&path, contents)
            .map_err(|e| anyhow!("Failed to write state file {:?}: {}", path.as_ref(), e))?;

        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| anyhow!("Failed to serialize state: {}", e))
    }
}

/// Registers addressable through [`State::read_reg`] and
/// [`State::write_reg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    RAX,
    RBX,
    RCX,
    RDX,
    RSI,
    RDI,
    RBP,
    RSP,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    RIP,
    RFLAGS,
    CR0,
    CR2,
    CR3,
    CR4,
    CR8,
    EFER,
}

impl FromStr for Register {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> Result<Self> {
        use Register::*;
        Ok(match name.to_uppercase().as_str() {
            "RAX" => RAX,
            "RBX" => RBX,
            "RCX" => RCX,
            "RDX" => RDX,
            "RSI" => RSI,
            "RDI" => RDI,
            "RBP" => RBP,
            "RSP" => RSP,
            "R8" => R8,
            "R9" => R9,
            "R10" => R10,
            "R11" => R11,
            "R12" => R12,
            "R13" => R13,
            "R14" => R14,
            "R15" => R15,
            "RIP" => RIP,
            "RFLAGS" => RFLAGS,
            "CR0" => CR0,
            "CR2" => CR2,
            "CR3" => CR3,
            "CR4" => CR4,
            "CR8" => CR8,
            "EFER" => EFER,
            _ => return Err(anyhow!("Unknown register name: {}", name)),
        })
    }
}

fn parse_hex(s: &str) -> Result<u64> {
    let cleaned = s.replace('_', "");
    let digits = cleaned.strip_prefix("0x").unwrap_or(&cleaned);
    u64::from_str_radix(digits, 16).map_err(|e| anyhow!("Invalid hex string '{}': {}", s, e))
}

/// TOML integers are signed, so 64-bit values are stored as hex strings.
mod hex_string {
    use super::parse_hex;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex_str: String = String::deserialize(deserializer)?;
        parse_hex(&hex_str).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format!("0x{:x}", value).serialize(serializer)
    }
}

mod hex_array {
    use super::parse_hex;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u64; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let strings: Vec<String> = Vec::deserialize(deserializer)?;
        let len = strings.len();
        let values = strings
            .iter()
            .map(|s| parse_hex(s))
            .collect::<Result<Vec<u64>, _>>()
            .map_err(serde::de::Error::custom)?;
        values
            .try_into()
            .map_err(|_| serde::de::Error::invalid_length(len, &"a fixed-size array"))
    }

    pub fn serialize<S, const N: usize>(values: &[u64; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        values
            .iter()
            .map(|v| format!("0x{:x}", v))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_hex("1000").unwrap(), 0x1000);
        assert_eq!(parse_hex("0xffff_f800_0000_0000").unwrap(), 0xffff_f800_0000_0000);
        assert!(parse_hex("0xzz").is_err());
    }

    #[test]
    fn test_register_from_str() {
        assert_eq!("rax".parse::<Register>().unwrap(), Register::RAX);
        assert_eq!("CR3".parse::<Register>().unwrap(), Register::CR3);
        assert!("xmm0".parse::<Register>().is_err());
    }

    #[test]
    fn test_read_write_reg() {
        let mut state = State::new();
        state.write_reg(Register::R13, 0xdead_beef);
        state.write_reg(Register::EFER, 0x1_0000_0d01);
        assert_eq!(state.r13, 0xdead_beef);
        assert_eq!(state.read_reg(Register::R13), 0xdead_beef);
        assert_eq!(state.read_reg(Register::EFER), 0xd01);
    }

    #[test]
    fn test_cpu_mode() {
        let mut state = State::new();
        assert_eq!(state.cpu_mode(), CpuMode::Real);

        state.cr0 |= CR0_PE;
        assert_eq!(state.cpu_mode(), CpuMode::Protected);

        state.efer |= EFER_LMA;
        assert_eq!(state.cpu_mode(), CpuMode::Compat);

        state.cs.attr |= SEG_ATTR_LONG;
        assert_eq!(state.cpu_mode(), CpuMode::Long);
    }

    #[test]
    fn test_paging_mode() {
        let mut state = State::new();
        state.cr3 = 0x1ad000;
        assert_eq!(state.paging().mode, PagingMode::Disabled);

        state.cr0 |= CR0_PE | CR0_PG;
        assert_eq!(state.paging().mode, PagingMode::Legacy { pse: false });

        state.cr4 |= CR4_PSE | CR4_PAE;
        assert_eq!(state.paging().mode, PagingMode::Pae);

        state.efer |= EFER_LMA;
        assert_eq!(state.paging(), Paging::long(0x1ad000));

        state.cr4 |= CR4_LA57;
        assert_eq!(state.paging().mode, PagingMode::Long5);
    }

    #[test]
    fn test_toml_roundtrip_keeps_high_bits() {
        let mut state = State::new();
        state.rip = 0xfffff802_1234_5678;
        state.gs.base = 0xffff_f780_0000_0000;
        state.zmm[31].q[7] = u64::MAX;

        let toml_str = state.to_toml_string().unwrap();
        assert!(toml_str.contains("rip = \"0xfffff80212345678\""));
        assert_eq!(State::from_toml_str(&toml_str).unwrap(), state);
    }

    #[test]
    fn test_from_toml_rejects_short_array() {
        let mut value: toml::Table = toml::from_str(&State::new().to_toml_string().unwrap()).unwrap();
        value.insert(
            "fpst".to_string(),
            toml::Value::Array(vec![toml::Value::String("0x0".to_string())]),
        );
        assert!(State::from_toml_str(&toml::to_string(&value).unwrap()).is_err());
    }
}
