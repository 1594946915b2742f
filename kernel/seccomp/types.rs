//! Classic BPF encoding, the seccomp input record and filter actions.

use core::fmt;

// ============================================================================
// Instruction encoding
// ============================================================================

// Instruction classes.
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

// Load sizes.
pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;

// Load modes.
pub const BPF_IMM: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_IND: u16 = 0x40;
pub const BPF_MEM: u16 = 0x60;
pub const BPF_LEN: u16 = 0x80;

// ALU operations.
pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_NEG: u16 = 0x80;
pub const BPF_MOD: u16 = 0x90;
pub const BPF_XOR: u16 = 0xA0;

// Jump operations.
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;

// Operand source.
pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;

// Return operand.
pub const BPF_A: u16 = 0x10;

// MISC operations.
pub const BPF_TAX: u16 = 0x00;
pub const BPF_TXA: u16 = 0x80;

/// Scratch memory words.
pub const BPF_MEMWORDS: usize = 16;
/// Longest accepted program.
pub const BPF_MAXINSNS: usize = 4096;

#[inline]
pub const fn bpf_class(code: u16) -> u16 {
    code & 0x07
}

#[inline]
pub const fn bpf_size(code: u16) -> u16 {
    code & 0x18
}

#[inline]
pub const fn bpf_mode(code: u16) -> u16 {
    code & 0xE0
}

#[inline]
pub const fn bpf_op(code: u16) -> u16 {
    code & 0xF0
}

#[inline]
pub const fn bpf_src(code: u16) -> u16 {
    code & 0x08
}

#[inline]
pub const fn bpf_rval(code: u16) -> u16 {
    code & 0x18
}

#[inline]
pub const fn bpf_miscop(code: u16) -> u16 {
    code & 0xF8
}

/// One classic BPF instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

/// Bytes per encoded instruction.
pub const SOCK_FILTER_SIZE: usize = 8;

impl SockFilter {
    /// Non-branching instruction.
    pub const fn stmt(code: u16, k: u32) -> Self {
        SockFilter { code, jt: 0, jf: 0, k }
    }

    /// Conditional jump.
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        SockFilter { code, jt, jf, k }
    }

    /// Little-endian `{u16 code, u8 jt, u8 jf, u32 k}`.
    pub fn to_bytes(&self) -> [u8; SOCK_FILTER_SIZE] {
        let mut out = [0u8; SOCK_FILTER_SIZE];
        out[0..2].copy_from_slice(&self.code.to_le_bytes());
        out[2] = self.jt;
        out[3] = self.jf;
        out[4..8].copy_from_slice(&self.k.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; SOCK_FILTER_SIZE]) -> Self {
        SockFilter {
            code: u16::from_le_bytes([bytes[0], bytes[1]]),
            jt: bytes[2],
            jf: bytes[3],
            k: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

// ============================================================================
// Input record
// ============================================================================

/// `AUDIT_ARCH_X86_64`: EM_X86_64 | 64-bit | little-endian.
pub const AUDIT_ARCH_X86_64: u32 = 0xC000_003E;

/// Size of the record filters read from.
pub const SECCOMP_DATA_SIZE: usize = 64;

pub const SECCOMP_DATA_NR: u32 = 0;
pub const SECCOMP_DATA_ARCH: u32 = 4;
pub const SECCOMP_DATA_IP: u32 = 8;
pub const SECCOMP_DATA_ARGS: u32 = 16;

/// Offset of the low word of argument `n`.
pub const fn arg_offset(n: u32) -> u32 {
    SECCOMP_DATA_ARGS + 8 * n
}

/// What a filter sees about one syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeccompData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

impl SeccompData {
    pub const fn new(nr: i32, instruction_pointer: u64, args: [u64; 6]) -> Self {
        SeccompData {
            nr,
            arch: AUDIT_ARCH_X86_64,
            instruction_pointer,
            args,
        }
    }

    /// Native (little-endian) byte image of the record.
    pub fn to_bytes(&self) -> [u8; SECCOMP_DATA_SIZE] {
        let mut out = [0u8; SECCOMP_DATA_SIZE];
        out[0..4].copy_from_slice(&self.nr.to_le_bytes());
        out[4..8].copy_from_slice(&self.arch.to_le_bytes());
        out[8..16].copy_from_slice(&self.instruction_pointer.to_le_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            let at = 16 + i * 8;
            out[at..at + 8].copy_from_slice(&arg.to_le_bytes());
        }
        out
    }

    /// 32-bit word at byte `offset`, or `None` past the record or unaligned.
    pub fn load_word(&self, offset: u32) -> Option<u32> {
        let offset = offset as usize;
        if offset % 4 != 0 || offset + 4 > SECCOMP_DATA_SIZE {
            return None;
        }
        let bytes = self.to_bytes();
        Some(u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]]))
    }
}

// ============================================================================
// Actions
// ============================================================================

pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_KILL_THREAD: u32 = 0x0000_0000;
pub const SECCOMP_RET_KILL: u32 = SECCOMP_RET_KILL_THREAD;
pub const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_LOG: u32 = 0x7FFC_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7FFF_0000;

pub const SECCOMP_RET_ACTION_FULL: u32 = 0xFFFF_0000;
pub const SECCOMP_RET_DATA: u32 = 0x0000_FFFF;

/// Action to take for a filtered syscall.
///
/// Actions have a severity ordering: Kill > Trap > Errno > Log > Allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeccompAction {
    /// Syscall proceeds.
    #[default]
    Allow,
    /// Audit record emitted, syscall proceeds.
    Log,
    /// Syscall returns the encoded errno without running.
    Errno(u16),
    /// Synchronous SIGSYS; the low 16 bits travel with the signal.
    Trap(u16),
    /// Caller terminated.
    Kill,
}

impl SeccompAction {
    /// Decode a filter return value.  Unknown actions decode as `Kill`.
    pub const fn from_ret(ret: u32) -> Self {
        let data = (ret & SECCOMP_RET_DATA) as u16;
        match ret & SECCOMP_RET_ACTION_FULL {
            SECCOMP_RET_ALLOW => SeccompAction::Allow,
            SECCOMP_RET_LOG => SeccompAction::Log,
            SECCOMP_RET_ERRNO => SeccompAction::Errno(data),
            SECCOMP_RET_TRAP => SeccompAction::Trap(data),
            _ => SeccompAction::Kill,
        }
    }

    /// Encode as a filter return value.
    pub const fn to_ret(self) -> u32 {
        match self {
            SeccompAction::Allow => SECCOMP_RET_ALLOW,
            SeccompAction::Log => SECCOMP_RET_LOG,
            SeccompAction::Errno(e) => SECCOMP_RET_ERRNO | e as u32,
            SeccompAction::Trap(d) => SECCOMP_RET_TRAP | d as u32,
            SeccompAction::Kill => SECCOMP_RET_KILL_PROCESS,
        }
    }

    /// Higher is more restrictive.
    #[inline]
    pub const fn severity(&self) -> u8 {
        match self {
            SeccompAction::Allow => 0,
            SeccompAction::Log => 1,
            SeccompAction::Errno(_) => 2,
            SeccompAction::Trap(_) => 3,
            SeccompAction::Kill => 4,
        }
    }

    #[inline]
    pub fn more_restrictive_than(&self, other: &SeccompAction) -> bool {
        self.severity() > other.severity()
    }

    /// Whether the syscall body runs.
    pub const fn proceeds(&self) -> bool {
        matches!(self, SeccompAction::Allow | SeccompAction::Log)
    }
}

impl fmt::Display for SeccompAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeccompAction::Allow => write!(f, "allow"),
            SeccompAction::Log => write!(f, "log"),
            SeccompAction::Errno(e) => write!(f, "errno({})", e),
            SeccompAction::Trap(d) => write!(f, "trap({})", d),
            SeccompAction::Kill => write!(f, "kill"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let data = SeccompData::new(62, 0x4000_1000, [1, 2, 3, 4, 5, 0x1_0000_0006]);
        assert_eq!(data.load_word(SECCOMP_DATA_NR), Some(62));
        assert_eq!(data.load_word(SECCOMP_DATA_ARCH), Some(AUDIT_ARCH_X86_64));
        assert_eq!(data.load_word(SECCOMP_DATA_IP), Some(0x4000_1000));
        assert_eq!(data.load_word(SECCOMP_DATA_IP + 4), Some(0));
        assert_eq!(data.load_word(arg_offset(0)), Some(1));
        assert_eq!(data.load_word(arg_offset(5)), Some(6));
        assert_eq!(data.load_word(arg_offset(5) + 4), Some(1));
        assert_eq!(data.load_word(60), Some(1));
        assert_eq!(data.load_word(64), None);
        assert_eq!(data.load_word(2), None);
    }

    #[test]
    fn test_action_decoding() {
        assert_eq!(SeccompAction::from_ret(SECCOMP_RET_ALLOW), SeccompAction::Allow);
        assert_eq!(SeccompAction::from_ret(SECCOMP_RET_KILL), SeccompAction::Kill);
        assert_eq!(SeccompAction::from_ret(SECCOMP_RET_KILL_PROCESS), SeccompAction::Kill);
        assert_eq!(SeccompAction::from_ret(SECCOMP_RET_ERRNO | 13), SeccompAction::Errno(13));
        assert_eq!(SeccompAction::from_ret(SECCOMP_RET_TRAP | 7), SeccompAction::Trap(7));
        assert_eq!(SeccompAction::from_ret(SECCOMP_RET_LOG), SeccompAction::Log);
        assert_eq!(SeccompAction::from_ret(0x1234_0000), SeccompAction::Kill);
        assert_eq!(SeccompAction::from_ret(SeccompAction::Errno(1).to_ret()), SeccompAction::Errno(1));
    }

    #[test]
    fn test_severity_order() {
        assert!(SeccompAction::Kill.more_restrictive_than(&SeccompAction::Trap(0)));
        assert!(SeccompAction::Trap(0).more_restrictive_than(&SeccompAction::Errno(1)));
        assert!(SeccompAction::Errno(1).more_restrictive_than(&SeccompAction::Log));
        assert!(SeccompAction::Log.more_restrictive_than(&SeccompAction::Allow));
        assert!(SeccompAction::Log.proceeds());
        assert!(!SeccompAction::Errno(1).proceeds());
    }

    #[test]
    fn test_instruction_wire_format() {
        let insn = SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 62, 1, 0);
        let bytes = insn.to_bytes();
        assert_eq!(bytes, [0x15, 0x00, 1, 0, 62, 0, 0, 0]);
        assert_eq!(SockFilter::from_bytes(&bytes), insn);
    }
}
