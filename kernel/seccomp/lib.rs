//! Seccomp syscall filtering.
//!
//! Filters are classic BPF programs run over a [`SeccompData`] record.  The
//! validator proves every accepted program acyclic and in bounds, so the
//! interpreter executes at most `len` instructions per syscall and never
//! needs a step budget.
//!
//! # Execution model
//!
//! One 32-bit accumulator `A`, one index register `X`, sixteen scratch
//! words, and a program counter that only moves forward.  Anything the
//! validator would have rejected but that is met at run time anyway (a bad
//! opcode, a load past the record, division by a zero `X`) aborts with
//! [`SeccompAction::Kill`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

pub mod types;

pub use types::*;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeccompError {
    /// Zero-length program.
    EmptyProgram,
    /// More than [`BPF_MAXINSNS`] instructions.
    ProgramTooLong,
    /// Unknown or unsupported opcode.
    InvalidInstruction { pc: usize },
    /// Jump lands past the end of the program.
    InvalidJump { pc: usize },
    /// Jump lands on itself or an earlier instruction.
    BackEdge { pc: usize },
    /// Absolute load outside the record, unaligned, or bad scratch index.
    InvalidLoad { pc: usize },
    /// Constant divisor or modulus of zero.
    DivisionByZero { pc: usize },
    /// Control can run off the end without a `RET`.
    NoTerminator,
    /// Wire image is not a whole number of instructions.
    BadLength,
    /// The target context may not carry a filter.
    NotPermitted,
}

impl fmt::Display for SeccompError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeccompError::EmptyProgram => write!(f, "seccomp: empty program"),
            SeccompError::ProgramTooLong => write!(f, "seccomp: program too long"),
            SeccompError::InvalidInstruction { pc } => write!(f, "seccomp: invalid instruction at {}", pc),
            SeccompError::InvalidJump { pc } => write!(f, "seccomp: jump out of range at {}", pc),
            SeccompError::BackEdge { pc } => write!(f, "seccomp: backward jump at {}", pc),
            SeccompError::InvalidLoad { pc } => write!(f, "seccomp: invalid load at {}", pc),
            SeccompError::DivisionByZero { pc } => write!(f, "seccomp: division by zero at {}", pc),
            SeccompError::NoTerminator => write!(f, "seccomp: program doesn't terminate"),
            SeccompError::BadLength => write!(f, "seccomp: truncated program image"),
            SeccompError::NotPermitted => write!(f, "seccomp: operation not permitted"),
        }
    }
}

pub type Result<T> = core::result::Result<T, SeccompError>;

// ============================================================================
// Validation
// ============================================================================

/// Control-flow successors of the instruction at `pc`, as absolute indices.
///
/// Computed in wide signed arithmetic so a malformed displacement can never
/// wrap around into range.
fn successors(pc: usize, insn: &SockFilter) -> (Option<i64>, Option<i64>) {
    let next = pc as i64 + 1;
    match bpf_class(insn.code) {
        BPF_RET => (None, None),
        BPF_JMP if bpf_op(insn.code) == BPF_JA => (Some(next + insn.k as i64), None),
        BPF_JMP => (Some(next + insn.jt as i64), Some(next + insn.jf as i64)),
        _ => (Some(next), None),
    }
}

/// Per-instruction static checks.
fn check_instruction(pc: usize, insn: &SockFilter) -> Result<()> {
    let code = insn.code;
    let k = insn.k;
    let ok = match bpf_class(code) {
        BPF_LD => match (bpf_size(code), bpf_mode(code)) {
            (BPF_W, BPF_ABS) => {
                if k % 4 != 0 || k as usize + 4 > SECCOMP_DATA_SIZE {
                    return Err(SeccompError::InvalidLoad { pc });
                }
                true
            }
            (BPF_W, BPF_LEN) | (BPF_W, BPF_IMM) => true,
            (BPF_W, BPF_MEM) => {
                if k as usize >= BPF_MEMWORDS {
                    return Err(SeccompError::InvalidLoad { pc });
                }
                true
            }
            _ => false,
        },
        BPF_LDX => match (bpf_size(code), bpf_mode(code)) {
            (BPF_W, BPF_IMM) | (BPF_W, BPF_LEN) => true,
            (BPF_W, BPF_MEM) => {
                if k as usize >= BPF_MEMWORDS {
                    return Err(SeccompError::InvalidLoad { pc });
                }
                true
            }
            _ => false,
        },
        BPF_ST | BPF_STX => {
            if code & !0x07 != 0 {
                false
            } else if k as usize >= BPF_MEMWORDS {
                return Err(SeccompError::InvalidLoad { pc });
            } else {
                true
            }
        }
        BPF_ALU => match bpf_op(code) {
            BPF_DIV | BPF_MOD if bpf_src(code) == BPF_K && k == 0 => {
                return Err(SeccompError::DivisionByZero { pc });
            }
            BPF_LSH | BPF_RSH if bpf_src(code) == BPF_K && k >= 32 => false,
            BPF_NEG => bpf_src(code) == BPF_K,
            BPF_ADD | BPF_SUB | BPF_MUL | BPF_DIV | BPF_OR | BPF_AND | BPF_LSH | BPF_RSH | BPF_MOD
            | BPF_XOR => true,
            _ => false,
        },
        BPF_JMP => match bpf_op(code) {
            BPF_JA => bpf_src(code) == BPF_K,
            BPF_JEQ | BPF_JGT | BPF_JGE | BPF_JSET => true,
            _ => false,
        },
        BPF_RET => matches!(bpf_rval(code), BPF_K | BPF_A) && code & 0xE0 == 0,
        BPF_MISC => matches!(bpf_miscop(code), BPF_TAX | BPF_TXA) && code & 0x07 == BPF_MISC,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(SeccompError::InvalidInstruction { pc })
    }
}

/// Validate a program.
///
/// Rejects empty and oversized programs, unknown opcodes, loads outside the
/// input record, out-of-range jump targets, back-edges, and any reachable
/// path that can fall off the end.  An accepted program executes at most
/// `prog.len()` instructions on every input.
pub fn validate(prog: &[SockFilter]) -> Result<()> {
    if prog.is_empty() {
        return Err(SeccompError::EmptyProgram);
    }
    if prog.len() > BPF_MAXINSNS {
        return Err(SeccompError::ProgramTooLong);
    }

    for (pc, insn) in prog.iter().enumerate() {
        check_instruction(pc, insn)?;
    }

    // Forward reachability: pc only increases, so a single ascending sweep
    // visits every reachable instruction after all of its predecessors.
    let len = prog.len() as i64;
    let mut reachable = vec![false; prog.len()];
    reachable[0] = true;
    for pc in 0..prog.len() {
        if !reachable[pc] {
            continue;
        }
        let (first, second) = successors(pc, &prog[pc]);
        for target in [first, second].into_iter().flatten() {
            if target <= pc as i64 {
                return Err(SeccompError::BackEdge { pc });
            }
            if target >= len {
                // Straight-line code running past the end has no RET.
                return Err(if bpf_class(prog[pc].code) == BPF_JMP {
                    SeccompError::InvalidJump { pc }
                } else {
                    SeccompError::NoTerminator
                });
            }
            reachable[target as usize] = true;
        }
    }
    Ok(())
}

/// Decode a wire image of 8-byte instructions.
pub fn decode_program(bytes: &[u8]) -> Result<Vec<SockFilter>> {
    if bytes.len() % SOCK_FILTER_SIZE != 0 {
        return Err(SeccompError::BadLength);
    }
    Ok(bytes
        .chunks_exact(SOCK_FILTER_SIZE)
        .map(|chunk| {
            let mut raw = [0u8; SOCK_FILTER_SIZE];
            raw.copy_from_slice(chunk);
            SockFilter::from_bytes(&raw)
        })
        .collect())
}

// ============================================================================
// Interpreter
// ============================================================================

/// Result of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    /// Raw 32-bit return value.
    pub ret: u32,
    /// Instructions executed, including the final `RET`.
    pub steps: usize,
}

impl Execution {
    pub const fn action(&self) -> SeccompAction {
        SeccompAction::from_ret(self.ret)
    }
}

const ABORT: u32 = SECCOMP_RET_KILL_PROCESS;

/// Run `prog` over `data`.
///
/// Safe on unvalidated input: every fault returns a kill.
pub fn run(prog: &[SockFilter], data: &SeccompData) -> Execution {
    let mut a: u32 = 0;
    let mut x: u32 = 0;
    let mut mem = [0u32; BPF_MEMWORDS];
    let mut pc: usize = 0;
    let mut steps: usize = 0;

    let abort = |steps| Execution { ret: ABORT, steps };

    while let Some(insn) = prog.get(pc) {
        steps += 1;
        let k = insn.k;
        let code = insn.code;
        pc += 1;
        match bpf_class(code) {
            BPF_LD => match bpf_mode(code) {
                BPF_ABS if bpf_size(code) == BPF_W => match data.load_word(k) {
                    Some(word) => a = word,
                    None => return abort(steps),
                },
                BPF_LEN => a = SECCOMP_DATA_SIZE as u32,
                BPF_IMM => a = k,
                BPF_MEM => match mem.get(k as usize) {
                    Some(word) => a = *word,
                    None => return abort(steps),
                },
                _ => return abort(steps),
            },
            BPF_LDX => match bpf_mode(code) {
                BPF_LEN => x = SECCOMP_DATA_SIZE as u32,
                BPF_IMM => x = k,
                BPF_MEM => match mem.get(k as usize) {
                    Some(word) => x = *word,
                    None => return abort(steps),
                },
                _ => return abort(steps),
            },
            BPF_ST | BPF_STX => {
                let value = if bpf_class(code) == BPF_ST { a } else { x };
                match mem.get_mut(k as usize) {
                    Some(slot) => *slot = value,
                    None => return abort(steps),
                }
            }
            BPF_ALU => {
                let operand = if bpf_src(code) == BPF_X { x } else { k };
                a = match bpf_op(code) {
                    BPF_ADD => a.wrapping_add(operand),
                    BPF_SUB => a.wrapping_sub(operand),
                    BPF_MUL => a.wrapping_mul(operand),
                    BPF_DIV => match a.checked_div(operand) {
                        Some(v) => v,
                        None => return abort(steps),
                    },
                    BPF_MOD => match a.checked_rem(operand) {
                        Some(v) => v,
                        None => return abort(steps),
                    },
                    BPF_OR => a | operand,
                    BPF_AND => a & operand,
                    BPF_XOR => a ^ operand,
                    BPF_LSH => a.checked_shl(operand).unwrap_or(0),
                    BPF_RSH => a.checked_shr(operand).unwrap_or(0),
                    BPF_NEG => a.wrapping_neg(),
                    _ => return abort(steps),
                };
            }
            BPF_JMP => {
                let operand = if bpf_src(code) == BPF_X { x } else { k };
                let offset = match bpf_op(code) {
                    BPF_JA => k as usize,
                    BPF_JEQ => branch(a == operand, insn),
                    BPF_JGT => branch(a > operand, insn),
                    BPF_JGE => branch(a >= operand, insn),
                    BPF_JSET => branch(a & operand != 0, insn),
                    _ => return abort(steps),
                };
                pc = match pc.checked_add(offset) {
                    Some(target) => target,
                    None => return abort(steps),
                };
            }
            BPF_RET => {
                let ret = match bpf_rval(code) {
                    BPF_K => k,
                    BPF_A => a,
                    _ => ABORT,
                };
                return Execution { ret, steps };
            }
            BPF_MISC => match bpf_miscop(code) {
                BPF_TAX => x = a,
                BPF_TXA => a = x,
                _ => return abort(steps),
            },
            _ => return abort(steps),
        }
    }
    // Fell off the end.
    abort(steps)
}

#[inline]
fn branch(taken: bool, insn: &SockFilter) -> usize {
    if taken {
        insn.jt as usize
    } else {
        insn.jf as usize
    }
}

// ============================================================================
// Filters
// ============================================================================

static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

/// A validated, immutable filter.  Shared by reference between a parent and
/// its forked children.
#[derive(Debug)]
pub struct SeccompFilter {
    id: u64,
    prog: Vec<SockFilter>,
}

impl SeccompFilter {
    /// Validate and wrap a program.
    pub fn new(prog: Vec<SockFilter>) -> Result<Self> {
        validate(&prog)?;
        Ok(SeccompFilter {
            id: NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed),
            prog,
        })
    }

    /// Decode and validate a wire image.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::new(decode_program(bytes)?)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.prog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prog.is_empty()
    }

    pub fn program(&self) -> &[SockFilter] {
        &self.prog
    }

    pub fn execute(&self, data: &SeccompData) -> Execution {
        run(&self.prog, data)
    }

    pub fn evaluate(&self, data: &SeccompData) -> SeccompAction {
        self.execute(data).action()
    }
}

/// Shared handle stored in a context.
pub type FilterRef = Arc<SeccompFilter>;

// ============================================================================
// Filter builders
// ============================================================================

/// `LD arch; JEQ x86_64 ? next : kill`.
fn arch_check(prog: &mut Vec<SockFilter>) {
    prog.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_ARCH));
    prog.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_X86_64, 1, 0));
    prog.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
}

/// Syscalls that stay legal in strict mode.
pub const STRICT_SYSCALLS: [u32; 4] = [0, 1, 60, 231];

/// Strict mode: read, write, exit, exit_group; everything else kills.
pub fn strict_filter() -> SeccompFilter {
    allow_list(&STRICT_SYSCALLS, SeccompAction::Kill)
}

/// Allow `nrs`, apply `default` to every other syscall.
pub fn allow_list(nrs: &[u32], default: SeccompAction) -> SeccompFilter {
    match_list(nrs, SeccompAction::Allow, default)
}

/// Apply `action` to `nrs`, allow everything else.
pub fn deny_list(nrs: &[u32], action: SeccompAction) -> SeccompFilter {
    match_list(nrs, action, SeccompAction::Allow)
}

/// Arch check, then one `JEQ` per syscall jumping to a shared match `RET`.
fn match_list(nrs: &[u32], on_match: SeccompAction, otherwise: SeccompAction) -> SeccompFilter {
    // Keep every jump displacement within a u8.
    let nrs = &nrs[..nrs.len().min(u8::MAX as usize - 1)];
    let mut prog = Vec::with_capacity(nrs.len() + 6);
    arch_check(&mut prog);
    prog.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR));
    for (i, &nr) in nrs.iter().enumerate() {
        // Remaining compares, then skip the fallthrough RET.
        let to_match = (nrs.len() - i) as u8;
        prog.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr, to_match, 0));
    }
    prog.push(SockFilter::stmt(BPF_RET | BPF_K, otherwise.to_ret()));
    prog.push(SockFilter::stmt(BPF_RET | BPF_K, on_match.to_ret()));

    SeccompFilter {
        id: NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed),
        prog,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(nr: i32) -> SeccompData {
        SeccompData::new(nr, 0x40_0000, [0; 6])
    }

    fn deny_62() -> Vec<SockFilter> {
        vec![
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, 0),
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 62, 1, 0),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL),
        ]
    }

    #[test]
    fn test_deny_one_syscall() {
        let filter = SeccompFilter::new(deny_62()).unwrap();
        assert_eq!(filter.evaluate(&data(62)), SeccompAction::Kill);
        assert_eq!(filter.evaluate(&data(1)), SeccompAction::Allow);
    }

    #[test]
    fn test_validator_rejections() {
        assert_eq!(validate(&[]), Err(SeccompError::EmptyProgram));

        let too_long = vec![SockFilter::stmt(BPF_RET | BPF_K, 0); BPF_MAXINSNS + 1];
        assert_eq!(validate(&too_long), Err(SeccompError::ProgramTooLong));

        let past_record = [
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, 64),
            SockFilter::stmt(BPF_RET | BPF_A, 0),
        ];
        assert_eq!(validate(&past_record), Err(SeccompError::InvalidLoad { pc: 0 }));

        let unaligned = [
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, 2),
            SockFilter::stmt(BPF_RET | BPF_A, 0),
        ];
        assert_eq!(validate(&unaligned), Err(SeccompError::InvalidLoad { pc: 0 }));

        let out_of_range = [
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 1, 5, 0),
            SockFilter::stmt(BPF_RET | BPF_K, 0),
        ];
        assert_eq!(validate(&out_of_range), Err(SeccompError::InvalidJump { pc: 0 }));

        let falls_off = [SockFilter::stmt(BPF_LD | BPF_W | BPF_IMM, 1)];
        assert_eq!(validate(&falls_off), Err(SeccompError::NoTerminator));

        let bad_opcode = [SockFilter::stmt(0xFFFF, 0)];
        assert_eq!(validate(&bad_opcode), Err(SeccompError::InvalidInstruction { pc: 0 }));

        let byte_load = [
            SockFilter::stmt(BPF_LD | BPF_B | BPF_ABS, 0),
            SockFilter::stmt(BPF_RET | BPF_A, 0),
        ];
        assert_eq!(validate(&byte_load), Err(SeccompError::InvalidInstruction { pc: 0 }));

        let div_zero = [
            SockFilter::stmt(BPF_ALU | BPF_DIV | BPF_K, 0),
            SockFilter::stmt(BPF_RET | BPF_A, 0),
        ];
        assert_eq!(validate(&div_zero), Err(SeccompError::DivisionByZero { pc: 0 }));

        let bad_scratch = [
            SockFilter::stmt(BPF_ST, 16),
            SockFilter::stmt(BPF_RET | BPF_A, 0),
        ];
        assert_eq!(validate(&bad_scratch), Err(SeccompError::InvalidLoad { pc: 0 }));
    }

    #[test]
    fn test_ja_wraparound_is_rejected() {
        // A huge JA displacement must not wrap back into the program.
        let prog = [
            SockFilter::stmt(BPF_JMP | BPF_JA, u32::MAX),
            SockFilter::stmt(BPF_RET | BPF_K, 0),
        ];
        assert_eq!(validate(&prog), Err(SeccompError::InvalidJump { pc: 0 }));
    }

    #[test]
    fn test_unreachable_tail_is_allowed() {
        // Trailing instruction after RET is never executed.
        let prog = [
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
            SockFilter::stmt(BPF_LD | BPF_W | BPF_IMM, 0),
        ];
        assert!(validate(&prog).is_ok());
    }

    #[test]
    fn test_alu_and_scratch() {
        // ((nr + 3) * 2) stored, reloaded into X, returned as errno via A.
        let prog = vec![
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR),
            SockFilter::stmt(BPF_ALU | BPF_ADD | BPF_K, 3),
            SockFilter::stmt(BPF_ALU | BPF_MUL | BPF_K, 2),
            SockFilter::stmt(BPF_ST, 5),
            SockFilter::stmt(BPF_LDX | BPF_W | BPF_MEM, 5),
            SockFilter::stmt(BPF_LD | BPF_W | BPF_IMM, SECCOMP_RET_ERRNO),
            SockFilter::stmt(BPF_ALU | BPF_OR | BPF_X, 0),
            SockFilter::stmt(BPF_RET | BPF_A, 0),
        ];
        let filter = SeccompFilter::new(prog).unwrap();
        assert_eq!(filter.evaluate(&data(4)), SeccompAction::Errno(14));
    }

    #[test]
    fn test_runtime_division_by_zero_kills() {
        let prog = vec![
            SockFilter::stmt(BPF_LDX | BPF_W | BPF_IMM, 0),
            SockFilter::stmt(BPF_LD | BPF_W | BPF_IMM, 10),
            SockFilter::stmt(BPF_ALU | BPF_DIV | BPF_X, 0),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
        ];
        let filter = SeccompFilter::new(prog).unwrap();
        assert_eq!(filter.evaluate(&data(0)), SeccompAction::Kill);
    }

    #[test]
    fn test_unvalidated_bad_load_kills() {
        let prog = [
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, 4096),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
        ];
        let exec = run(&prog, &data(0));
        assert_eq!(exec.action(), SeccompAction::Kill);
        assert_eq!(exec.steps, 1);
    }

    #[test]
    fn test_jset_and_jgt() {
        let prog = vec![
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, arg_offset(0)),
            SockFilter::jump(BPF_JMP | BPF_JSET | BPF_K, 0x4, 0, 1),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ERRNO | 1),
            SockFilter::jump(BPF_JMP | BPF_JGT | BPF_K, 100, 0, 1),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_TRAP),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_LOG),
        ];
        let filter = SeccompFilter::new(prog).unwrap();
        let with_arg = |arg0| SeccompData::new(9, 0, [arg0, 0, 0, 0, 0, 0]);
        assert_eq!(filter.evaluate(&with_arg(0x4)), SeccompAction::Errno(1));
        assert_eq!(filter.evaluate(&with_arg(200)), SeccompAction::Trap(0));
        assert_eq!(filter.evaluate(&with_arg(3)), SeccompAction::Log);
    }

    #[test]
    fn test_wire_decoding() {
        let bytes: Vec<u8> = deny_62().iter().flat_map(|i| i.to_bytes()).collect();
        let filter = SeccompFilter::from_bytes(&bytes).unwrap();
        assert_eq!(filter.program(), &deny_62()[..]);
        assert_eq!(SeccompFilter::from_bytes(&bytes[..7]).unwrap_err(), SeccompError::BadLength);
        assert_eq!(SeccompFilter::from_bytes(&[]).unwrap_err(), SeccompError::EmptyProgram);
    }

    #[test]
    fn test_builders() {
        let strict = strict_filter();
        assert!(validate(strict.program()).is_ok());
        assert_eq!(strict.evaluate(&data(1)), SeccompAction::Allow);
        assert_eq!(strict.evaluate(&data(60)), SeccompAction::Allow);
        assert_eq!(strict.evaluate(&data(57)), SeccompAction::Kill);

        let deny = deny_list(&[62, 170], SeccompAction::Errno(1));
        assert!(validate(deny.program()).is_ok());
        assert_eq!(deny.evaluate(&data(170)), SeccompAction::Errno(1));
        assert_eq!(deny.evaluate(&data(62)), SeccompAction::Errno(1));
        assert_eq!(deny.evaluate(&data(39)), SeccompAction::Allow);

        let mut foreign = data(39);
        foreign.arch = 0x4000_0003;
        assert_eq!(deny.evaluate(&foreign), SeccompAction::Kill);
        assert_ne!(strict.id(), deny.id());
    }

    /// Small deterministic generator for program fuzzing.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u32 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) as u32
        }
    }

    #[test]
    fn test_accepted_programs_terminate_within_len() {
        const CODES: [u16; 14] = [
            BPF_LD | BPF_W | BPF_ABS,
            BPF_LD | BPF_W | BPF_IMM,
            BPF_LD | BPF_W | BPF_LEN,
            BPF_LDX | BPF_W | BPF_IMM,
            BPF_ALU | BPF_ADD | BPF_K,
            BPF_ALU | BPF_AND | BPF_X,
            BPF_ALU | BPF_DIV | BPF_X,
            BPF_MISC | BPF_TAX,
            BPF_JMP | BPF_JEQ | BPF_K,
            BPF_JMP | BPF_JGE | BPF_X,
            BPF_JMP | BPF_JSET | BPF_K,
            BPF_JMP | BPF_JA,
            BPF_RET | BPF_K,
            BPF_RET | BPF_A,
        ];
        let mut rng = Lcg(0x5EC0_3317);
        let mut accepted = 0;
        for _ in 0..2000 {
            let len = 1 + (rng.next() % 24) as usize;
            let prog: Vec<SockFilter> = (0..len)
                .map(|_| {
                    let code = CODES[(rng.next() as usize) % CODES.len()];
                    let k = if code == (BPF_LD | BPF_W | BPF_ABS) {
                        (rng.next() % 16) * 4
                    } else {
                        rng.next() % 8
                    };
                    SockFilter::jump(code, k, (rng.next() % 4) as u8, (rng.next() % 4) as u8)
                })
                .collect();
            if validate(&prog).is_err() {
                continue;
            }
            accepted += 1;
            for nr in 0..8 {
                let input = SeccompData::new(nr, rng.next() as u64, [rng.next() as u64; 6]);
                assert!(run(&prog, &input).steps <= prog.len());
            }
        }
        assert!(accepted > 0);
    }
}
