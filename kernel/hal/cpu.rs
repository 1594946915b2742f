//! CPU topology and interrupt-flag primitives.
//!
//! On bare-metal x86_64 the interrupt primitives are the real `sti`/`cli`
//! wrappers from the `x86_64` crate.  Everywhere else they drive a software
//! flag so the same critical-section discipline compiles and runs.

use crate::platform::Platform;

/// Raw CPUID register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cpuid {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

// ============================================================================
// Interrupt primitives
// ============================================================================

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    use x86_64::instructions::interrupts;

    #[inline]
    pub fn enable() {
        interrupts::enable();
    }

    #[inline]
    pub fn disable() {
        interrupts::disable();
    }

    #[inline]
    pub fn enabled() -> bool {
        interrupts::are_enabled()
    }

    #[inline]
    pub fn without<F: FnOnce() -> R, R>(f: F) -> R {
        interrupts::without_interrupts(f)
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    use super::SoftInterruptFlag;

    static FLAG: SoftInterruptFlag = SoftInterruptFlag::new();

    #[inline]
    pub fn enable() {
        FLAG.enable();
    }

    #[inline]
    pub fn disable() {
        FLAG.disable();
    }

    #[inline]
    pub fn enabled() -> bool {
        FLAG.enabled()
    }

    #[inline]
    pub fn without<F: FnOnce() -> R, R>(f: F) -> R {
        FLAG.without(f)
    }
}

/// Software stand-in for RFLAGS.IF.  Starts disabled, as after reset.
pub struct SoftInterruptFlag {
    enabled: core::sync::atomic::AtomicBool,
}

impl SoftInterruptFlag {
    pub const fn new() -> Self {
        SoftInterruptFlag {
            enabled: core::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, core::sync::atomic::Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, core::sync::atomic::Ordering::SeqCst);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(core::sync::atomic::Ordering::SeqCst)
    }

    /// Run `f` with the flag cleared, restoring the previous value.
    pub fn without<F: FnOnce() -> R, R>(&self, f: F) -> R {
        let was_enabled = self.enabled.swap(false, core::sync::atomic::Ordering::SeqCst);
        let result = f();
        if was_enabled {
            self.enable();
        }
        result
    }
}

impl Default for SoftInterruptFlag {
    fn default() -> Self {
        Self::new()
    }
}

pub fn enable_interrupts() {
    arch::enable();
}

pub fn disable_interrupts() {
    arch::disable();
}

pub fn interrupts_enabled() -> bool {
    arch::enabled()
}

/// Run `f` inside an interrupts-disabled critical section.
#[inline]
pub fn without_interrupts<F: FnOnce() -> R, R>(f: F) -> R {
    arch::without(f)
}

// ============================================================================
// Topology
// ============================================================================

const LEAF_VENDOR: u32 = 0x0;
const LEAF_FEATURES: u32 = 0x1;
const LEAF_CACHE_PARAMS: u32 = 0x4;
const LEAF_EXT_TOPOLOGY: u32 = 0xB;

const LEVEL_TYPE_SMT: u32 = 1;
const LEVEL_TYPE_CORE: u32 = 2;

/// CPUID.1:EDX[28], logical-processor count field valid.
const FEATURE_HTT: u32 = 1 << 28;

/// Processor topology.  Every field is at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTopology {
    pub packages: u32,
    pub cores_per_package: u32,
    pub threads_per_core: u32,
}

impl CpuTopology {
    pub const SINGLE: CpuTopology = CpuTopology {
        packages: 1,
        cores_per_package: 1,
        threads_per_core: 1,
    };

    pub fn logical_cpus(&self) -> u32 {
        self.packages * self.cores_per_package * self.threads_per_core
    }

    /// Detect topology from CPUID, preferring the extended topology leaf.
    pub fn detect(platform: &dyn Platform) -> CpuTopology {
        let Some(max_leaf) = platform.cpuid(LEAF_VENDOR, 0).map(|r| r.eax) else {
            return Self::SINGLE;
        };

        if max_leaf >= LEAF_EXT_TOPOLOGY {
            if let Some(topology) = Self::from_extended_leaf(platform) {
                return topology;
            }
        }
        if max_leaf >= LEAF_FEATURES {
            if let Some(topology) = Self::from_legacy_leaves(platform, max_leaf) {
                return topology;
            }
        }
        Self::SINGLE
    }

    fn from_extended_leaf(platform: &dyn Platform) -> Option<CpuTopology> {
        let mut smt = 0;
        let mut core = 0;
        for subleaf in 0..8 {
            let r = platform.cpuid(LEAF_EXT_TOPOLOGY, subleaf)?;
            let level_type = (r.ecx >> 8) & 0xFF;
            if level_type == 0 {
                break;
            }
            let logical = r.ebx & 0xFFFF;
            match level_type {
                LEVEL_TYPE_SMT => smt = logical,
                LEVEL_TYPE_CORE => core = logical,
                _ => {}
            }
        }
        if smt == 0 || core == 0 {
            return None;
        }
        Some(CpuTopology {
            packages: 1,
            cores_per_package: (core / smt).max(1),
            threads_per_core: smt,
        })
    }

    fn from_legacy_leaves(platform: &dyn Platform, max_leaf: u32) -> Option<CpuTopology> {
        let features = platform.cpuid(LEAF_FEATURES, 0)?;
        let logical = if features.edx & FEATURE_HTT != 0 {
            ((features.ebx >> 16) & 0xFF).max(1)
        } else {
            1
        };
        let cores = if max_leaf >= LEAF_CACHE_PARAMS {
            platform
                .cpuid(LEAF_CACHE_PARAMS, 0)
                .map(|r| ((r.eax >> 26) & 0x3F) + 1)
                .unwrap_or(1)
        } else {
            1
        };
        Some(CpuTopology {
            packages: 1,
            cores_per_package: cores,
            threads_per_core: (logical / cores).max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimPlatform, StubPlatform};

    fn leaf(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Cpuid {
        Cpuid { eax, ebx, ecx, edx }
    }

    #[test]
    fn test_extended_topology_leaf() {
        let sim = SimPlatform::new();
        sim.set_cpuid(0, 0, leaf(0x16, 0, 0, 0));
        sim.set_cpuid(0xB, 0, leaf(1, 2, LEVEL_TYPE_SMT << 8, 0));
        sim.set_cpuid(0xB, 1, leaf(4, 16, (LEVEL_TYPE_CORE << 8) | 1, 0));
        sim.set_cpuid(0xB, 2, leaf(0, 0, 2, 0));
        let t = CpuTopology::detect(&sim);
        assert_eq!(t.threads_per_core, 2);
        assert_eq!(t.cores_per_package, 8);
        assert_eq!(t.packages, 1);
        assert_eq!(t.logical_cpus(), 16);
    }

    #[test]
    fn test_legacy_leaves() {
        let sim = SimPlatform::new();
        sim.set_cpuid(0, 0, leaf(0x4, 0, 0, 0));
        sim.set_cpuid(1, 0, leaf(0, 8 << 16, 0, FEATURE_HTT));
        sim.set_cpuid(4, 0, leaf(3 << 26, 0, 0, 0));
        let t = CpuTopology::detect(&sim);
        assert_eq!(t.cores_per_package, 4);
        assert_eq!(t.threads_per_core, 2);
    }

    #[test]
    fn test_fallback_single() {
        assert_eq!(CpuTopology::detect(&StubPlatform::new()), CpuTopology::SINGLE);

        // Extended leaf advertised but empty: legacy leaf 1 without HTT.
        let sim = SimPlatform::new();
        sim.set_cpuid(0, 0, leaf(0xB, 0, 0, 0));
        sim.set_cpuid(1, 0, leaf(0, 0, 0, 0));
        sim.set_cpuid(0xB, 0, leaf(0, 0, 0, 0));
        assert_eq!(CpuTopology::detect(&sim), CpuTopology::SINGLE);
    }

    #[test]
    fn test_soft_interrupt_flag_restores_state() {
        let flag = SoftInterruptFlag::new();
        assert!(!flag.enabled());
        flag.enable();
        let inner = flag.without(|| flag.enabled());
        assert!(!inner);
        assert!(flag.enabled());

        flag.disable();
        flag.without(|| ());
        assert!(!flag.enabled());
    }

    #[test]
    fn test_without_interrupts_returns_value() {
        assert_eq!(without_interrupts(|| 7), 7);
    }
}
