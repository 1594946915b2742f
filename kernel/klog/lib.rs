//! Kernel logging (`klog`).
//!
//! Profile-aware logging macros shared by every kernel crate.  The crate is a
//! leaf dependency: it knows nothing about consoles, it only forwards
//! formatted output to a writer registered by the boot path.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Profile-aware | Use case |
//! |-------|--------------|---------------|----------|
//! | [`kprintln!`] | Compiled out | No | Debug diagnostics |
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_always!`] | Active | Secure-gated | Boot banners, status messages |
//! | [`klog_force!`] | Active | No | Fatal invariant breaks |
//!
//! # Hardening Profile Integration
//!
//! Filtering is decided at runtime from the active hardening profile, which
//! the kernel installs with [`set_profile`] during boot:
//!
//! - **Secure** : no output
//! - **Balanced**: `Error` + `Warn` only
//! - **Performance**: all levels
//!
//! The hot path is a single `Relaxed` atomic load + integer compare.
//!
//! # Writers
//!
//! Output goes to the function installed with [`set_writer`].  Until one is
//! installed everything is dropped, so library code can log freely in unit
//! tests without a console.

#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use spin::RwLock;

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages.
///
/// Ordered from least severe ([`Trace`]) to most severe ([`Error`]).
/// The runtime filter allows messages at or above the configured minimum level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness or security.
    Error = 4,
}

// ============================================================================
// Profile Filter
// ============================================================================

/// Sentinel: all output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level.  Messages with `level >= LOG_MIN_LEVEL` are emitted.
/// Initialised to DISABLED; the boot path must call [`set_profile`].
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Runtime gate for [`klog_always!`].  Off until [`set_profile`] is called
/// with a non-Secure profile.
static LOG_ALWAYS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Hardening profile identifiers mirroring `kernel_core::config::HardeningProfile`.
///
/// Duplicated here so `klog` stays a leaf crate.  Values MUST stay in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KlogProfile {
    /// Maximum security, no klog output.
    Secure = 0,
    /// Balanced: errors and warnings only.
    Balanced = 1,
    /// Performance/debug: all levels.
    Performance = 2,
}

/// Set the klog filter from a profile.
///
/// Called once during boot after the configuration selects a profile.  Safe
/// to call again if the profile changes at runtime.
///
/// Also gates [`klog_always!`]: the Secure profile suppresses it.
#[inline]
pub fn set_profile(profile: KlogProfile) {
    let min = match profile {
        KlogProfile::Secure => LEVEL_DISABLED,
        KlogProfile::Balanced => Level::Warn as u8,
        KlogProfile::Performance => Level::Trace as u8,
    };
    LOG_MIN_LEVEL.store(min, Ordering::Release);
    LOG_ALWAYS_ENABLED.store(profile != KlogProfile::Secure, Ordering::Release);
}

/// Disable all klog output.  Does **not** affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
///
/// Hot path: single `Relaxed` atomic load + integer compare.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

/// Returns `true` if [`klog_always!`] output is currently enabled.
#[doc(hidden)]
#[inline(always)]
pub fn _klog_always_enabled() -> bool {
    LOG_ALWAYS_ENABLED.load(Ordering::Relaxed)
}

// ============================================================================
// Output Helpers (not public API, used by macros)
// ============================================================================

/// Console sink signature.
pub type Writer = fn(fmt::Arguments);

static WRITER: RwLock<Option<Writer>> = RwLock::new(None);

/// Install the console writer.  Replaces any previous writer.
pub fn set_writer(writer: Writer) {
    *WRITER.write() = Some(writer);
}

/// Remove the console writer; subsequent output is dropped.
pub fn clear_writer() {
    *WRITER.write() = None;
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_print(args: fmt::Arguments) {
    if let Some(writer) = *WRITER.read() {
        writer(args);
    }
}

// ============================================================================
// Macros
// ============================================================================

/// Profile-gated kernel output (boot banners, status messages).
///
/// Suppressed in [`KlogProfile::Secure`].  For output that must appear
/// regardless of profile use [`klog_force!`].
#[macro_export]
macro_rules! klog_always {
    () => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print(format_args!("\n"));
        }
    }};
    ($($arg:tt)+) => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

/// Truly unconditional kernel output; never suppressed by any profile.
///
/// Reserved for refcount underflow and similar internal invariant breaks.
/// All other output should use [`klog!`] or [`klog_always!`].
#[macro_export]
macro_rules! klog_force {
    () => {{
        $crate::_klog_print(format_args!("\n"));
    }};
    ($($arg:tt)+) => {{
        $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
    }};
}

/// Debug-only kernel print, a drop-in replacement for `println!`.
///
/// **Fully compiled out** in release builds (zero cost, zero binary impact).
/// Use this for developer diagnostics that should never appear in production.
#[macro_export]
macro_rules! kprintln {
    () => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!();
    }};
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

/// Profile-aware kernel logging.
///
/// `Debug` and `Trace` levels are additionally compiled out in release builds,
/// so they incur zero cost in production even if the profile would allow them.
///
/// # Examples
///
/// ```ignore
/// klog!(Error, "oom: killed ctx {} in cgroup {}", victim, cg);
/// klog!(Warn,  "mac: denied {} -> {}", src, tgt);
/// klog!(Info,  "hal: {} devices enumerated", count);
/// klog!(Debug, "pci: {:02x}:{:02x}.{}", bus, dev, func);
/// ```
#[macro_export]
macro_rules! klog {
    // ---- Error (always compiled in, runtime-filtered) ----
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    // ---- Warn (always compiled in, runtime-filtered) ----
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    // ---- Info (always compiled in, runtime-filtered) ----
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    // ---- Debug (compiled out in release) ----
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    // ---- Trace (compiled out in release) ----
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::sync::Mutex;

    static CAPTURED: Mutex<String> = Mutex::new(String::new());
    static SERIAL: Mutex<()> = Mutex::new(());

    fn capture(args: fmt::Arguments) {
        CAPTURED.lock().unwrap().push_str(&std::format!("{}", args));
    }

    #[test]
    fn test_profile_filter() {
        let _guard = SERIAL.lock().unwrap();
        set_profile(KlogProfile::Secure);
        assert!(!enabled(Level::Error));
        assert!(!_klog_always_enabled());

        set_profile(KlogProfile::Balanced);
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Warn));
        assert!(!enabled(Level::Info));

        set_profile(KlogProfile::Performance);
        assert!(enabled(Level::Trace));
        disable();
        assert!(!enabled(Level::Error));
    }

    #[test]
    fn test_writer_receives_output() {
        let _guard = SERIAL.lock().unwrap();
        CAPTURED.lock().unwrap().clear();
        set_writer(capture);
        set_profile(KlogProfile::Balanced);
        klog!(Warn, "pressure {}", 3);
        klog!(Info, "dropped");
        clear_writer();
        klog_force!("also dropped");
        disable();
        assert_eq!(CAPTURED.lock().unwrap().as_str(), "pressure 3\n");
    }
}
