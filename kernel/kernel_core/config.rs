//! Boot configuration.
//!
//! Every table capacity is a constructor parameter of the kernel; this module
//! gathers them into [`KernelConfig`] together with the hardening profile
//! that selects log verbosity and audit ring size.
//!
//! # Hardening Profiles
//!
//! | Profile | klog | Audit |
//! |---------|------|-------|
//! | Secure | silent | 256 |
//! | Balanced | warn+ | 128 |
//! | Performance | all | 64 |
//!
//! # Command line
//!
//! `KernelConfig::from_cmdline` accepts whitespace-separated `key=value`
//! pairs.  Unknown keys are ignored so boot loaders may pass their own.

use alloc::string::{String, ToString};
use core::fmt;

use klog::KlogProfile;
use lsm::MacMode;

use crate::namespace::MAX_HOSTNAME_LEN;

// ============================================================================
// Hardening Profiles
// ============================================================================

/// System hardening profile levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HardeningProfile {
    /// No console diagnostics, large audit ring.
    Secure = 0,
    /// Warnings and errors on the console.
    #[default]
    Balanced = 1,
    /// Everything on the console, small audit ring.
    Performance = 2,
}

impl HardeningProfile {
    /// Parse profile from string (case-insensitive).
    ///
    /// Accepts various aliases for each profile level.
    pub fn from_str(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "secure" | "strict" | "hardened" => Some(Self::Secure),
            "balanced" | "default" | "normal" => Some(Self::Balanced),
            "performance" | "perf" | "fast" => Some(Self::Performance),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Secure => "Secure",
            Self::Balanced => "Balanced",
            Self::Performance => "Performance",
        }
    }

    /// Recommended audit ring capacity for this profile.
    pub const fn audit_capacity(&self) -> usize {
        match self {
            Self::Secure => 256,
            Self::Balanced => 128,
            Self::Performance => 64,
        }
    }

    pub const fn klog_profile(&self) -> KlogProfile {
        match self {
            Self::Secure => KlogProfile::Secure,
            Self::Balanced => KlogProfile::Balanced,
            Self::Performance => KlogProfile::Performance,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A recognised key carried a value that doesn't parse.
    InvalidValue { key: String, value: String },
    /// A capacity is outside the supported range.
    OutOfRange(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value } => {
                write!(f, "config: invalid value '{}' for '{}'", value, key)
            }
            ConfigError::OutOfRange(what) => write!(f, "config: {} out of range", what),
        }
    }
}

// ============================================================================
// Kernel Configuration
// ============================================================================

/// Capacities and policy knobs fixed at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Context table slots, including the reserved ids 0 and 1.
    pub max_contexts: usize,
    /// SID table capacity, excluding the unlabeled SID.
    pub max_sids: usize,
    /// Namespace pool size, including the six root namespaces.
    pub max_namespaces: usize,
    /// Namespace proxy pool size, including the root proxy.
    pub max_proxies: usize,
    /// Total cgroups, including the root.
    pub max_cgroups: usize,
    /// Deepest allowed cgroup (root is depth 0).
    pub max_cgroup_depth: u32,
    pub audit_capacity: usize,
    pub timer_hz: u32,
    /// Initial hostname of the root UTS namespace.
    pub hostname: String,
    pub profile: HardeningProfile,
    pub mac_mode: MacMode,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::for_profile(HardeningProfile::default())
    }
}

impl KernelConfig {
    pub fn for_profile(profile: HardeningProfile) -> Self {
        KernelConfig {
            max_contexts: 256,
            max_sids: 256,
            max_namespaces: 256,
            max_proxies: 128,
            max_cgroups: 64,
            max_cgroup_depth: 8,
            audit_capacity: profile.audit_capacity(),
            timer_hz: hal::DEFAULT_TIMER_HZ,
            hostname: "limitless".to_string(),
            profile,
            mac_mode: MacMode::Enforcing,
        }
    }

    /// Parse `key=value` boot arguments on top of the defaults.
    ///
    /// A `profile=` key also resets the audit capacity to that profile's
    /// recommendation.
    pub fn from_cmdline(cmdline: &str) -> Result<Self, ConfigError> {
        let mut config = KernelConfig::default();
        for arg in cmdline.split_whitespace() {
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };
            let invalid = || ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "profile" => {
                    config.profile = HardeningProfile::from_str(value).ok_or_else(invalid)?;
                    config.audit_capacity = config.profile.audit_capacity();
                }
                "hostname" => config.hostname = value.to_string(),
                "max_contexts" => config.max_contexts = value.parse().map_err(|_| invalid())?,
                "max_sids" => config.max_sids = value.parse().map_err(|_| invalid())?,
                "max_cgroups" => config.max_cgroups = value.parse().map_err(|_| invalid())?,
                "timer_hz" => config.timer_hz = value.parse().map_err(|_| invalid())?,
                "mac" => {
                    config.mac_mode = match value {
                        "enforcing" => MacMode::Enforcing,
                        "permissive" => MacMode::Permissive,
                        _ => return Err(invalid()),
                    }
                }
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Slot 0 is reserved and slot 1 is the kernel.
        if self.max_contexts < 3 {
            return Err(ConfigError::OutOfRange("max_contexts"));
        }
        if self.max_sids == 0 {
            return Err(ConfigError::OutOfRange("max_sids"));
        }
        if self.max_namespaces < 6 {
            return Err(ConfigError::OutOfRange("max_namespaces"));
        }
        if self.max_proxies == 0 {
            return Err(ConfigError::OutOfRange("max_proxies"));
        }
        if self.max_cgroups == 0 {
            return Err(ConfigError::OutOfRange("max_cgroups"));
        }
        if self.audit_capacity == 0 || self.audit_capacity > audit::MAX_CAPACITY {
            return Err(ConfigError::OutOfRange("audit_capacity"));
        }
        if self.timer_hz == 0 {
            return Err(ConfigError::OutOfRange("timer_hz"));
        }
        if self.hostname.len() > MAX_HOSTNAME_LEN {
            return Err(ConfigError::OutOfRange("hostname"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_aliases() {
        assert_eq!(HardeningProfile::from_str("HARDENED"), Some(HardeningProfile::Secure));
        assert_eq!(HardeningProfile::from_str("perf"), Some(HardeningProfile::Performance));
        assert_eq!(HardeningProfile::from_str("Normal"), Some(HardeningProfile::Balanced));
        assert_eq!(HardeningProfile::from_str("turbo"), None);
        assert_eq!(HardeningProfile::Secure.audit_capacity(), 256);
        assert_eq!(HardeningProfile::Performance.audit_capacity(), 64);
    }

    #[test]
    fn test_cmdline_parsing() {
        let config =
            KernelConfig::from_cmdline("quiet profile=secure hostname=node-a max_cgroups=12 mac=permissive").unwrap();
        assert_eq!(config.profile, HardeningProfile::Secure);
        assert_eq!(config.audit_capacity, 256);
        assert_eq!(config.hostname, "node-a");
        assert_eq!(config.max_cgroups, 12);
        assert_eq!(config.mac_mode, MacMode::Permissive);
        assert_eq!(config.max_contexts, KernelConfig::default().max_contexts);
    }

    #[test]
    fn test_cmdline_errors() {
        assert_eq!(
            KernelConfig::from_cmdline("max_sids=lots"),
            Err(ConfigError::InvalidValue {
                key: "max_sids".to_string(),
                value: "lots".to_string(),
            })
        );
        assert!(matches!(KernelConfig::from_cmdline("mac=off"), Err(ConfigError::InvalidValue { .. })));
        assert_eq!(
            KernelConfig::from_cmdline("max_contexts=2"),
            Err(ConfigError::OutOfRange("max_contexts"))
        );
        assert_eq!(KernelConfig::from_cmdline("timer_hz=0"), Err(ConfigError::OutOfRange("timer_hz")));
    }
}
