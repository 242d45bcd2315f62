//! Runtime CPU probing and tier selection.
//!
//! Features are probed once per process and cached. A [`KernelConfig`] can
//! force a tier or shrink the cache budgets used to size row ranges.

use std::sync::OnceLock;

/// Instruction-set tier a kernel set is specialized for.
///
/// The tier fixes the float lane count and how many output positions one
/// micro tile covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// 128-bit lanes, also used for NEON and unknown targets.
    Sse41,
    /// 256-bit lanes.
    Avx2,
    /// 512-bit lanes, 16-bit pair sums for int8 products.
    Avx512bw,
    /// 512-bit lanes, exact int8 dot products.
    Avx512vnni,
    /// 512-bit lanes with 32-position micro tiles.
    Amx,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::Sse41,
        Tier::Avx2,
        Tier::Avx512bw,
        Tier::Avx512vnni,
        Tier::Amx,
    ];

    /// Number of f32 lanes in one vector.
    pub const fn lanes(self) -> usize {
        match self {
            Tier::Sse41 => 4,
            Tier::Avx2 => 8,
            Tier::Avx512bw | Tier::Avx512vnni | Tier::Amx => 16,
        }
    }

    /// Output positions per micro tile.
    pub const fn micro_w(self) -> usize {
        match self {
            Tier::Sse41 | Tier::Avx2 => 5,
            Tier::Avx512bw | Tier::Avx512vnni => 12,
            Tier::Amx => 32,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Tier::Sse41 => "sse4.1",
            Tier::Avx2 => "avx2",
            Tier::Avx512bw => "avx512bw",
            Tier::Avx512vnni => "avx512vnni",
            Tier::Amx => "amx",
        }
    }
}

/// CPU feature flags detected at runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuFeatures {
    pub has_sse4_1: bool,
    pub has_avx2: bool,
    pub has_fma: bool,
    pub has_avx512f: bool,
    pub has_avx512bw: bool,
    pub has_vnni: bool,
    /// NEON is mandatory on aarch64.
    pub has_neon: bool,
}

impl CpuFeatures {
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self {
                has_sse4_1: is_x86_feature_detected!("sse4.1"),
                has_avx2: is_x86_feature_detected!("avx2"),
                has_fma: is_x86_feature_detected!("fma"),
                has_avx512f: is_x86_feature_detected!("avx512f"),
                has_avx512bw: is_x86_feature_detected!("avx512bw"),
                has_vnni: is_x86_feature_detected!("avx512vnni"),
                has_neon: false,
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            Self {
                has_neon: true,
                ..Self::default()
            }
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            Self::default()
        }
    }

    /// Best tier the hardware supports. The AMX profile is never picked
    /// automatically.
    pub fn best_tier(&self) -> Tier {
        let wide = cfg!(feature = "avx512") && self.has_avx512f && self.has_avx512bw;
        if wide && self.has_vnni {
            Tier::Avx512vnni
        } else if wide {
            Tier::Avx512bw
        } else if self.has_avx2 && self.has_fma {
            Tier::Avx2
        } else {
            Tier::Sse41
        }
    }
}

/// Cached CPU features.
pub fn cpu_features() -> &'static CpuFeatures {
    static FEATURES: OnceLock<CpuFeatures> = OnceLock::new();
    FEATURES.get_or_init(CpuFeatures::detect)
}

/// Best tier for the running CPU.
pub fn detect() -> Tier {
    static TIER: OnceLock<Tier> = OnceLock::new();
    *TIER.get_or_init(|| {
        let tier = cpu_features().best_tier();
        log::debug!("synet-simd: detected {} tier", tier.name());
        tier
    })
}

/// Setup-time knobs shared by all kernel handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Forced tier, `None` picks [`detect`].
    pub tier: Option<Tier>,
    /// Budget for the ring buffers of one row range.
    pub l2_cache: usize,
    /// Budget for the int8 weights of one macro channel block.
    pub l3_cache: usize,
    /// Allow the merged (ring buffer) compositions; when false every block
    /// runs through the whole-image path.
    pub merged: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tier: None,
            l2_cache: 256 * 1024,
            l3_cache: 2 * 1024 * 1024,
            merged: true,
        }
    }
}

impl KernelConfig {
    /// Use exactly this tier.
    pub fn with_tier(tier: Tier) -> Self {
        Self {
            tier: Some(tier),
            ..Self::default()
        }
    }

    /// 128-bit lanes everywhere, useful as a baseline.
    pub fn scalar_width() -> Self {
        Self::with_tier(Tier::Sse41)
    }

    #[must_use]
    pub fn l2_cache(mut self, bytes: usize) -> Self {
        self.l2_cache = bytes;
        self
    }

    #[must_use]
    pub fn l3_cache(mut self, bytes: usize) -> Self {
        self.l3_cache = bytes;
        self
    }

    /// Whole-image execution only, for checking the merged compositions.
    #[must_use]
    pub fn whole_image(mut self) -> Self {
        self.merged = false;
        self
    }

    pub fn resolve_tier(&self) -> Tier {
        self.tier.unwrap_or_else(detect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_tier_ordering() {
        let none = CpuFeatures::default();
        assert_eq!(none.best_tier(), Tier::Sse41);
        let avx2 = CpuFeatures {
            has_sse4_1: true,
            has_avx2: true,
            has_fma: true,
            ..CpuFeatures::default()
        };
        assert_eq!(avx2.best_tier(), Tier::Avx2);
        let vnni = CpuFeatures {
            has_avx512f: true,
            has_avx512bw: true,
            has_vnni: true,
            ..avx2
        };
        if cfg!(feature = "avx512") {
            assert_eq!(vnni.best_tier(), Tier::Avx512vnni);
        } else {
            assert_eq!(vnni.best_tier(), Tier::Avx2);
        }
    }

    #[test]
    fn test_config_override() {
        let config = KernelConfig::with_tier(Tier::Amx).l2_cache(4096);
        assert_eq!(config.resolve_tier(), Tier::Amx);
        assert_eq!(config.l2_cache, 4096);
        assert!(Tier::ALL.iter().all(|t| t.micro_w() >= 5));
    }
}
