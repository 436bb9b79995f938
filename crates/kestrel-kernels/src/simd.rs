//! Runtime SIMD capability detection.
//!
//! Detection runs once and is cached. Setting `KESTREL_FORCE_SCALAR=1`
//! in the environment pins every kernel to its scalar path, which makes
//! numerics bit-reproducible across machines.

use std::sync::OnceLock;

/// SIMD capabilities detected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimdCapability {
    pub avx2: bool,
    pub avx512f: bool,
    pub neon: bool,
    pub fma: bool,
}

static DETECTED: OnceLock<SimdCapability> = OnceLock::new();

impl SimdCapability {
    const SCALAR: SimdCapability = SimdCapability {
        avx2: false,
        avx512f: false,
        neon: false,
        fma: false,
    };

    /// Detect SIMD capabilities for the current CPU.
    pub fn detect() -> &'static SimdCapability {
        DETECTED.get_or_init(|| {
            if std::env::var_os("KESTREL_FORCE_SCALAR").is_some_and(|v| v != "0") {
                tracing::debug!("KESTREL_FORCE_SCALAR set, using scalar kernels");
                return Self::SCALAR;
            }
            let cap = Self::probe();
            tracing::debug!(tier = cap.best_tier(), "detected SIMD capability");
            cap
        })
    }

    #[cfg(target_arch = "x86_64")]
    fn probe() -> SimdCapability {
        SimdCapability {
            avx2: is_x86_feature_detected!("avx2"),
            avx512f: is_x86_feature_detected!("avx512f"),
            fma: is_x86_feature_detected!("fma"),
            neon: false,
        }
    }

    #[cfg(target_arch = "aarch64")]
    fn probe() -> SimdCapability {
        // NEON is mandatory on AArch64
        SimdCapability { neon: true, ..Self::SCALAR }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn probe() -> SimdCapability {
        Self::SCALAR
    }

    /// Whether the AVX2+FMA GEMM inner loop can be used.
    pub fn fma_gemm(&self) -> bool {
        self.avx2 && self.fma
    }

    /// Best available SIMD tier as a human-readable string.
    pub fn best_tier(&self) -> &'static str {
        if self.avx512f {
            "AVX-512"
        } else if self.avx2 {
            "AVX2"
        } else if self.neon {
            "NEON"
        } else {
            "scalar"
        }
    }
}
