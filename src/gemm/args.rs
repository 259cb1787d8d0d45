//! Problem description and kernel-selection metadata.

use std::str::FromStr;

use crate::cpu_info::{cpu_info, CpuInfo};
use crate::error::GemmError;
use crate::traits::Activation;

/// Family of kernel implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GemmMethod {
    /// No preference; the factory picks by cycle estimate.
    #[default]
    Default,
    /// Unpacked A read through row slices, pretransposed B.
    GemmHybrid,
    /// Packed A panels, pretransposed B.
    GemmInterleaved,
}

impl FromStr for GemmMethod {
    type Err = GemmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Ok(GemmMethod::Default),
            "hybrid" | "gemm_hybrid" => Ok(GemmMethod::GemmHybrid),
            "interleaved" | "gemm_interleaved" => Ok(GemmMethod::GemmInterleaved),
            other => Err(GemmError::InvalidArgument(format!("unknown gemm method '{other}'"))),
        }
    }
}

/// Layout the weights operand is expected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WeightFormat {
    #[default]
    Unspecified,
    /// Any layout; the kernel pretransposes.
    Any,
    /// Stripes of `out_width` columns over the whole K, `k_unroll` rows
    /// interleaved per column (see `transpose_interleave_b`).
    Interleaved { out_width: usize, k_unroll: usize },
}

/// Caller overrides for kernel selection and blocking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GemmConfig {
    pub method: GemmMethod,
    /// Only kernels whose name contains this substring are considered.
    pub filter: String,
    /// K block size; 0 lets the kernel decide.
    pub inner_block_size: usize,
    /// N block size; 0 lets the kernel decide.
    pub outer_block_size: usize,
    pub weight_format: WeightFormat,
}

impl GemmConfig {
    /// Read `IGEMM_METHOD`, `IGEMM_FILTER`, `IGEMM_INNER_BLOCK` and
    /// `IGEMM_OUTER_BLOCK`. Returns `None` when none is set.
    pub fn from_env() -> Option<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let method = var("IGEMM_METHOD");
        let filter = var("IGEMM_FILTER");
        let inner = var("IGEMM_INNER_BLOCK");
        let outer = var("IGEMM_OUTER_BLOCK");
        if method.is_none() && filter.is_none() && inner.is_none() && outer.is_none() {
            return None;
        }

        let mut cfg = GemmConfig::default();
        if let Some(m) = method {
            match m.parse() {
                Ok(m) => cfg.method = m,
                Err(e) => log::warn!("ignoring IGEMM_METHOD: {e}"),
            }
        }
        cfg.filter = filter.unwrap_or_default();
        let parse_block = |name: &str, v: Option<String>| match v.map(|v| v.trim().parse::<usize>()) {
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                log::warn!("ignoring {name}: {e}");
                0
            }
            None => 0,
        };
        cfg.inner_block_size = parse_block("IGEMM_INNER_BLOCK", inner);
        cfg.outer_block_size = parse_block("IGEMM_OUTER_BLOCK", outer);
        log::debug!("gemm config from environment: {cfg:?}");
        Some(cfg)
    }
}

/// Logical shape of one GEMM (or convolution-as-GEMM) plus execution hints.
///
/// `k` is the per-section depth: for a convolution it is the channel count
/// and `k_sections` the number of kernel points.
#[derive(Debug, Clone, PartialEq)]
pub struct GemmArgs {
    pub ci: CpuInfo,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub k_sections: usize,
    pub nbatches: usize,
    pub nmulti: usize,
    pub indirect_input: bool,
    pub act: Activation,
    pub max_threads: usize,
    pub fixed_format: bool,
    pub fast_mode: bool,
    pub cfg: Option<GemmConfig>,
}

impl GemmArgs {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self {
            ci: *cpu_info(),
            m,
            n,
            k,
            k_sections: 1,
            nbatches: 1,
            nmulti: 1,
            indirect_input: false,
            act: Activation::None,
            max_threads: 1,
            fixed_format: false,
            fast_mode: false,
            cfg: None,
        }
    }

    pub fn with_cpu_info(mut self, ci: CpuInfo) -> Self {
        self.ci = ci;
        self
    }

    pub fn with_k_sections(mut self, k_sections: usize) -> Self {
        self.k_sections = k_sections;
        self
    }

    pub fn with_batches(mut self, nbatches: usize) -> Self {
        self.nbatches = nbatches;
        self
    }

    pub fn with_multis(mut self, nmulti: usize) -> Self {
        self.nmulti = nmulti;
        self
    }

    pub fn with_indirect_input(mut self, indirect: bool) -> Self {
        self.indirect_input = indirect;
        self
    }

    pub fn with_activation(mut self, act: Activation) -> Self {
        self.act = act;
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads.max(1);
        self
    }

    pub fn with_fixed_format(mut self, fixed: bool) -> Self {
        self.fixed_format = fixed;
        self
    }

    pub fn with_fast_mode(mut self, fast: bool) -> Self {
        self.fast_mode = fast;
        self
    }

    pub fn with_config(mut self, cfg: GemmConfig) -> Self {
        self.cfg = Some(cfg);
        self
    }

    /// Whether kernel selection is left entirely to the factory.
    pub fn uses_default_selection(&self) -> bool {
        self.cfg.as_ref().map_or(true, |c| c.method == GemmMethod::Default && c.filter.is_empty())
    }

    /// Caller K block override, if any.
    pub fn inner_block_size(&self) -> Option<usize> {
        self.cfg.as_ref().map(|c| c.inner_block_size).filter(|&b| b > 0)
    }

    /// Caller N block override, if any.
    pub fn outer_block_size(&self) -> Option<usize> {
        self.cfg.as_ref().map(|c| c.outer_block_size).filter(|&b| b > 0)
    }

    /// Apply `GemmConfig::from_env()` when no config was given explicitly.
    pub fn with_env_config(mut self) -> Self {
        if self.cfg.is_none() {
            self.cfg = GemmConfig::from_env();
        }
        self
    }
}

/// What the factory selected (or could select) for a problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDescription {
    pub method: GemmMethod,
    pub name: String,
    pub is_default: bool,
    pub cycle_estimate: u64,
}

impl Default for KernelDescription {
    fn default() -> Self {
        Self { method: GemmMethod::Default, name: String::new(), is_default: false, cycle_estimate: 0 }
    }
}
