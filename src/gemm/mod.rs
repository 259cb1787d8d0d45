//! GEMM kernels, their contract and the factory that picks one.

pub mod args;
pub mod arrays;
pub mod common;
pub mod factory;
pub mod hybrid;
pub mod interleaved;
mod merge;
pub mod pretranspose;
pub mod strategy;
mod workspace;

pub use args::{GemmArgs, GemmConfig, GemmMethod, KernelDescription, WeightFormat};
pub use arrays::{ErasedArrays, ErasedSlice, ErasedSliceMut, GemmArrays, IndirectRows, SharedMutSlice};
pub use common::{GemmCommon, IGemmCommon};
pub use factory::{
    find_implementation, gemm, get_compatible_kernels, get_gemm_method, has_opt_gemm, GemmImplementation,
    GemmKernel, GemmKernelList,
};
pub use hybrid::GemmHybrid;
pub use interleaved::GemmInterleaved;
pub use pretranspose::BLayout;
pub use strategy::{
    Bf16Interleaved8x12, HgemmInterleaved8x12, HybridStrategy, InterleavedStrategy, PerformanceParameters,
    S8Interleaved8x12, SgemmHybrid6x16, SgemmInterleaved8x12, U8Interleaved8x12,
};
