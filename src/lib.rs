//! igemm-kernels: indirect GEMM for CPU convolution and matrix multiply.
//!
//! This crate provides the substrate the numeric micro-kernels plug into:
//! - **Indirect convolution**: convolutions run as GEMM through a
//!   [`Convolver`] that resolves im2col blocks to input slices on demand
//! - **Interleave family**: one packer for plain, indirect and
//!   convolution-shaped operands, with optional in-band row sums
//! - **Work partitioning**: [`NDRange`]/[`NDCoordinate`] windows split across
//!   a rayon pool by [`GemmScheduler`]
//! - **Kernel selection**: a factory ranking kernels by cycle estimate
//!
//! # Quick Start
//!
//! ```ignore
//! use igemm_kernels::{gemm, GemmArgs, GemmArrays, GemmScheduler, OutputStage};
//!
//! let args = GemmArgs::new(m, n, k).with_max_threads(4);
//! let mut kernel = gemm::<f32, f32>(&args, &OutputStage::Nothing)?;
//! let mut pretransposed = vec![0u8; kernel.get_b_pretransposed_array_size()];
//! let scheduler = GemmScheduler::new(4)?;
//! scheduler.pretranspose(&mut *kernel, &mut pretransposed, &b, n, 0)?;
//! kernel.set_arrays(GemmArrays::new(&a, k, &b, n, &mut c, n));
//! scheduler.run(&mut *kernel);
//! ```

pub mod convolution;
pub mod cpu_info;
pub mod error;
pub mod gemm;
pub mod interleave;
pub mod ndrange;
pub mod quantized;
pub mod scheduler;
pub mod traits;
pub mod types;
pub mod validation;

pub use convolution::{ConvolutionParameters, Convolver};
pub use cpu_info::{cpu_info, AlignedVec, CpuInfo};
pub use error::{GemmError, GemmResult};
pub use gemm::{
    gemm, get_compatible_kernels, get_gemm_method, has_opt_gemm, GemmArgs, GemmArrays, GemmCommon, GemmConfig,
    GemmMethod, IGemmCommon, KernelDescription, WeightFormat,
};
pub use interleave::{convolution_interleave, indirect_interleave, interleave, sectioned_interleave, PanelShape};
pub use ndrange::{NDCoordinate, NDRange, Window, WorkRange};
pub use quantized::{OutputStage, PerChannelRequant, Requantize32};
pub use scheduler::{execute_sequential, GemmScheduler};
pub use traits::{Accumulator, Activation, Element};
pub use types::{DataType, VLType};
