//! `cujit` — runtime compilation and launch of CUDA kernels.
//!
//! Compiles a `.cu` source file to PTX with NVRTC, loads the result as a
//! device module, and launches named entry points with positionally packed
//! arguments on a caller-supplied stream.
//!
//! Device, context, and stream creation stay with the caller: this crate
//! consumes an existing [`CudaContext`](cudarc::driver::safe::CudaContext)
//! and a raw `CUstream` and manages only the compile/load/launch lifecycle.
//! Host and device memory management are likewise the caller's concern —
//! device pointers are packed into [`KernelArgs`] as plain `u64` handles.
//!
//! # Example
//!
//! ```no_run
//! use cudarc::driver::safe::CudaContext;
//! use cujit::{CompileMode, KernelArgs, Shader};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = CudaContext::new(0)?;
//! let stream = ctx.default_stream();
//!
//! let shader = Shader::compile(&ctx, "kernels/scale.cu", &[], &[], CompileMode::Release)?;
//!
//! let mut args = KernelArgs::new().with(0x1000u64).with(128u32);
//! // SAFETY: the argument layout matches the kernel signature and the
//! // device pointer stays live for the duration of the launch.
//! unsafe {
//!     shader.launch("scale", &mut args, [128, 1, 1], [64, 1, 1], stream.cu_stream())?;
//! }
//! stream.synchronize()?;
//! # Ok(())
//! # }
//! ```

pub mod args;
pub mod compile;
pub mod error;
pub mod shader;

pub use args::{KernelArgs, KernelParam};
pub use compile::{CompileMode, CompileOutput};
pub use error::ShaderError;
pub use shader::{compute_launch_config_1d, compute_launch_config_2d, Shader};
