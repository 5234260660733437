//! Compiled kernel modules — NVRTC compilation, module loading, function
//! caching, and dispatch.
//!
//! This module uses the raw CUDA driver API (`cudarc::driver::sys`) for
//! module and function handles. cudarc's safe wrappers keep `CUmodule` and
//! `CUfunction` as `pub(crate)`, which prevents building custom argument
//! arrays for `cuLaunchKernel`. The safe `CudaContext` is still used for
//! device init and thread binding.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::mem::MaybeUninit;
use std::path::Path;
use std::sync::Arc;

use cudarc::driver::safe::CudaContext;
use cudarc::driver::sys;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::args::KernelArgs;
use crate::compile::{self, CompileMode};
use crate::error::ShaderError;

// ---------------------------------------------------------------------------
// Raw module handle (RAII)
// ---------------------------------------------------------------------------

/// RAII wrapper around a raw `CUmodule` handle.
///
/// Automatically calls `cuModuleUnload` on drop — exactly once, since the
/// handle is owned exclusively. The CUDA context must still be valid when
/// this is dropped, which is guaranteed by the held `Arc`.
#[derive(Debug)]
struct RawModule {
    cu_module: sys::CUmodule,
    ctx: Arc<CudaContext>,
}

impl Drop for RawModule {
    fn drop(&mut self) {
        // Best-effort unload; ignore errors during drop.
        let _ = self.ctx.bind_to_thread();
        // SAFETY: cu_module was obtained from cuModuleLoadData and has not
        // been unloaded yet. The context is still valid because we hold an
        // Arc to it.
        let _ = unsafe { sys::cuModuleUnload(self.cu_module) };
    }
}

// SAFETY: CUmodule is a pointer that can be used from any thread as long as
// the owning CUDA context is bound. We ensure context binding before use.
unsafe impl Send for RawModule {}
unsafe impl Sync for RawModule {}

/// Newtype wrapper around `CUfunction` to implement `Send` and `Sync`.
///
/// Function handles remain valid as long as the owning module and context
/// are alive, which [`Shader`] guarantees by owning both.
#[derive(Debug, Clone, Copy)]
struct SendCUfunction(sys::CUfunction);

// SAFETY: CUfunction is a pointer into the CUDA driver's internal state. It
// is safe to send/share across threads as long as the owning module is not
// unloaded and the context is bound before use — both guaranteed by Shader.
unsafe impl Send for SendCUfunction {}
unsafe impl Sync for SendCUfunction {}

// ---------------------------------------------------------------------------
// Function cache
// ---------------------------------------------------------------------------

/// Name-keyed get-or-resolve cache for function handles.
///
/// Entries are never removed and each name resolves at most once; failed
/// resolutions are not cached, so a later retry re-runs the resolver.
#[derive(Debug, Default)]
struct FunctionCache {
    entries: RwLock<HashMap<String, SendCUfunction>>,
}

impl FunctionCache {
    fn get_or_resolve(
        &self,
        name: &str,
        resolve: impl FnOnce() -> Result<sys::CUfunction, ShaderError>,
    ) -> Result<sys::CUfunction, ShaderError> {
        if let Some(func) = self.entries.read().get(name) {
            return Ok(func.0);
        }

        let func = resolve()?;
        self.entries
            .write()
            .insert(name.to_string(), SendCUfunction(func));
        Ok(func)
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

// ---------------------------------------------------------------------------
// Shader
// ---------------------------------------------------------------------------

/// One compiled device module produced from one CUDA source file.
///
/// Compiles on construction (NVRTC source → PTX → `cuModuleLoadData`), owns
/// the loaded module for its whole lifetime, resolves entry points lazily by
/// name, and unloads the module exactly once on drop. Construction failures
/// never leave a dangling module handle — the RAII wrapper is only created
/// after a successful load.
///
/// # Thread Safety
///
/// `Shader` is `Send + Sync`. The function cache uses `parking_lot::RwLock`,
/// so concurrent launches of already-resolved functions take only a read
/// lock; concurrent first-resolution of the same name serializes on the
/// write lock (both may run the driver lookup, the second insert wins with
/// an identical handle).
#[derive(Debug)]
pub struct Shader {
    module: RawModule,
    functions: FunctionCache,
}

impl Shader {
    /// Compile the source file at `path` and load the resulting PTX into the
    /// given context.
    ///
    /// `include_dirs` become one `-I <dir>` option each (caller order
    /// preserved), `extra_flags` are passed to NVRTC verbatim, and
    /// [`CompileMode::Debug`] appends `-G`. The NVRTC program log is emitted
    /// through `tracing` whenever it is non-trivial, on success and failure
    /// alike; a failed compile also carries the log in the returned error.
    pub fn compile(
        ctx: &Arc<CudaContext>,
        path: impl AsRef<Path>,
        include_dirs: &[String],
        extra_flags: &[String],
        mode: CompileMode,
    ) -> Result<Self, ShaderError> {
        let path = path.as_ref();
        let output = compile::compile_file(path, include_dirs, extra_flags, mode)?;
        let module = load_module(ctx, &output.ptx)?;

        info!(
            source = %path.display(),
            ptx_bytes = output.ptx.len(),
            "Loaded compiled kernel module"
        );

        Ok(Self {
            module,
            functions: FunctionCache::default(),
        })
    }

    /// Resolve an entry point by name, caching the handle on first use.
    ///
    /// The driver lookup runs at most once per distinct name for this
    /// module. An unknown name fails with [`ShaderError::SymbolNotFound`]
    /// and is not cached.
    pub fn get_function(&self, name: &str) -> Result<sys::CUfunction, ShaderError> {
        self.functions.get_or_resolve(name, || {
            let fn_name_c = CString::new(name).map_err(|_| ShaderError::SymbolNotFound {
                name: name.to_string(),
            })?;

            self.module
                .ctx
                .bind_to_thread()
                .map_err(|e| ShaderError::SymbolNotFound {
                    name: format!("{name} (context bind failed: {e})"),
                })?;

            // SAFETY:
            // 1. cu_module is a valid handle from cuModuleLoadData.
            // 2. fn_name_c is a valid NUL-terminated C string.
            // 3. The CUDA context is bound to this thread.
            let func = unsafe {
                let mut cu_func = MaybeUninit::uninit();
                let result = sys::cuModuleGetFunction(
                    cu_func.as_mut_ptr(),
                    self.module.cu_module,
                    fn_name_c.as_ptr(),
                );
                result.result().map_err(|_e| ShaderError::SymbolNotFound {
                    name: name.to_string(),
                })?;
                cu_func.assume_init()
            };

            debug!(function = name, "Cached kernel function handle");
            Ok(func)
        })
    }

    /// Launch the entry point `name` with the packed arguments on `stream`.
    ///
    /// Zero dynamic shared memory. The call is asynchronous with respect to
    /// the host: it enqueues the launch on `stream` and returns without
    /// waiting for device completion — the caller must synchronize the
    /// stream before reading any output buffers.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `stream` is a valid `CUstream` handle (or null for the default
    ///   stream).
    /// - `args` match the kernel's parameter list in number, order, and byte
    ///   width — argument layout is not validated against the device-side
    ///   signature.
    /// - Device pointers packed into `args` point to live allocations that
    ///   outlive the kernel's execution.
    pub unsafe fn launch(
        &self,
        name: &str,
        args: &mut KernelArgs,
        grid: [u32; 3],
        block: [u32; 3],
        stream: sys::CUstream,
    ) -> Result<(), ShaderError> {
        // SAFETY: caller guarantees stream validity and argument correctness.
        unsafe { self.launch_with_shared_mem(name, args, grid, block, 0, stream) }
    }

    /// Like [`launch`](Self::launch), but with an explicit dynamic shared
    /// memory allocation per thread block.
    ///
    /// # Safety
    ///
    /// Same contract as [`launch`](Self::launch).
    pub unsafe fn launch_with_shared_mem(
        &self,
        name: &str,
        args: &mut KernelArgs,
        grid: [u32; 3],
        block: [u32; 3],
        shared_mem_bytes: u32,
        stream: sys::CUstream,
    ) -> Result<(), ShaderError> {
        let func = self.get_function(name)?;

        debug!(
            kernel = name,
            grid = ?grid,
            block = ?block,
            shared_mem = shared_mem_bytes,
            num_args = args.len(),
            "Dispatching kernel"
        );

        // Snapshot of the argument pointers; args is borrowed mutably for
        // the whole call, so the buffer cannot move underneath them.
        let mut arg_ptrs: Vec<*mut c_void> = args.kernel_params();

        self.module
            .ctx
            .bind_to_thread()
            .map_err(|e| ShaderError::Launch {
                kernel: name.to_string(),
                reason: format!("failed to bind context: {e}"),
            })?;

        // SAFETY:
        // - func was obtained from cuModuleGetFunction on the owned module.
        // - arg_ptrs points into args' packed buffer, which outlives this
        //   call and is not mutated during it.
        // - The caller guarantees argument count/layout matches the kernel
        //   signature, device pointers are live, and stream is valid.
        unsafe {
            let result = sys::cuLaunchKernel(
                func,
                grid[0],
                grid[1],
                grid[2],
                block[0],
                block[1],
                block[2],
                shared_mem_bytes,
                stream,
                arg_ptrs.as_mut_ptr(),
                std::ptr::null_mut(), // extra (unused)
            );
            result.result().map_err(|e| ShaderError::Launch {
                kernel: name.to_string(),
                reason: format!("{e}"),
            })?;
        }

        debug!(kernel = name, "Kernel launch enqueued");
        Ok(())
    }

    /// Number of entry points resolved so far.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }
}

fn load_module(ctx: &Arc<CudaContext>, ptx: &[u8]) -> Result<RawModule, ShaderError> {
    // cuModuleLoadData expects NUL-terminated PTX text.
    let mut image = Vec::with_capacity(ptx.len() + 1);
    image.extend_from_slice(ptx);
    if !ptx.ends_with(&[0]) {
        image.push(0);
    }

    ctx.bind_to_thread().map_err(|e| ShaderError::ModuleLoad {
        reason: format!("failed to bind CUDA context: {e}"),
    })?;

    // SAFETY:
    // 1. image holds valid NUL-terminated PTX text.
    // 2. The CUDA context is bound to this thread.
    // 3. module is initialized by cuModuleLoadData on success.
    let cu_module = unsafe {
        let mut module = MaybeUninit::uninit();
        let result = sys::cuModuleLoadData(module.as_mut_ptr(), image.as_ptr() as *const c_void);
        result.result().map_err(|e| ShaderError::ModuleLoad {
            reason: format!("cuModuleLoadData failed: {e}"),
        })?;
        module.assume_init()
    };

    Ok(RawModule {
        cu_module,
        ctx: ctx.clone(),
    })
}

// ---------------------------------------------------------------------------
// Grid / Block helpers
// ---------------------------------------------------------------------------

/// Calculate grid and block dimensions for a 1D kernel launch.
pub fn compute_launch_config_1d(num_elements: u32) -> ([u32; 3], [u32; 3]) {
    const BLOCK_SIZE: u32 = 256;
    let grid_x = num_elements.div_ceil(BLOCK_SIZE);
    ([grid_x, 1, 1], [BLOCK_SIZE, 1, 1])
}

/// Calculate grid and block dimensions for a 2D kernel launch. Uses 16x16
/// thread blocks.
pub fn compute_launch_config_2d(width: u32, height: u32) -> ([u32; 3], [u32; 3]) {
    const BLOCK_X: u32 = 16;
    const BLOCK_Y: u32 = 16;
    let grid_x = width.div_ceil(BLOCK_X);
    let grid_y = height.div_ceil(BLOCK_Y);
    ([grid_x, grid_y, 1], [BLOCK_X, BLOCK_Y, 1])
}
