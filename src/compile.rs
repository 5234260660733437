//! NVRTC compilation — CUDA C source to PTX with include paths and an
//! optional device-debug mode.
//!
//! This module uses the raw NVRTC API (`cudarc::nvrtc::sys`) directly rather
//! than cudarc's safe wrapper. The safe wrapper only exposes the program log
//! when compilation fails, but warnings emitted by a successful compile must
//! be surfaced too — the log is fetched unconditionally after every compile
//! and returned as part of the structured [`CompileOutput`].

use std::ffi::{c_char, c_int, CStr, CString};
use std::fs;
use std::path::Path;
use std::ptr;

use cudarc::nvrtc::sys;
use tracing::{debug, warn};

use crate::error::ShaderError;

/// Optimization/debug mode for kernel compilation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileMode {
    /// Default NVRTC optimization.
    Release,
    /// Device debug info (`-G`). Disables most optimization.
    Debug,
}

/// Result of a successful compilation.
#[derive(Clone, Debug)]
pub struct CompileOutput {
    /// NUL-terminated PTX text, ready for `cuModuleLoadData`.
    pub ptx: Vec<u8>,
    /// Full NVRTC program log. May contain warnings even on success.
    pub log: String,
}

/// RAII handle for an NVRTC program — destroyed on every exit path.
struct NvrtcProgram(sys::nvrtcProgram);

impl Drop for NvrtcProgram {
    fn drop(&mut self) {
        // SAFETY: self.0 came from nvrtcCreateProgram and has not been
        // destroyed yet.
        let _ = unsafe { sys::nvrtcDestroyProgram(&mut self.0) };
    }
}

/// Read a kernel source file and compile it to PTX.
///
/// The whole file is read into memory with a single trailing NUL byte
/// appended; the buffer only lives for the duration of the compile. A
/// missing or unreadable file fails with [`ShaderError::SourceRead`] before
/// NVRTC is ever invoked.
pub fn compile_file(
    path: &Path,
    include_dirs: &[String],
    extra_flags: &[String],
    mode: CompileMode,
) -> Result<CompileOutput, ShaderError> {
    let mut source = fs::read(path).map_err(|source| ShaderError::SourceRead {
        path: path.to_path_buf(),
        source,
    })?;
    source.push(0);

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "kernel.cu".to_string());

    compile_source(&source, &name, include_dirs, extra_flags, mode)
}

/// Compile NUL-terminated CUDA C source to PTX.
///
/// The option list is one `-I <dir>` per include directory (caller order
/// preserved), then `extra_flags` verbatim, then `-G` in debug mode. The
/// program log is emitted through `tracing` whenever it is longer than one
/// byte, on success and failure alike; on failure it also travels inside the
/// returned [`ShaderError::Compile`].
pub fn compile_source(
    source: &[u8],
    name: &str,
    include_dirs: &[String],
    extra_flags: &[String],
    mode: CompileMode,
) -> Result<CompileOutput, ShaderError> {
    debug_assert!(source.ends_with(&[0]), "source must be NUL-terminated");

    let name_c = CString::new(name).map_err(|_| ShaderError::Compile {
        name: name.to_string(),
        log: "program name contains an interior NUL byte".to_string(),
    })?;

    let mut raw: sys::nvrtcProgram = ptr::null_mut();
    // SAFETY: source is NUL-terminated, name_c is a valid C string, and the
    // header arrays are unused (count 0, null pointers).
    let create = unsafe {
        sys::nvrtcCreateProgram(
            &mut raw,
            source.as_ptr() as *const c_char,
            name_c.as_ptr(),
            0,
            ptr::null(),
            ptr::null(),
        )
    };
    if create != sys::nvrtcResult::NVRTC_SUCCESS {
        return Err(ShaderError::Compile {
            name: name.to_string(),
            log: format!("nvrtcCreateProgram failed: {}", error_string(create)),
        });
    }
    let prog = NvrtcProgram(raw);

    let options = build_options(include_dirs, extra_flags, mode);
    let option_cstrs = options
        .iter()
        .map(|o| CString::new(o.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ShaderError::Compile {
            name: name.to_string(),
            log: "compile option contains an interior NUL byte".to_string(),
        })?;
    let option_ptrs: Vec<*const c_char> = option_cstrs.iter().map(|o| o.as_ptr()).collect();

    debug!(kernel = name, ?options, "Compiling CUDA source with NVRTC");

    // SAFETY: prog is a live program and option_ptrs holds valid C strings
    // for the duration of the call.
    let compiled = unsafe {
        sys::nvrtcCompileProgram(prog.0, option_ptrs.len() as c_int, option_ptrs.as_ptr())
    };

    // The log is fetched and surfaced exactly once, whatever the outcome —
    // warnings from a successful compile are visible too.
    let log = program_log(&prog);
    if log.len() > 1 {
        warn!(kernel = name, "NVRTC log:\n{log}");
    }

    if compiled != sys::nvrtcResult::NVRTC_SUCCESS {
        return Err(ShaderError::Compile {
            name: name.to_string(),
            log,
        });
    }

    let mut ptx_size = 0usize;
    // SAFETY: prog compiled successfully and ptx_size is a valid out pointer.
    let sized = unsafe { sys::nvrtcGetPTXSize(prog.0, &mut ptx_size) };
    if sized != sys::nvrtcResult::NVRTC_SUCCESS {
        return Err(ShaderError::Compile {
            name: name.to_string(),
            log: format!("nvrtcGetPTXSize failed: {}", error_string(sized)),
        });
    }

    let mut ptx = vec![0u8; ptx_size];
    // SAFETY: ptx has exactly ptx_size writable bytes as reported by NVRTC.
    let fetched = unsafe { sys::nvrtcGetPTX(prog.0, ptx.as_mut_ptr() as *mut c_char) };
    if fetched != sys::nvrtcResult::NVRTC_SUCCESS {
        return Err(ShaderError::Compile {
            name: name.to_string(),
            log: format!("nvrtcGetPTX failed: {}", error_string(fetched)),
        });
    }

    debug!(kernel = name, ptx_bytes = ptx.len(), "Compiled CUDA source to PTX");
    Ok(CompileOutput { ptx, log })
}

/// Build the NVRTC option list: include flags in caller order, extra flags
/// verbatim, `-G` last in debug mode.
fn build_options(
    include_dirs: &[String],
    extra_flags: &[String],
    mode: CompileMode,
) -> Vec<String> {
    let mut options = Vec::with_capacity(include_dirs.len() + extra_flags.len() + 1);
    for dir in include_dirs {
        options.push(format!("-I {dir}"));
    }
    options.extend(extra_flags.iter().cloned());
    if mode == CompileMode::Debug {
        options.push("-G".to_string());
    }
    options
}

/// Fetch the full program log, stripping trailing NULs. Returns an empty
/// string if the log cannot be retrieved.
fn program_log(prog: &NvrtcProgram) -> String {
    let mut log_size = 0usize;
    // SAFETY: prog is live and log_size is a valid out pointer.
    let sized = unsafe { sys::nvrtcGetProgramLogSize(prog.0, &mut log_size) };
    if sized != sys::nvrtcResult::NVRTC_SUCCESS || log_size == 0 {
        return String::new();
    }

    let mut log = vec![0u8; log_size];
    // SAFETY: log has log_size writable bytes.
    let fetched = unsafe { sys::nvrtcGetProgramLog(prog.0, log.as_mut_ptr() as *mut c_char) };
    if fetched != sys::nvrtcResult::NVRTC_SUCCESS {
        return String::new();
    }

    while log.last() == Some(&0) {
        log.pop();
    }
    String::from_utf8_lossy(&log).into_owned()
}

fn error_string(result: sys::nvrtcResult) -> String {
    // SAFETY: nvrtcGetErrorString returns a static NUL-terminated string for
    // any result value.
    unsafe { CStr::from_ptr(sys::nvrtcGetErrorString(result)) }
        .to_string_lossy()
        .into_owned()
}
