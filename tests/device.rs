//! End-to-end device tests: compile a kernel from a source file, launch it,
//! and read results back. These need a CUDA device and driver — run with
//! `cargo test -- --ignored` on a GPU machine.

use std::io::Write;

use cudarc::driver::safe::{CudaContext, DevicePtr};
use cujit::{CompileMode, KernelArgs, Shader, ShaderError};
use tempfile::NamedTempFile;

const FILL_KERNEL: &str = r#"
extern "C" __global__ void fill_from_sum(float* out, const float* coeffs)
{
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    out[i] = coeffs[0] + coeffs[1] + coeffs[2] + coeffs[3];
}
"#;

fn write_kernel(source: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".cu")
        .tempfile()
        .expect("create temp kernel file");
    file.write_all(source.as_bytes()).expect("write kernel source");
    file
}

#[test]
#[ignore = "requires a CUDA device"]
fn fill_kernel_writes_expected_value() {
    let ctx = CudaContext::new(0).expect("CUDA context");
    let stream = ctx.default_stream();

    let file = write_kernel(FILL_KERNEL);
    let shader = Shader::compile(&ctx, file.path(), &[], &[], CompileMode::Release)
        .expect("compile kernel");

    const N_BLOCKS: usize = 128;
    const BLOCK_SIZE: usize = 64;

    let out = stream
        .alloc_zeros::<f32>(N_BLOCKS * BLOCK_SIZE)
        .expect("alloc output buffer");
    let coeffs = stream
        .memcpy_stod(&[1.0f32, 2.0, 3.0, 4.0])
        .expect("upload coefficients");

    let (out_ptr, _sync_out) = out.device_ptr(&stream);
    let (coeffs_ptr, _sync_coeffs) = coeffs.device_ptr(&stream);

    let mut args = KernelArgs::new().with(out_ptr).with(coeffs_ptr);

    // SAFETY: the argument layout matches fill_from_sum(float*, const
    // float*), both allocations outlive the launch, and the stream is valid.
    unsafe {
        shader
            .launch(
                "fill_from_sum",
                &mut args,
                [N_BLOCKS as u32, 1, 1],
                [BLOCK_SIZE as u32, 1, 1],
                stream.cu_stream(),
            )
            .expect("launch kernel");
    }

    stream.synchronize().expect("synchronize stream");

    let host: Vec<f32> = stream.memcpy_dtov(&out).expect("read back output");
    assert_eq!(host.len(), N_BLOCKS * BLOCK_SIZE);
    assert!(
        host.iter().all(|&v| v == 10.0),
        "every element must equal 10.0"
    );
}

#[test]
#[ignore = "requires a CUDA device"]
fn function_handles_are_cached_across_launches() {
    let ctx = CudaContext::new(0).expect("CUDA context");
    let stream = ctx.default_stream();

    let file = write_kernel(FILL_KERNEL);
    let shader = Shader::compile(&ctx, file.path(), &[], &[], CompileMode::Release)
        .expect("compile kernel");

    assert_eq!(shader.function_count(), 0);

    let out = stream.alloc_zeros::<f32>(64).expect("alloc output buffer");
    let coeffs = stream
        .memcpy_stod(&[1.0f32, 2.0, 3.0, 4.0])
        .expect("upload coefficients");

    for _ in 0..3 {
        let (out_ptr, _sync_out) = out.device_ptr(&stream);
        let (coeffs_ptr, _sync_coeffs) = coeffs.device_ptr(&stream);
        let mut args = KernelArgs::new().with(out_ptr).with(coeffs_ptr);

        // SAFETY: layout matches the kernel signature, allocations are live,
        // stream is valid.
        unsafe {
            shader
                .launch("fill_from_sum", &mut args, [1, 1, 1], [64, 1, 1], stream.cu_stream())
                .expect("launch kernel");
        }
    }

    stream.synchronize().expect("synchronize stream");
    assert_eq!(shader.function_count(), 1, "one name resolves exactly once");
}

#[test]
#[ignore = "requires a CUDA device"]
fn invalid_source_fails_with_log() {
    let ctx = CudaContext::new(0).expect("CUDA context");
    let file = write_kernel("extern \"C\" __global__ void broken( { not CUDA }");

    let err = Shader::compile(&ctx, file.path(), &[], &[], CompileMode::Release).unwrap_err();
    match err {
        ShaderError::Compile { log, .. } => {
            assert!(!log.is_empty(), "compile failure must surface the log")
        }
        other => panic!("expected Compile error, got {other}"),
    }
}

#[test]
#[ignore = "requires a CUDA device"]
fn unknown_entry_point_is_reported() {
    let ctx = CudaContext::new(0).expect("CUDA context");
    let file = write_kernel(FILL_KERNEL);
    let shader = Shader::compile(&ctx, file.path(), &[], &[], CompileMode::Release)
        .expect("compile kernel");

    let err = shader.get_function("does_not_exist").unwrap_err();
    assert!(matches!(err, ShaderError::SymbolNotFound { .. }));
    assert_eq!(shader.function_count(), 0);
}

#[test]
fn missing_source_file_fails_before_any_device_work() {
    // No context needed: the file read fails before NVRTC or the driver is
    // touched, so this runs everywhere.
    let err = cujit::compile::compile_file(
        std::path::Path::new("/no/such/kernel.cu"),
        &[],
        &[],
        CompileMode::Release,
    )
    .unwrap_err();
    assert!(matches!(err, ShaderError::SourceRead { .. }));
}
