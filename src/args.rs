//! Kernel argument packing — positional byte-copy marshaling for
//! `cuLaunchKernel`.
//!
//! CUDA's launch ABI takes `void** kernelParams` where each entry points to
//! the storage of one parameter value, in positional order. [`KernelArgs`]
//! is the marshaller that produces that array from a sequential push API:
//! each value is appended to a contiguous byte buffer by its raw byte
//! representation, and [`KernelArgs::kernel_params`] derives one pointer per
//! recorded offset.
//!
//! Argument identity is purely positional — no name or type tag is retained,
//! so values must be pushed in the exact order the kernel expects.

use std::ffi::c_void;
use std::mem;

/// Marker for values that may be packed as kernel parameters.
///
/// # Safety
///
/// Implementors must be plain fixed-layout values whose in-memory byte
/// representation is exactly what the device-side parameter expects: no
/// interior padding the kernel reads, no references to host memory, no drop
/// glue. The scalar primitives, `CUdeviceptr` (a `u64`), and small float
/// vectors all qualify.
pub unsafe trait KernelParam: Copy {}

unsafe impl KernelParam for i8 {}
unsafe impl KernelParam for u8 {}
unsafe impl KernelParam for i16 {}
unsafe impl KernelParam for u16 {}
unsafe impl KernelParam for i32 {}
unsafe impl KernelParam for u32 {}
unsafe impl KernelParam for i64 {}
unsafe impl KernelParam for u64 {}
unsafe impl KernelParam for usize {}
unsafe impl KernelParam for isize {}
unsafe impl KernelParam for f32 {}
unsafe impl KernelParam for f64 {}
unsafe impl KernelParam for [f32; 2] {}
unsafe impl KernelParam for [f32; 4] {}

/// Positionally packed kernel arguments.
///
/// Holds one contiguous byte buffer plus the starting offset of each pushed
/// value. Offsets are monotonically increasing and non-overlapping; each
/// spans exactly the byte width of the value pushed at that position.
///
/// Build the full argument set, take the pointer list once via
/// [`kernel_params`](Self::kernel_params), launch, and only then mutate or
/// drop the packer — the pointer list points into this buffer and is
/// invalidated by any mutating call.
#[derive(Clone, Debug, Default)]
pub struct KernelArgs {
    buffer: Vec<u8>,
    offsets: Vec<usize>,
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value's raw bytes and record its starting offset.
    ///
    /// Must be called in the exact order the target kernel declares its
    /// parameters.
    pub fn push<T: KernelParam>(&mut self, value: T) {
        let offset = self.buffer.len();
        // SAFETY: T is Copy with a fixed layout (KernelParam contract), so
        // reading size_of::<T>() bytes from its address is valid.
        let bytes = unsafe {
            std::slice::from_raw_parts(&value as *const T as *const u8, mem::size_of::<T>())
        };
        self.buffer.extend_from_slice(bytes);
        self.offsets.push(offset);
    }

    /// Chaining variant of [`push`](Self::push).
    pub fn with<T: KernelParam>(mut self, value: T) -> Self {
        self.push(value);
        self
    }

    /// Reset the buffer and offset list, allowing reuse across launches.
    ///
    /// Invalidates any previously derived pointer list.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.offsets.clear();
    }

    /// Number of packed arguments.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Total packed size in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Starting offset of each argument within the packed buffer.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Build the `void**` argument pointer array in push order.
    ///
    /// Each entry points at the stored bytes for that parameter position.
    /// The returned `Vec` borrows from `self`'s buffer — it is valid only
    /// until the next call to [`push`](Self::push) or [`clear`](Self::clear),
    /// or until the packer is dropped.
    pub fn kernel_params(&mut self) -> Vec<*mut c_void> {
        let base = self.buffer.as_mut_ptr();
        self.offsets
            .iter()
            // SAFETY: every recorded offset is < buffer.len(), so the
            // resulting pointer stays inside the allocation.
            .map(|&offset| unsafe { base.add(offset) } as *mut c_void)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_match_value_widths() {
        // An 8-byte handle followed by a 4-byte float: offsets 0 and 8,
        // 12 bytes total.
        let mut args = KernelArgs::new();
        args.push(0x1000u64);
        args.push(10.0f32);

        assert_eq!(args.len(), 2);
        assert_eq!(args.offsets(), &[0, 8]);
        assert_eq!(args.size_in_bytes(), 12);
    }

    #[test]
    fn pointers_read_back_in_push_order() {
        let mut args = KernelArgs::new()
            .with(0xAAAAu64)
            .with(42i32)
            .with(0xBBBBu64)
            .with(3.5f32)
            .with(100u32);

        let ptrs = args.kernel_params();
        assert_eq!(ptrs.len(), 5);

        // SAFETY: pointers are valid, owned by `args`, and correctly typed.
        unsafe {
            assert_eq!(*(ptrs[0] as *const u64), 0xAAAA);
            assert_eq!(*(ptrs[1] as *const i32), 42);
            assert_eq!(*(ptrs[2] as *const u64), 0xBBBB);
            assert_eq!(*(ptrs[3] as *const f32), 3.5);
            assert_eq!(*(ptrs[4] as *const u32), 100);
        }
    }

    #[test]
    fn buffer_concatenates_raw_bytes() {
        let mut args = KernelArgs::new();
        args.push(0x0102_0304u32);
        args.push(0x05u8);

        let ptrs = args.kernel_params();
        // SAFETY: first pointer addresses 4 valid bytes, second addresses 1.
        unsafe {
            assert_eq!(*(ptrs[0] as *const u32), 0x0102_0304);
            assert_eq!(*(ptrs[1] as *const u8), 0x05);
        }
        assert_eq!(args.size_in_bytes(), 5);
        assert_eq!(args.offsets(), &[0, 4]);
    }

    #[test]
    fn clear_is_equivalent_to_fresh() {
        let mut reused = KernelArgs::new();
        reused.push(1u64);
        reused.push(2.0f64);
        reused.clear();

        assert!(reused.is_empty());
        assert_eq!(reused.size_in_bytes(), 0);

        reused.push(7u32);
        reused.push(8.0f32);

        let mut fresh = KernelArgs::new();
        fresh.push(7u32);
        fresh.push(8.0f32);

        assert_eq!(reused.offsets(), fresh.offsets());
        assert_eq!(reused.size_in_bytes(), fresh.size_in_bytes());

        let reused_ptrs = reused.kernel_params();
        // SAFETY: pointers are valid and correctly typed.
        unsafe {
            assert_eq!(*(reused_ptrs[0] as *const u32), 7);
            assert_eq!(*(reused_ptrs[1] as *const f32), 8.0);
        }
    }

    #[test]
    fn empty_packer_yields_empty_pointer_list() {
        let mut args = KernelArgs::new();
        assert!(args.is_empty());
        assert!(args.kernel_params().is_empty());
    }

    #[test]
    fn vector_params_pack_full_width() {
        let mut args = KernelArgs::new().with([1.0f32, 2.0]).with([3.0f32, 4.0, 5.0, 6.0]);

        assert_eq!(args.offsets(), &[0, 8]);
        assert_eq!(args.size_in_bytes(), 24);

        let ptrs = args.kernel_params();
        // SAFETY: pointers are valid, owned by `args`, and correctly typed.
        unsafe {
            assert_eq!(*(ptrs[0] as *const [f32; 2]), [1.0, 2.0]);
            assert_eq!(*(ptrs[1] as *const [f32; 4]), [3.0, 4.0, 5.0, 6.0]);
        }
    }
}
