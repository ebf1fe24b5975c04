// This module implements ExecutableBuffer, the owner of generated machine code. While building,
// the buffer is an append-only vector of 32-bit instruction words. finalize() turns the words
// into callable code: it releases any earlier mapping, maps an anonymous private read/write
// region through libc::mmap (rounded up to whole pages), copies the words in, invalidates the
// instruction cache over the range, and flips the region to read+execute with mprotect. The
// build words are discarded afterwards. The mapping is owned by a small RAII guard so it is
// unmapped exactly once, either on re-finalize or on drop. Finalized code is immutable, which
// makes the buffer Send and Sync and lets compiled kernels be shared across worker threads.

//! Executable memory for generated kernels.

use std::path::Path;
use std::ptr::NonNull;

use super::error::{JitError, JitResult};

/// Anonymous mapping holding finalized code.
struct Mapping {
    ptr: NonNull<u8>,
    /// Mapped length, a whole number of pages.
    len: usize,
    /// Number of code words at the start of the mapping.
    words: usize,
}

impl Mapping {
    fn new(words: &[u32]) -> JitResult<Self> {
        let code_len = std::mem::size_of_val(words);
        let page = page_size();
        let len = (code_len + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file descriptor involved; the result is
        // checked against MAP_FAILED before use.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(JitError::AllocationFailure {
                reason: format!("mmap of {len} bytes: {}", std::io::Error::last_os_error()),
            });
        }
        let ptr = NonNull::new(raw as *mut u8).ok_or_else(|| JitError::AllocationFailure {
            reason: "mmap returned a null mapping".to_string(),
        })?;
        let mapping = Mapping { ptr, len, words: words.len() };

        // SAFETY: the region is writable and at least code_len bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(words.as_ptr() as *const u8, ptr.as_ptr(), code_len);
        }
        clear_icache(ptr.as_ptr(), code_len);

        // SAFETY: ptr/len describe the mapping created above.
        let ret = unsafe { libc::mprotect(raw, len, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            // Dropping `mapping` releases the region.
            return Err(JitError::PermissionFailure {
                reason: format!("mprotect to read+execute: {}", std::io::Error::last_os_error()),
            });
        }
        Ok(mapping)
    }

    fn code(&self) -> &[u32] {
        // SAFETY: the mapping stays readable for its whole lifetime and starts with
        // `words` initialized instruction words.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u32, self.words) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len were returned by mmap and are unmapped only here.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Growable instruction word buffer that can be turned into executable code.
///
/// Lifecycle: building (append only) → finalized (mapped read+execute, build words
/// dropped) → destroyed (mapping released). Finalizing again releases the previous
/// mapping before creating a new one.
#[derive(Default)]
pub struct ExecutableBuffer {
    words: Vec<u32>,
    mapping: Option<Mapping>,
}

// SAFETY: the mapping is owned exclusively and never written after mprotect.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one instruction word to the build sequence.
    #[inline]
    pub fn append(&mut self, word: u32) {
        self.words.push(word);
    }

    pub fn extend(&mut self, words: &[u32]) {
        self.words.extend_from_slice(words);
    }

    /// Number of code words: pending build words, or the finalized code if nothing
    /// is pending.
    pub fn len_words(&self) -> usize {
        self.words().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len_words() == 0
    }

    /// The pending build words, or the finalized code when nothing is pending.
    pub fn words(&self) -> &[u32] {
        match &self.mapping {
            Some(mapping) if self.words.is_empty() => mapping.code(),
            _ => &self.words,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.mapping.is_some()
    }

    /// Map the build words as executable code, releasing the previous mapping.
    ///
    /// With no pending words this is a no-op: a finalized buffer keeps its mapping
    /// and a fresh buffer keeps a null entry pointer.
    pub fn finalize(&mut self) -> JitResult<()> {
        if self.words.is_empty() {
            return Ok(());
        }
        self.mapping = None;
        let mapping = Mapping::new(&self.words)?;
        log::trace!(
            "finalized {} words into {} mapped bytes at {:p}",
            mapping.words,
            mapping.len,
            mapping.ptr
        );
        self.mapping = Some(mapping);
        self.words = Vec::new();
        Ok(())
    }

    /// Entry address of the finalized code, null if never finalized.
    pub fn entry_ptr(&self) -> *const u8 {
        self.mapping
            .as_ref()
            .map_or(std::ptr::null(), |m| m.ptr.as_ptr() as *const u8)
    }

    /// Reinterpret the entry address as a function pointer of type `F`.
    ///
    /// Returns `None` if the buffer was never finalized (or finalized empty), or if
    /// `F` is not pointer sized.
    ///
    /// # Safety
    /// `F` must be an `extern "C"` function pointer type whose signature matches the
    /// code in the buffer, and the returned pointer must not outlive `self`.
    pub unsafe fn as_callable<F: Copy>(&self) -> Option<F> {
        if std::mem::size_of::<F>() != std::mem::size_of::<*const u8>() {
            return None;
        }
        let entry = self.entry_ptr();
        if entry.is_null() {
            return None;
        }
        Some(std::mem::transmute_copy::<*const u8, F>(&entry))
    }

    /// Write the code words to `path` as little-endian bytes.
    pub fn dump(&self, path: impl AsRef<Path>) -> JitResult<()> {
        let path = path.as_ref();
        let bytes: Vec<u8> = self.words().iter().flat_map(|w| w.to_le_bytes()).collect();
        std::fs::write(path, bytes).map_err(|source| JitError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl std::fmt::Debug for ExecutableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableBuffer")
            .field("words", &self.len_words())
            .field("entry", &self.entry_ptr())
            .finish()
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Make freshly written code visible to instruction fetch.
#[cfg(target_arch = "aarch64")]
fn clear_icache(start: *const u8, len: usize) {
    use std::arch::asm;

    let ctr: u64;
    // SAFETY: CTR_EL0 is readable from EL0 on Linux and macOS.
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack)) };
    let dline = 4usize << ((ctr >> 16) & 0xf);
    let iline = 4usize << (ctr & 0xf);
    let begin = start as usize;
    let end = begin + len;

    // SAFETY: cache maintenance by VA over a mapped range has no other side effects.
    unsafe {
        let mut addr = begin & !(dline - 1);
        while addr < end {
            asm!("dc cvau, {}", in(reg) addr, options(nostack));
            addr += dline;
        }
        asm!("dsb ish", options(nostack));
        let mut addr = begin & !(iline - 1);
        while addr < end {
            asm!("ic ivau, {}", in(reg) addr, options(nostack));
            addr += iline;
        }
        asm!("dsb ish", "isb", options(nostack));
    }
}

/// Generated code is never executed on other architectures.
#[cfg(not(target_arch = "aarch64"))]
fn clear_icache(_start: *const u8, _len: usize) {}
