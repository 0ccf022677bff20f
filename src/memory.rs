//! Executable memory backed by mmap.
//!
//! Finished instruction streams are copied into an anonymous mapping which
//! is then flipped to read+execute. The mapping lives until the owning
//! [`ExecutableMemory`] is dropped, which for compiled functions means the
//! life of the process in practice.

use std::ptr::NonNull;

/// Error type for memory operations.
#[derive(Debug)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// A page-aligned block of memory holding machine code.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a writable, not-yet-executable block of at least `size` bytes.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    /// Copy a finished instruction stream into fresh executable memory.
    pub fn from_code(code: &[u8]) -> Result<Self, MemoryError> {
        let mut mem = Self::new(code.len())?;
        mem.write(0, code)?;
        mem.make_executable()?;
        Ok(mem)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping (page-rounded).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Write bytes at `offset`. Fails once the block is executable.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        if offset + data.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Flip the block to read+execute. Irreversible; further writes fail.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }

        self.executable = true;
        Ok(())
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The block is exclusively owned and its contents are immutable once
// executable.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}
