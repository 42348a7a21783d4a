// Shared memory backend for Linux
// Named objects under /dev/shm, mapped MAP_SHARED so every process sees the same pages

use std::fmt::Debug;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::ptr::NonNull;

#[cfg(target_os = "linux")]
use std::os::fd::AsRawFd;
#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

const SHM_DIR: &str = "/dev/shm";

/// Shared memory backend trait for memory mapping
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Name of the shm object backing this mapping
    fn name(&self) -> &str;
}

/// Path of the shm object for `name`.
pub fn shm_path(name: &str) -> PathBuf {
    PathBuf::from(SHM_DIR).join(name)
}

/// Create a new named shared memory region of exactly `size` bytes.
///
/// Fails with `AlreadyExists` if an object with that name is already present; the
/// caller decides whether a leftover object may be reclaimed.
#[cfg(target_os = "linux")]
pub fn create_shared_memory(name: &str, size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::create(name, size)?))
}

/// Attach to an existing shared memory region, mapping its full current size.
#[cfg(target_os = "linux")]
pub fn attach_shared_memory(name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::attach(name)?))
}

/// Remove the name of a shared memory object. Existing mappings stay valid until unmapped.
pub fn unlink_shared_memory(name: &str) -> io::Result<()> {
    fs::remove_file(shm_path(name))
}

#[cfg(not(target_os = "linux"))]
pub fn create_shared_memory(_name: &str, _size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn attach_shared_memory(_name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct LinuxSharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    name: String,
}

// The mapping is plain memory; all cross-thread access goes through atomics in the
// segment header.
#[cfg(target_os = "linux")]
unsafe impl Send for LinuxSharedMemory {}
#[cfg(target_os = "linux")]
unsafe impl Sync for LinuxSharedMemory {}

#[cfg(target_os = "linux")]
impl LinuxSharedMemory {
    /// Create the object exclusively, size it and map it.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory size must be non-zero",
            ));
        }

        let path = shm_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;

        // Set size; the kernel zero-fills the new pages
        if let Err(e) = file.set_len(size as u64) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        match Self::map(&file, size, name) {
            Ok(shm) => Ok(shm),
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Open an existing object and map all of it.
    pub fn attach(name: &str) -> io::Result<Self> {
        let path = shm_path(name);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let size = file.metadata()?.len() as usize;
        if size == 0 {
            // Creator has not sized it yet
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("shared memory at {} is not initialised yet", path.display()),
            ));
        }

        Self::map(&file, size, name)
    }

    fn map(file: &fs::File, size: usize, name: &str) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // The mapping outlives the descriptor; `file` is closed when it drops
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        Ok(Self {
            ptr,
            size,
            name: name.to_owned(),
        })
    }
}

#[cfg(target_os = "linux")]
impl Drop for LinuxSharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(target_os = "linux")]
impl SharedMemoryBackend for LinuxSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn name(&self) -> &str {
        &self.name
    }
}
