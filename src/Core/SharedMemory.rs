// Shared memory backends for station regions
// File regions live in /dev/shm so independently started clients can map them.
// Local regions live on the heap and are found by name within one process.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Deserialize;

#[cfg(target_os = "linux")]
use std::fs::OpenOptions;
#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, IntoRawFd};
#[cfg(target_os = "linux")]
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};

/// Every region and every logical sub-region starts on this boundary.
pub const REGION_ALIGN: usize = 128;

/// Round `size` up to the region alignment.
#[inline]
pub const fn align_up(size: usize) -> usize {
    (size + REGION_ALIGN - 1) & !(REGION_ALIGN - 1)
}

/// Shared memory backend trait for mapped station regions
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Get the underlying handle
    fn raw_handle(&self) -> RawHandle;
}

/// Platform-specific handle type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawHandle {
    /// Unix file descriptor of a /dev/shm file
    Fd(i32),
    /// Process-local region id
    Local(u64),
}

/// Where a station region lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionBacking {
    /// A file under /dev/shm, visible to other processes.
    #[default]
    File,
    /// A heap block visible only inside this process.
    Local,
}

/// Create a new region, replacing any previous region of the same name.
///
/// # Arguments
/// * `size` - Size of the region in bytes (rounded up to `REGION_ALIGN`)
/// * `name` - Name other processes use to attach
/// * `backing` - File or process-local backing
pub fn create_shared_memory(
    size: usize,
    name: &str,
    backing: RegionBacking,
) -> io::Result<Box<dyn SharedMemoryBackend>> {
    let size = align_up(size);
    match backing {
        RegionBacking::Local => Ok(Box::new(LocalSharedMemory::create(size, name)?)),
        RegionBacking::File => create_file_region(size, name),
    }
}

/// Attach to an existing region.
///
/// # Arguments
/// * `name` - Name of the region to attach to
/// * `min_size` - Smallest acceptable size (for validation)
/// * `backing` - File or process-local backing
pub fn attach_shared_memory(
    name: &str,
    min_size: usize,
    backing: RegionBacking,
) -> io::Result<Box<dyn SharedMemoryBackend>> {
    match backing {
        RegionBacking::Local => Ok(Box::new(LocalSharedMemory::attach(name, min_size)?)),
        RegionBacking::File => attach_file_region(name, min_size),
    }
}

#[cfg(target_os = "linux")]
fn create_file_region(size: usize, name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::create(size, name)?))
}

#[cfg(target_os = "linux")]
fn attach_file_region(name: &str, min_size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::attach(name, min_size)?))
}

#[cfg(not(target_os = "linux"))]
fn create_file_region(_size: usize, _name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "File-backed shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
fn attach_file_region(_name: &str, _min_size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "File-backed shared memory only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct LinuxSharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: i32,
    path: String,
    inode: u64,
    owner: bool,
}

#[cfg(target_os = "linux")]
unsafe impl Send for LinuxSharedMemory {}
#[cfg(target_os = "linux")]
unsafe impl Sync for LinuxSharedMemory {}

#[cfg(target_os = "linux")]
impl LinuxSharedMemory {
    /// Create /dev/shm/<name> afresh and map it.
    pub fn create(size: usize, name: &str) -> io::Result<Self> {
        let path = format!("/dev/shm/{}", name);

        // Unlink a leftover region first; clients still mapping it keep the old file
        let _ = std::fs::remove_file(&path);

        // Clients of other users write into their mailboxes, so the file is world writable
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to create shared memory file at {}: {}", path, e),
                )
            })?;

        if unsafe { libc::ftruncate(file.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let inode = file.metadata()?.ino();
        let fd = file.into_raw_fd();
        let ptr = unsafe { map_fd(fd, size) }?;

        Ok(Self {
            ptr,
            size,
            fd,
            path,
            inode,
            owner: true,
        })
    }

    /// Map an existing /dev/shm/<name>.
    pub fn attach(name: &str, min_size: usize) -> io::Result<Self> {
        let path = format!("/dev/shm/{}", name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to open shared memory at {}: {}", path, e),
                )
            })?;

        let metadata = file.metadata()?;
        let size = metadata.len() as usize;
        if size < min_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Shared memory size too small: expected at least {} bytes, got {}",
                    min_size, size
                ),
            ));
        }

        let fd = file.into_raw_fd();
        let ptr = unsafe { map_fd(fd, size) }?;

        Ok(Self {
            ptr,
            size,
            fd,
            path,
            inode: metadata.ino(),
            owner: false,
        })
    }
}

/// # Safety
/// `fd` must be an open descriptor of a file at least `size` bytes long.
/// On failure the descriptor is closed.
#[cfg(target_os = "linux")]
unsafe fn map_fd(fd: i32, size: usize) -> io::Result<NonNull<u8>> {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        fd,
        0,
    );

    if ptr == libc::MAP_FAILED {
        let err = io::Error::last_os_error();
        libc::close(fd);
        return Err(err);
    }

    // mmap hands out page-aligned addresses, which covers REGION_ALIGN
    if (ptr as usize) % REGION_ALIGN != 0 {
        libc::munmap(ptr, size);
        libc::close(fd);
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Shared memory not properly aligned",
        ));
    }

    match NonNull::new(ptr as *mut u8) {
        Some(ptr) => Ok(ptr),
        None => {
            libc::close(fd);
            Err(io::Error::new(io::ErrorKind::Other, "mmap returned null"))
        }
    }
}

#[cfg(target_os = "linux")]
impl Drop for LinuxSharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
        // Only unlink the file if it has not been replaced by a newer region
        let still_ours = std::fs::metadata(&self.path)
            .map(|m| m.ino() == self.inode)
            .unwrap_or(false);
        if self.owner && still_ours {
            let _ = std::fs::remove_file(&self.path);
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

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Fd(self.fd)
    }
}

// -----------------------------------------------------------------------------
// Process-local regions
// -----------------------------------------------------------------------------

struct LocalBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    id: u64,
}

unsafe impl Send for LocalBlock {}
unsafe impl Sync for LocalBlock {}

impl Drop for LocalBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

lazy_static::lazy_static! {
    static ref LOCAL_REGIONS: Mutex<HashMap<String, Weak<LocalBlock>>> = Mutex::new(HashMap::new());
}

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// A zeroed heap block registered under a name, standing in for /dev/shm.
pub struct LocalSharedMemory {
    block: Arc<LocalBlock>,
    name: String,
    owner: bool,
}

impl LocalSharedMemory {
    pub fn create(size: usize, name: &str) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Region size must be greater than zero",
            ));
        }
        let layout = Layout::from_size_align(size, REGION_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "Region allocation failed"))?;

        let block = Arc::new(LocalBlock {
            ptr,
            layout,
            id: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed),
        });
        LOCAL_REGIONS
            .lock()
            .insert(name.to_string(), Arc::downgrade(&block));

        Ok(Self {
            block,
            name: name.to_string(),
            owner: true,
        })
    }

    pub fn attach(name: &str, min_size: usize) -> io::Result<Self> {
        let block = LOCAL_REGIONS
            .lock()
            .get(name)
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("No local region named {}", name),
                )
            })?;

        if block.layout.size() < min_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Shared memory size too small: expected at least {} bytes, got {}",
                    min_size,
                    block.layout.size()
                ),
            ));
        }

        Ok(Self {
            block,
            name: name.to_string(),
            owner: false,
        })
    }
}

impl Drop for LocalSharedMemory {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        let mut regions = LOCAL_REGIONS.lock();
        let ours = regions
            .get(&self.name)
            .map(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&self.block)))
            .unwrap_or(false);
        if ours {
            regions.remove(&self.name);
        }
    }
}

impl Debug for LocalSharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSharedMemory")
            .field("name", &self.name)
            .field("id", &self.block.id)
            .field("size", &self.block.layout.size())
            .field("owner", &self.owner)
            .finish()
    }
}

impl SharedMemoryBackend for LocalSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.block.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.block.layout.size()
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Local(self.block.id)
    }
}
