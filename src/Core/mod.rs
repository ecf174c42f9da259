pub mod SharedMemory;
pub mod futex;
pub mod process;

pub use SharedMemory::{
    align_up, attach_shared_memory, create_shared_memory, RawHandle, RegionBacking,
    SharedMemoryBackend, REGION_ALIGN,
};
