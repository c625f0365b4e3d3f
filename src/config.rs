use color_eyre::eyre;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Limits and resources of the emulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Emulator {
    /// Threads per warp (used for `%laneid` and `%warpid`).
    pub warp_size: u32,
    pub max_threads_per_block: u32,
    /// Register slots available to each thread.
    pub max_registers_per_thread: usize,
    pub max_barriers_per_block: usize,

    /// Device global memory available to allocations.
    pub global_memory_size: u64,
    pub param_memory_size: u64,
    pub const_memory_size: u64,
    /// Per block shared memory, static and dynamic.
    pub shared_memory_per_block: u64,
    pub local_memory_per_thread: u64,
    /// Per thread call stack capacity.
    pub stack_size_per_thread: u64,
    /// Texture handle space.
    pub texture_memory_size: u64,

    /// Number of worker threads used to run thread blocks.
    ///
    /// `None` uses `NUM_THREADS` if set or the number of physical cores.
    pub worker_threads: Option<usize>,
}

impl Default for Emulator {
    fn default() -> Self {
        Self {
            warp_size: 32,
            max_threads_per_block: 1024,
            max_registers_per_thread: 255,
            max_barriers_per_block: 16,
            global_memory_size: 4 * 1024 * 1024 * 1024,
            param_memory_size: 4 * 1024,
            const_memory_size: 64 * 1024,
            shared_memory_per_block: 48 * 1024,
            local_memory_per_thread: 16 * 1024,
            stack_size_per_thread: 8 * 1024,
            texture_memory_size: 4 * 1024,
            worker_threads: None,
        }
    }
}

impl Emulator {
    pub fn from_json(json: &str) -> eyre::Result<Self> {
        let config = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|err| eyre::eyre!("failed to read config {}: {err}", path.display()))?;
        Self::from_json(&json)
    }

    /// Effective number of worker threads.
    #[must_use]
    pub fn num_worker_threads(&self) -> usize {
        self.worker_threads_or(|| crate::parallel::get_num_threads().ok().flatten())
    }

    fn worker_threads_or(&self, from_env: impl FnOnce() -> Option<usize>) -> usize {
        self.worker_threads
            .or_else(from_env)
            .unwrap_or_else(num_cpus::get_physical)
            .max(1)
    }
}
