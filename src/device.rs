//! Device contract and the in-process emulator backend.

use crate::config;
use crate::error::Error;
use crate::kernel::{EmulatedKernel, KernelAttributes};
use crate::memory::{AllocationInfo, Allocations, GlobalMemory};
use crate::module::{GlobalSymbol, ModuleSymbols, TextureBinding};
use crate::sync::{atomic, Arc, Mutex, RwLock};
use crate::trace::TraceGenerator;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use ptx::{Dim, Space};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// The stream every device starts with.
pub const DEFAULT_STREAM: u64 = 0;

static NEXT_DEVICE: atomic::AtomicUsize = atomic::AtomicUsize::new(0);

/// Device currently selected by this process.
static SELECTED: Lazy<Mutex<Option<usize>>> = Lazy::new(|| Mutex::new(None));

/// Exclusive selection of a device, released on drop.
#[derive(Debug)]
#[must_use]
pub struct Selection {
    device: usize,
}

impl Selection {
    fn acquire(device: usize) -> Result<Self, Error> {
        let mut selected = SELECTED.lock();
        match *selected {
            Some(other) => Err(Error::DeviceBusy(other)),
            None => {
                log::debug!("select device {device}");
                *selected = Some(device);
                Ok(Self { device })
            }
        }
    }

    #[must_use]
    pub fn device(&self) -> usize {
        self.device
    }
}

impl Drop for Selection {
    fn drop(&mut self) {
        let mut selected = SELECTED.lock();
        if *selected == Some(self.device) {
            log::debug!("unselect device {}", self.device);
            *selected = None;
        }
    }
}

/// Geometry and arguments of a kernel launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: Dim,
    pub block: Dim,
    /// Bytes of dynamically sized shared memory.
    pub shared_memory: u64,
    /// Packed kernel arguments.
    pub arguments: Vec<u8>,
}

impl LaunchConfig {
    #[must_use]
    pub fn new(grid: impl Into<Dim>, block: impl Into<Dim>) -> Self {
        Self {
            grid: grid.into(),
            block: block.into(),
            shared_memory: 0,
            arguments: Vec::new(),
        }
    }

    #[must_use]
    pub fn shared_memory(mut self, bytes: u64) -> Self {
        self.shared_memory = bytes;
        self
    }

    /// Append an argument, aligned to its size.
    #[must_use]
    pub fn arg(mut self, value: &[u8]) -> Self {
        let align = value.len().max(1).next_power_of_two();
        let offset = self.arguments.len().next_multiple_of(align);
        self.arguments.resize(offset, 0);
        self.arguments.extend_from_slice(value);
        self
    }
}

/// Capabilities a device backend offers to the runtime.
///
/// Launches are synchronous, so stream and event operations only keep the
/// bookkeeping consistent.
pub trait Device: Send + Sync {
    /// Allocate `size` bytes of zeroed device memory.
    fn allocate(&self, size: u64) -> Result<u64, Error>;

    /// Allocate host memory mapped into the device address space.
    fn allocate_host(&self, size: u64) -> Result<u64, Error>;

    fn free(&self, address: u64) -> Result<(), Error>;

    /// Allocation containing `address`.
    fn memory_allocation(&self, address: u64) -> Option<AllocationInfo>;

    /// Allocations closest to `address`, for diagnostics.
    fn nearby_allocations(&self, address: u64) -> Vec<AllocationInfo>;

    fn write(&self, address: u64, data: &[u8]) -> Result<(), Error>;

    fn read(&self, address: u64, data: &mut [u8]) -> Result<(), Error>;

    fn create_stream(&self) -> u64;

    fn destroy_stream(&self, stream: u64) -> Result<(), Error>;

    fn synchronize_stream(&self, stream: u64) -> Result<(), Error>;

    /// Stream used by subsequent launches.
    fn set_stream(&self, stream: u64) -> Result<(), Error>;

    fn create_event(&self) -> u64;

    fn destroy_event(&self, event: u64) -> Result<(), Error>;

    fn record_event(&self, event: u64, stream: u64) -> Result<(), Error>;

    fn synchronize_event(&self, event: u64) -> Result<(), Error>;

    /// Time between two recorded events.
    fn event_time(&self, start: u64, end: u64) -> Result<Duration, Error>;

    /// Load a module, allocating its globals and preparing its kernels.
    fn load(&self, module: ptx::Module) -> Result<(), Error>;

    fn unload(&self, module: &str) -> Result<(), Error>;

    fn attributes(&self, module: &str, kernel: &str) -> Result<KernelAttributes, Error>;

    /// Error of the last failed operation, clearing it.
    fn last_error(&self) -> Option<Error>;

    fn bind_texture(&self, module: &str, texture: &str, binding: TextureBinding) -> Result<(), Error>;

    fn unbind_texture(&self, module: &str, texture: &str) -> Result<(), Error>;

    fn texture_reference(&self, module: &str, texture: &str) -> Result<Option<TextureBinding>, Error>;

    /// Run `kernel` of `module` to completion.
    fn launch(&self, module: &str, kernel: &str, launch: &LaunchConfig) -> Result<(), Error>;

    /// Wait for all outstanding work.
    fn synchronize(&self) -> Result<(), Error>;

    /// Bound the worker threads used by launches (`None` for the configured default).
    fn limit_worker_threads(&self, threads: Option<usize>);

    /// Select this device exclusively for the current process.
    fn select(&self) -> Result<Selection, Error>;

    fn unselect(&self, selection: Selection) {
        drop(selection);
    }

    /// Device address of a module variable.
    fn global_address(&self, module: &str, name: &str) -> Result<u64, Error>;
}

#[derive(Debug)]
struct LoadedModule {
    symbols: Arc<ModuleSymbols>,
    kernels: IndexMap<String, Arc<EmulatedKernel>>,
    /// Allocations backing module variables.
    allocations: Vec<u64>,
}

/// Device executing kernels on the host.
pub struct EmulatorDevice {
    id: usize,
    config: Arc<config::Emulator>,
    allocations: Arc<Allocations>,
    modules: RwLock<IndexMap<String, LoadedModule>>,
    streams: Mutex<HashSet<u64>>,
    current_stream: Mutex<u64>,
    events: Mutex<HashMap<u64, Option<Instant>>>,
    next_handle: atomic::AtomicU64,
    worker_threads: Mutex<Option<usize>>,
    trace_generators: Mutex<Vec<Arc<dyn TraceGenerator>>>,
    last_error: Mutex<Option<Error>>,
}

impl std::fmt::Debug for EmulatorDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorDevice")
            .field("id", &self.id)
            .field("modules", &self.modules.read().keys().collect::<Vec<_>>())
            .field("allocations", &self.allocations.len())
            .finish_non_exhaustive()
    }
}

impl Default for EmulatorDevice {
    fn default() -> Self {
        Self::new(config::Emulator::default())
    }
}

impl EmulatorDevice {
    #[must_use]
    pub fn new(config: config::Emulator) -> Self {
        let allocations = Allocations::new(config.global_memory_size);
        Self {
            id: NEXT_DEVICE.fetch_add(1, atomic::Ordering::Relaxed),
            config: Arc::new(config),
            allocations: Arc::new(allocations),
            modules: RwLock::new(IndexMap::new()),
            streams: Mutex::new(HashSet::from([DEFAULT_STREAM])),
            current_stream: Mutex::new(DEFAULT_STREAM),
            events: Mutex::new(HashMap::new()),
            next_handle: atomic::AtomicU64::new(1),
            worker_threads: Mutex::new(None),
            trace_generators: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn properties(&self) -> &config::Emulator {
        &self.config
    }

    #[must_use]
    pub fn modules(&self) -> Vec<String> {
        self.modules.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn current_stream(&self) -> u64 {
        *self.current_stream.lock()
    }

    /// Emulation context of a loaded kernel or device function.
    pub fn kernel(&self, module: &str, kernel: &str) -> Result<Arc<EmulatedKernel>, Error> {
        let modules = self.modules.read();
        let loaded = modules
            .get(module)
            .ok_or_else(|| Error::UnknownModule(module.to_string()))?;
        loaded
            .kernels
            .get(kernel)
            .cloned()
            .ok_or_else(|| Error::UnknownKernel {
                module: module.to_string(),
                kernel: kernel.to_string(),
            })
    }

    fn symbols(&self, module: &str) -> Result<Arc<ModuleSymbols>, Error> {
        self.modules
            .read()
            .get(module)
            .map(|loaded| Arc::clone(&loaded.symbols))
            .ok_or_else(|| Error::UnknownModule(module.to_string()))
    }

    /// Attach a generator to every subsequent launch.
    pub fn add_trace_generator(&self, generator: Arc<dyn TraceGenerator>) {
        self.trace_generators.lock().push(generator);
    }

    pub fn remove_trace_generator(&self, generator: &Arc<dyn TraceGenerator>) -> bool {
        let mut generators = self.trace_generators.lock();
        let before = generators.len();
        generators.retain(|other| !std::ptr::addr_eq(Arc::as_ptr(other), Arc::as_ptr(generator)));
        generators.len() != before
    }

    fn record_error<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result {
            log::error!("device {}: {err}", self.id);
            if let Error::InvalidMemoryAccess { address, .. } = err {
                for info in self.allocations.nearby(*address) {
                    log::error!("    nearby allocation {info}");
                }
            }
            *self.last_error.lock() = Some(err.clone());
        }
        result
    }

    fn check_stream(&self, stream: u64) -> Result<(), Error> {
        if self.streams.lock().contains(&stream) {
            Ok(())
        } else {
            Err(Error::UnknownStream(stream))
        }
    }

    fn load_module(&self, module: ptx::Module) -> Result<(), Error> {
        let mut modules = self.modules.write();
        if modules.contains_key(&module.name) {
            return Err(Error::DuplicateModule(module.name));
        }
        let module = Arc::new(module);
        let symbols = Arc::new(ModuleSymbols::new(Arc::clone(&module)));

        let mut allocations = Vec::new();
        let globals = module
            .variables
            .iter()
            .filter(|var| matches!(var.space, Space::Global | Space::Const) && !var.external);
        let release = |allocations: &[u64]| {
            for address in allocations {
                let _ = self.allocations.free(*address);
            }
        };
        for var in globals {
            let size = var.size();
            let address = match self.allocations.allocate(size, false) {
                Ok(address) => address,
                Err(err) => {
                    release(&allocations);
                    return Err(err);
                }
            };
            allocations.push(address);
            if let Some(initializer) = &var.initializer {
                let len = initializer.len().min(size as usize);
                self.allocations.write(address, &initializer[..len])?;
            }
            symbols.define_global(
                &var.name,
                GlobalSymbol {
                    address,
                    size,
                    space: var.space,
                },
            );
        }

        for loaded in modules.values() {
            symbols.import(&loaded.symbols);
            loaded.symbols.import(&symbols);
        }

        let global: Arc<dyn GlobalMemory> = self.allocations.clone();
        let kernels: IndexMap<String, Arc<EmulatedKernel>> = module
            .functions
            .iter()
            .map(|function| {
                let kernel = EmulatedKernel::new(
                    Arc::clone(function),
                    Arc::clone(&symbols),
                    Arc::clone(&global),
                    Arc::clone(&self.config),
                );
                symbols.register_kernel(&kernel);
                (function.name.clone(), kernel)
            })
            .collect();

        if let Err(err) = kernels.values().try_for_each(|kernel| kernel.initialize()) {
            release(&allocations);
            return Err(err);
        }

        log::debug!(
            "device {}: loaded module {} ({} kernels, {} globals)",
            self.id,
            module.name,
            kernels.len(),
            allocations.len()
        );
        modules.insert(
            module.name.clone(),
            LoadedModule {
                symbols,
                kernels,
                allocations,
            },
        );
        Ok(())
    }

    #[tracing::instrument(name = "launch", skip(self, kernel, launch), fields(kernel = kernel.name()))]
    fn run(&self, kernel: &Arc<EmulatedKernel>, launch: &LaunchConfig) -> Result<(), Error> {
        if launch.grid.z != 1 {
            return Err(Error::invalid_kernel(
                kernel.name(),
                format!("grid {} is not two dimensional", launch.grid),
            ));
        }
        let generators = self.trace_generators.lock().clone();
        let worker_threads = *self.worker_threads.lock();
        let start = Instant::now();
        let result = kernel.launch(launch, worker_threads, &generators);
        log::debug!(
            "{} with grid {} and block {} finished in {:?}",
            kernel.name(),
            launch.grid,
            launch.block,
            start.elapsed()
        );
        result
    }
}

impl Device for EmulatorDevice {
    fn allocate(&self, size: u64) -> Result<u64, Error> {
        self.record_error(self.allocations.allocate(size, false))
    }

    fn allocate_host(&self, size: u64) -> Result<u64, Error> {
        self.record_error(self.allocations.allocate(size, true))
    }

    fn free(&self, address: u64) -> Result<(), Error> {
        self.record_error(self.allocations.free(address))
    }

    fn memory_allocation(&self, address: u64) -> Option<AllocationInfo> {
        self.allocations.info(address)
    }

    fn nearby_allocations(&self, address: u64) -> Vec<AllocationInfo> {
        self.allocations.nearby(address)
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<(), Error> {
        self.record_error(self.allocations.write(address, data))
    }

    fn read(&self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        self.record_error(self.allocations.read(address, data))
    }

    fn create_stream(&self) -> u64 {
        let stream = self.next_handle.fetch_add(1, atomic::Ordering::Relaxed);
        self.streams.lock().insert(stream);
        stream
    }

    fn destroy_stream(&self, stream: u64) -> Result<(), Error> {
        let removed = stream != DEFAULT_STREAM && self.streams.lock().remove(&stream);
        if !removed {
            return self.record_error(Err(Error::UnknownStream(stream)));
        }
        let mut current = self.current_stream.lock();
        if *current == stream {
            *current = DEFAULT_STREAM;
        }
        Ok(())
    }

    fn synchronize_stream(&self, stream: u64) -> Result<(), Error> {
        self.record_error(self.check_stream(stream))
    }

    fn set_stream(&self, stream: u64) -> Result<(), Error> {
        self.record_error(self.check_stream(stream))?;
        *self.current_stream.lock() = stream;
        Ok(())
    }

    fn create_event(&self) -> u64 {
        let event = self.next_handle.fetch_add(1, atomic::Ordering::Relaxed);
        self.events.lock().insert(event, None);
        event
    }

    fn destroy_event(&self, event: u64) -> Result<(), Error> {
        match self.events.lock().remove(&event) {
            Some(_) => Ok(()),
            None => self.record_error(Err(Error::UnknownEvent(event))),
        }
    }

    fn record_event(&self, event: u64, stream: u64) -> Result<(), Error> {
        self.record_error(self.check_stream(stream))?;
        match self.events.lock().get_mut(&event) {
            Some(recorded) => {
                *recorded = Some(Instant::now());
                Ok(())
            }
            None => self.record_error(Err(Error::UnknownEvent(event))),
        }
    }

    fn synchronize_event(&self, event: u64) -> Result<(), Error> {
        if self.events.lock().contains_key(&event) {
            Ok(())
        } else {
            self.record_error(Err(Error::UnknownEvent(event)))
        }
    }

    /// Fails with [`Error::UnknownEvent`] for events that were never recorded.
    fn event_time(&self, start: u64, end: u64) -> Result<Duration, Error> {
        let recorded = |event: u64| {
            self.events
                .lock()
                .get(&event)
                .copied()
                .flatten()
                .ok_or(Error::UnknownEvent(event))
        };
        let elapsed = recorded(start).and_then(|start| {
            let end = recorded(end)?;
            Ok(end.saturating_duration_since(start))
        });
        self.record_error(elapsed)
    }

    fn load(&self, module: ptx::Module) -> Result<(), Error> {
        self.record_error(self.load_module(module))
    }

    fn unload(&self, module: &str) -> Result<(), Error> {
        let Some(loaded) = self.modules.write().shift_remove(module) else {
            return self.record_error(Err(Error::UnknownModule(module.to_string())));
        };
        for address in &loaded.allocations {
            self.allocations.free(*address)?;
        }
        log::debug!("device {}: unloaded module {module}", self.id);
        Ok(())
    }

    fn attributes(&self, module: &str, kernel: &str) -> Result<KernelAttributes, Error> {
        let kernel = self.record_error(self.kernel(module, kernel))?;
        Ok(kernel.attributes())
    }

    fn last_error(&self) -> Option<Error> {
        self.last_error.lock().take()
    }

    fn bind_texture(&self, module: &str, texture: &str, binding: TextureBinding) -> Result<(), Error> {
        let bytes = binding.width * binding.height.max(1) * binding.ty.size();
        let result = self.symbols(module).and_then(|symbols| {
            if !self.allocations.contains(binding.address, bytes) {
                return Err(Error::InvalidDevicePointer(binding.address));
            }
            symbols.bind_texture(texture, binding)
        });
        self.record_error(result)
    }

    fn unbind_texture(&self, module: &str, texture: &str) -> Result<(), Error> {
        let result = self
            .symbols(module)
            .and_then(|symbols| symbols.unbind_texture(texture));
        self.record_error(result)
    }

    fn texture_reference(&self, module: &str, texture: &str) -> Result<Option<TextureBinding>, Error> {
        let result = self.symbols(module).and_then(|symbols| {
            if symbols.has_texture(texture) {
                Ok(symbols.texture(texture))
            } else {
                Err(Error::UnknownTexture {
                    module: module.to_string(),
                    texture: texture.to_string(),
                })
            }
        });
        self.record_error(result)
    }

    fn launch(&self, module: &str, kernel: &str, launch: &LaunchConfig) -> Result<(), Error> {
        let result = self
            .kernel(module, kernel)
            .and_then(|kernel| self.run(&kernel, launch));
        self.record_error(result)
    }

    fn synchronize(&self) -> Result<(), Error> {
        Ok(())
    }

    fn limit_worker_threads(&self, threads: Option<usize>) {
        *self.worker_threads.lock() = threads;
    }

    fn select(&self) -> Result<Selection, Error> {
        self.record_error(Selection::acquire(self.id))
    }

    fn global_address(&self, module: &str, name: &str) -> Result<u64, Error> {
        let result = self.symbols(module).and_then(|symbols| {
            symbols
                .global(name)
                .map(|symbol| symbol.address)
                .ok_or_else(|| Error::UnresolvedSymbol {
                    symbol: name.to_string(),
                })
        });
        self.record_error(result)
    }
}
