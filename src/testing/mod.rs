pub mod kernels;

use crate::config;
use crate::cta::ActiveMask;
use crate::device::{Device, EmulatorDevice, LaunchConfig};
use crate::instruction::Pc;
use crate::memory::AccessKind;
use crate::sync::Mutex;
use crate::trace::{InstructionEvent, LaunchInfo, MemoryEvent, TraceGenerator};
use color_eyre::eyre;

static LOGGER: std::sync::Once = std::sync::Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        env_logger::builder().is_test(true).init();
    });
}

/// A device running thread blocks one after the other.
#[must_use]
pub fn device() -> EmulatorDevice {
    device_with_config(config::Emulator {
        worker_threads: Some(1),
        ..config::Emulator::default()
    })
}

#[must_use]
pub fn device_with_config(config: config::Emulator) -> EmulatorDevice {
    init_logging();
    EmulatorDevice::new(config)
}

/// A module holding only `function`, named after it.
#[must_use]
pub fn module(function: ptx::Function) -> ptx::Module {
    ptx::Module::new(function.name.clone()).with_function(function)
}

pub fn upload(device: &impl Device, values: &[u32]) -> eyre::Result<u64> {
    let bytes: Vec<u8> = values.iter().flat_map(|value| value.to_le_bytes()).collect();
    let address = device.allocate(bytes.len() as u64)?;
    device.write(address, &bytes)?;
    Ok(address)
}

pub fn download(device: &impl Device, address: u64, len: usize) -> eyre::Result<Vec<u32>> {
    let mut bytes = vec![0u8; len * 4];
    device.read(address, &mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Launch a kernel whose first parameter receives one `u32` per thread.
///
/// The arguments of `launch` follow the output pointer.
pub fn run_with_output(
    device: &EmulatorDevice,
    module: &str,
    kernel: &str,
    launch: LaunchConfig,
) -> eyre::Result<Vec<u32>> {
    let threads = launch.grid.size() * launch.block.size();
    let out = device.allocate(threads * 4)?;
    let arguments = [out.to_le_bytes().as_slice(), &launch.arguments].concat();
    let launch = LaunchConfig {
        arguments,
        ..launch
    };
    device.launch(module, kernel, &launch)?;
    let values = download(device, out, threads as usize)?;
    device.free(out)?;
    Ok(values)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    pub pc: Pc,
    pub block: Option<String>,
    pub active: ActiveMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accessed {
    pub kind: AccessKind,
    pub address: u64,
    pub value: Option<u64>,
}

/// Records everything it observes.
#[derive(Debug, Default)]
pub struct Recorder {
    launches: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
    instructions: Mutex<Vec<Executed>>,
    memory: Mutex<Vec<Accessed>>,
}

impl Recorder {
    #[must_use]
    pub fn launches(&self) -> Vec<String> {
        self.launches.lock().clone()
    }

    #[must_use]
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }

    #[must_use]
    pub fn instructions(&self) -> Vec<Executed> {
        self.instructions.lock().clone()
    }

    #[must_use]
    pub fn memory(&self) -> Vec<Accessed> {
        self.memory.lock().clone()
    }
}

impl TraceGenerator for Recorder {
    fn initialize(&self, launch: &LaunchInfo<'_>) {
        self.launches.lock().push(launch.kernel.to_string());
    }

    fn pre_instruction(&self, event: &InstructionEvent<'_>) {
        self.instructions.lock().push(Executed {
            pc: event.instruction.pc,
            block: event.block_start.map(str::to_string),
            active: event.active.clone(),
        });
    }

    fn post_memory(&self, event: &MemoryEvent<'_>) {
        self.memory.lock().push(Accessed {
            kind: event.kind,
            address: event.address,
            value: event.value,
        });
    }

    fn finish(&self, launch: &LaunchInfo<'_>) {
        self.finished.lock().push(launch.kernel.to_string());
    }
}
