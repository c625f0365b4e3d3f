use crate::instruction::Pc;
use crate::memory::{AccessKind, Segment};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid kernel {kernel:?}: {message}")]
    InvalidKernel { kernel: String, message: String },

    #[error("out of {segment} memory: requested {requested} bytes but only {available} of {capacity} bytes are free")]
    OutOfMemory {
        segment: Segment,
        requested: u64,
        available: u64,
        capacity: u64,
    },

    #[error("out of device memory: requested {requested} bytes but only {available} of {capacity} bytes are free")]
    OutOfDeviceMemory {
        requested: u64,
        available: u64,
        capacity: u64,
    },

    #[error("kernel {kernel:?} needs {required} registers per thread (limit is {limit})")]
    OutOfRegisters {
        kernel: String,
        required: usize,
        limit: usize,
    },

    #[error("unresolved symbol {symbol:?}")]
    UnresolvedSymbol { symbol: String },

    #[error("invalid {kind} of {size} bytes at {address:#x} (pc={pc}, thread={thread})")]
    InvalidMemoryAccess {
        kind: AccessKind,
        address: u64,
        size: u64,
        pc: Pc,
        thread: u32,
    },

    #[error("execution fault at pc={pc}: {message}")]
    ExecutionFault { pc: Pc, message: String },

    #[error("invalid device pointer {0:#x}")]
    InvalidDevicePointer(u64),

    #[error("unknown module {0:?}")]
    UnknownModule(String),

    #[error("module {0:?} is already loaded")]
    DuplicateModule(String),

    #[error("unknown kernel {kernel:?} in module {module:?}")]
    UnknownKernel { module: String, kernel: String },

    #[error("unknown texture {texture:?} in module {module:?}")]
    UnknownTexture { module: String, texture: String },

    #[error("unknown stream {0}")]
    UnknownStream(u64),

    #[error("unknown event {0}")]
    UnknownEvent(u64),

    #[error("device {0} is busy")]
    DeviceBusy(usize),
}

impl Error {
    pub fn invalid_kernel(kernel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidKernel {
            kernel: kernel.into(),
            message: message.into(),
        }
    }

    pub fn fault(pc: Pc, message: impl Into<String>) -> Self {
        Self::ExecutionFault {
            pc,
            message: message.into(),
        }
    }

    /// Errors raised while running a kernel, as opposed to preparing it.
    #[must_use]
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Self::UnresolvedSymbol { .. }
                | Self::InvalidMemoryAccess { .. }
                | Self::ExecutionFault { .. }
        )
    }
}
