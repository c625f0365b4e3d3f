#![allow(
    clippy::upper_case_acronyms,
    non_camel_case_types,
    clippy::too_many_arguments,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]
// #![allow(warnings)]

pub mod barrier;
pub mod config;
pub mod cta;
pub mod device;
pub mod error;
pub mod instruction;
pub mod kernel;
pub mod linker;
pub mod memory;
pub mod module;
pub mod parallel;
pub mod regalloc;
pub mod sequence;
pub mod sync;
pub mod trace;

#[cfg(test)]
pub mod testing;

pub use device::{Device, EmulatorDevice, LaunchConfig};
pub use error::Error;
pub use kernel::EmulatedKernel;
pub use ptx;

#[must_use]
pub fn is_debug() -> bool {
    #[cfg(all(feature = "debug_build", feature = "release_build"))]
    compile_error!(r#"both feature "debug_build" or "release_build" are set."#);

    #[cfg(feature = "debug_build")]
    return true;
    #[cfg(feature = "release_build")]
    return false;
    #[cfg(not(any(feature = "debug_build", feature = "release_build")))]
    compile_error!(r#"neither feature "debug_build" or "release_build" is set."#);
}
