#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

pub mod builder;
pub mod dim;
pub mod ir;

pub use dim::{Dim, Point};
pub use ir::*;
