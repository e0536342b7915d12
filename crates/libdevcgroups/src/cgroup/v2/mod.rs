pub mod bpf;
mod controller;
pub mod program;
pub mod rules;

#[cfg(test)]
#[allow(clippy::too_many_arguments)]
pub mod mocks;

pub use controller::{Baseline, Devices, DevicesControllerError};
