//! State machine module.

pub mod machine;
pub(crate) mod phases;

pub use machine::{DfuState, TransferSession};
