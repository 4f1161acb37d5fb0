#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use crate::{
    batch::{run_batch, BatchOptions, BatchReport, Tally},
    convert::{ConversionReport, ConversionRequest, Converter},
    errors::{Error, Result},
    workspace::Workspace,
};

pub mod batch;
pub mod convert;
pub mod errors;
pub mod filter;
pub mod image;
pub mod process;
pub mod reader;
pub mod shrink;
pub mod workspace;
pub mod writer;

/// Anything holding archive entries
pub trait Cbz {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
