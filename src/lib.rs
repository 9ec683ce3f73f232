pub mod catalog;
pub mod errors;
pub mod export;
pub mod file;
pub mod invoke;
pub mod metadata;
pub mod pipeline;
pub mod reconcile;
pub mod reinject;
pub mod select;
pub mod volume;

#[cfg(test)]
mod testing;

pub use catalog::{Series, SeriesCatalog, SliceRecord};
pub use export::Exporter;
pub use invoke::{ExternalCommand, ProcessCommand, ToolInvoker};
pub use metadata::*;
pub use pipeline::{process_case, run_all, run_all_with_progress, BatchLayout, PipelineOptions};
pub use reconcile::{Reconciler, RotationMode};
pub use reinject::reinject;
pub use select::OutputSelector;
pub use volume::{ExtraDimensions, SliceAxis, Volume};
