//! Conversion and graph-build workflows for kbforge.
//!
//! This crate ties the batch conversion service, the task store, the graph
//! extractor, the graph store and result archive unpacking together into the
//! two end-to-end flows in [`pipeline`].

pub mod aggregate;
pub mod extraction;
pub mod materialize;
pub mod orchestrator;
pub mod pipeline;
pub mod submit;
pub mod unpack;
pub mod writer;

#[cfg(test)]
mod testing;

pub use aggregate::{
    AggregatedGraph, AggregationStats, GraphAggregator, MergePolicy, MergeProperties,
    NodeResolver, aggregate_checkpoints,
};
pub use extraction::{ExtractionReport, GraphExtractionStage, SourceUnit, discover_units};
pub use materialize::{Materialized, OutputLayout, ResultMaterializer};
pub use orchestrator::{PollPolicy, PollReport, PollingOrchestrator};
pub use pipeline::{
    ConversionFlow, ConversionMode, ConversionReport, GraphBuildOptions, GraphBuildReport,
    ProgressReporter, SilentProgress, run_conversion, run_graph_build,
};
pub use submit::{SubmitReport, Submitter};
pub use unpack::{UnpackReport, unpack_archive, unpack_archives};
pub use writer::{BatchedGraphWriter, WriteReport};
