//! Shared types, error model, and configuration for kbforge.
//!
//! This crate is the foundation depended on by all other kbforge crates.
//! It provides:
//! - [`KbError`], the unified error type
//! - Conversion task types ([`ConversionTask`], [`TaskState`], [`TaskEvent`])
//! - Graph types ([`GraphNode`], [`GraphRelationship`], [`ExtractionUnit`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod fs;
pub mod graph;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ExtractionConfig, GraphConfig, MergePolicyKind, PathsConfig, PollingConfig,
    RemoteConfig, TaskStoreKind, TasksConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, resolve_api_key,
};
pub use error::{KbError, Result};
pub use fs::{find_files, relative_slash_path, write_atomic};
pub use graph::{
    CHECKPOINT_SCHEMA_VERSION, ExtractedGraph, ExtractionUnit, GraphNode, GraphRelationship,
    Properties,
};
pub use types::{
    ConversionTask, SourceEntry, SourceManifest, TaskEvent, TaskState, load_source_manifest,
};
