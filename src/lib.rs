// ============================================
// RTA Builder - lib.rs
// ============================================
// Rebuilds a customised bootable image from a source ISO.
//
// Module map:
//   pipeline    the build controller (stages, cascades, worker handle)
//   extract     mount-and-copy / 7-Zip extraction strategies
//   create      oscdimg / scripted authoring / raw archive strategies
//   customize   the stock populate + customize mutation
//   convert     VHD and raw-disk outputs
//   verify      ISO 9660 / El Torito checks on the result
//   probe       which external tools this host has
//   mount       attach/detach source images
//   subprocess  monitored child processes with line parsing
//   progress    monotonic stage-weighted progress and the event sink
//   catalog     tools_config.json
//   download    fetching a source image
//   config      rtabuilder.toml and the app directory
// ============================================

pub mod cancel;
pub mod catalog;
pub mod config;
pub mod context;
pub mod convert;
pub mod create;
pub mod customize;
pub mod download;
pub mod error;
pub mod extract;
pub mod mount;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod subprocess;
pub mod verify;

pub use cancel::StopFlag;
pub use config::BuilderConfig;
pub use convert::OutputFormat;
pub use create::CreationTier;
pub use customize::DefaultMutation;
pub use error::{BuildError, Result};
pub use pipeline::{
    validate_job, BuildHandle, BuildJob, BuildOutcome, BuildPipeline, BuildReport, BuildState, Mutation, Stage,
};
pub use probe::{probe, CapabilitySet};
pub use verify::ArtifactKind;
