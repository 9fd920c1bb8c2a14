//! Offline index construction and the persisted artifact it produces.

mod artifact;
mod builder;

pub use artifact::{ARTIFACT_VERSION, ArtifactError, IndexArtifact, Manifest};
pub use builder::{BuildError, BuilderConfig, DEFAULT_NUM_SUBSPACES, IndexBuilder};
