//! Manifest parsing and version handling for cdflow2.
//!
//! This crate defines the schema layer: the `cdflow.yaml` project manifest
//! (`Manifest`), the per-build release requirements derived from it
//! (`ReleaseRequirements`), and the semantic version parser used to decide
//! which Terraform flags an image understands (`Semver`).

pub mod manifest;
pub mod semver;

pub use manifest::{
    load_manifest, parse_manifest_file, parse_manifest_str, BuildSection, ConfigSection,
    Manifest, ManifestError, ReleaseRequirement, ReleaseRequirements, TerraformSection,
    TrivySection, MANIFEST_FILE, SUPPORTED_VERSION,
};
pub use semver::{parse_semver, Semver, SemverError};
