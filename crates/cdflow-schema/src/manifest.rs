use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// File name of the project manifest, looked up in the code directory.
pub const MANIFEST_FILE: &str = "cdflow.yaml";

/// The only manifest version this driver understands.
pub const SUPPORTED_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read cdflow.yaml: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid cdflow.yaml: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("cdflow.yaml version must be 2 for cdflow2, found {0}")]
    UnsupportedVersion(i64),
    #[error("cdflow.yaml version must be 2 for cdflow2, found no version")]
    MissingVersion,
    #[error("cdflow.yaml error - {0} must not be empty")]
    EmptyImage(String),
    #[error("cdflow.yaml error - invalid build id '{0}' (allowed: letters, digits, '_', '-', '.')")]
    InvalidBuildId(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Manifest {
    pub version: i64,
    #[serde(default)]
    pub team: String,
    pub config: ConfigSection,
    #[serde(default)]
    pub builds: BTreeMap<String, BuildSection>,
    pub terraform: TerraformSection,
    /// Optional security scanning of the repository and built images.
    #[serde(default)]
    pub trivy: Option<TrivySection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigSection {
    pub image: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
    pub image: String,
    /// Capabilities the config plugin should provision for this build.
    #[serde(default)]
    pub needs: Vec<String>,
    /// Free-form parameters handed to the build as `MANIFEST_PARAMS`.
    #[serde(default)]
    pub params: Option<BTreeMap<String, serde_json::Value>>,
    /// Host environment variables passed through to the build container.
    #[serde(default)]
    pub env_vars: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TerraformSection {
    pub image: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TrivySection {
    pub image: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl TrivySection {
    /// Whether critical findings fail the release (`errorOnFindings`, default true).
    pub fn error_on_findings(&self) -> bool {
        self.params
            .get("errorOnFindings")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true)
    }
}

/// What one build needs from the config plugin, in the plugin's wire casing.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReleaseRequirement {
    #[serde(rename = "Needs")]
    pub needs: Vec<String>,
}

pub type ReleaseRequirements = BTreeMap<String, ReleaseRequirement>;

#[derive(Deserialize)]
struct VersionHeader {
    #[serde(default)]
    version: Option<i64>,
}

impl Manifest {
    /// Release requirements for every build, keyed by build id.
    pub fn release_requirements(&self) -> ReleaseRequirements {
        self.builds
            .iter()
            .map(|(id, build)| {
                (
                    id.clone(),
                    ReleaseRequirement {
                        needs: build.needs.clone(),
                    },
                )
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.config.image.trim().is_empty() {
            return Err(ManifestError::EmptyImage("config.image".to_owned()));
        }
        if self.terraform.image.trim().is_empty() {
            return Err(ManifestError::EmptyImage("terraform.image".to_owned()));
        }
        if let Some(trivy) = &self.trivy {
            if trivy.image.trim().is_empty() {
                return Err(ManifestError::EmptyImage("trivy.image".to_owned()));
            }
        }
        for (id, build) in &self.builds {
            if !is_valid_build_id(id) {
                return Err(ManifestError::InvalidBuildId(id.clone()));
            }
            if build.image.trim().is_empty() {
                return Err(ManifestError::EmptyImage(format!("builds.{id}.image")));
            }
        }
        Ok(())
    }
}

fn is_valid_build_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

pub fn parse_manifest_str(input: &str) -> Result<Manifest, ManifestError> {
    // Check the version before the shape so an older manifest reports the
    // version mismatch rather than a missing field.
    let header: VersionHeader = serde_yaml::from_str(input)?;
    match header.version {
        Some(SUPPORTED_VERSION) => {}
        Some(other) => return Err(ManifestError::UnsupportedVersion(other)),
        None => return Err(ManifestError::MissingVersion),
    }
    let manifest: Manifest = serde_yaml::from_str(input)?;
    manifest.validate()?;
    Ok(manifest)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<Manifest, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}

/// Load `cdflow.yaml` from a project directory.
pub fn load_manifest(code_dir: impl AsRef<Path>) -> Result<Manifest, ManifestError> {
    parse_manifest_file(code_dir.as_ref().join(MANIFEST_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r"
version: 2
team: test-team
config:
  image: config-image
  params:
    TEST_CONFIG_VAR: config value
    nested:
      a: 1
builds:
  release:
    image: release-image
  docs:
    image: docs-image
    needs: [lambda, ecr]
    params:
      dir: site
    env_vars: [NPM_TOKEN]
terraform:
  image: hashicorp/terraform:1.5.7
";

    #[test]
    fn parses_full_manifest() {
        let manifest = parse_manifest_str(FULL).expect("should parse");
        assert_eq!(manifest.version, 2);
        assert_eq!(manifest.team, "test-team");
        assert_eq!(manifest.config.image, "config-image");
        assert_eq!(
            manifest.config.params["TEST_CONFIG_VAR"],
            serde_json::json!("config value")
        );
        assert_eq!(manifest.config.params["nested"], serde_json::json!({"a": 1}));
        assert_eq!(manifest.builds.len(), 2);
        assert_eq!(manifest.builds["docs"].needs, vec!["lambda", "ecr"]);
        assert_eq!(manifest.builds["docs"].env_vars, vec!["NPM_TOKEN"]);
        assert!(manifest.builds["release"].params.is_none());
        assert_eq!(manifest.terraform.image, "hashicorp/terraform:1.5.7");
    }

    #[test]
    fn trivy_section_is_optional() {
        assert!(parse_manifest_str(FULL).unwrap().trivy.is_none());
        let input = format!(
            "{FULL}trivy:\n  image: aquasec/trivy:0.50.0\n  params:\n    errorOnFindings: false\n"
        );
        let trivy = parse_manifest_str(&input).unwrap().trivy.unwrap();
        assert_eq!(trivy.image, "aquasec/trivy:0.50.0");
        assert!(!trivy.error_on_findings());

        let input = format!("{FULL}trivy:\n  image: aquasec/trivy:0.50.0\n");
        assert!(parse_manifest_str(&input).unwrap().trivy.unwrap().error_on_findings());

        let input = format!("{FULL}trivy:\n  image: ''\n");
        assert!(matches!(
            parse_manifest_str(&input),
            Err(ManifestError::EmptyImage(field)) if field == "trivy.image"
        ));
    }

    #[test]
    fn build_ids_iterate_sorted() {
        let manifest = parse_manifest_str(FULL).unwrap();
        let ids: Vec<&String> = manifest.builds.keys().collect();
        assert_eq!(ids, vec!["docs", "release"]);
    }

    #[test]
    fn parses_minimal_manifest() {
        let input = r"
version: 2
config:
  image: config-image
terraform:
  image: terraform-image
";
        let manifest = parse_manifest_str(input).expect("should parse");
        assert!(manifest.team.is_empty());
        assert!(manifest.builds.is_empty());
        assert!(manifest.config.params.is_empty());
    }

    #[test]
    fn rejects_other_versions() {
        let input = r"
version: 1
config: config-image
";
        match parse_manifest_str(input) {
            Err(ManifestError::UnsupportedVersion(1)) => {}
            other => panic!("expected UnsupportedVersion(1), got {other:?}"),
        }
    }

    #[test]
    fn version_error_message_is_stable() {
        let err = parse_manifest_str("version: 3\n").unwrap_err();
        assert!(err
            .to_string()
            .starts_with("cdflow.yaml version must be 2 for cdflow2"));
    }

    #[test]
    fn rejects_missing_version() {
        assert!(matches!(
            parse_manifest_str("team: x\n"),
            Err(ManifestError::MissingVersion)
        ));
    }

    #[test]
    fn rejects_empty_images() {
        let input = r"
version: 2
config:
  image: ''
terraform:
  image: terraform-image
";
        assert!(matches!(
            parse_manifest_str(input),
            Err(ManifestError::EmptyImage(field)) if field == "config.image"
        ));
    }

    #[test]
    fn rejects_bad_build_id() {
        let input = r"
version: 2
config:
  image: c
builds:
  'bad id':
    image: b
terraform:
  image: t
";
        assert!(matches!(
            parse_manifest_str(input),
            Err(ManifestError::InvalidBuildId(_))
        ));
    }

    #[test]
    fn rejects_unknown_build_fields() {
        let input = r"
version: 2
config:
  image: c
builds:
  release:
    image: b
    imgae: typo
terraform:
  image: t
";
        assert!(parse_manifest_str(input).is_err());
    }

    #[test]
    fn release_requirements_use_wire_casing() {
        let manifest = parse_manifest_str(FULL).unwrap();
        let requirements = manifest.release_requirements();
        let json = serde_json::to_value(&requirements).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "docs": {"Needs": ["lambda", "ecr"]},
                "release": {"Needs": []},
            })
        );
    }

    #[test]
    fn loads_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), FULL).unwrap();
        let manifest = load_manifest(dir.path()).unwrap();
        assert_eq!(manifest.team, "test-team");
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_manifest(dir.path()),
            Err(ManifestError::Io(_))
        ));
    }
}
