//! Release metadata assembly and packaging.
//!
//! The metadata is a mapping from build id to that build's string mapping,
//! plus a `release` entry describing the release itself. It is written into
//! the release volume as `release-metadata.json` through a single-entry tar
//! stream copied into the config container.

use crate::env::ReleaseIdentity;
use crate::CoreError;
use std::collections::BTreeMap;

pub type ReleaseMetadata = BTreeMap<String, BTreeMap<String, String>>;

/// Key of the release's own entry in the metadata.
pub const RELEASE_KEY: &str = "release";

/// Path of the metadata file inside the tar stream, relative to `/`.
pub const METADATA_TAR_PATH: &str = "release/release-metadata.json";

/// Split a `--release-data` value of the form `KEY=VALUE`.
pub fn parse_release_data(value: &str) -> Result<(String, String), CoreError> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(CoreError::Usage(format!(
            "release data not in the correct format (expected KEY=VALUE): {value}"
        ))),
    }
}

/// The `tags` value recorded on a release: CI run details as a JSON string.
///
/// Only GitHub Actions runs are described; a key is present only when the
/// variables it is built from are set, so outside CI the value is `{}`.
pub fn release_tags(host: &BTreeMap<String, String>) -> Result<String, CoreError> {
    let var = |key: &str| host.get(key).map(String::as_str).filter(|v| !v.is_empty());
    let mut tags = BTreeMap::new();
    if let Some(server) = var("GITHUB_SERVER_URL") {
        let server = server.trim_end_matches('/');
        if let Some(repository) = var("GITHUB_REPOSITORY") {
            let repository = format!("{server}/{}", repository.trim_matches('/'));
            if let Some(run_id) = var("GITHUB_RUN_ID") {
                tags.insert("job", format!("{repository}/actions/runs/{run_id}"));
            }
            tags.insert("repository", repository);
        }
        if let Some(workflow) = var("GITHUB_WORKFLOW") {
            tags.insert("workflow", workflow.to_owned());
        }
        if let Some(actor) = var("GITHUB_ACTOR") {
            tags.insert("actor", actor.to_owned());
        }
    }
    Ok(serde_json::to_string(&tags)?)
}

/// Inputs merged into the `release` entry, lowest precedence first.
#[derive(Debug, Default)]
pub struct ReleaseDetails<'a> {
    pub tags: String,
    pub additional_metadata: Option<&'a BTreeMap<String, String>>,
    pub release_data: &'a [(String, String)],
}

/// Assemble the final metadata from per-build results.
///
/// The `release` entry always exists, and its reserved keys are written last.
pub fn finalize(
    builds: BTreeMap<String, BTreeMap<String, String>>,
    details: &ReleaseDetails<'_>,
    identity: &ReleaseIdentity,
) -> ReleaseMetadata {
    let mut metadata = builds;
    let release = metadata.entry(RELEASE_KEY.to_owned()).or_default();
    release.insert("tags".to_owned(), details.tags.clone());
    if let Some(additional) = details.additional_metadata {
        release.extend(additional.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    release.extend(details.release_data.iter().cloned());
    identity.overlay_metadata(release);
    metadata
}

/// A tar stream holding one regular file at `path` with mode 0644.
pub fn single_file_tar(path: &str, content: &[u8]) -> Result<Vec<u8>, CoreError> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    builder.append_data(&mut header, path, content)?;
    Ok(builder.into_inner()?)
}

/// The metadata as a tar stream to be extracted at `/`.
pub fn metadata_tar(metadata: &ReleaseMetadata) -> Result<Vec<u8>, CoreError> {
    let json = serde_json::to_vec(metadata)?;
    single_file_tar(METADATA_TAR_PATH, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn identity() -> ReleaseIdentity {
        ReleaseIdentity {
            version: "7".to_owned(),
            team: "platform".to_owned(),
            component: "svc".to_owned(),
            commit: "abc".to_owned(),
        }
    }

    #[test]
    fn release_data_parsing() {
        assert_eq!(
            parse_release_data("owner=team-a").unwrap(),
            ("owner".to_owned(), "team-a".to_owned())
        );
        assert_eq!(
            parse_release_data("url=http://x?a=b").unwrap(),
            ("url".to_owned(), "http://x?a=b".to_owned())
        );
        assert!(matches!(
            parse_release_data("novalue"),
            Err(CoreError::Usage(_))
        ));
        assert!(parse_release_data("=x").is_err());
    }

    #[test]
    fn github_tags() {
        let host: BTreeMap<String, String> = [
            ("GITHUB_SERVER_URL", "https://github.com"),
            ("GITHUB_REPOSITORY", "org/svc"),
            ("GITHUB_RUN_ID", "42"),
            ("GITHUB_WORKFLOW", "release"),
            ("GITHUB_ACTOR", "octocat"),
        ]
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
        let tags: serde_json::Value = serde_json::from_str(&release_tags(&host).unwrap()).unwrap();
        assert_eq!(tags["repository"], "https://github.com/org/svc");
        assert_eq!(tags["job"], "https://github.com/org/svc/actions/runs/42");
        assert_eq!(tags["workflow"], "release");
        assert_eq!(tags["actor"], "octocat");
    }

    #[test]
    fn tags_without_ci_are_empty() {
        assert_eq!(release_tags(&BTreeMap::new()).unwrap(), "{}");
        let host = BTreeMap::from([
            ("GITHUB_REPOSITORY".to_owned(), "org/svc".to_owned()),
            ("GITHUB_RUN_ID".to_owned(), "42".to_owned()),
            ("GITHUB_ACTOR".to_owned(), String::new()),
        ]);
        assert_eq!(release_tags(&host).unwrap(), "{}");
    }

    #[test]
    fn job_needs_repository() {
        let host = BTreeMap::from([
            ("GITHUB_SERVER_URL".to_owned(), "https://github.com".to_owned()),
            ("GITHUB_RUN_ID".to_owned(), "42".to_owned()),
            ("GITHUB_ACTOR".to_owned(), "octocat".to_owned()),
        ]);
        let tags: serde_json::Value = serde_json::from_str(&release_tags(&host).unwrap()).unwrap();
        assert!(tags.get("job").is_none());
        assert!(tags.get("repository").is_none());
        assert_eq!(tags["actor"], "octocat");
    }

    #[test]
    fn reserved_keys_are_written_last() {
        let mut builds = BTreeMap::new();
        builds.insert(
            "docker".to_owned(),
            [("image".to_owned(), "repo/svc:7".to_owned())].into(),
        );
        let additional: BTreeMap<String, String> = [
            ("version".to_owned(), "plugin".to_owned()),
            ("artifact".to_owned(), "s3://bucket/svc-7.zip".to_owned()),
        ]
        .into();
        let release_data = vec![
            ("commit".to_owned(), "user".to_owned()),
            ("owner".to_owned(), "team-a".to_owned()),
            ("artifact".to_owned(), "override".to_owned()),
        ];
        let details = ReleaseDetails {
            tags: "{}".to_owned(),
            additional_metadata: Some(&additional),
            release_data: &release_data,
        };
        let metadata = finalize(builds, &details, &identity());
        let release = &metadata["release"];
        assert_eq!(release["version"], "7");
        assert_eq!(release["commit"], "abc");
        assert_eq!(release["component"], "svc");
        assert_eq!(release["team"], "platform");
        assert_eq!(release["owner"], "team-a");
        assert_eq!(release["artifact"], "override");
        assert_eq!(release["tags"], "{}");
        assert_eq!(metadata["docker"]["image"], "repo/svc:7");
    }

    #[test]
    fn release_entry_always_exists() {
        let metadata = finalize(BTreeMap::new(), &ReleaseDetails::default(), &identity());
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata["release"]["version"], "7");
    }

    #[test]
    fn metadata_tar_has_single_entry() {
        let metadata = finalize(BTreeMap::new(), &ReleaseDetails::default(), &identity());
        let bytes = metadata_tar(&metadata).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(
            entry.path().unwrap().to_string_lossy(),
            "release/release-metadata.json"
        );
        assert_eq!(entry.header().mode().unwrap(), 0o644);
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        let decoded: ReleaseMetadata = serde_json::from_str(&content).unwrap();
        assert_eq!(decoded, metadata);
        drop(entry);
        assert!(entries.next().is_none());
    }
}
