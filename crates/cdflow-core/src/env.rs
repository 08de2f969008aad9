//! Environment merging for build plugins.
//!
//! Per-build environments are assembled from the config plugin's output, the
//! host variables a build asks for, and the orchestrator's own keys. The
//! reserved keys are written last so no other source can change them.

use crate::CoreError;
use cdflow_schema::BuildSection;
use std::collections::BTreeMap;

/// Keys the orchestrator owns in build environments.
pub const RESERVED_KEYS: [&str; 4] = ["VERSION", "TEAM", "COMPONENT", "COMMIT"];

/// The values behind the reserved keys for one release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseIdentity {
    pub version: String,
    pub team: String,
    pub component: String,
    pub commit: String,
}

impl ReleaseIdentity {
    /// Write `VERSION`, `TEAM`, `COMPONENT` and `COMMIT` into an environment.
    pub fn overlay_env(&self, env: &mut BTreeMap<String, String>) {
        for (key, value) in RESERVED_KEYS.iter().zip(self.values()) {
            env.insert((*key).to_owned(), value.to_owned());
        }
    }

    /// Write `version`, `team`, `component` and `commit` into release metadata.
    pub fn overlay_metadata(&self, release: &mut BTreeMap<String, String>) {
        for (key, value) in RESERVED_KEYS.iter().zip(self.values()) {
            release.insert(key.to_ascii_lowercase(), value.to_owned());
        }
    }

    fn values(&self) -> [&str; 4] {
        [&self.version, &self.team, &self.component, &self.commit]
    }
}

/// The host process environment as a mapping. Non-UTF-8 entries are skipped.
pub fn host_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

/// Environment for one build container.
///
/// Starts from the plugin-provided env, adds the host variables listed in the
/// build's `env_vars`, then `BUILD_ID` and `MANIFEST_PARAMS`, then the reserved keys.
pub fn build_env(
    build_id: &str,
    build: &BuildSection,
    plugin_env: Option<&BTreeMap<String, String>>,
    host: &BTreeMap<String, String>,
    identity: &ReleaseIdentity,
) -> Result<BTreeMap<String, String>, CoreError> {
    let mut env = plugin_env.cloned().unwrap_or_default();
    for name in &build.env_vars {
        if let Some(value) = host.get(name) {
            env.insert(name.clone(), value.clone());
        }
    }
    env.insert("BUILD_ID".to_owned(), build_id.to_owned());
    let params = match &build.params {
        Some(params) => serde_json::to_string(params)?,
        None => "{}".to_owned(),
    };
    env.insert("MANIFEST_PARAMS".to_owned(), params);
    identity.overlay_env(&mut env);
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ReleaseIdentity {
        ReleaseIdentity {
            version: "1.2.3".to_owned(),
            team: "platform".to_owned(),
            component: "svc".to_owned(),
            commit: "abc123".to_owned(),
        }
    }

    #[test]
    fn reserved_keys_win_over_plugin_env() {
        let plugin: BTreeMap<String, String> = [
            ("VERSION".to_owned(), "hijacked".to_owned()),
            ("AWS_REGION".to_owned(), "eu-west-1".to_owned()),
        ]
        .into();
        let env = build_env(
            "docker",
            &BuildSection::default(),
            Some(&plugin),
            &BTreeMap::new(),
            &identity(),
        )
        .unwrap();
        assert_eq!(env["VERSION"], "1.2.3");
        assert_eq!(env["TEAM"], "platform");
        assert_eq!(env["COMPONENT"], "svc");
        assert_eq!(env["COMMIT"], "abc123");
        assert_eq!(env["AWS_REGION"], "eu-west-1");
        assert_eq!(env["BUILD_ID"], "docker");
        assert_eq!(env["MANIFEST_PARAMS"], "{}");
    }

    #[test]
    fn passes_through_requested_host_vars() {
        let build = BuildSection {
            env_vars: vec!["NPM_TOKEN".to_owned(), "UNSET_VAR".to_owned(), "COMMIT".to_owned()],
            ..BuildSection::default()
        };
        let host: BTreeMap<String, String> = [
            ("NPM_TOKEN".to_owned(), "t0k3n".to_owned()),
            ("COMMIT".to_owned(), "host-commit".to_owned()),
            ("HOME".to_owned(), "/root".to_owned()),
        ]
        .into();
        let env = build_env("lambda", &build, None, &host, &identity()).unwrap();
        assert_eq!(env["NPM_TOKEN"], "t0k3n");
        assert!(!env.contains_key("UNSET_VAR"));
        assert!(!env.contains_key("HOME"));
        assert_eq!(env["COMMIT"], "abc123");
    }

    #[test]
    fn manifest_params_are_json() {
        let mut params = BTreeMap::new();
        params.insert("memory".to_owned(), serde_json::json!(256));
        params.insert("handler".to_owned(), serde_json::json!("index.handler"));
        let build = BuildSection {
            params: Some(params),
            ..BuildSection::default()
        };
        let env = build_env("lambda", &build, None, &BTreeMap::new(), &identity()).unwrap();
        let decoded: serde_json::Value = serde_json::from_str(&env["MANIFEST_PARAMS"]).unwrap();
        assert_eq!(decoded["memory"], 256);
        assert_eq!(decoded["handler"], "index.handler");
    }

    #[test]
    fn metadata_overlay_uses_lowercase_keys() {
        let mut release = BTreeMap::new();
        release.insert("version".to_owned(), "plugin".to_owned());
        identity().overlay_metadata(&mut release);
        assert_eq!(release["version"], "1.2.3");
        assert_eq!(release["team"], "platform");
        assert_eq!(release.len(), 4);
    }

    #[test]
    fn host_env_sees_process_vars() {
        let env = host_env();
        assert!(!env.is_empty());
    }
}
