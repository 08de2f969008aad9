//! Registry credentials for image pulls.
//!
//! Credentials come from `CDFLOW2_DOCKER_AUTH_<REGISTRY>_USERNAME` and
//! `CDFLOW2_DOCKER_AUTH_<REGISTRY>_PASSWORD`, where `<REGISTRY>` is the image's
//! registry domain upper-cased with `.`, `:` and `-` replaced by `_`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;
use std::path::Path;

pub const AUTH_ENV_PREFIX: &str = "CDFLOW2_DOCKER_AUTH_";

const DEFAULT_DOMAIN: &str = "docker.io";
const LEGACY_INDEX_HOST: &str = "index.docker.io";
const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    /// Registry the credentials belong to, as used in `config.json`.
    pub registry: String,
    pub username: String,
    pub password: String,
}

/// Registry domain of an image reference, `docker.io` when none is given.
pub fn registry_domain(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, _))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            first
        }
        _ => DEFAULT_DOMAIN,
    }
}

/// The `<REGISTRY>` part of the credential variable names for a domain.
pub fn env_key(domain: &str) -> String {
    domain
        .chars()
        .map(|c| match c {
            '.' | ':' | '-' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

fn lookup_pair<F>(domain: &str, lookup: &F) -> Option<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let key = env_key(domain);
    let username = lookup(&format!("{AUTH_ENV_PREFIX}{key}_USERNAME")).filter(|s| !s.is_empty())?;
    let password = lookup(&format!("{AUTH_ENV_PREFIX}{key}_PASSWORD")).filter(|s| !s.is_empty())?;
    Some((username, password))
}

/// Find credentials for `image` through `lookup` (normally `std::env::var`).
///
/// The image's registry domain is tried first. After that comes the older
/// naming, keyed on `index.docker.io` or, for references with more than one
/// `/`, on the first path segment.
pub fn credentials_for<F>(image: &str, lookup: F) -> Option<RegistryCredentials>
where
    F: Fn(&str) -> Option<String>,
{
    let domain = registry_domain(image);
    let legacy = if image.matches('/').count() > 1 {
        image.split('/').next().unwrap_or(LEGACY_INDEX_HOST)
    } else {
        LEGACY_INDEX_HOST
    };
    for candidate in [domain, legacy] {
        if let Some((username, password)) = lookup_pair(candidate, &lookup) {
            let registry = if candidate == DEFAULT_DOMAIN || candidate == LEGACY_INDEX_HOST {
                DOCKER_HUB_AUTH_KEY.to_owned()
            } else {
                candidate.to_owned()
            };
            return Some(RegistryCredentials {
                registry,
                username,
                password,
            });
        }
    }
    None
}

pub fn credentials_from_env(image: &str) -> Option<RegistryCredentials> {
    credentials_for(image, |key| std::env::var(key).ok())
}

/// Write a client `config.json` holding only these credentials into `dir`.
pub fn write_client_config(dir: &Path, creds: &RegistryCredentials) -> std::io::Result<()> {
    let auth = STANDARD.encode(format!("{}:{}", creds.username, creds.password));
    let mut auths = serde_json::Map::new();
    auths.insert(creds.registry.clone(), json!({ "auth": auth }));
    let config = json!({ "auths": auths });
    let content = serde_json::to_vec_pretty(&config).map_err(std::io::Error::other)?;
    std::fs::write(dir.join("config.json"), content)
}
