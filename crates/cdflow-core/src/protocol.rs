//! Request and response messages exchanged with the config plugin.
//!
//! Requests are tagged by `Action` and use PascalCase field names. Responses
//! are decoded leniently: missing fields default, `null` maps read as empty,
//! and camelCase spellings are accepted alongside PascalCase.

use cdflow_schema::ReleaseRequirements;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

pub type Params = BTreeMap<String, serde_json::Value>;
pub type EnvMap = BTreeMap<String, String>;

#[derive(Debug, Serialize)]
#[serde(tag = "Action", rename_all = "snake_case", rename_all_fields = "PascalCase")]
pub enum Request<'a> {
    Setup {
        config: &'a Params,
        env: &'a EnvMap,
        component: &'a str,
        commit: &'a str,
        team: &'a str,
        release_requirements: &'a ReleaseRequirements,
    },
    ConfigureRelease {
        version: &'a str,
        component: &'a str,
        commit: &'a str,
        team: &'a str,
        config: &'a Params,
        env: &'a EnvMap,
        release_requirements: &'a ReleaseRequirements,
    },
    UploadRelease {
        terraform_image: &'a str,
    },
    PrepareTerraform {
        version: &'a str,
        component: &'a str,
        commit: &'a str,
        env_name: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        state_should_exist: Option<bool>,
        config: &'a Params,
        env: &'a EnvMap,
    },
}

impl Request<'_> {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Setup { .. } => "setup",
            Self::ConfigureRelease { .. } => "configure_release",
            Self::UploadRelease { .. } => "upload_release",
            Self::PrepareTerraform { .. } => "prepare_terraform",
        }
    }
}

/// Every response carries a success flag.
pub trait Response {
    fn success(&self) -> bool;
}

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Telemetry settings handed back by the plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Monitoring {
    #[serde(rename = "APIKey", alias = "apiKey", alias = "ApiKey", deserialize_with = "null_default")]
    pub api_key: String,
    #[serde(rename = "Data", alias = "data", deserialize_with = "null_default")]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SetupResponse {
    #[serde(rename = "Success", alias = "success")]
    pub success: bool,
    #[serde(rename = "Monitoring", alias = "monitoring", deserialize_with = "null_default")]
    pub monitoring: Monitoring,
    #[serde(rename = "Message", alias = "message", deserialize_with = "null_default")]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigureReleaseResponse {
    #[serde(rename = "Success", alias = "success")]
    pub success: bool,
    /// Per-build environment, keyed by build id.
    #[serde(rename = "Env", alias = "env", deserialize_with = "null_default")]
    pub env: BTreeMap<String, EnvMap>,
    #[serde(
        rename = "AdditionalMetadata",
        alias = "additionalMetadata",
        deserialize_with = "null_default"
    )]
    pub additional_metadata: BTreeMap<String, String>,
    #[serde(rename = "Monitoring", alias = "monitoring", deserialize_with = "null_default")]
    pub monitoring: Monitoring,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UploadReleaseResponse {
    #[serde(rename = "Success", alias = "success")]
    pub success: bool,
    #[serde(rename = "Message", alias = "message", deserialize_with = "null_default")]
    pub message: String,
}

/// A backend setting whose real value should not be echoed to the terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackendParameter {
    #[serde(rename = "Value", alias = "value")]
    pub value: String,
    #[serde(rename = "DisplayValue", alias = "displayValue")]
    pub display_value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PrepareTerraformResponse {
    #[serde(rename = "Success", alias = "success")]
    pub success: bool,
    #[serde(rename = "TerraformImage", alias = "terraformImage", deserialize_with = "null_default")]
    pub terraform_image: String,
    #[serde(rename = "Env", alias = "env", deserialize_with = "null_default")]
    pub env: EnvMap,
    #[serde(
        rename = "TerraformBackendType",
        alias = "terraformBackendType",
        deserialize_with = "null_default"
    )]
    pub terraform_backend_type: String,
    #[serde(rename = "TerraformBackendConfig", alias = "terraformBackendConfig")]
    pub terraform_backend_config: OrderedMap<String>,
    #[serde(
        rename = "TerraformBackendConfigParameters",
        alias = "terraformBackendConfigParameters"
    )]
    pub terraform_backend_config_parameters: OrderedMap<BackendParameter>,
    #[serde(rename = "Monitoring", alias = "monitoring", deserialize_with = "null_default")]
    pub monitoring: Monitoring,
}

macro_rules! impl_response {
    ($($ty:ty),*) => {
        $(impl Response for $ty {
            fn success(&self) -> bool {
                self.success
            }
        })*
    };
}

impl_response!(
    SetupResponse,
    ConfigureReleaseResponse,
    UploadReleaseResponse,
    PrepareTerraformResponse
);

/// A JSON object decoded into its pairs in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V> OrderedMap<V> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

struct OrderedMapVisitor<V>(PhantomData<V>);

impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
    type Value = OrderedMap<V>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map or null")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut pairs: Vec<(String, V)> = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, value)) = access.next_entry::<String, V>()? {
            if let Some(index) = pairs.iter().position(|(k, _)| *k == key) {
                pairs[index].1 = value;
            } else {
                pairs.push((key, value));
            }
        }
        Ok(OrderedMap(pairs))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(OrderedMap::default())
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(OrderedMap::default())
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(OrderedMapVisitor(PhantomData))
    }
}
