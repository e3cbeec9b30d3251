use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_yaml::{Mapping, Value as YamlValue};
use std::{collections::BTreeMap, env, fs, io, path::Path};
use tracing::debug;
use validator::Validate;

use crate::parameters::render_scalar;

/// Environment variables starting with this prefix override settings, e.g.
/// `ARTEMIS_DEV__NAMINGSUFFIX=x2` or `ARTEMIS_DEV__ELASTICSEARCHCONFIG__INSTANCECOUNT=0`.
/// Path segments are separated by `__` and matched case-insensitively.
pub const OVERRIDE_PREFIX: &str = "ARTEMIS_";
const OVERRIDE_SEPARATOR: &str = "__";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors in `{0}`: {1}")]
    ValidationError(String, String),

    #[error("Environment `{0}` is not defined in the configuration profile")]
    UnknownEnvironment(String),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

/// Settings shared by every stack deployed into one environment.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "PascalCase")]
pub struct EnvironmentConfig {
    #[validate(length(min = 1, message = "Region must not be empty"))]
    pub region: String,

    #[serde(deserialize_with = "scalar_text")]
    #[validate(length(min = 1, message = "OpsBucketName must not be empty"))]
    pub ops_bucket_name: String,

    #[serde(
        default,
        deserialize_with = "lenient_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub block_instance_count: Option<u32>,

    #[serde(deserialize_with = "scalar_text")]
    #[validate(length(min = 1, message = "NamingSuffix must not be empty"))]
    pub naming_suffix: String,

    #[serde(rename = "S3DataBucketConfig")]
    #[validate]
    pub s3_data_bucket: S3DataBucketConfig,

    #[serde(rename = "ElasticSearchConfig")]
    #[validate]
    pub elastic_search: ElasticSearchConfig,

    /// Keys such as `ProjectId` and `BlockPrefix` that only feed stack parameters.
    #[serde(flatten)]
    pub settings: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "PascalCase")]
pub struct S3DataBucketConfig {
    #[serde(default)]
    pub instance_count: Option<i64>,

    #[serde(rename = "S3BucketCFTemplateURL")]
    #[validate(length(min = 1, message = "S3BucketCFTemplateURL must not be empty"))]
    pub template_key: String,

    #[serde(flatten)]
    pub settings: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "PascalCase")]
pub struct ElasticSearchConfig {
    #[serde(default)]
    pub instance_count: Option<i64>,

    #[serde(rename = "ElasticSearchCFTemplateURL")]
    #[validate(length(min = 1, message = "ElasticSearchCFTemplateURL must not be empty"))]
    pub template_key: String,

    #[serde(flatten)]
    pub settings: BTreeMap<String, Value>,
}

/// The whole settings file, keyed by environment name.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct Profile {
    environments: BTreeMap<String, EnvironmentConfig>,
}

impl Profile {
    /// Finds an environment by name, ignoring case when there is no exact match.
    /// Returns the name as written in the profile.
    pub fn lookup(&self, name: &str) -> Result<(&str, &EnvironmentConfig), Error> {
        if let Some((key, environment)) = self.environments.get_key_value(name) {
            return Ok((key.as_str(), environment));
        }

        return self
            .environments
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(key, environment)| (key.as_str(), environment))
            .ok_or_else(|| Error::UnknownEnvironment(name.to_string()));
    }

    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig, Error> {
        return self.lookup(name).map(|(_, environment)| environment);
    }

    pub fn environment_names(&self) -> impl Iterator<Item = &str> {
        self.environments.keys().map(String::as_str)
    }
}

pub fn parse(path: &Path) -> Result<Profile, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    return parse_with_overrides(&contents, env::vars());
}

pub fn parse_str(contents: &str) -> Result<Profile, Error> {
    return parse_with_overrides(contents, std::iter::empty());
}

/// Parses the profile, applies `ARTEMIS_*` overrides from `variables`, then validates.
pub fn parse_with_overrides<I>(contents: &str, variables: I) -> Result<Profile, Error>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut document: YamlValue = match serde_yaml::from_str(contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    apply_overrides(&mut document, variables)?;

    let profile: Profile = match serde_yaml::from_value(document) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    for (name, environment) in &profile.environments {
        match environment.validate() {
            Ok(_) => (),
            Err(error) => return Err(Error::ValidationError(name.clone(), error.to_string())),
        }
    }

    return Ok(profile);
}

fn apply_overrides<I>(document: &mut YamlValue, variables: I) -> Result<(), Error>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (variable, raw) in variables {
        let path = match variable.strip_prefix(OVERRIDE_PREFIX) {
            Some(path) if path.contains(OVERRIDE_SEPARATOR) => path,
            _ => continue,
        };
        let segments: Vec<&str> = path.split(OVERRIDE_SEPARATOR).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            debug!("Ignoring malformed override {}", variable);
            continue;
        }

        let known_environment = match document.as_mapping() {
            Some(environments) => matching_key(environments, segments[0]).is_some(),
            None => false,
        };
        if !known_environment {
            debug!("Ignoring override {} for an undefined environment", variable);
            continue;
        }

        debug!("Overriding {} from the environment", path);
        set_path(document, &segments, override_value(raw), &variable)?;
    }

    return Ok(());
}

fn set_path(
    target: &mut YamlValue,
    segments: &[&str],
    value: YamlValue,
    variable: &str,
) -> Result<(), Error> {
    let mapping = match target.as_mapping_mut() {
        Some(mapping) => mapping,
        None => {
            return Err(Error::ParsingError(format!(
                "{} overrides a setting that is not a mapping",
                variable
            )))
        }
    };

    let (segment, rest) = match segments.split_first() {
        Some(split) => split,
        None => return Ok(()),
    };
    let key = match matching_key(mapping, segment) {
        Some(key) => key,
        None => YamlValue::String(segment.to_string()),
    };
    if rest.is_empty() {
        mapping.insert(key, value);
        return Ok(());
    }

    let child = mapping
        .entry(key)
        .or_insert_with(|| YamlValue::Mapping(Mapping::new()));
    return set_path(child, rest, value, variable);
}

fn matching_key(mapping: &Mapping, segment: &str) -> Option<YamlValue> {
    mapping
        .keys()
        .find(|key| match key.as_str() {
            Some(key) => key.eq_ignore_ascii_case(segment),
            None => false,
        })
        .cloned()
}

/// Scalars are read as YAML so `3` and `true` keep their type; anything else stays text.
fn override_value(raw: String) -> YamlValue {
    match serde_yaml::from_str::<YamlValue>(&raw) {
        Ok(value @ (YamlValue::Bool(_) | YamlValue::Number(_) | YamlValue::String(_))) => value,
        _ => YamlValue::String(raw),
    }
}

fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let count = match &value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(number)) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(text)) => text.trim().parse::<u32>().ok(),
        Some(_) => None,
    };

    match count {
        Some(count) => Ok(Some(count)),
        None => Err(serde::de::Error::custom(format!(
            "expected a non-negative count, found {}",
            value.unwrap_or(Value::Null)
        ))),
    }
}

fn scalar_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match render_scalar(&value) {
        Some(text) => Ok(text),
        None => Err(serde::de::Error::custom(format!(
            "expected a string, number or boolean, found {}",
            value
        ))),
    }
}
