use serde::Serialize;
use serde_json::Value;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Parameter `{0}` is missing from the configuration")]
    MissingParameter(String),

    #[error("Parameter `{0}` must be a string, number or boolean")]
    NotAScalar(String),

    #[error("Parameter source is not a mapping: {0}")]
    NotAMapping(String),
}

/// One `ParameterKey`/`ParameterValue` pair handed to CloudFormation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackParameter {
    pub key: String,
    pub value: String,
}

impl StackParameter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Looks every name up in `source` and returns the pairs in the order the names were given.
pub fn filter_parameters<T>(names: &[&str], source: &T) -> Result<Vec<StackParameter>, Error>
where
    T: Serialize + ?Sized,
{
    let source = match serde_json::to_value(source) {
        Ok(Value::Object(map)) => map,
        Ok(other) => return Err(Error::NotAMapping(other.to_string())),
        Err(error) => return Err(Error::NotAMapping(error.to_string())),
    };

    let mut filtered = Vec::with_capacity(names.len());
    for name in names {
        let value = source
            .get(*name)
            .ok_or_else(|| Error::MissingParameter(name.to_string()))?;
        let value = render_scalar(value).ok_or_else(|| Error::NotAScalar(name.to_string()))?;

        filtered.push(StackParameter::new(*name, value));
    }

    return Ok(filtered);
}

pub fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{json, Value};

    use super::{filter_parameters, Error, StackParameter};

    #[test]
    fn keeps_the_order_of_the_names() {
        let source = json!({ "B": "two", "A": "one", "C": "three" });

        let filtered = filter_parameters(&["C", "A", "B"], &source).unwrap();
        assert_eq!(
            vec![
                StackParameter::new("C", "three"),
                StackParameter::new("A", "one"),
                StackParameter::new("B", "two"),
            ],
            filtered
        );
    }

    #[test]
    fn renders_numbers_and_booleans() {
        let source = json!({ "Retention": 90, "Enabled": true, "Ratio": 0.5 });

        let filtered = filter_parameters(&["Retention", "Enabled", "Ratio"], &source).unwrap();
        let values: Vec<&str> = filtered.iter().map(|p| p.value.as_str()).collect();
        assert_eq!(vec!["90", "true", "0.5"], values);
    }

    #[test]
    fn empty_names_yield_no_parameters() {
        let source: BTreeMap<String, Value> = BTreeMap::new();

        assert_eq!(Ok(vec![]), filter_parameters(&[], &source));
    }

    #[test]
    fn missing_name_is_an_error() {
        let source = json!({ "NamingSuffix": "x1" });

        assert_eq!(
            Err(Error::MissingParameter(String::from("ProjectId"))),
            filter_parameters(&["NamingSuffix", "ProjectId"], &source)
        );
    }

    #[test]
    fn nested_value_is_not_a_parameter() {
        let source = json!({ "Block": { "Nested": 1 }, "Empty": null });

        assert_eq!(
            Err(Error::NotAScalar(String::from("Block"))),
            filter_parameters(&["Block"], &source)
        );
        assert_eq!(
            Err(Error::NotAScalar(String::from("Empty"))),
            filter_parameters(&["Empty"], &source)
        );
    }

    #[test]
    fn source_must_be_a_mapping() {
        let result = filter_parameters(&["A"], &vec!["A"]);

        match result {
            Err(Error::NotAMapping(_)) => {}
            other => panic!("Expected `NotAMapping` error, got {:?}", other),
        }
    }
}
