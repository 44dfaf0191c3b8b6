use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::BatchError;

/// Typed value of a single job parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(NaiveDate),
}

impl JobParameterValue {
    fn type_tag(&self) -> &'static str {
        match self {
            JobParameterValue::String(_) => "string",
            JobParameterValue::Long(_) => "long",
            JobParameterValue::Double(_) => "double",
            JobParameterValue::Date(_) => "date",
        }
    }

    fn render(&self) -> String {
        match self {
            JobParameterValue::String(value) => value.clone(),
            JobParameterValue::Long(value) => value.to_string(),
            JobParameterValue::Double(value) => value.to_string(),
            JobParameterValue::Date(value) => value.format("%Y-%m-%d").to_string(),
        }
    }

    fn parse(type_tag: &str, raw: &str) -> Result<Self, BatchError> {
        match type_tag {
            "string" => Ok(JobParameterValue::String(raw.to_string())),
            "long" => raw
                .parse()
                .map(JobParameterValue::Long)
                .map_err(|err| BatchError::Configuration(format!("invalid long '{raw}': {err}"))),
            "double" => raw
                .parse()
                .map(JobParameterValue::Double)
                .map_err(|err| BatchError::Configuration(format!("invalid double '{raw}': {err}"))),
            "date" => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(JobParameterValue::Date)
                .map_err(|err| BatchError::Configuration(format!("invalid date '{raw}': {err}"))),
            other => Err(BatchError::Configuration(format!(
                "unknown job parameter type '{other}'"
            ))),
        }
    }
}

/// A parameter value together with its identifying flag. Non-identifying
/// parameters are carried along with the execution but take no part in the
/// identity of the job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    value: JobParameterValue,
    identifying: bool,
}

impl JobParameter {
    pub fn new(value: JobParameterValue, identifying: bool) -> Self {
        Self { value, identifying }
    }

    pub fn value(&self) -> &JobParameterValue {
        &self.value
    }

    pub fn is_identifying(&self) -> bool {
        self.identifying
    }
}

/// Immutable ordered mapping from parameter name to typed value.
///
/// Two `JobParameters` are equal iff their identifying entries are equal,
/// and [`JobParameters::identifying_key`] hashes exactly those entries, so
/// equal parameter sets always map to the same job instance.
///
/// # Example
///
/// ```
/// use batchflow::core::job_parameters::JobParametersBuilder;
///
/// let parameters = JobParametersBuilder::new()
///     .add_string("input.file", "/data/trades.csv")
///     .add_long("chunk.size", 100)
///     .build();
///
/// assert_eq!(parameters.get_long("chunk.size"), Some(100));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&JobParameter> {
        self.parameters.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.parameters.get(key).map(JobParameter::value) {
            Some(JobParameterValue::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.parameters.get(key).map(JobParameter::value) {
            Some(JobParameterValue::Long(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.parameters.get(key).map(JobParameter::value) {
            Some(JobParameterValue::Double(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_date(&self, key: &str) -> Option<NaiveDate> {
        match self.parameters.get(key).map(JobParameter::value) {
            Some(JobParameterValue::Date(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.parameters.iter()
    }

    fn identifying_entries(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.parameters
            .iter()
            .filter(|(_, parameter)| parameter.identifying)
    }

    /// Deterministic hash over the identifying entries, used as part of the
    /// job instance identity. The map is ordered, so the digest input is
    /// canonical regardless of insertion order.
    pub fn identifying_key(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, parameter) in self.identifying_entries() {
            hasher.update(key.as_bytes());
            hasher.update(b"(");
            hasher.update(parameter.value.type_tag().as_bytes());
            hasher.update(b")=");
            hasher.update(parameter.value.render().as_bytes());
            hasher.update(b";");
        }
        hex::encode(hasher.finalize())
    }

    /// Renders the parameters to a flat `key(type)=value` string, one entry
    /// per comma-separated token, with a `-` prefix on non-identifying keys.
    /// Delimiter characters inside keys and values are backslash-escaped, so
    /// the output restores to an equivalent value via
    /// [`Self::from_properties`].
    pub fn to_properties(&self) -> String {
        let entries: Vec<String> = self
            .parameters
            .iter()
            .map(|(key, parameter)| {
                let prefix = if parameter.identifying { "" } else { "-" };
                // A literal leading '-' on an identifying key would read as
                // the non-identifying prefix; escape it.
                let mut key = escape(key);
                if parameter.identifying && key.starts_with('-') {
                    key.insert(0, '\\');
                }
                format!(
                    "{prefix}{key}({})={}",
                    parameter.value.type_tag(),
                    escape(&parameter.value.render())
                )
            })
            .collect();
        entries.join(",")
    }

    /// Restores a [`JobParameters`] from its [`Self::to_properties`] form.
    /// A key without a type tag is treated as an identifying string.
    pub fn from_properties(properties: &str) -> Result<Self, BatchError> {
        let mut builder = JobParametersBuilder::new();
        for token in split_unescaped(properties, ',') {
            if token.is_empty() {
                continue;
            }
            let mut parts = split_unescaped(&token, '=');
            if parts.len() < 2 {
                return Err(BatchError::Configuration(format!(
                    "malformed job parameter '{token}'"
                )));
            }
            let raw_key = parts.remove(0);
            let raw_value = unescape(&parts.join("="));

            let identifying = !raw_key.starts_with('-');
            let raw_key = if identifying {
                raw_key
            } else {
                raw_key[1..].to_string()
            };

            let key_parts = split_unescaped(&raw_key, '(');
            let (key, value) = match key_parts.as_slice() {
                [key, tag] if tag.ends_with(')') => (
                    unescape(key),
                    JobParameterValue::parse(&tag[..tag.len() - 1], &raw_value)?,
                ),
                [key] => (unescape(key), JobParameterValue::String(raw_value)),
                _ => {
                    return Err(BatchError::Configuration(format!(
                        "malformed job parameter key '{raw_key}'"
                    )));
                }
            };
            builder = builder.add(&key, JobParameter::new(value, identifying));
        }
        Ok(builder.build())
    }
}

/// Backslash-escapes the characters the properties format uses as
/// delimiters.
fn escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | ',' | '(' | ')' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Splits on unescaped occurrences of `separator`, keeping escape sequences
/// intact inside the returned tokens.
fn split_unescaped(input: &str, separator: char) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == separator {
            tokens.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    tokens.push(current);
    tokens
}

/// Equality over identifying entries only.
impl PartialEq for JobParameters {
    fn eq(&self, other: &Self) -> bool {
        self.identifying_entries().eq(other.identifying_entries())
    }
}

/// Builder for [`JobParameters`].
#[derive(Default)]
pub struct JobParametersBuilder {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParametersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, key: &str, parameter: JobParameter) -> Self {
        self.parameters.insert(key.to_string(), parameter);
        self
    }

    pub fn add_string(self, key: &str, value: &str) -> Self {
        self.add(
            key,
            JobParameter::new(JobParameterValue::String(value.to_string()), true),
        )
    }

    pub fn add_long(self, key: &str, value: i64) -> Self {
        self.add(key, JobParameter::new(JobParameterValue::Long(value), true))
    }

    pub fn add_double(self, key: &str, value: f64) -> Self {
        self.add(
            key,
            JobParameter::new(JobParameterValue::Double(value), true),
        )
    }

    pub fn add_date(self, key: &str, value: NaiveDate) -> Self {
        self.add(key, JobParameter::new(JobParameterValue::Date(value), true))
    }

    /// Adds a parameter that is excluded from the job instance identity.
    pub fn add_non_identifying(self, key: &str, value: JobParameterValue) -> Self {
        self.add(key, JobParameter::new(value, false))
    }

    pub fn build(self) -> JobParameters {
        JobParameters {
            parameters: self.parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_non_identifying_parameters() {
        let left = JobParametersBuilder::new()
            .add_string("input", "a.csv")
            .add_non_identifying("run.id", JobParameterValue::Long(1))
            .build();
        let right = JobParametersBuilder::new()
            .add_string("input", "a.csv")
            .add_non_identifying("run.id", JobParameterValue::Long(2))
            .build();

        assert_eq!(left, right);
        assert_eq!(left.identifying_key(), right.identifying_key());
    }

    #[test]
    fn distinct_identifying_parameters_have_distinct_keys() {
        let left = JobParametersBuilder::new().add_long("seq", 1).build();
        let right = JobParametersBuilder::new().add_long("seq", 2).build();

        assert_ne!(left, right);
        assert_ne!(left.identifying_key(), right.identifying_key());
    }

    #[test]
    fn identifying_key_is_insertion_order_independent() {
        let left = JobParametersBuilder::new()
            .add_string("a", "1")
            .add_string("b", "2")
            .build();
        let right = JobParametersBuilder::new()
            .add_string("b", "2")
            .add_string("a", "1")
            .build();

        assert_eq!(left.identifying_key(), right.identifying_key());
    }

    #[test]
    fn properties_round_trip_preserves_identity() {
        let parameters = JobParametersBuilder::new()
            .add_string("input", "trades.csv")
            .add_long("limit", 42)
            .add_double("rate", 1.5)
            .add_date("schedule", NaiveDate::from_ymd_opt(2026, 8, 25).unwrap())
            .add_non_identifying("comment", JobParameterValue::String("nightly".to_string()))
            .build();

        let properties = parameters.to_properties();
        let restored = JobParameters::from_properties(&properties).unwrap();

        assert_eq!(parameters, restored);
        assert_eq!(parameters.identifying_key(), restored.identifying_key());
        assert_eq!(restored.get_long("limit"), Some(42));
        assert_eq!(restored.get_string("comment"), Some("nightly"));
        assert!(!restored.get("comment").unwrap().is_identifying());
    }

    #[test]
    fn properties_round_trip_keys_and_values_with_delimiter_characters() {
        let parameters = JobParametersBuilder::new()
            .add_string("report(final)", "a,b=c")
            .add_string("-leading-dash", "plain")
            .add_non_identifying(
                "comment",
                JobParameterValue::String("one, two".to_string()),
            )
            .build();

        let restored = JobParameters::from_properties(&parameters.to_properties()).unwrap();

        assert_eq!(restored.get_string("report(final)"), Some("a,b=c"));
        assert_eq!(restored.get_string("-leading-dash"), Some("plain"));
        assert!(restored.get("-leading-dash").unwrap().is_identifying());
        assert_eq!(restored.get_string("comment"), Some("one, two"));
        assert!(!restored.get("comment").unwrap().is_identifying());
        assert_eq!(parameters, restored);
    }

    #[test]
    fn untyped_property_defaults_to_identifying_string() {
        let restored = JobParameters::from_properties("input=trades.csv").unwrap();
        assert_eq!(restored.get_string("input"), Some("trades.csv"));
        assert!(restored.get("input").unwrap().is_identifying());
    }

    #[test]
    fn malformed_property_is_a_configuration_error() {
        let result = JobParameters::from_properties("oops");
        assert!(matches!(result, Err(BatchError::Configuration(_))));

        let result = JobParameters::from_properties("when(epoch)=12");
        assert!(matches!(result, Err(BatchError::Configuration(_))));
    }
}
