//! Label schemas: which sample attributes become time-series labels, and in
//! what order.
//!
//! A schema is resolved once per reconfigure from a [`ListenerConfig`]. Fixed
//! attribute labels come first in their declared order, then any configured
//! extra attributes, then the caller's sample variables in the order the host
//! reports them. Lookups into the collectors are positional, so the order
//! here is the order every extracted tuple must follow.

use std::collections::HashSet;
use std::fmt;

use tracing::warn;

use crate::config::ListenerConfig;

/// Label name carrying the assertion failure flag.
pub const FAILURE_LABEL: &str = "failure";

/// Metric family a schema is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Sampler,
    Assertion,
}

/// Attributes readable from a sample result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleAttribute {
    Label,
    Code,
    Success,
    ThreadName,
    DataType,
    Url,
    ResponseMessage,
}

impl SampleAttribute {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "label" => Some(Self::Label),
            "code" => Some(Self::Code),
            "success" => Some(Self::Success),
            "thread_name" => Some(Self::ThreadName),
            "data_type" => Some(Self::DataType),
            "url" => Some(Self::Url),
            "response_message" => Some(Self::ResponseMessage),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Label => "label",
            Self::Code => "code",
            Self::Success => "success",
            Self::ThreadName => "thread_name",
            Self::DataType => "data_type",
            Self::Url => "url",
            Self::ResponseMessage => "response_message",
        }
    }
}

/// Attributes readable from an assertion result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssertionAttribute {
    Name,
    Failure,
    Error,
}

impl AssertionAttribute {
    /// Only the attributes that may be requested as extra labels.
    /// The assertion name is always exposed under `label`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            FAILURE_LABEL => Some(Self::Failure),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Where a label's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelSource {
    Sample(SampleAttribute),
    Assertion(AssertionAttribute),
    /// Index into the event's sample variables
    Variable(usize),
}

#[derive(Debug, Clone)]
pub struct SchemaLabel {
    pub name: String,
    pub source: LabelSource,
}

/// Ordered, deduplicated label names plus the source bound to each.
///
/// Equality is positional over the names.
#[derive(Debug, Clone, Default)]
pub struct LabelSchema {
    labels: Vec<SchemaLabel>,
}

impl PartialEq for LabelSchema {
    fn eq(&self, other: &Self) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(&other.labels)
                .all(|(a, b)| a.name == b.name)
    }
}

impl Eq for LabelSchema {}

impl fmt::Display for LabelSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.names().join(", "))
    }
}

impl LabelSchema {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Schema whose labels all read sample variables, by position.
    ///
    /// Names are taken as given; collectors reject invalid ones when the
    /// schema is installed.
    pub fn from_variables<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: names
                .into_iter()
                .enumerate()
                .map(|(index, name)| SchemaLabel {
                    name: name.into(),
                    source: LabelSource::Variable(index),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[SchemaLabel] {
        &self.labels
    }

    pub fn names(&self) -> Vec<&str> {
        self.labels.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn owned_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }

    /// Resolve the schema for `family` from the configuration.
    ///
    /// Never fails: names that cannot be resolved or are not valid label
    /// names are dropped with a warning and the rest of the schema is kept.
    pub fn resolve(family: Family, config: &ListenerConfig) -> Self {
        let mut builder = SchemaBuilder::default();

        match family {
            Family::Sampler => {
                if config.save.label {
                    builder.push("label", LabelSource::Sample(SampleAttribute::Label));
                }
            }
            Family::Assertion => {
                builder.push("label", LabelSource::Assertion(AssertionAttribute::Name));
            }
        }
        if config.save.code {
            builder.push("code", LabelSource::Sample(SampleAttribute::Code));
        }
        if config.save.success {
            builder.push("success", LabelSource::Sample(SampleAttribute::Success));
        }
        if family == Family::Assertion {
            builder.push(
                FAILURE_LABEL,
                LabelSource::Assertion(AssertionAttribute::Failure),
            );
        }

        for name in &config.extra_labels {
            let source = match family {
                Family::Assertion => AssertionAttribute::from_name(name)
                    .map(LabelSource::Assertion)
                    .or_else(|| SampleAttribute::from_name(name).map(LabelSource::Sample)),
                Family::Sampler => SampleAttribute::from_name(name).map(LabelSource::Sample),
            };
            match source {
                Some(source) => builder.push(name, source),
                None => warn!(?family, label = %name, "unknown sample attribute, label dropped"),
            }
        }

        for (index, name) in config.sample_variables.iter().enumerate() {
            if !is_valid_label_name(name) {
                warn!(?family, variable = %name, "sample variable is not a valid label name, dropped");
                continue;
            }
            builder.push(name, LabelSource::Variable(index));
        }

        builder.build(family)
    }
}

#[derive(Default)]
struct SchemaBuilder {
    labels: Vec<SchemaLabel>,
    seen: HashSet<String>,
}

impl SchemaBuilder {
    fn push(&mut self, name: &str, source: LabelSource) {
        if !self.seen.insert(name.to_string()) {
            warn!(label = %name, "duplicate label name, keeping the first occurrence");
            return;
        }
        self.labels.push(SchemaLabel {
            name: name.to_string(),
            source,
        });
    }

    fn build(self, family: Family) -> LabelSchema {
        let schema = LabelSchema {
            labels: self.labels,
        };
        tracing::debug!(?family, %schema, "resolved label schema");
        schema
    }
}

/// Prometheus label name rules, plus `quantile` which summaries reserve.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    first_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("__")
        && name != "quantile"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_vars(vars: &[&str]) -> ListenerConfig {
        ListenerConfig {
            sample_variables: vars.iter().map(|v| v.to_string()).collect(),
            ..ListenerConfig::default()
        }
    }

    #[test]
    fn test_sampler_order() {
        let schema = LabelSchema::resolve(Family::Sampler, &config_with_vars(&["user", "region"]));
        assert_eq!(schema.names(), vec!["label", "code", "success", "user", "region"]);
    }

    #[test]
    fn test_assertion_schema_substitutes_name_and_adds_failure() {
        let mut config = config_with_vars(&["user"]);
        config.save.label = false;
        config.save.success = false;
        let schema = LabelSchema::resolve(Family::Assertion, &config);
        assert_eq!(schema.names(), vec!["label", "code", "failure", "user"]);
        assert_eq!(
            schema.labels()[0].source,
            LabelSource::Assertion(AssertionAttribute::Name)
        );
    }

    #[test]
    fn test_flags_disable_fixed_labels() {
        let mut config = ListenerConfig::default();
        config.save.code = false;
        config.save.success = false;
        let schema = LabelSchema::resolve(Family::Sampler, &config);
        assert_eq!(schema.names(), vec!["label"]);
    }

    #[test]
    fn test_unknown_extra_label_dropped() {
        let mut config = ListenerConfig::default();
        config.extra_labels = vec!["url".into(), "no_such_attribute".into()];
        let schema = LabelSchema::resolve(Family::Sampler, &config);
        assert_eq!(schema.names(), vec!["label", "code", "success", "url"]);
    }

    #[test]
    fn test_variables_deduplicated_and_validated() {
        let schema = LabelSchema::resolve(
            Family::Sampler,
            &config_with_vars(&["code", "bad-name", "quantile", "tenant"]),
        );
        assert_eq!(schema.names(), vec!["label", "code", "success", "tenant"]);
        // the surviving variable keeps its original index
        assert_eq!(schema.labels()[3].source, LabelSource::Variable(3));
    }

    #[test]
    fn test_positional_equality() {
        let a = LabelSchema::resolve(Family::Sampler, &config_with_vars(&["a", "b"]));
        let b = LabelSchema::resolve(Family::Sampler, &config_with_vars(&["b", "a"]));
        let c = LabelSchema::resolve(Family::Sampler, &config_with_vars(&["a", "b"]));
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_label_name_rules() {
        assert!(is_valid_label_name("tenant_id"));
        assert!(is_valid_label_name("_x"));
        assert!(!is_valid_label_name("9lives"));
        assert!(!is_valid_label_name("__reserved"));
        assert!(!is_valid_label_name(""));
    }
}
