//! Reads label values off incoming samples.
//!
//! Each label source in a [`LabelSchema`] is bound to a plain function once,
//! when the schema is installed; extraction then walks that table per event.

use std::hash::{Hash, Hasher};

use tracing::debug;

use crate::error::ListenerError;
use crate::event::{AssertionResult, SampleEvent, SampleResult};
use crate::schema::{AssertionAttribute, LabelSchema, LabelSource, SampleAttribute};

type SampleFn = fn(&SampleResult) -> String;
type AssertionFn = fn(&AssertionResult) -> String;

/// Bound reader for one label position.
#[derive(Clone, Copy)]
pub enum Accessor {
    Sample(SampleFn),
    Assertion(AssertionFn),
    Variable(usize),
}

impl Accessor {
    pub fn for_source(source: LabelSource) -> Self {
        match source {
            LabelSource::Sample(attr) => Accessor::Sample(sample_accessor(attr)),
            LabelSource::Assertion(attr) => Accessor::Assertion(assertion_accessor(attr)),
            LabelSource::Variable(index) => Accessor::Variable(index),
        }
    }
}

fn sample_accessor(attr: SampleAttribute) -> SampleFn {
    match attr {
        SampleAttribute::Label => |r| r.label.clone(),
        SampleAttribute::Code => |r| r.response_code.clone(),
        SampleAttribute::Success => |r| r.success.to_string(),
        SampleAttribute::ThreadName => |r| r.thread_name.clone(),
        SampleAttribute::DataType => |r| r.data_type.clone(),
        SampleAttribute::Url => |r| r.url.clone().unwrap_or_default(),
        SampleAttribute::ResponseMessage => |r| r.response_message.clone(),
    }
}

fn assertion_accessor(attr: AssertionAttribute) -> AssertionFn {
    match attr {
        AssertionAttribute::Name => |a| a.name.clone(),
        AssertionAttribute::Failure => |a| a.failure.to_string(),
        AssertionAttribute::Error => |a| a.error.to_string(),
    }
}

/// Ordered label values identifying one child series.
///
/// Equality and hashing are positional over the values. The generation
/// records which reconfigure the extractor belonged to, so a tuple built
/// before a rebuild can be refused instead of recorded.
#[derive(Debug, Clone, Eq)]
pub struct LabelValues {
    values: Vec<String>,
    generation: Option<u64>,
}

impl PartialEq for LabelValues {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Hash for LabelValues {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.values.hash(state);
    }
}

impl LabelValues {
    /// A tuple not tied to any reconfigure generation; only its length is checked.
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
            generation: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            values: Vec::new(),
            generation: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn as_strs(&self) -> Vec<&str> {
        self.values.iter().map(String::as_str).collect()
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn into_values(self) -> Vec<String> {
        self.values
    }
}

/// Accessor table for one installed schema.
pub struct Extractor {
    names: Vec<String>,
    accessors: Vec<Accessor>,
    generation: u64,
}

impl Extractor {
    pub fn new(schema: &LabelSchema, generation: u64) -> Self {
        Self {
            names: schema.owned_names(),
            accessors: schema
                .labels()
                .iter()
                .map(|l| Accessor::for_source(l.source))
                .collect(),
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Values for a sampler-family schema.
    pub fn extract(&self, event: &SampleEvent) -> Result<LabelValues, ListenerError> {
        self.extract_inner(event, None)
    }

    /// Values for an assertion-family schema; assertion-sourced labels read
    /// from `assertion`, everything else from the sample.
    pub fn extract_assertion(
        &self,
        event: &SampleEvent,
        assertion: &AssertionResult,
    ) -> Result<LabelValues, ListenerError> {
        self.extract_inner(event, Some(assertion))
    }

    fn extract_inner(
        &self,
        event: &SampleEvent,
        assertion: Option<&AssertionResult>,
    ) -> Result<LabelValues, ListenerError> {
        let mut values = Vec::with_capacity(self.accessors.len());
        for (name, accessor) in self.names.iter().zip(&self.accessors) {
            let value = match accessor {
                Accessor::Sample(read) => read(&event.result),
                Accessor::Assertion(read) => match assertion {
                    Some(assertion) => read(assertion),
                    None => {
                        return Err(ListenerError::Extraction {
                            label: name.clone(),
                            reason: "no assertion result for an assertion label".into(),
                        })
                    }
                },
                Accessor::Variable(index) => event.variable_value(*index).to_string(),
            };
            values.push(value);
        }
        debug!(labels = ?values, "generated label set");
        Ok(LabelValues {
            values,
            generation: Some(self.generation),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::event::SampleResult;
    use crate::schema::Family;

    fn config(vars: &[&str]) -> ListenerConfig {
        ListenerConfig {
            sample_variables: vars.iter().map(|v| v.to_string()).collect(),
            ..ListenerConfig::default()
        }
    }

    #[test]
    fn test_extract_matches_schema_order() {
        let schema = LabelSchema::resolve(Family::Sampler, &config(&["user", "region"]));
        let extractor = Extractor::new(&schema, 1);
        let event = SampleEvent::new(SampleResult::new("login", "200", true, 5))
            .with_variables([Some("alice"), Some("eu")]);

        let values = extractor.extract(&event).unwrap();
        assert_eq!(values.len(), schema.len());
        assert_eq!(values.values(), ["login", "200", "true", "alice", "eu"]);
        assert_eq!(values.generation(), Some(1));
    }

    #[test]
    fn test_unset_variable_is_empty_string() {
        let schema = LabelSchema::resolve(Family::Sampler, &config(&["user", "region"]));
        let extractor = Extractor::new(&schema, 1);
        let event = SampleEvent::new(SampleResult::new("login", "200", true, 5))
            .with_variables([Some("bob")]);

        let values = extractor.extract(&event).unwrap();
        assert_eq!(values.values()[4], "");
    }

    #[test]
    fn test_assertion_values_read_from_sub_record() {
        let schema = LabelSchema::resolve(Family::Assertion, &config(&[]));
        let extractor = Extractor::new(&schema, 3);
        let event = SampleEvent::new(SampleResult::new("login", "401", false, 5));
        let assertion = AssertionResult::failed("status is 200", "got 401");

        let values = extractor.extract_assertion(&event, &assertion).unwrap();
        assert_eq!(values.values(), ["status is 200", "401", "false", "true"]);
    }

    #[test]
    fn test_absent_optional_attributes_are_empty() {
        let mut cfg = config(&[]);
        cfg.extra_labels = vec!["url".into(), "response_message".into(), "data_type".into()];
        let schema = LabelSchema::resolve(Family::Sampler, &cfg);
        let extractor = Extractor::new(&schema, 1);
        let event = SampleEvent::new(SampleResult::new("login", "200", true, 5));

        let values = extractor.extract(&event).unwrap();
        assert_eq!(values.values(), ["login", "200", "true", "", "", ""]);
    }

    #[test]
    fn test_assertion_schema_without_assertion_fails() {
        let schema = LabelSchema::resolve(Family::Assertion, &config(&[]));
        let extractor = Extractor::new(&schema, 1);
        let event = SampleEvent::new(SampleResult::new("login", "200", true, 5));
        assert!(extractor.extract(&event).is_err());
    }

    #[test]
    fn test_label_values_equality_ignores_generation() {
        let a = LabelValues::new(["login", "200"]);
        let schema = LabelSchema::resolve(Family::Sampler, &{
            let mut c = config(&[]);
            c.save.success = false;
            c
        });
        let b = Extractor::new(&schema, 9)
            .extract(&SampleEvent::new(SampleResult::new("login", "200", true, 1)))
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, LabelValues::new(["200", "login"]));
    }
}
