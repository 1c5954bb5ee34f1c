//! Sample events delivered by the host load-test engine.

use serde::{Deserialize, Serialize};

/// Outcome of one assertion applied to a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub name: String,
    pub failure: bool,
    pub error: bool,
    pub failure_message: Option<String>,
}

impl AssertionResult {
    pub fn passed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failure: false,
            error: false,
            failure_message: None,
        }
    }

    pub fn failed(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            failure: true,
            error: false,
            failure_message: Some(message.to_string()),
        }
    }
}

/// Measured result of a single sampler execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    pub label: String,
    pub response_code: String,
    pub success: bool,
    /// Elapsed time in milliseconds
    pub elapsed_ms: u64,
    pub thread_name: String,
    pub data_type: String,
    /// Sampled URL, when the sampler has one
    pub url: Option<String>,
    pub response_message: String,
    pub assertions: Vec<AssertionResult>,
}

impl SampleResult {
    pub fn new(label: &str, response_code: &str, success: bool, elapsed_ms: u64) -> Self {
        Self {
            label: label.to_string(),
            response_code: response_code.to_string(),
            success,
            elapsed_ms,
            thread_name: String::new(),
            data_type: String::new(),
            url: None,
            response_message: String::new(),
            assertions: Vec::new(),
        }
    }

    pub fn with_assertion(mut self, assertion: AssertionResult) -> Self {
        self.assertions.push(assertion);
        self
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    pub fn with_response_message(mut self, message: &str) -> Self {
        self.response_message = message.to_string();
        self
    }

    pub fn with_thread_name(mut self, thread_name: &str) -> Self {
        self.thread_name = thread_name.to_string();
        self
    }
}

/// A sample plus the per-run context the host attaches to it.
///
/// `variables` is indexed positionally against the run's declared sample
/// variable names; `None` marks a variable the sampler did not set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleEvent {
    pub result: SampleResult,
    pub variables: Vec<Option<String>>,
    /// Threads running in the sample's thread group when it completed
    pub active_threads: u32,
}

impl SampleEvent {
    pub fn new(result: SampleResult) -> Self {
        Self {
            result,
            variables: Vec::new(),
            active_threads: 0,
        }
    }

    pub fn with_variables<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        self.variables = values.into_iter().map(|v| v.map(Into::into)).collect();
        self
    }

    pub fn with_active_threads(mut self, threads: u32) -> Self {
        self.active_threads = threads;
        self
    }

    /// Value of the variable at `index`; unset or out of range yields "".
    pub fn variable_value(&self, index: usize) -> &str {
        self.variables
            .get(index)
            .and_then(|v| v.as_deref())
            .unwrap_or("")
    }
}
