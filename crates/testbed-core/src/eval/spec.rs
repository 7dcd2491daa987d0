//! Per-instance test specifications and the catalog that serves them.

use super::parsers::{LogParser, TestOutcome};
use crate::error::CoreError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Runner command used when an instance does not name one.
pub const DEFAULT_TEST_CMD: &str = "pytest -rA";

fn default_test_cmd() -> String {
    DEFAULT_TEST_CMD.to_string()
}

/// Accept a JSON list or a string holding a JSON list, as dataset dumps
/// carry both.
fn list_or_encoded<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Encoded(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::List(list) => Ok(list),
        Raw::Encoded(s) if s.trim().is_empty() => Ok(Vec::new()),
        Raw::Encoded(s) => serde_json::from_str(&s).map_err(serde::de::Error::custom),
    }
}

/// What to run for one instance and how to judge the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    pub instance_id: String,
    /// `owner/name` of the repository under test.
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_test_cmd")]
    pub test_cmd: String,
    /// Tests the patch must turn from failing to passing.
    #[serde(
        default,
        alias = "FAIL_TO_PASS",
        deserialize_with = "list_or_encoded"
    )]
    pub fail_to_pass: Vec<String>,
    /// Tests that must keep passing.
    #[serde(
        default,
        alias = "PASS_TO_PASS",
        deserialize_with = "list_or_encoded"
    )]
    pub pass_to_pass: Vec<String>,
    /// Test file → methods to leave out of every result.
    #[serde(default)]
    pub ignored_tests: BTreeMap<String, Vec<String>>,
    /// Reference fix, used by evaluations run without a patch.
    #[serde(default, alias = "patch")]
    pub gold_patch: Option<String>,
    /// Parser override. Chosen from `repo` when absent.
    #[serde(default)]
    pub log_parser: Option<LogParser>,
}

impl TestSpec {
    /// A pytest spec with no declared tests.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            repo: String::new(),
            test_cmd: default_test_cmd(),
            fail_to_pass: Vec::new(),
            pass_to_pass: Vec::new(),
            ignored_tests: BTreeMap::new(),
            gold_patch: None,
            log_parser: None,
        }
    }

    pub fn parser(&self) -> LogParser {
        self.log_parser
            .unwrap_or_else(|| LogParser::for_repo(&self.repo))
    }

    /// Test files as the runner expects them. Django takes dotted module
    /// labels relative to `tests/`.
    pub fn test_directives(&self, test_files: &[String]) -> Vec<String> {
        if self.parser() != LogParser::Django {
            return test_files.to_vec();
        }
        test_files
            .iter()
            .map(|file| {
                let file = file.strip_suffix(".py").unwrap_or(file);
                let file = file.strip_prefix("tests/").unwrap_or(file);
                file.replace('/', ".")
            })
            .collect()
    }

    /// Full shell command running `test_files`.
    pub fn test_command(&self, test_files: &[String]) -> String {
        let mut command = self.test_cmd.clone();
        for directive in self.test_directives(test_files) {
            command.push(' ');
            command.push_str(&shell_quote(&directive));
        }
        command
    }

    /// Remove outcomes listed in `ignored_tests`.
    pub fn drop_ignored(&self, outcomes: Vec<TestOutcome>) -> Vec<TestOutcome> {
        if self.ignored_tests.is_empty() {
            return outcomes;
        }
        outcomes
            .into_iter()
            .filter(|outcome| !self.is_ignored(outcome))
            .collect()
    }

    fn is_ignored(&self, outcome: &TestOutcome) -> bool {
        let (Some(file), Some(method)) = (&outcome.file_path, &outcome.method) else {
            return false;
        };
        self.ignored_tests
            .get(file)
            .is_some_and(|methods| methods.iter().any(|m| m == method || m == "*"))
    }
}

fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':'))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Source of test specifications keyed by instance reference.
pub trait InstanceCatalog: Send + Sync {
    fn test_spec(&self, instance_ref: &str) -> Option<TestSpec>;
}

/// Catalog held in memory, usually loaded from a JSON file.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    specs: HashMap<String, TestSpec>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: impl IntoIterator<Item = TestSpec>) -> Self {
        let mut catalog = Self::new();
        for spec in specs {
            catalog.insert(spec);
        }
        catalog
    }

    /// Load a JSON array of specs.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let specs: Vec<TestSpec> = serde_json::from_str(&raw)
            .map_err(|e| CoreError::Catalog(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), count = specs.len(), "Loaded instance catalog");
        Ok(Self::from_specs(specs))
    }

    pub fn insert(&mut self, spec: TestSpec) {
        self.specs.insert(spec.instance_id.clone(), spec);
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl InstanceCatalog for StaticCatalog {
    fn test_spec(&self, instance_ref: &str) -> Option<TestSpec> {
        self.specs.get(instance_ref).cloned()
    }
}
