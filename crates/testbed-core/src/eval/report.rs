//! Grading observed outcomes against FAIL_TO_PASS and PASS_TO_PASS.

use super::parsers::{TestOutcome, TestStatus};
use super::spec::TestSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Declared tests split by how they fared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestGroup {
    pub success: Vec<String>,
    pub failure: Vec<String>,
}

impl TestGroup {
    /// Share of graded tests that succeeded. An empty group counts as 1.
    pub fn pass_rate(&self) -> f64 {
        let total = self.success.len() + self.failure.len();
        if total == 0 {
            1.0
        } else {
            self.success.len() as f64 / total as f64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.success.is_empty() && self.failure.is_empty()
    }
}

/// Grading of both declared sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestsStatus {
    #[serde(rename = "FAIL_TO_PASS")]
    pub fail_to_pass: TestGroup,
    #[serde(rename = "PASS_TO_PASS")]
    pub pass_to_pass: TestGroup,
}

/// How completely a patch resolves an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedStatus {
    Full,
    Partial,
    No,
}

impl ResolvedStatus {
    pub fn from_tests(status: &TestsStatus) -> Self {
        let f2p = status.fail_to_pass.pass_rate();
        let p2p = status.pass_to_pass.pass_rate();
        if f2p == 1.0 && p2p == 1.0 {
            Self::Full
        } else if f2p > 0.0 && f2p < 1.0 && p2p == 1.0 {
            Self::Partial
        } else {
            Self::No
        }
    }
}

/// Grade `declared` tests against observed outcomes. A test never observed
/// counts as failed. Skipped tests land in neither list.
fn grade_group(declared: &[String], observed: &HashMap<&str, TestStatus>) -> TestGroup {
    let mut group = TestGroup::default();
    for name in declared {
        match observed.get(name.as_str()) {
            Some(status) if status.is_pass() => group.success.push(name.clone()),
            Some(TestStatus::Skipped) => {}
            _ => group.failure.push(name.clone()),
        }
    }
    group
}

/// Grade both declared sets against `outcomes`.
pub fn grade(outcomes: &[TestOutcome], fail_to_pass: &[String], pass_to_pass: &[String]) -> TestsStatus {
    let observed: HashMap<&str, TestStatus> = outcomes
        .iter()
        .map(|o| (o.name.as_str(), o.status))
        .collect();
    TestsStatus {
        fail_to_pass: grade_group(fail_to_pass, &observed),
        pass_to_pass: grade_group(pass_to_pass, &observed),
    }
}

/// Overall verdict of a `run_tests` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
}

/// Result of running selected test files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub status: RunStatus,
    /// `false` when a patch was given and did not apply.
    pub patch_applied: bool,
    /// One or more outcomes per requested file, nothing else.
    pub outcomes: Vec<TestOutcome>,
    /// Declared tests that belong to the requested files, graded.
    pub tests_status: TestsStatus,
    /// Raw runner or patch output.
    pub output: String,
}

impl TestResult {
    /// Build a result from parsed `outcomes` of a run over `test_files`.
    pub fn from_outcomes(
        spec: &TestSpec,
        test_files: &[String],
        outcomes: Vec<TestOutcome>,
        output: String,
    ) -> Self {
        let outcomes = attribute(test_files, outcomes);
        let fail_to_pass = in_scope(&spec.fail_to_pass, test_files, &outcomes);
        let pass_to_pass = in_scope(&spec.pass_to_pass, test_files, &outcomes);
        let tests_status = grade(&outcomes, &fail_to_pass, &pass_to_pass);

        let passed = if fail_to_pass.is_empty() && pass_to_pass.is_empty() {
            !outcomes.iter().any(|o| o.status.is_failure())
        } else {
            tests_status.fail_to_pass.failure.is_empty()
                && tests_status.pass_to_pass.failure.is_empty()
        };

        Self {
            status: if passed {
                RunStatus::Passed
            } else {
                RunStatus::Failed
            },
            patch_applied: true,
            outcomes,
            tests_status,
            output,
        }
    }

    /// The patch did not apply, so no test ran.
    pub fn patch_failed(test_files: &[String], output: String) -> Self {
        Self {
            status: RunStatus::Failed,
            patch_applied: false,
            outcomes: attribute(test_files, Vec::new()),
            tests_status: TestsStatus::default(),
            output,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    /// PASS_TO_PASS tests that failed.
    pub fn regressions(&self) -> &[String] {
        &self.tests_status.pass_to_pass.failure
    }

    pub fn has_regressions(&self) -> bool {
        !self.regressions().is_empty()
    }

    /// Outcomes grouped by their file.
    pub fn outcomes_by_file(&self) -> BTreeMap<&str, Vec<&TestOutcome>> {
        let mut by_file: BTreeMap<&str, Vec<&TestOutcome>> = BTreeMap::new();
        for outcome in &self.outcomes {
            if let Some(file) = outcome.file_path.as_deref() {
                by_file.entry(file).or_default().push(outcome);
            }
        }
        by_file
    }
}

/// Result of a full instance evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub instance_id: String,
    pub patch_applied: bool,
    pub resolved: bool,
    pub resolution: ResolvedStatus,
    pub tests_status: TestsStatus,
    pub outcomes: Vec<TestOutcome>,
    pub output: String,
}

impl EvaluationResult {
    pub fn from_outcomes(spec: &TestSpec, outcomes: Vec<TestOutcome>, output: String) -> Self {
        let tests_status = grade(&outcomes, &spec.fail_to_pass, &spec.pass_to_pass);
        let resolution = ResolvedStatus::from_tests(&tests_status);
        Self {
            instance_id: spec.instance_id.clone(),
            patch_applied: true,
            resolved: resolution == ResolvedStatus::Full,
            resolution,
            tests_status,
            outcomes,
            output,
        }
    }

    pub fn patch_failed(instance_id: impl Into<String>, output: String) -> Self {
        Self {
            instance_id: instance_id.into(),
            patch_applied: false,
            resolved: false,
            resolution: ResolvedStatus::No,
            tests_status: TestsStatus::default(),
            outcomes: Vec::new(),
            output,
        }
    }
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./")
}

/// Keep outcomes that belong to a requested file, rewriting their file to
/// the requested spelling. Requested files without any outcome get a
/// synthetic error outcome.
fn attribute(test_files: &[String], outcomes: Vec<TestOutcome>) -> Vec<TestOutcome> {
    let mut files: Vec<&String> = Vec::new();
    for file in test_files {
        if !files.contains(&file) {
            files.push(file);
        }
    }
    let single = (files.len() == 1).then(|| files[0]);

    let mut kept: Vec<TestOutcome> = Vec::new();
    for mut outcome in outcomes {
        let matched = match outcome.file_path.as_deref() {
            Some(observed) => files.iter().copied().find(|requested| {
                let (a, b) = (normalize(observed), normalize(requested));
                a == b || a.ends_with(&format!("/{b}")) || b.ends_with(&format!("/{a}"))
            }),
            None => single,
        };
        if let Some(file) = matched {
            outcome.file_path = Some(file.clone());
            kept.push(outcome);
        }
    }

    for file in files {
        if !kept.iter().any(|o| o.file_path.as_ref() == Some(file)) {
            let mut missing = TestOutcome::new(file.clone(), TestStatus::Error);
            missing.file_path = Some(file.clone());
            missing.failure_output = Some("no test results found for this file".to_string());
            kept.push(missing);
        }
    }
    kept
}

/// Declared tests that belong to the requested files.
fn in_scope(declared: &[String], test_files: &[String], outcomes: &[TestOutcome]) -> Vec<String> {
    declared
        .iter()
        .filter(|name| {
            outcomes.iter().any(|o| &o.name == *name)
                || test_files
                    .iter()
                    .any(|file| name.starts_with(&format!("{}::", normalize(file))))
        })
        .cloned()
        .collect()
}
