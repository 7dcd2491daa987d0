//! Test log parsers.
//!
//! Each parser turns raw runner output into per-test outcomes. Unrecognised
//! lines are ignored, so a log from the wrong runner yields nothing rather
//! than garbage.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Outcome of a single test as printed by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Error,
    Xfail,
}

impl TestStatus {
    /// Parse a pytest status word.
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "PASSED" => Some(Self::Passed),
            "FAILED" => Some(Self::Failed),
            "SKIPPED" => Some(Self::Skipped),
            "ERROR" => Some(Self::Error),
            "XFAIL" => Some(Self::Xfail),
            _ => None,
        }
    }

    /// Counts as passing for grading.
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Passed | Self::Xfail)
    }

    /// Counts as failing for grading.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }
}

/// One test observed in a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Name as the runner prints it, e.g. `tests/test_a.py::test_b`.
    pub name: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_output: Option<String>,
}

impl TestOutcome {
    pub fn new(name: impl Into<String>, status: TestStatus) -> Self {
        Self {
            name: name.into(),
            status,
            file_path: None,
            method: None,
            failure_output: None,
        }
    }
}

/// Which runner produced a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogParser {
    #[default]
    Pytest,
    Django,
    Sympy,
}

impl LogParser {
    /// Parser used for a `owner/name` repository.
    pub fn for_repo(repo: &str) -> Self {
        match repo {
            "django/django" => Self::Django,
            "sympy/sympy" => Self::Sympy,
            _ => Self::Pytest,
        }
    }

    pub fn parse(&self, log: &str) -> Vec<TestOutcome> {
        match self {
            Self::Pytest => parse_pytest(log),
            Self::Django => parse_django(log),
            Self::Sympy => parse_sympy(log),
        }
    }
}

/// Ordered outcomes where a later line for the same test wins.
#[derive(Default)]
struct Outcomes {
    items: Vec<TestOutcome>,
    index: HashMap<String, usize>,
}

impl Outcomes {
    fn push(&mut self, outcome: TestOutcome) {
        match self.index.get(&outcome.name) {
            Some(&i) => self.items[i] = outcome,
            None => {
                self.index.insert(outcome.name.clone(), self.items.len());
                self.items.push(outcome);
            }
        }
    }

    fn attach_failures(&mut self, failures: &HashMap<String, String>, key: impl Fn(&TestOutcome) -> Vec<String>) {
        for outcome in self.items.iter_mut().filter(|o| o.status.is_failure()) {
            if let Some(text) = key(outcome).iter().find_map(|k| failures.get(k)) {
                outcome.failure_output = Some(text.clone());
            }
        }
    }

    fn into_vec(self) -> Vec<TestOutcome> {
        self.items
    }
}

/// Remove ANSI colour sequences.
fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for end in chars.by_ref() {
                if end.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

fn is_rule(line: &str, ch: char) -> bool {
    line.len() >= 3 && line.starts_with(ch) && line.ends_with(ch)
}

/// Split `file::Class::method` into file path and dotted method.
fn split_test_id(name: &str) -> (Option<String>, Option<String>) {
    match name.split_once("::") {
        Some((file, rest)) => (Some(file.to_string()), Some(rest.replace("::", "."))),
        None => (None, None),
    }
}

// ============================================================================
// pytest
// ============================================================================

fn parse_pytest(log: &str) -> Vec<TestOutcome> {
    let mut outcomes = Outcomes::default();
    let mut failures: HashMap<String, String> = HashMap::new();
    let mut in_failures = false;
    let mut current: Option<(String, Vec<String>)> = None;

    let mut flush = |current: &mut Option<(String, Vec<String>)>| {
        if let Some((name, lines)) = current.take() {
            failures.insert(name, lines.join("\n").trim().to_string());
        }
    };

    for raw in log.lines() {
        let line = strip_ansi(raw);
        let trimmed = line.trim();

        if is_rule(trimmed, '=') {
            flush(&mut current);
            in_failures = trimmed.contains(" FAILURES ") || trimmed.contains(" ERRORS ");
            continue;
        }

        if in_failures {
            if is_rule(trimmed, '_') {
                flush(&mut current);
                let title = trimmed.trim_matches(|c| c == '_' || c == ' ');
                current = Some((title.to_string(), Vec::new()));
            } else if let Some((_, lines)) = current.as_mut() {
                lines.push(line.clone());
            }
            continue;
        }

        if let Some(outcome) = pytest_line(trimmed) {
            outcomes.push(outcome);
        }
    }
    flush(&mut current);

    outcomes.attach_failures(&failures, |o| {
        let mut keys = Vec::new();
        if let Some(method) = &o.method {
            keys.push(method.clone());
        }
        keys.push(o.name.clone());
        keys
    });
    outcomes.into_vec()
}

/// Strip a trailing `[ 42%]` progress marker.
fn strip_progress(line: &str) -> &str {
    if line.ends_with("%]") {
        if let Some(i) = line.rfind('[') {
            return line[..i].trim_end();
        }
    }
    line
}

fn pytest_line(line: &str) -> Option<TestOutcome> {
    let line = strip_progress(line);
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 2 {
        return None;
    }

    let (status, name) = if let Some(status) = TestStatus::parse(tokens[0]) {
        // `SKIPPED [1] tests/test_a.py:12: reason`
        if status == TestStatus::Skipped && tokens[1].starts_with('[') {
            let location = tokens.get(2)?.trim_end_matches(':');
            let mut outcome = TestOutcome::new(location, status);
            outcome.file_path = location.split(':').next().map(String::from);
            return Some(outcome);
        }
        (status, tokens[1])
    } else {
        let last = tokens[tokens.len() - 1].trim_end_matches(':');
        let status = TestStatus::parse(last)?;
        (status, tokens[tokens.len() - 2])
    };

    if !name.contains("::") {
        return None;
    }
    let (file_path, method) = split_test_id(name);
    Some(TestOutcome {
        name: name.to_string(),
        status,
        file_path,
        method,
        failure_output: None,
    })
}

// ============================================================================
// Django
// ============================================================================

fn django_test_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\w+) \(([\w.]+)\)").expect("django test pattern should compile")
    })
}

fn django_status(verdict: &str) -> Option<TestStatus> {
    let verdict = verdict.trim();
    if verdict == "ok" {
        Some(TestStatus::Passed)
    } else if verdict.starts_with("skipped") {
        Some(TestStatus::Skipped)
    } else if verdict == "FAIL" || verdict == "unexpected success" {
        Some(TestStatus::Failed)
    } else if verdict == "ERROR" {
        Some(TestStatus::Error)
    } else if verdict == "expected failure" {
        Some(TestStatus::Xfail)
    } else {
        None
    }
}

/// `app.tests.FooTests` → (`tests/app/tests.py`, `FooTests`).
fn django_location(module: &str, method: &str) -> (Option<String>, String) {
    let parts: Vec<&str> = module.split('.').collect();
    let (modules, class) = match parts.split_last() {
        Some((last, rest)) if last.chars().next().is_some_and(|c| c.is_uppercase()) => {
            (rest, Some(*last))
        }
        _ => (&parts[..], None),
    };
    let file = if modules.is_empty() {
        None
    } else {
        Some(format!("tests/{}.py", modules.join("/")))
    };
    let method = match class {
        Some(class) => format!("{class}.{method}"),
        None => method.to_string(),
    };
    (file, method)
}

fn parse_django(log: &str) -> Vec<TestOutcome> {
    let mut outcomes = Outcomes::default();
    let mut pending: Option<(String, String, String)> = None;
    let mut failures: HashMap<String, String> = HashMap::new();
    let mut block: Option<(String, Vec<String>)> = None;

    for raw in log.lines() {
        let line = strip_ansi(raw);
        let trimmed = line.trim_end();

        // Failure detail blocks: `FAIL: test_x (app.tests.T)` up to the next rule.
        if let Some(title) = trimmed
            .strip_prefix("FAIL: ")
            .or_else(|| trimmed.strip_prefix("ERROR: "))
        {
            if let Some((name, lines)) = block.take() {
                failures.insert(name, lines.join("\n").trim().to_string());
            }
            block = Some((title.trim().to_string(), Vec::new()));
            continue;
        }
        if block.is_some() && (is_rule(trimmed, '=') || trimmed.starts_with("Ran ")) {
            if let Some((name, lines)) = block.take() {
                failures.insert(name, lines.join("\n").trim().to_string());
            }
            continue;
        }
        if let Some((_, lines)) = block.as_mut() {
            lines.push(line.clone());
            continue;
        }

        if let Some(caps) = django_test_line().captures(trimmed) {
            let method = caps[1].to_string();
            let module = caps[2].to_string();
            let name = format!("{method} ({module})");
            pending = Some((name, module, method));
        }

        // The verdict may follow a docstring on a later line.
        if let Some(status) = trimmed
            .rsplit_once(" ... ")
            .and_then(|(_, verdict)| django_status(verdict))
        {
            if let Some((name, module, method)) = pending.take() {
                let (file_path, method) = django_location(&module, &method);
                outcomes.push(TestOutcome {
                    name,
                    status,
                    file_path,
                    method: Some(method),
                    failure_output: None,
                });
            }
        }
    }
    if let Some((name, lines)) = block.take() {
        failures.insert(name, lines.join("\n").trim().to_string());
    }

    outcomes.attach_failures(&failures, |o| vec![o.name.clone()]);
    outcomes.into_vec()
}

// ============================================================================
// SymPy
// ============================================================================

fn parse_sympy(log: &str) -> Vec<TestOutcome> {
    let mut outcomes = Outcomes::default();
    let mut current_file: Option<String> = None;

    for raw in log.lines() {
        let line = strip_ansi(raw);
        let trimmed = line.trim();

        // `sympy/core/tests/test_basic.py[22]` starts a file.
        if let Some((path, _)) = trimmed.split_once(".py[") {
            if !path.contains(' ') {
                current_file = Some(format!("{path}.py"));
                continue;
            }
        }

        // `____ sympy/core/tests/test_basic.py:test_equality ____`
        if is_rule(trimmed, '_') {
            let title = trimmed.trim_matches(|c| c == '_' || c == ' ');
            if let Some((path, method)) = title.split_once(".py:") {
                let mut outcome = TestOutcome::new(method, TestStatus::Failed);
                outcome.file_path = Some(format!("{path}.py"));
                outcome.method = Some(method.to_string());
                outcomes.push(outcome);
            }
            continue;
        }

        if !trimmed.starts_with("test_") {
            continue;
        }
        let Some((name, verdict)) = trimmed.rsplit_once(' ') else {
            continue;
        };
        let status = match verdict {
            "ok" => TestStatus::Passed,
            "F" => TestStatus::Failed,
            "E" => TestStatus::Error,
            "f" => TestStatus::Xfail,
            "s" => TestStatus::Skipped,
            _ => continue,
        };
        let name = name.trim();
        let mut outcome = TestOutcome::new(name, status);
        outcome.file_path = current_file.clone();
        outcome.method = Some(name.to_string());
        outcomes.push(outcome);
    }
    outcomes.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of<'a>(outcomes: &'a [TestOutcome], name: &str) -> Option<&'a TestOutcome> {
        outcomes.iter().find(|o| o.name == name)
    }

    #[test]
    fn test_pytest_summary_lines() {
        let log = "\
============================= test session starts ==============================
collected 4 items

tests/test_a.py ..F.                                                     [100%]

=================================== FAILURES ===================================
__________________________________ test_three __________________________________

    def test_three():
>       assert 1 == 2
E       assert 1 == 2

tests/test_a.py:9: AssertionError
=========================== short test summary info ============================
PASSED tests/test_a.py::test_one
PASSED tests/test_a.py::TestGroup::test_two
FAILED tests/test_a.py::test_three - assert 1 == 2
SKIPPED [1] tests/test_b.py:4: needs network
========================= 1 failed, 2 passed in 0.05s ==========================
";
        let outcomes = parse_pytest(log);
        assert_eq!(outcomes.len(), 4);

        let two = status_of(&outcomes, "tests/test_a.py::TestGroup::test_two").unwrap();
        assert_eq!(two.status, TestStatus::Passed);
        assert_eq!(two.file_path.as_deref(), Some("tests/test_a.py"));
        assert_eq!(two.method.as_deref(), Some("TestGroup.test_two"));

        let three = status_of(&outcomes, "tests/test_a.py::test_three").unwrap();
        assert_eq!(three.status, TestStatus::Failed);
        assert!(three.failure_output.as_deref().unwrap().contains("assert 1 == 2"));

        let skipped = status_of(&outcomes, "tests/test_b.py:4").unwrap();
        assert_eq!(skipped.status, TestStatus::Skipped);
        assert_eq!(skipped.file_path.as_deref(), Some("tests/test_b.py"));
    }

    #[test]
    fn test_pytest_verbose_lines_with_colour() {
        let log = "\
\u{1b}[32mtests/test_c.py::test_ok PASSED\u{1b}[0m [ 50%]
tests/test_c.py::test_bad ERROR                                          [100%]
";
        let outcomes = parse_pytest(log);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].status, TestStatus::Passed);
        assert_eq!(outcomes[1].status, TestStatus::Error);
    }

    #[test]
    fn test_pytest_ignores_noise() {
        let log = "PASSED\nsomething FAILED without id\nrandom text\n";
        assert!(parse_pytest(log).is_empty());
    }

    #[test]
    fn test_django_lines() {
        let log = "\
test_add (utils_tests.test_text.TextTests) ... ok
test_sub (utils_tests.test_text.TextTests) ... FAIL
test_docs (utils_tests.test_text.TextTests)
Checks the docstring case. ... ERROR
test_skip (utils_tests.test_text.TextTests) ... skipped 'no db'

======================================================================
FAIL: test_sub (utils_tests.test_text.TextTests)
----------------------------------------------------------------------
Traceback (most recent call last):
AssertionError: 1 != 2

----------------------------------------------------------------------
Ran 4 tests in 0.010s
";
        let outcomes = parse_django(log);
        assert_eq!(outcomes.len(), 4);

        let add = status_of(&outcomes, "test_add (utils_tests.test_text.TextTests)").unwrap();
        assert_eq!(add.status, TestStatus::Passed);
        assert_eq!(add.file_path.as_deref(), Some("tests/utils_tests/test_text.py"));
        assert_eq!(add.method.as_deref(), Some("TextTests.test_add"));

        let sub = status_of(&outcomes, "test_sub (utils_tests.test_text.TextTests)").unwrap();
        assert_eq!(sub.status, TestStatus::Failed);
        assert!(sub.failure_output.as_deref().unwrap().contains("1 != 2"));

        let docs = status_of(&outcomes, "test_docs (utils_tests.test_text.TextTests)").unwrap();
        assert_eq!(docs.status, TestStatus::Error);

        let skip = status_of(&outcomes, "test_skip (utils_tests.test_text.TextTests)").unwrap();
        assert_eq!(skip.status, TestStatus::Skipped);
    }

    #[test]
    fn test_sympy_lines() {
        let log = "\
sympy/core/tests/test_basic.py[3]
test_equality ok
test_matches_basic F
test_has E

________________ sympy/core/tests/test_basic.py:test_matches_basic ________________
";
        let outcomes = parse_sympy(log);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].status, TestStatus::Passed);
        assert_eq!(
            outcomes[0].file_path.as_deref(),
            Some("sympy/core/tests/test_basic.py")
        );
        assert_eq!(status_of(&outcomes, "test_matches_basic").unwrap().status, TestStatus::Failed);
        assert_eq!(status_of(&outcomes, "test_has").unwrap().status, TestStatus::Error);
    }

    #[test]
    fn test_parser_for_repo() {
        assert_eq!(LogParser::for_repo("django/django"), LogParser::Django);
        assert_eq!(LogParser::for_repo("sympy/sympy"), LogParser::Sympy);
        assert_eq!(LogParser::for_repo("psf/requests"), LogParser::Pytest);
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\u{1b}[1m\u{1b}[31mFAILED\u{1b}[0m x"), "FAILED x");
    }
}
