//! Test specifications, log parsing and grading.

mod parsers;
mod report;
mod spec;

pub use parsers::{LogParser, TestOutcome, TestStatus};
pub use report::{
    grade, EvaluationResult, ResolvedStatus, RunStatus, TestGroup, TestResult, TestsStatus,
};
pub use spec::{InstanceCatalog, StaticCatalog, TestSpec, DEFAULT_TEST_CMD};
