pub mod config;
pub mod results;
pub mod runner;

pub use config::{BackendKind, SyntheticOptions, TestConfig};
pub use results::{ResultsSummary, TestResult, TestResults};
pub use runner::TestRunner;
