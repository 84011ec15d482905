pub mod columns;
pub mod config;
pub mod design;
pub mod diagnostics;
pub mod error;
pub mod load;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod recode;
pub mod report;
pub mod subset;
pub mod tabulate;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{AnalysisError, AnalysisResult};
