//! Pipeline stages
//!
//! Each stage takes an immutable input and returns an immutable result;
//! none of them keeps state between requests or retries on its own.

pub mod classifier;
pub mod generator;
pub mod loader;
pub mod planner;
pub mod validator;
pub mod visualizer;

pub use classifier::Classifier;
pub use generator::Generator;
pub use loader::{DataLoader, LoadFailure, LoadReport, LoadedTable, Loader};
pub use planner::Planner;
pub use validator::Validator;
pub use visualizer::{
    requested_chart, ArtifactRef, ChartKind, ChartRenderer, ChartRequest, ChartSpec, JsonChartRenderer, Visualizer,
};
