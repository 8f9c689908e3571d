pub mod accumulator;
pub mod allocation;
pub mod config;
pub mod error;
pub mod estimators;
pub mod evaluator;
pub mod mlmc;
pub mod nlp;
pub mod rollup;
pub mod scalarization;
pub mod sde;
pub mod utility;

pub use config::MlmcConfig;
pub use error::{MlmcError, Result};
pub use evaluator::{EvaluationMode, Evaluator, LevelResponse, SamplePoint};
pub use mlmc::MlmcController;
pub use rollup::MlmcResults;
