pub mod analysis_actor;

pub use analysis_actor::{AnalysisHandle, AnalysisId};
