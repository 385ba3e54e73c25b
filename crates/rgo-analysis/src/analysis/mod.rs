//! 解析記録とそのマージ規則

mod dispatch;
mod merger;
mod record;

pub use dispatch::{AnalysisDispatcher, dispatch};
pub use merger::{AnalysisMerger, CandidateMove, MergeOutcome, candidate_moves, points_lost};
pub use record::{AnalysisRecord, DEMOTED_ORDER, MoveAnalysis};
