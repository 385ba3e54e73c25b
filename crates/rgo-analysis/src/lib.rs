//! 囲碁解析エンジンのクライアント
//!
//! - JSON-lines 形式の解析エンジンを非同期に駆動する [`PrimaryEngineClient`]
//! - GTP 形式の比較エンジンを 1 リクエストずつ駆動する [`SecondaryEngineClient`]
//! - 応答を局面木 ([`GameNode`]) の解析記録へ取り込む [`AnalysisMerger`]
//! - 解析完了などを購読者へ知らせる [`EventNotifier`]
//!
//! 応答は `crossbeam_channel` で [`Delivery`] として届き、
//! [`AnalysisDispatcher`] がマージと通知を 1 本のスレッドで行う。

pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod position;
pub mod protocol;
pub mod query;
pub mod types;

pub use analysis::{AnalysisDispatcher, AnalysisMerger, AnalysisRecord, MergeOutcome, MoveAnalysis};
pub use config::{AnalysisConfig, PrimaryEngineConfig, SecondaryEngineConfig};
pub use engine::{
    Delivery, EngineState, EngineStatus, PrimaryEngineClient, QueryOutcome, SecondaryEngineClient,
};
pub use error::{EngineError, Result};
pub use events::{Event, EventKind, EventNotifier, Handler};
pub use position::{GameNode, GameSetup, PositionSnapshot};
pub use protocol::{EngineResult, ResultKind};
pub use query::{AnalysisOptions, QueryBuilder};
pub use types::{BoardSize, Color, Move, PlayerMove, RegionOfInterest, Rules};
