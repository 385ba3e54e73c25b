//! エンジンプロセスの管理
//!
//! - [`PrimaryEngineClient`]: JSON-lines 解析エンジン。書き込み 1 本・読み取り 2 本のスレッドと、
//!   `id` → 応答先の表で非同期に応答を振り分ける。
//! - [`SecondaryEngineClient`]: GTP 比較エンジン。常に 1 リクエストだけを有効とし、
//!   トークンで古い解析の結果を捨てる。

pub mod gtp;
pub mod primary;
pub mod secondary;
mod token;
mod writer;

use std::sync::Arc;

use crate::error::EngineError;
use crate::position::GameNode;
use crate::protocol::{EngineResult, ResultKind};

pub use gtp::SecondaryCandidate;
pub use primary::PrimaryEngineClient;
pub use secondary::{SecondaryDelivery, SecondaryEngineClient, SecondaryOutcome};
pub use token::{CancelToken, TokenSlot};

/// クエリ 1 件の応答
#[derive(Debug)]
pub enum QueryOutcome {
    /// 途中経過または最終結果
    Result(EngineResult),
    /// エラー応答やクラッシュ。クエリはこれで終わる
    Failed(EngineError),
}

/// 応答先チャネルへ届くメッセージ
#[derive(Debug)]
pub struct Delivery {
    pub query_id: String,
    pub kind: ResultKind,
    /// 取り込み先のノード（ハンドシェイク等では無い）
    pub node: Option<Arc<GameNode>>,
    pub outcome: QueryOutcome,
}

impl Delivery {
    /// このクエリへの最後のメッセージか
    pub fn is_final(&self) -> bool {
        match &self.outcome {
            QueryOutcome::Result(result) => !result.is_partial,
            QueryOutcome::Failed(_) => true,
        }
    }
}

/// プロセスのライフサイクル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    NotStarted,
    Starting,
    /// 起動済みで未完了のクエリが無い
    Idle,
    /// 起動済みで未完了のクエリがある
    Busy,
    ShuttingDown,
    Stopped,
}

impl EngineState {
    pub fn is_ready(self) -> bool {
        matches!(self, EngineState::Idle | EngineState::Busy)
    }
}

/// ポーリング用の状態まとめ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub unhealthy: bool,
    pub queries_remaining: usize,
}
