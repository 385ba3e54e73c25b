//! エンジンクライアントのエラー型
//!
//! 行単位の解析エラーは読み取りループ内で回復する。プロセス単位の障害は
//! ここで呼び出し側へ返り、クライアントの unhealthy フラグを立てる。

use std::path::PathBuf;

/// エンジンクライアントのエラー
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// 実行ファイルが無い・起動できない・パイプを取得できない
    #[error("failed to start engine {path}: {reason}")]
    ProcessStart { path: PathBuf, reason: String },

    /// エンジン出力の 1 行を解釈できない
    #[error("protocol parse error: {0}")]
    ProtocolParse(String),

    /// 未完了のクエリを抱えたままエンジンプロセスが終了した
    #[error("engine crashed: {0}")]
    EngineCrashed(String),

    /// 呼び出し側の期限内に応答が無い
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// 明示的に打ち切られたクエリ（失敗ではない）
    #[error("query cancelled")]
    Cancelled,

    /// stdin への書き込み失敗（主に broken pipe）
    #[error("failed to write to engine: {0}")]
    WriteFailure(String),

    /// 未起動、または停止済み
    #[error("engine is not running")]
    NotRunning,

    /// 過去の障害により再起動まで利用不可
    #[error("engine is unhealthy; restart required")]
    Unhealthy,

    /// エンジンが `error` フィールド付きで応答した
    #[error("engine reported an error: {0}")]
    Engine(String),

    /// 設定値が不正
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// 再起動まで以降の要求を拒否すべきエラーか
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::EngineCrashed(_)
                | EngineError::WriteFailure(_)
                | EngineError::Timeout(_)
                | EngineError::Unhealthy
        )
    }
}

/// エンジンクライアント操作の Result 型
pub type Result<T> = std::result::Result<T, EngineError>;
