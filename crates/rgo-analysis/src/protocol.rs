//! JSON-lines 解析エンジンとのワイヤ形式
//!
//! 1 リクエスト 1 行、1 レスポンス 1 行。レスポンスは `id` で元のクエリへ戻す。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Color, Move};

/// 解析リクエスト
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub id: String,
    pub rules: String,
    pub priority: i32,
    pub analyze_turns: Vec<usize>,
    pub max_visits: u32,
    pub komi: f64,
    #[serde(rename = "boardXSize")]
    pub board_x_size: u8,
    #[serde(rename = "boardYSize")]
    pub board_y_size: u8,
    pub include_ownership: bool,
    pub include_moves_ownership: bool,
    pub include_policy: bool,
    /// `[["B", "D4"], ...]`
    pub initial_stones: Vec<(Color, String)>,
    pub initial_player: Color,
    pub moves: Vec<(Color, String)>,
    pub override_settings: Map<String, Value>,
    pub ponder: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_during_search_every: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub avoid_moves: Vec<AvoidMoves>,
}

/// 探索から除外する着手集合
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvoidMoves {
    pub moves: Vec<String>,
    pub player: Color,
    pub until_depth: u32,
}

/// 解析以外の制御リクエスト（打ち切り、バージョン問い合わせ）
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub id: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminate_id: Option<String>,
}

impl ActionRequest {
    pub fn terminate(id: String, terminate_id: &str) -> Self {
        Self {
            id,
            action: "terminate".to_string(),
            terminate_id: Some(terminate_id.to_string()),
        }
    }

    pub fn query_version(id: String) -> Self {
        Self {
            id,
            action: "query_version".to_string(),
            terminate_id: None,
        }
    }
}

/// stdin に書き出す 1 行分のリクエスト
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum EngineRequest {
    Analyze(Box<AnalysisRequest>),
    Action(ActionRequest),
}

impl EngineRequest {
    pub fn id(&self) -> &str {
        match self {
            EngineRequest::Analyze(req) => &req.id,
            EngineRequest::Action(req) => &req.id,
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// ルート局面の評価（黒視点）
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RootInfo {
    pub score_lead: Option<f64>,
    pub winrate: Option<f64>,
    #[serde(default)]
    pub visits: u32,
    pub utility: Option<f64>,
    pub score_stdev: Option<f64>,
}

/// 候補手 1 つ分の評価（黒視点）
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MoveInfo {
    #[serde(rename = "move")]
    pub mv: String,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub visits: u32,
    pub score_lead: Option<f64>,
    pub winrate: Option<f64>,
    #[serde(default)]
    pub pv: Vec<String>,
    pub prior: Option<f64>,
    pub lcb: Option<f64>,
    pub utility: Option<f64>,
    pub score_stdev: Option<f64>,
    pub ownership: Option<Vec<f64>>,
}

/// stdout の 1 行をそのまま写した構造
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResponse {
    pub id: Option<String>,
    #[serde(default)]
    pub is_during_search: bool,
    pub turn_number: Option<u32>,
    pub root_info: Option<RootInfo>,
    #[serde(default)]
    pub move_infos: Vec<MoveInfo>,
    pub ownership: Option<Vec<f64>>,
    pub policy: Option<Vec<f64>>,
    pub error: Option<String>,
    pub warning: Option<String>,
    pub field: Option<String>,
    pub action: Option<String>,
    pub version: Option<String>,
}

impl RawResponse {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// 解析結果として取り込める形に変換する
    pub fn into_result(self, query_id: String) -> EngineResult {
        EngineResult {
            query_id,
            root_info: self.root_info,
            move_infos: self.move_infos,
            ownership: self.ownership,
            policy: self.policy,
            is_partial: self.is_during_search,
        }
    }
}

/// 1 クエリに対する 1 回分の解析結果。コールバック先で即座に消費される。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineResult {
    pub query_id: String,
    pub root_info: Option<RootInfo>,
    pub move_infos: Vec<MoveInfo>,
    pub ownership: Option<Vec<f64>>,
    /// 末尾の要素はパス
    pub policy: Option<Vec<f64>>,
    pub is_partial: bool,
}

/// 結果の取り込み方。投入時に決まり、マージまで持ち回す。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Normal,
    /// 途中経過として扱う（`completed` を立てない）
    Partial,
    /// 仮想の次の一手を打った局面の評価
    Refine(Move),
    /// 既存の候補を避けて得た追加候補
    Additional,
    /// 領域を限定した探索の結果
    RegionRestricted,
}

impl ResultKind {
    /// 途中経過の通常解析は [`ResultKind::Partial`] として取り込む
    pub fn for_report(self, is_partial: bool) -> Self {
        match self {
            ResultKind::Normal if is_partial => ResultKind::Partial,
            other => other,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ResultKind::Normal => "normal",
            ResultKind::Partial => "partial",
            ResultKind::Refine(_) => "refine",
            ResultKind::Additional => "additional",
            ResultKind::RegionRestricted => "region",
        }
    }
}
