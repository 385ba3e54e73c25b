//! エンジン結果を局面木の解析記録へ取り込む
//!
//! 取り込みは常に「現在の記録を複製 → 変更 → 丸ごと差し替え」で行う。
//! 呼び出しはディスパッチスレッドからのみ行われる前提で、同じノードへの
//! 取り込みが並行することはない。

use std::cmp::Ordering;

use serde::Serialize;

use super::record::{AnalysisRecord, MoveAnalysis};
use crate::position::GameNode;
use crate::protocol::{EngineResult, ResultKind};

/// 取り込みの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// 記録を更新した。`completed` は更新後の値
    Applied { completed: bool },
    /// 必要な値が無いため何もしなかった
    Skipped,
}

/// 解析結果のマージ規則
pub struct AnalysisMerger;

impl AnalysisMerger {
    /// `result` を `node` の記録へ取り込む
    pub fn apply(node: &GameNode, result: &EngineResult, kind: ResultKind) -> MergeOutcome {
        let mut record = AnalysisRecord::clone(&node.analysis());

        match kind {
            ResultKind::Refine(mv) => {
                let Some(root) = result.root_info.as_ref() else {
                    log::warn!(
                        "refine result without rootInfo ignored query_id={} move={}",
                        result.query_id,
                        mv
                    );
                    return MergeOutcome::Skipped;
                };
                let mut pv = vec![mv.to_gtp()];
                if let Some(best) = result.move_infos.first() {
                    pv.extend(best.pv.iter().cloned());
                }
                let refined = MoveAnalysis::from_root_info(mv.to_gtp(), root, pv);
                record.update_move_keeping_order(refined);
            }
            ResultKind::Additional | ResultKind::RegionRestricted => {
                for info in &result.move_infos {
                    record.update_move_keeping_order(MoveAnalysis::from_move_info(info));
                }
            }
            ResultKind::Normal | ResultKind::Partial => {
                let Some(root) = result.root_info.as_ref() else {
                    log::warn!(
                        "analysis result without rootInfo ignored query_id={} node={}",
                        result.query_id,
                        node.id()
                    );
                    return MergeOutcome::Skipped;
                };
                record.demote_all();
                for info in &result.move_infos {
                    record.update_move(MoveAnalysis::from_move_info(info));
                    if let Some(entry) = record.moves.get_mut(&info.mv) {
                        entry.order = info.order;
                    }
                }
                record.root = Some(root.clone());
                if let Some(ownership) = &result.ownership {
                    record.ownership = Some(ownership.clone());
                }
                if let Some(policy) = &result.policy {
                    record.policy = Some(policy.clone());
                }
                if kind == ResultKind::Normal && !result.is_partial {
                    record.completed = true;
                }

                if let (Some(parent), Some(mv)) = (node.parent(), node.single_move()) {
                    let mut pv = vec![mv.to_gtp()];
                    if let Some(best) = result.move_infos.first() {
                        pv.extend(best.pv.iter().cloned());
                    }
                    let mut parent_record = AnalysisRecord::clone(&parent.analysis());
                    let entry = MoveAnalysis::from_root_info(mv.to_gtp(), root, pv);
                    parent_record.update_move_keeping_order(entry);
                    parent.replace_analysis(parent_record);
                }
            }
        }

        let completed = record.completed;
        node.replace_analysis(record);
        MergeOutcome::Applied { completed }
    }
}

/// 候補手に損失を付けたもの
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateMove {
    #[serde(flatten)]
    pub analysis: MoveAnalysis,
    /// ルート評価からの目数損（手番側から見て正が悪い）
    pub points_lost: Option<f64>,
    pub winrate_lost: Option<f64>,
    /// 最善候補（order 0）からの目数損
    pub relative_points_lost: Option<f64>,
}

/// `node` の着手で失った目数。親子どちらかが未解析なら `None`。
pub fn points_lost(node: &GameNode) -> Option<f64> {
    let mv = node.player_move()?;
    let parent = node.parent()?;
    let parent_score = parent.analysis().score()?;
    let score = node.analysis().score()?;
    Some(mv.player.sign() * (parent_score - score))
}

/// 候補手一覧を `(order, points_lost)` 昇順で返す。ルート評価が無ければ空。
pub fn candidate_moves(node: &GameNode) -> Vec<CandidateMove> {
    let record = node.analysis();
    let Some(root) = record.root.as_ref() else {
        return Vec::new();
    };
    let sign = node.next_player().sign();
    let best_score = record
        .moves
        .values()
        .filter(|m| m.order == 0)
        .find_map(|m| m.score_lead);

    let mut candidates: Vec<CandidateMove> = record
        .moves
        .values()
        .map(|m| CandidateMove {
            points_lost: root.score_lead.zip(m.score_lead).map(|(r, s)| sign * (r - s)),
            winrate_lost: root.winrate.zip(m.winrate).map(|(r, w)| sign * (r - w)),
            relative_points_lost: best_score.zip(m.score_lead).map(|(b, s)| sign * (b - s)),
            analysis: m.clone(),
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.analysis.order.cmp(&b.analysis.order).then_with(|| cmp_lost(a.points_lost, b.points_lost))
    });
    candidates
}

fn cmp_lost(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
