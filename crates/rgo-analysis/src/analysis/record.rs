use std::collections::BTreeMap;

use serde::Serialize;

use crate::protocol::{MoveInfo, RootInfo};

/// 古くなった候補手を押し下げるための順位。エンジンが返す順位より常に大きい。
pub const DEMOTED_ORDER: u32 = 999;

/// 1 ノード分の解析記録
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisRecord {
    /// GTP 座標 → 候補手の評価
    pub moves: BTreeMap<String, MoveAnalysis>,
    pub root: Option<RootInfo>,
    pub ownership: Option<Vec<f64>>,
    pub policy: Option<Vec<f64>>,
    pub completed: bool,
}

impl AnalysisRecord {
    /// ルート評価が届いているか
    pub fn exists(&self) -> bool {
        self.root.is_some()
    }

    /// ルートの目数差（黒視点）
    pub fn score(&self) -> Option<f64> {
        self.root.as_ref().and_then(|r| r.score_lead)
    }

    pub fn winrate(&self) -> Option<f64> {
        self.root.as_ref().and_then(|r| r.winrate)
    }

    pub fn root_visits(&self) -> u32 {
        self.root.as_ref().map_or(0, |r| r.visits)
    }

    /// 1 件の候補手を取り込む。
    ///
    /// 訪問数が真に多い方が丸ごと勝つ。そうでなければ手元に無い値だけを補う。
    /// 新規の候補は `incoming.order` のまま入る。
    pub fn update_move(&mut self, incoming: MoveAnalysis) {
        match self.moves.get_mut(&incoming.mv) {
            None => {
                self.moves.insert(incoming.mv.clone(), incoming);
            }
            Some(current) if current.visits < incoming.visits => {
                *current = incoming;
            }
            Some(current) => current.fill_missing(incoming),
        }
    }

    /// 順位を持たない評価（refine や子ノード由来）を取り込む。
    ///
    /// 既存の候補なら今の順位を保ち、新規なら `DEMOTED_ORDER` で入れる。
    pub fn update_move_keeping_order(&mut self, mut incoming: MoveAnalysis) {
        incoming.order = self
            .moves
            .get(&incoming.mv)
            .map_or(DEMOTED_ORDER, |current| current.order);
        self.update_move(incoming);
    }

    /// 全候補の順位を `DEMOTED_ORDER` に下げる
    pub fn demote_all(&mut self) {
        for entry in self.moves.values_mut() {
            entry.order = DEMOTED_ORDER;
        }
    }
}

/// 候補手 1 つ分の評価（黒視点）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoveAnalysis {
    #[serde(rename = "move")]
    pub mv: String,
    /// バッチ内の順位。0 が最善
    pub order: u32,
    pub visits: u32,
    pub score_lead: Option<f64>,
    pub winrate: Option<f64>,
    pub pv: Option<Vec<String>>,
    pub prior: Option<f64>,
    pub lcb: Option<f64>,
    pub utility: Option<f64>,
    pub score_stdev: Option<f64>,
    pub ownership: Option<Vec<f64>>,
}

impl MoveAnalysis {
    pub fn from_move_info(info: &MoveInfo) -> Self {
        Self {
            mv: info.mv.clone(),
            order: info.order,
            visits: info.visits,
            score_lead: info.score_lead,
            winrate: info.winrate,
            pv: (!info.pv.is_empty()).then(|| info.pv.clone()),
            prior: info.prior,
            lcb: info.lcb,
            utility: info.utility,
            score_stdev: info.score_stdev,
            ownership: info.ownership.clone(),
        }
    }

    /// ルート評価と読み筋から、ある着手の評価を作る（refine・親ノードへの反映用）
    pub fn from_root_info(mv: String, root: &RootInfo, pv: Vec<String>) -> Self {
        Self {
            mv,
            order: DEMOTED_ORDER,
            visits: root.visits,
            score_lead: root.score_lead,
            winrate: root.winrate,
            pv: Some(pv),
            prior: None,
            lcb: None,
            utility: root.utility,
            score_stdev: root.score_stdev,
            ownership: None,
        }
    }

    fn fill_missing(&mut self, other: MoveAnalysis) {
        fill(&mut self.score_lead, other.score_lead);
        fill(&mut self.winrate, other.winrate);
        fill(&mut self.pv, other.pv);
        fill(&mut self.prior, other.prior);
        fill(&mut self.lcb, other.lcb);
        fill(&mut self.utility, other.utility);
        fill(&mut self.score_stdev, other.score_stdev);
        fill(&mut self.ownership, other.ownership);
    }
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(
        mv: &str,
        order: u32,
        visits: u32,
        score: Option<f64>,
        pv: Option<&[&str]>,
    ) -> MoveAnalysis {
        MoveAnalysis {
            mv: mv.to_string(),
            order,
            visits,
            score_lead: score,
            winrate: None,
            pv: pv.map(|p| p.iter().map(|s| s.to_string()).collect()),
            prior: None,
            lcb: None,
            utility: None,
            score_stdev: None,
            ownership: None,
        }
    }

    #[test]
    fn higher_visits_replace_entirely() {
        let mut rec = AnalysisRecord::default();
        rec.update_move(entry("D4", 1, 10, Some(1.0), Some(&["D4"])));
        rec.update_move(entry("D4", 0, 20, None, Some(&["D4", "Q16"])));
        let e = &rec.moves["D4"];
        assert_eq!(e.visits, 20);
        assert_eq!(e.order, 0);
        assert_eq!(e.score_lead, None);
        assert_eq!(e.pv.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn equal_or_lower_visits_only_fill_absent_fields() {
        let mut rec = AnalysisRecord::default();
        rec.update_move(entry("D4", 0, 20, None, Some(&["D4"])));
        rec.update_move(entry("D4", 3, 20, Some(2.5), Some(&["D4", "C3"])));
        rec.update_move(entry("D4", 4, 5, Some(9.9), None));
        let e = &rec.moves["D4"];
        assert_eq!(e.visits, 20);
        assert_eq!(e.order, 0);
        assert_eq!(e.score_lead, Some(2.5));
        assert_eq!(e.pv.as_deref(), Some(&["D4".to_string()][..]));
    }

    #[test]
    fn unordered_entry_keeps_existing_rank() {
        let mut rec = AnalysisRecord::default();
        rec.update_move(entry("D4", 0, 60, Some(1.0), None));
        rec.update_move_keeping_order(entry("D4", DEMOTED_ORDER, 300, Some(0.4), None));
        rec.update_move_keeping_order(entry("C3", 0, 10, None, None));
        assert_eq!(rec.moves["D4"].order, 0);
        assert_eq!(rec.moves["D4"].visits, 300);
        assert_eq!(rec.moves["C3"].order, DEMOTED_ORDER);
    }

    #[test]
    fn demote_all_sets_sentinel() {
        let mut rec = AnalysisRecord::default();
        rec.update_move(entry("D4", 0, 1, None, None));
        rec.update_move(entry("Q16", 1, 1, None, None));
        rec.demote_all();
        assert!(rec.moves.values().all(|e| e.order == DEMOTED_ORDER));
    }

    #[test]
    fn from_move_info_treats_empty_pv_as_absent() {
        let info = MoveInfo {
            mv: "C3".into(),
            order: 2,
            visits: 7,
            ..Default::default()
        };
        let e = MoveAnalysis::from_move_info(&info);
        assert_eq!(e.order, 2);
        assert!(e.pv.is_none());
    }
}
