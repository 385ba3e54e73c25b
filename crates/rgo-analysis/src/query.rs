//! 局面と解析オプションから解析リクエストを組み立てる純関数

use serde_json::{Map, Value};

use crate::config::PrimaryEngineConfig;
use crate::position::PositionSnapshot;
use crate::protocol::{AnalysisRequest, AvoidMoves, ResultKind};
use crate::types::{Color, Move, PlayerMove, RegionOfInterest};

/// 1 回の解析要求に付けるオプション
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// 訪問数。未指定なら設定の `max_visits`（`fast` なら `fast_visits`）
    pub visits: Option<u32>,
    pub fast: bool,
    /// 手の空いた時間に回す低優先度の解析
    pub ponder: bool,
    /// 思考時間の上限（秒）。未指定なら設定の `max_time`。ponder では付けない
    pub time_limit: Option<f64>,
    pub include_ownership: bool,
    pub include_policy: bool,
    pub include_moves_ownership: bool,
    /// 設定の `base_priority` に加える優先度
    pub priority: i32,
    /// 仮想の次の一手（refine）
    pub next_move: Option<Move>,
    /// 既存の候補手を避けて別の候補を探す
    pub find_alternatives: bool,
    pub region_of_interest: Option<RegionOfInterest>,
    /// 途中経過の報告間隔（秒）。未指定なら設定値
    pub report_every: Option<f64>,
    /// `overrideSettings` に足す追加設定
    pub extra_settings: Map<String, Value>,
}

impl AnalysisOptions {
    /// 結果をどう取り込むか
    pub fn result_kind(&self) -> ResultKind {
        if let Some(mv) = self.next_move {
            ResultKind::Refine(mv)
        } else if self.find_alternatives {
            ResultKind::Additional
        } else if self.region_of_interest.is_some_and(|r| r.is_valid()) {
            ResultKind::RegionRestricted
        } else {
            ResultKind::Normal
        }
    }
}

/// 解析リクエストの組み立て役。設定だけを借用し、副作用を持たない。
pub struct QueryBuilder<'a> {
    config: &'a PrimaryEngineConfig,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(config: &'a PrimaryEngineConfig) -> Self {
        Self { config }
    }

    /// `analyzed_moves` は対象ノードで解析済みの候補手（find_alternatives 用）
    pub fn build(
        &self,
        id: String,
        position: &PositionSnapshot,
        analyzed_moves: &[String],
        options: &AnalysisOptions,
    ) -> AnalysisRequest {
        let mut moves: Vec<(Color, String)> = position.moves.iter().map(gtp_pair).collect();
        if let Some(next) = options.next_move {
            moves.push((position.next_player, next.to_gtp()));
        }
        let refine = options.next_move.is_some();

        let visits = options.visits.unwrap_or(if options.fast {
            self.config.fast_visits
        } else {
            self.config.max_visits
        });

        let mut priority = self.config.base_priority.saturating_add(options.priority);
        if options.ponder {
            priority = priority.saturating_add(self.config.ponder_priority_offset);
        }

        let mut override_settings = Map::new();
        let noise = Value::from(self.config.wide_root_noise);
        override_settings.insert("wideRootNoise".to_string(), noise);
        for (key, value) in &self.config.override_settings {
            if let Ok(v) = serde_json::to_value(value) {
                override_settings.insert(key.clone(), v);
            }
        }
        let time_limit = if options.ponder {
            None
        } else {
            options.time_limit.or(self.config.max_time)
        };
        if let Some(max_time) = time_limit {
            override_settings.insert("maxTime".to_string(), Value::from(max_time));
        }
        for (key, value) in &options.extra_settings {
            override_settings.insert(key.clone(), value.clone());
        }

        AnalysisRequest {
            id,
            rules: position.rules.as_str().to_string(),
            priority,
            analyze_turns: vec![moves.len()],
            max_visits: visits,
            komi: position.komi,
            board_x_size: position.board_size.x,
            board_y_size: position.board_size.y,
            include_ownership: options.include_ownership && !refine,
            include_moves_ownership: options.include_moves_ownership && !refine,
            include_policy: options.include_policy && !refine,
            initial_stones: position.initial_stones.iter().map(gtp_pair).collect(),
            initial_player: position.initial_player,
            moves,
            override_settings,
            ponder: options.ponder,
            report_during_search_every: options.report_every.or(self.config.report_every),
            avoid_moves: avoid_list(position, analyzed_moves, options),
        }
    }
}

fn gtp_pair(pm: &PlayerMove) -> (Color, String) {
    (pm.player, pm.mv.to_gtp())
}

/// 除外リスト。
///
/// - find_alternatives: 解析済みの候補手をすべて除外し、新しい候補を強制する
/// - region_of_interest: 矩形外の全座標を両手番について除外する
/// - いずれも無ければ空
///
/// 反転した矩形は「何も除外しない」として扱う。
pub fn avoid_list(
    position: &PositionSnapshot,
    analyzed_moves: &[String],
    options: &AnalysisOptions,
) -> Vec<AvoidMoves> {
    if options.find_alternatives {
        if analyzed_moves.is_empty() {
            return Vec::new();
        }
        return vec![AvoidMoves {
            moves: analyzed_moves.to_vec(),
            player: position.next_player,
            until_depth: 1,
        }];
    }
    let Some(roi) = options.region_of_interest.filter(RegionOfInterest::is_valid) else {
        return Vec::new();
    };
    let size = position.board_size;
    let outside: Vec<String> = (0..size.x)
        .flat_map(|x| (0..size.y).map(move |y| (x, y)))
        .filter(|&(x, y)| !roi.contains(x, y))
        .map(|(x, y)| Move::point(x, y).to_gtp())
        .collect();
    if outside.is_empty() {
        return Vec::new();
    }
    [Color::Black, Color::White]
        .into_iter()
        .map(|player| AvoidMoves {
            moves: outside.clone(),
            player,
            until_depth: 1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoardSize, Rules};
    use std::collections::HashSet;

    fn snapshot(size: u8) -> PositionSnapshot {
        PositionSnapshot {
            board_size: BoardSize::square(size),
            komi: 6.5,
            rules: Rules::default(),
            initial_player: Color::Black,
            initial_stones: vec![],
            moves: vec![PlayerMove::new(Color::Black, Move::point(3, 3))],
            next_player: Color::White,
        }
    }

    #[test]
    fn builds_basic_request() {
        let cfg = PrimaryEngineConfig {
            base_priority: 5,
            max_time: Some(8.0),
            ..Default::default()
        };
        let opts = AnalysisOptions {
            priority: 2,
            include_ownership: true,
            ..Default::default()
        };
        let req = QueryBuilder::new(&cfg).build("Q1".into(), &snapshot(19), &[], &opts);
        assert_eq!(req.priority, 7);
        assert_eq!(req.max_visits, cfg.max_visits);
        assert_eq!(req.analyze_turns, vec![1]);
        assert_eq!(req.moves, vec![(Color::Black, "D4".to_string())]);
        assert!(req.include_ownership);
        assert_eq!(req.override_settings["maxTime"], Value::from(8.0));
        assert!(req.avoid_moves.is_empty());
        assert_eq!(opts.result_kind(), ResultKind::Normal);
    }

    #[test]
    fn fast_and_ponder_adjust_visits_priority_and_time() {
        let cfg = PrimaryEngineConfig {
            max_time: Some(8.0),
            ..Default::default()
        };
        let opts = AnalysisOptions {
            fast: true,
            ponder: true,
            ..Default::default()
        };
        let req = QueryBuilder::new(&cfg).build("Q1".into(), &snapshot(19), &[], &opts);
        assert_eq!(req.max_visits, cfg.fast_visits);
        assert_eq!(req.priority, cfg.ponder_priority_offset);
        assert!(req.ponder);
        assert!(!req.override_settings.contains_key("maxTime"));
    }

    #[test]
    fn refine_appends_move_and_disables_ownership_and_policy() {
        let cfg = PrimaryEngineConfig::default();
        let opts = AnalysisOptions {
            next_move: Some(Move::point(15, 15)),
            include_ownership: true,
            include_policy: true,
            include_moves_ownership: true,
            ..Default::default()
        };
        let req = QueryBuilder::new(&cfg).build("Q1".into(), &snapshot(19), &[], &opts);
        assert_eq!(req.moves.last(), Some(&(Color::White, "Q16".to_string())));
        assert_eq!(req.analyze_turns, vec![2]);
        assert!(!req.include_ownership);
        assert!(!req.include_moves_ownership);
        assert!(!req.include_policy);
        assert_eq!(opts.result_kind(), ResultKind::Refine(Move::point(15, 15)));
    }

    #[test]
    fn alternatives_avoid_exactly_analyzed_moves() {
        let cfg = PrimaryEngineConfig::default();
        let opts = AnalysisOptions {
            find_alternatives: true,
            region_of_interest: Some(RegionOfInterest::new(0, 2, 0, 2)),
            ..Default::default()
        };
        let analyzed = vec!["Q16".to_string(), "D16".to_string()];
        let req = QueryBuilder::new(&cfg).build("Q1".into(), &snapshot(19), &analyzed, &opts);
        assert_eq!(req.avoid_moves.len(), 1);
        assert_eq!(req.avoid_moves[0].moves, analyzed);
        assert_eq!(req.avoid_moves[0].player, Color::White);
        assert_eq!(req.avoid_moves[0].until_depth, 1);
        assert_eq!(opts.result_kind(), ResultKind::Additional);
    }

    #[test]
    fn region_of_interest_avoids_everything_outside_for_both_colors() {
        let opts = AnalysisOptions {
            region_of_interest: Some(RegionOfInterest::new(3, 5, 3, 5)),
            ..Default::default()
        };
        let avoid = avoid_list(&snapshot(9), &[], &opts);
        assert_eq!(avoid.len(), 2);
        assert_eq!(avoid[0].player, Color::Black);
        assert_eq!(avoid[1].player, Color::White);
        for entry in &avoid {
            let set: HashSet<&str> = entry.moves.iter().map(String::as_str).collect();
            assert_eq!(set.len(), 81 - 9);
            for x in 0..9u8 {
                for y in 0..9u8 {
                    let coord = Move::point(x, y).to_gtp();
                    let inside = (3..=5).contains(&x) && (3..=5).contains(&y);
                    assert_eq!(set.contains(coord.as_str()), !inside, "{coord}");
                }
            }
        }
        assert_eq!(opts.result_kind(), ResultKind::RegionRestricted);
    }

    #[test]
    fn inverted_region_excludes_nothing() {
        let opts = AnalysisOptions {
            region_of_interest: Some(RegionOfInterest::new(5, 3, 3, 5)),
            ..Default::default()
        };
        assert!(avoid_list(&snapshot(9), &[], &opts).is_empty());
        assert_eq!(opts.result_kind(), ResultKind::Normal);
    }

    #[test]
    fn whole_board_region_excludes_nothing() {
        let opts = AnalysisOptions {
            region_of_interest: Some(RegionOfInterest::new(0, 8, 0, 8)),
            ..Default::default()
        };
        assert!(avoid_list(&snapshot(9), &[], &opts).is_empty());
    }

    #[test]
    fn request_serializes_wire_field_names() {
        let cfg = PrimaryEngineConfig::default();
        let opts = AnalysisOptions {
            report_every: Some(0.5),
            ..Default::default()
        };
        let req = QueryBuilder::new(&cfg).build("Q9".into(), &snapshot(9), &[], &opts);
        let v: Value = serde_json::to_value(&req).unwrap();
        assert_eq!(v["boardXSize"], 9);
        assert_eq!(v["boardYSize"], 9);
        assert_eq!(v["analyzeTurns"], serde_json::json!([1]));
        assert_eq!(v["moves"], serde_json::json!([["B", "D4"]]));
        assert_eq!(v["initialPlayer"], "B");
        assert_eq!(v["reportDuringSearchEvery"], 0.5);
        assert!(v["overrideSettings"]["wideRootNoise"].is_number());
        assert!(v.get("avoidMoves").is_none());
    }
}
