//! GTP 比較エンジンの入出力（コマンド整形と `info` 行の解釈）

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::position::PositionSnapshot;
use crate::types::PlayerMove;

/// `info` 1 区間から取り出した候補手
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecondaryCandidate {
    #[serde(rename = "move")]
    pub mv: String,
    pub visits: u32,
    /// 0.0〜1.0 に正規化した勝率（手番側視点）
    pub winrate: f64,
    pub order: u32,
    pub prior: Option<f64>,
    pub lcb: Option<f64>,
    pub score_lead: Option<f64>,
    pub pv: Vec<String>,
}

/// `=` / `?` で始まる応答行か
pub fn is_response(line: &str) -> bool {
    line.starts_with('=') || line.starts_with('?')
}

pub fn is_error_response(line: &str) -> bool {
    line.starts_with('?')
}

pub fn is_info_line(line: &str) -> bool {
    line.starts_with("info ")
}

/// 勝率の表記揺れ（0〜1、百分率、万分率）を 0〜1 に揃える
pub fn normalize_winrate(raw: f64) -> f64 {
    if raw > 100.0 {
        raw / 10_000.0
    } else if raw > 1.0 {
        raw / 100.0
    } else {
        raw
    }
}

/// `info move D4 visits 100 winrate 5000 order 0 pv D4 D16 info move ...` を解釈する
pub fn parse_info_line(line: &str) -> Result<Vec<SecondaryCandidate>> {
    let mut out = Vec::new();
    let mut tokens = line.split_whitespace().peekable();
    while let Some(tok) = tokens.next() {
        if tok != "info" {
            return Err(parse_error(format!("expected 'info' but found '{tok}'"), line));
        }
        let mut mv = None;
        let mut visits = None;
        let mut winrate = None;
        let mut order = None;
        let mut prior = None;
        let mut lcb = None;
        let mut score_lead = None;
        let mut pv = Vec::new();
        while let Some(&key) = tokens.peek() {
            if key == "info" {
                break;
            }
            tokens.next();
            if key == "pv" {
                while let Some(&mv) = tokens.peek() {
                    if mv == "info" || PV_TERMINATORS.contains(&mv) {
                        break;
                    }
                    pv.push(mv.to_string());
                    tokens.next();
                }
                continue;
            }
            let value = tokens
                .next()
                .ok_or_else(|| parse_error(format!("missing value for '{key}'"), line))?;
            match key {
                "move" => mv = Some(value.to_string()),
                "visits" => visits = Some(number::<u32>(key, value, line)?),
                "winrate" => winrate = Some(normalize_winrate(number::<f64>(key, value, line)?)),
                "order" => order = Some(number::<u32>(key, value, line)?),
                "prior" => prior = Some(normalize_winrate(number::<f64>(key, value, line)?)),
                "lcb" => lcb = Some(normalize_winrate(number::<f64>(key, value, line)?)),
                "scoreLead" | "scoreMean" => score_lead = Some(number::<f64>(key, value, line)?),
                _ => {}
            }
        }
        let mv = mv.ok_or_else(|| parse_error("info without move".to_string(), line))?;
        out.push(SecondaryCandidate {
            mv,
            visits: visits.unwrap_or(0),
            winrate: winrate.ok_or_else(|| parse_error("info without winrate".to_string(), line))?,
            order: order.unwrap_or(out.len() as u32),
            prior,
            lcb,
            score_lead,
            pv,
        });
    }
    Ok(out)
}

/// pv の後ろに続くことがある、pv ではないキー
const PV_TERMINATORS: &[&str] = &["ownership", "pvVisits", "movesOwnership"];

fn number<T: std::str::FromStr>(key: &str, value: &str, line: &str) -> Result<T> {
    value.parse().map_err(|_| parse_error(format!("invalid {key} '{value}'"), line))
}

fn parse_error(message: String, line: &str) -> EngineError {
    let head: String = line.chars().take(80).collect();
    EngineError::ProtocolParse(format!("{message} in '{head}'"))
}

pub fn total_visits(candidates: &[SecondaryCandidate]) -> u32 {
    candidates.iter().map(|c| c.visits).sum()
}

fn play(pm: &PlayerMove) -> String {
    format!("play {} {}", pm.player.as_str(), pm.mv.to_gtp())
}

/// 局面を再現するコマンド列
pub fn position_commands(position: &PositionSnapshot) -> Vec<String> {
    let size = position.board_size;
    let mut cmds = Vec::with_capacity(3 + position.initial_stones.len() + position.moves.len());
    if size.is_square() {
        cmds.push(format!("boardsize {}", size.x));
    } else {
        cmds.push(format!("rectangular_boardsize {} {}", size.x, size.y));
    }
    cmds.push("clear_board".to_string());
    cmds.push(format!("komi {}", position.komi));
    cmds.extend(position.initial_stones.iter().map(play));
    cmds.extend(position.moves.iter().map(play));
    cmds
}
