//! 手番・着手・盤面サイズなど、両エンジンとの通信で共有する基本型

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// GTP 座標の列文字。`I` を飛ばした 25 文字。
pub const GTP_COLUMNS: &[u8; 25] = b"ABCDEFGHJKLMNOPQRSTUVWXYZ";

/// 扱える最大の盤面サイズ
pub const MAX_BOARD_SIZE: u8 = 25;

/// 手番（黒/白）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Color {
    #[serde(rename = "B")]
    Black,
    #[serde(rename = "W")]
    White,
}

impl Color {
    /// 相手番を返す
    #[inline]
    pub const fn opponent(self) -> Color {
        match self {
            Color::Black => Color::White,
            Color::White => Color::Black,
        }
    }

    /// 黒視点の評価値を手番視点に直すための符号
    #[inline]
    pub const fn sign(self) -> f64 {
        match self {
            Color::Black => 1.0,
            Color::White => -1.0,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Color::Black => "B",
            Color::White => "W",
        }
    }
}

impl std::ops::Not for Color {
    type Output = Color;

    #[inline]
    fn not(self) -> Color {
        self.opponent()
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "B" | "b" | "black" | "Black" => Ok(Color::Black),
            "W" | "w" | "white" | "White" => Ok(Color::White),
            other => Err(format!("unknown color: {other}")),
        }
    }
}

/// 盤面サイズ（横, 縦）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoardSize {
    pub x: u8,
    pub y: u8,
}

impl BoardSize {
    pub const fn square(n: u8) -> Self {
        Self { x: n, y: n }
    }

    pub const fn is_square(self) -> bool {
        self.x == self.y
    }

    /// 盤上の全座標数
    pub const fn points(self) -> usize {
        self.x as usize * self.y as usize
    }

    pub const fn contains(self, x: u8, y: u8) -> bool {
        x < self.x && y < self.y
    }
}

impl Default for BoardSize {
    fn default() -> Self {
        Self::square(19)
    }
}

/// 着手。`x`, `y` は 0 始まりで、`y = 0` が盤の下端（GTP の 1 行目）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Move {
    Pass,
    Point { x: u8, y: u8 },
}

impl Move {
    pub const fn point(x: u8, y: u8) -> Self {
        Move::Point { x, y }
    }

    pub const fn is_pass(self) -> bool {
        matches!(self, Move::Pass)
    }

    /// GTP 形式の座標文字列（例: `D4`, `pass`）
    pub fn to_gtp(self) -> String {
        match self {
            Move::Pass => "pass".to_string(),
            Move::Point { x, y } => {
                let col = GTP_COLUMNS.get(x as usize).copied().unwrap_or(b'?') as char;
                format!("{col}{}", y as u32 + 1)
            }
        }
    }

    /// GTP 形式の座標を解析する。大文字小文字は区別しない。
    pub fn from_gtp(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("pass") {
            return Some(Move::Pass);
        }
        let mut chars = s.chars();
        let col = chars.next()?.to_ascii_uppercase();
        let x = GTP_COLUMNS.iter().position(|&c| c as char == col)?;
        let row: u32 = chars.as_str().parse().ok()?;
        if row == 0 || row > MAX_BOARD_SIZE as u32 {
            return None;
        }
        Some(Move::Point {
            x: x as u8,
            y: (row - 1) as u8,
        })
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_gtp())
    }
}

impl FromStr for Move {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Move::from_gtp(s).ok_or_else(|| format!("invalid GTP coordinate: {s}"))
    }
}

/// 手番付きの着手
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlayerMove {
    pub player: Color,
    pub mv: Move,
}

impl PlayerMove {
    pub const fn new(player: Color, mv: Move) -> Self {
        Self { player, mv }
    }

    /// `B:D4` / `W:pass` 形式を解析する
    pub fn parse(s: &str) -> Option<Self> {
        let (color, coord) = s.split_once(':')?;
        Some(Self {
            player: color.parse().ok()?,
            mv: Move::from_gtp(coord)?,
        })
    }
}

/// ルール名。エンジンにはそのまま渡す。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rules(pub String);

impl Default for Rules {
    fn default() -> Self {
        Rules("japanese".to_string())
    }
}

impl Rules {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 探索を制限する矩形領域。境界は両端を含む 0 始まりの座標。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x_min: u8,
    pub x_max: u8,
    pub y_min: u8,
    pub y_max: u8,
}

impl RegionOfInterest {
    pub const fn new(x_min: u8, x_max: u8, y_min: u8, y_max: u8) -> Self {
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    /// 反転した境界は領域として扱わない
    pub const fn is_valid(&self) -> bool {
        self.x_min <= self.x_max && self.y_min <= self.y_max
    }

    pub const fn contains(&self, x: u8, y: u8) -> bool {
        self.x_min <= x && x <= self.x_max && self.y_min <= y && y <= self.y_max
    }

    /// `x1,x2,y1,y2` 形式を解析する
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<u8> = s
            .split(',')
            .map(|p| p.trim().parse().ok())
            .collect::<Option<_>>()?;
        match parts.as_slice() {
            [x_min, x_max, y_min, y_max] => Some(Self::new(*x_min, *x_max, *y_min, *y_max)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gtp_coordinates_skip_i() {
        assert_eq!(Move::point(0, 0).to_gtp(), "A1");
        assert_eq!(Move::point(7, 0).to_gtp(), "H1");
        assert_eq!(Move::point(8, 0).to_gtp(), "J1");
        assert_eq!(Move::point(3, 3).to_gtp(), "D4");
        assert_eq!(Move::point(15, 15).to_gtp(), "Q16");
        assert_eq!(Move::point(24, 24).to_gtp(), "Z25");
        assert_eq!(Move::Pass.to_gtp(), "pass");
    }

    #[test]
    fn gtp_parse_accepts_lowercase_and_pass() {
        assert_eq!(Move::from_gtp("d4"), Some(Move::point(3, 3)));
        assert_eq!(Move::from_gtp("J10"), Some(Move::point(8, 9)));
        assert_eq!(Move::from_gtp("PASS"), Some(Move::Pass));
        assert_eq!(Move::from_gtp("I5"), None);
        assert_eq!(Move::from_gtp("A0"), None);
        assert_eq!(Move::from_gtp(""), None);
    }

    #[test]
    fn player_move_parse() {
        let pm = PlayerMove::parse("W:Q16").unwrap();
        assert_eq!(pm.player, Color::White);
        assert_eq!(pm.mv, Move::point(15, 15));
        assert!(PlayerMove::parse("X:Q16").is_none());
        assert!(PlayerMove::parse("Q16").is_none());
    }

    #[test]
    fn color_sign_and_opponent() {
        assert_eq!(Color::Black.sign(), 1.0);
        assert_eq!(Color::White.sign(), -1.0);
        assert_eq!(!Color::Black, Color::White);
    }

    #[test]
    fn region_parse_and_validity() {
        let roi = RegionOfInterest::parse("3,5,3,5").unwrap();
        assert!(roi.is_valid());
        assert!(roi.contains(4, 4));
        assert!(!roi.contains(2, 4));
        assert!(!RegionOfInterest::new(5, 3, 0, 8).is_valid());
        assert!(RegionOfInterest::parse("1,2,3").is_none());
    }
}
