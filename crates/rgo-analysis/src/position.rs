//! 解析対象の局面木
//!
//! GUI 側の棋譜木の最小限の写しで、各ノードが自分の `AnalysisRecord` を持つ。
//! 記録は `Arc` ごと差し替えるので、読み手は短いロックでスナップショットを取り、
//! 途中まで書き換えられた状態を見ることはない。
//!
//! 親は強参照、子は弱参照で持つ。どのノードを保持していてもルートまでの経路は生き続け、
//! 誰も保持していない枝は解放される。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::analysis::AnalysisRecord;
use crate::types::{BoardSize, Color, Move, PlayerMove, Rules};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// 木全体で共通の対局条件
#[derive(Debug, Clone, PartialEq)]
pub struct GameSetup {
    pub board_size: BoardSize,
    pub komi: f64,
    pub rules: Rules,
    /// ルートで手番を持つ側（置碁なら白）
    pub initial_player: Color,
}

impl Default for GameSetup {
    fn default() -> Self {
        Self {
            board_size: BoardSize::default(),
            komi: 6.5,
            rules: Rules::default(),
            initial_player: Color::Black,
        }
    }
}

/// エンジンへ渡す局面の記述。ルートから対象ノードまでを平坦化したもの。
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub board_size: BoardSize,
    pub komi: f64,
    pub rules: Rules,
    pub initial_player: Color,
    /// ルートの置き石
    pub initial_stones: Vec<PlayerMove>,
    /// ルート以降の着手（途中の置き石も順に含む）
    pub moves: Vec<PlayerMove>,
    /// 対象ノードで手番を持つ側
    pub next_player: Color,
}

/// 局面木の 1 ノード
#[derive(Debug)]
pub struct GameNode {
    id: u64,
    setup: Arc<GameSetup>,
    parent: Option<Arc<GameNode>>,
    mv: Option<PlayerMove>,
    placements: Vec<PlayerMove>,
    children: RwLock<Vec<Weak<GameNode>>>,
    analysis: RwLock<Arc<AnalysisRecord>>,
}

impl GameNode {
    /// ルートノードを作る
    pub fn root(setup: GameSetup) -> Arc<Self> {
        Self::root_with_stones(setup, Vec::new())
    }

    /// 置き石付きのルートノードを作る
    pub fn root_with_stones(setup: GameSetup, placements: Vec<PlayerMove>) -> Arc<Self> {
        Arc::new(Self::new(Arc::new(setup), None, None, placements))
    }

    fn new(
        setup: Arc<GameSetup>,
        parent: Option<Arc<GameNode>>,
        mv: Option<PlayerMove>,
        placements: Vec<PlayerMove>,
    ) -> Self {
        Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            setup,
            parent,
            mv,
            placements,
            children: RwLock::new(Vec::new()),
            analysis: RwLock::new(Arc::new(AnalysisRecord::default())),
        }
    }

    /// 着手して子ノードを返す。同じ着手の子が既にあればそれを返す。
    pub fn play(self: &Arc<Self>, mv: PlayerMove) -> Arc<GameNode> {
        let mut children = self.children.write();
        children.retain(|c| c.strong_count() > 0);
        if let Some(existing) = children
            .iter()
            .filter_map(Weak::upgrade)
            .find(|c| c.mv == Some(mv))
        {
            return existing;
        }
        let setup = Arc::clone(&self.setup);
        let child = Arc::new(Self::new(setup, Some(Arc::clone(self)), Some(mv), Vec::new()));
        children.push(Arc::downgrade(&child));
        child
    }

    /// 途中局面での置き石ノードを追加する
    pub fn add_placements(self: &Arc<Self>, placements: Vec<PlayerMove>) -> Arc<GameNode> {
        let setup = Arc::clone(&self.setup);
        let child = Arc::new(Self::new(setup, Some(Arc::clone(self)), None, placements));
        self.children.write().push(Arc::downgrade(&child));
        child
    }

    /// 手番交互に着手列を打ち進める
    pub fn play_sequence(self: &Arc<Self>, moves: &[PlayerMove]) -> Arc<GameNode> {
        moves.iter().fold(Arc::clone(self), |node, mv| node.play(*mv))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn setup(&self) -> &GameSetup {
        &self.setup
    }

    pub fn parent(&self) -> Option<Arc<GameNode>> {
        self.parent.clone()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// まだ誰かが保持している子ノード
    pub fn children(&self) -> Vec<Arc<GameNode>> {
        self.children.read().iter().filter_map(Weak::upgrade).collect()
    }

    /// このノードの着手
    pub fn player_move(&self) -> Option<PlayerMove> {
        self.mv
    }

    pub fn placements(&self) -> &[PlayerMove] {
        &self.placements
    }

    /// このノードで着手した側。着手の無いノードでは直前に打った側とみなす。
    pub fn player(&self) -> Color {
        match self.mv {
            Some(m) => m.player,
            None => self.next_player().opponent(),
        }
    }

    /// このノードで手番を持つ側
    pub fn next_player(&self) -> Color {
        match (self.mv, &self.parent) {
            (Some(m), _) => m.player.opponent(),
            (None, Some(parent)) => parent.next_player(),
            (None, None) => self.setup.initial_player,
        }
    }

    /// ルートからこのノードまでの経路
    pub fn nodes_from_root(self: &Arc<Self>) -> Vec<Arc<GameNode>> {
        let mut path = vec![Arc::clone(self)];
        let mut cursor = self.parent();
        while let Some(node) = cursor {
            cursor = node.parent();
            path.push(node);
        }
        path.reverse();
        path
    }

    /// 着手の深さ（ルートは 0）
    pub fn depth(self: &Arc<Self>) -> usize {
        self.nodes_from_root().len() - 1
    }

    /// エンジンへ渡す局面記述を作る
    pub fn snapshot(self: &Arc<Self>) -> PositionSnapshot {
        let path = self.nodes_from_root();
        let mut initial_stones = Vec::new();
        let mut moves = Vec::new();
        for node in &path {
            if node.is_root() {
                initial_stones.extend(node.placements.iter().copied());
            } else {
                moves.extend(node.placements.iter().copied());
            }
            if let Some(mv) = node.mv {
                moves.push(mv);
            }
        }
        PositionSnapshot {
            board_size: self.setup.board_size,
            komi: self.setup.komi,
            rules: self.setup.rules.clone(),
            initial_player: self.setup.initial_player,
            initial_stones,
            moves,
            next_player: self.next_player(),
        }
    }

    /// 解析記録のスナップショット。
    ///
    /// 読み取りロックは `Arc` を複製する間だけ持つ。返った記録はその後の差し替えで変わらない。
    pub fn analysis(&self) -> Arc<AnalysisRecord> {
        Arc::clone(&self.analysis.read())
    }

    /// 解析記録を丸ごと差し替える
    pub(crate) fn replace_analysis(&self, record: AnalysisRecord) {
        *self.analysis.write() = Arc::new(record);
    }

    /// 解析記録を空に戻す
    pub fn clear_analysis(&self) {
        self.replace_analysis(AnalysisRecord::default());
    }

    /// 部分木すべての解析記録を空に戻す
    pub fn clear_analysis_recursive(&self) {
        self.clear_analysis();
        for child in self.children() {
            child.clear_analysis_recursive();
        }
    }

    /// 解析済みの候補手（GTP 座標）
    pub fn analyzed_moves(&self) -> Vec<String> {
        self.analysis().moves.keys().cloned().collect()
    }

    /// このノードの着手座標（手番なし）
    pub fn single_move(&self) -> Option<Move> {
        self.mv.map(|m| m.mv)
    }
}
