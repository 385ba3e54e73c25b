//! 比較エンジン用の単一有効トークン

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// 現在有効なトークンを 1 つだけ保持する。
///
/// 新しいトークンを発行すると古いものは無効になる。結果の送出は
/// [`CancelToken::emit_if_current`] でこのロックを取ったまま行うので、
/// [`TokenSlot::clear`] が戻った後に無効なトークンの結果が届くことはない。
#[derive(Debug, Default)]
pub struct TokenSlot {
    current: Mutex<Option<u64>>,
    changed: Condvar,
    next: AtomicU64,
}

impl TokenSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 新しいトークンを発行し、以前のものを無効にする
    pub fn issue(self: &Arc<Self>) -> CancelToken {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        *self.current.lock() = Some(id);
        self.changed.notify_all();
        CancelToken {
            id,
            slot: Arc::clone(self),
        }
    }

    /// 有効なトークンを無くす。無効化したものがあれば `true`。
    pub fn clear(&self) -> bool {
        let had = self.current.lock().take().is_some();
        self.changed.notify_all();
        had
    }

    pub fn current(&self) -> Option<u64> {
        *self.current.lock()
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    id: u64,
    slot: Arc<TokenSlot>,
}

impl CancelToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_current(&self) -> bool {
        *self.slot.current.lock() == Some(self.id)
    }

    /// 無効化されるか `timeout` が過ぎるまで待つ。無効化されたら `true`。
    pub fn wait_cancelled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.slot.current.lock();
        while *current == Some(self.id) {
            if self.slot.changed.wait_until(&mut current, deadline).timed_out() {
                return *current != Some(self.id);
            }
        }
        true
    }

    /// まだ有効なら、ロックを保持したまま `emit` を実行する
    pub fn emit_if_current(&self, emit: impl FnOnce()) -> bool {
        let current = self.slot.current.lock();
        if *current != Some(self.id) {
            return false;
        }
        emit();
        true
    }
}
