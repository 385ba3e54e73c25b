//! 解析完了・局面変更を疎結合な購読者へ知らせる pub/sub

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

/// イベントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// あるノードの最終結果が取り込まれた
    AnalysisComplete,
    /// あるノードの解析記録が変わった（途中経過を含む）
    PositionChanged,
    /// エンジン側の障害（クラッシュ、エラー応答）
    EngineFailure,
}

/// 通知内容。payload は作成後に変更できない。
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    payload: Arc<BTreeMap<String, Value>>,
}

impl Event {
    pub fn new(kind: EventKind, payload: BTreeMap<String, Value>) -> Self {
        Self {
            kind,
            payload: Arc::new(payload),
        }
    }

    /// `(key, value)` の並びから作る
    pub fn with<I, K>(kind: EventKind, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self::new(kind, fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn payload(&self) -> &BTreeMap<String, Value> {
        &self.payload
    }
}

/// 購読ハンドラ。同一性は `Arc` のポインタで判定する。
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// スレッド安全な通知器
#[derive(Default)]
pub struct EventNotifier {
    subscribers: Mutex<HashMap<EventKind, Vec<Handler>>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 購読する。同じ (kind, handler) の組は 1 つにまとめる。新規なら `true`。
    pub fn subscribe(&self, kind: EventKind, handler: Handler) -> bool {
        let mut subs = self.subscribers.lock();
        let list = subs.entry(kind).or_default();
        if list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        list.push(handler);
        true
    }

    /// 購読を解除する。登録されていたなら `true`。
    pub fn unsubscribe(&self, kind: EventKind, handler: &Handler) -> bool {
        let mut subs = self.subscribers.lock();
        let Some(list) = subs.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| !Arc::ptr_eq(h, handler));
        before != list.len()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.lock().get(&kind).map_or(0, Vec::len)
    }

    /// 通知する。
    ///
    /// 呼び出し時点の購読者一覧を複製してからロックを外して呼ぶので、
    /// ハンドラ内での購読・解除は次回以降の通知にだけ効く。
    /// ハンドラの panic はログに残して残りのハンドラを続行する。
    pub fn notify(&self, event: &Event) -> usize {
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();
        let mut delivered = 0;
        for handler in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    log::error!("event handler panicked kind={:?} error={msg}", event.kind);
                }
            }
        }
        delivered
    }
}
