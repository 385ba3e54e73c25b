//! 書き込みスレッドが取り出す優先度付きキュー

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::{Condvar, Mutex};

use crate::protocol::EngineRequest;

/// 打ち切り要求など、解析より先に書き出すもの
pub(crate) const CONTROL_PRIORITY: i32 = i32::MAX;

struct Queued {
    priority: i32,
    seq: u64,
    request: EngineRequest,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // 優先度が高いものを先に、同じ優先度なら投入順
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Queued>,
    seq: u64,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct WriteQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl WriteQueue {
    /// 積む。閉じていれば `false`。呼び出し側をブロックしない。
    pub(crate) fn push(&self, priority: i32, request: EngineRequest) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.seq += 1;
        let seq = state.seq;
        state.heap.push(Queued {
            priority,
            seq,
            request,
        });
        drop(state);
        self.ready.notify_one();
        true
    }

    /// 次の要求を待って取り出す。閉じられたら `None`。
    pub(crate) fn pop(&self) -> Option<EngineRequest> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.heap.pop() {
                return Some(item.request);
            }
            self.ready.wait(&mut state);
        }
    }

    /// 閉じて待機中の書き込みスレッドを起こす。残りは捨てる。
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.heap.clear();
        drop(state);
        self.ready.notify_all();
    }

    /// 再起動用に空の状態へ戻す
    pub(crate) fn reopen(&self) {
        let mut state = self.state.lock();
        state.closed = false;
        state.heap.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().heap.len()
    }
}
