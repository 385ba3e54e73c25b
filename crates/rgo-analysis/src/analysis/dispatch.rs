//! 応答の取り込みと通知を 1 本のスレッドに集約する

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, select, unbounded};
use serde_json::Value;

use super::merger::{AnalysisMerger, MergeOutcome};
use crate::engine::{Delivery, QueryOutcome};
use crate::error::Result;
use crate::events::{Event, EventKind, EventNotifier};

/// エンジンからの [`Delivery`] を受け取り、ノードへマージしてイベントを出すスレッド。
///
/// マージはこのスレッドだけが行うので、同じノードへの取り込みが並行することはない。
pub struct AnalysisDispatcher {
    tx: Sender<Delivery>,
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl AnalysisDispatcher {
    pub fn spawn(notifier: Arc<EventNotifier>) -> Result<Self> {
        let (tx, rx) = unbounded::<Delivery>();
        let (stop, stop_rx) = unbounded::<()>();
        let handle = thread::Builder::new()
            .name("analysis-dispatch".to_string())
            .spawn(move || run(&rx, &stop_rx, &notifier))?;
        Ok(Self {
            tx,
            stop,
            handle: Some(handle),
        })
    }

    /// `PrimaryEngineClient::submit` に渡す応答先
    pub fn sender(&self) -> Sender<Delivery> {
        self.tx.clone()
    }

    /// 受信済みの応答を処理し終えてからスレッドを止める
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.stop.send(());
        if handle.join().is_err() {
            log::error!("analysis dispatch thread panicked");
        }
    }
}

impl Drop for AnalysisDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(rx: &Receiver<Delivery>, stop: &Receiver<()>, notifier: &EventNotifier) {
    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(delivery) => dispatch(delivery, notifier),
                Err(_) => break,
            },
            recv(stop) -> _ => {
                for delivery in rx.try_iter() {
                    dispatch(delivery, notifier);
                }
                break;
            }
        }
    }
    log::debug!("analysis dispatch thread exiting");
}

/// 1 件の応答をマージして通知する。ディスパッチスレッドを使わない呼び出し側向け。
pub fn dispatch(delivery: Delivery, notifier: &EventNotifier) {
    let is_final = delivery.is_final();
    let Delivery {
        query_id,
        kind,
        node,
        outcome,
    } = delivery;
    match outcome {
        QueryOutcome::Result(result) => {
            let Some(node) = node else {
                log::debug!("result without target node ignored query_id={query_id}");
                return;
            };
            let kind = kind.for_report(result.is_partial);
            let outcome = AnalysisMerger::apply(&node, &result, kind);
            let MergeOutcome::Applied { completed } = outcome else {
                return;
            };
            log::debug!(
                "merged query_id={query_id} node={} kind={} partial={} moves={}",
                node.id(),
                kind.label(),
                result.is_partial,
                result.move_infos.len()
            );
            let fields = || {
                [
                    ("node", Value::from(node.id())),
                    ("query_id", Value::from(query_id.as_str())),
                    ("kind", Value::from(kind.label())),
                ]
            };
            notifier.notify(&Event::with(EventKind::PositionChanged, fields()));
            if is_final {
                let mut event = fields().to_vec();
                event.push(("completed", Value::from(completed)));
                notifier.notify(&Event::with(EventKind::AnalysisComplete, event));
            }
        }
        QueryOutcome::Failed(error) => {
            log::warn!("query failed query_id={query_id} kind={} error={error}", kind.label());
            let mut fields = vec![
                ("query_id", Value::from(query_id.as_str())),
                ("kind", Value::from(kind.label())),
                ("error", Value::from(error.to_string())),
                ("fatal", Value::from(error.is_fatal())),
            ];
            if let Some(node) = node {
                fields.push(("node", Value::from(node.id())));
            }
            notifier.notify(&Event::with(EventKind::EngineFailure, fields));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::position::GameNode;
    use crate::protocol::{EngineResult, MoveInfo, ResultKind, RootInfo};
    use crossbeam_channel::Receiver;
    use std::time::Duration;

    fn capture(notifier: &EventNotifier, kind: EventKind) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        notifier.subscribe(
            kind,
            Arc::new(move |e: &Event| {
                let _ = tx.send(e.clone());
            }),
        );
        rx
    }

    fn result(partial: bool) -> EngineResult {
        EngineResult {
            query_id: "QUERY:1".to_string(),
            root_info: Some(RootInfo {
                score_lead: Some(0.5),
                visits: 10,
                ..Default::default()
            }),
            move_infos: vec![MoveInfo {
                mv: "D4".into(),
                order: 0,
                visits: 10,
                ..Default::default()
            }],
            is_partial: partial,
            ..Default::default()
        }
    }

    #[test]
    fn partial_then_final_notifies_once_complete() {
        let notifier = EventNotifier::new();
        let changed = capture(&notifier, EventKind::PositionChanged);
        let complete = capture(&notifier, EventKind::AnalysisComplete);
        let node = GameNode::root(Default::default());
        for partial in [true, false] {
            dispatch(
                Delivery {
                    query_id: "QUERY:1".to_string(),
                    kind: ResultKind::Normal,
                    node: Some(Arc::clone(&node)),
                    outcome: QueryOutcome::Result(result(partial)),
                },
                &notifier,
            );
        }
        let kinds: Vec<Value> = changed.try_iter().filter_map(|e| e.get("kind").cloned()).collect();
        assert_eq!(kinds, [Value::from("partial"), Value::from("normal")]);
        let done: Vec<Event> = complete.try_iter().collect();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].get("completed"), Some(&Value::from(true)));
        assert_eq!(done[0].get("node"), Some(&Value::from(node.id())));
        assert!(node.analysis().completed);
    }

    #[test]
    fn failures_become_engine_failure_events() {
        let notifier = EventNotifier::new();
        let failures = capture(&notifier, EventKind::EngineFailure);
        dispatch(
            Delivery {
                query_id: "QUERY:9".to_string(),
                kind: ResultKind::Normal,
                node: None,
                outcome: QueryOutcome::Failed(EngineError::EngineCrashed("exit 1".to_string())),
            },
            &notifier,
        );
        let event = failures.try_recv().unwrap();
        assert_eq!(event.get("query_id"), Some(&Value::from("QUERY:9")));
        assert_eq!(event.get("fatal"), Some(&Value::from(true)));
    }

    #[test]
    fn thread_drains_queue_before_shutdown() {
        let notifier = Arc::new(EventNotifier::new());
        let complete = capture(&notifier, EventKind::AnalysisComplete);
        let mut dispatcher = AnalysisDispatcher::spawn(Arc::clone(&notifier)).unwrap();
        let node = GameNode::root(Default::default());
        dispatcher
            .sender()
            .send(Delivery {
                query_id: "QUERY:1".to_string(),
                kind: ResultKind::Normal,
                node: Some(Arc::clone(&node)),
                outcome: QueryOutcome::Result(result(false)),
            })
            .unwrap();
        dispatcher.shutdown();
        assert!(complete.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(node.analysis().exists());
        dispatcher.shutdown();
    }
}
