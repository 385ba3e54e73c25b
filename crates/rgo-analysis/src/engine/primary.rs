//! JSON-lines 解析エンジンのクライアント
//!
//! スレッド構成:
//! - 書き込みスレッド: 優先度付きキューから取り出して stdin に 1 行ずつ書く（stdin の唯一の所有者）
//! - stdout 読み取りスレッド: 応答を `id` で引き当て、登録された応答先チャネルへ送る
//! - stderr 読み取りスレッド: 診断出力を `log::debug!` へ流す
//!
//! 保留中クエリ表と子プロセスは 1 つの `Mutex` で守り、表が変わるたびに `Condvar` で知らせる。

use std::collections::HashMap;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use super::writer::{CONTROL_PRIORITY, WriteQueue};
use super::{Delivery, EngineState, EngineStatus, QueryOutcome};
use crate::config::PrimaryEngineConfig;
use crate::error::{EngineError, Result};
use crate::position::GameNode;
use crate::protocol::{
    ActionRequest, AnalysisRequest, EngineRequest, EngineResult, RawResponse, ResultKind,
};
use crate::query::{AnalysisOptions, QueryBuilder};

/// ログに出す行の最大長
const LOG_LINE_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    NotStarted,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

struct PendingQuery {
    kind: ResultKind,
    node: Option<Arc<GameNode>>,
    reply: Sender<Delivery>,
    ponder: bool,
}

struct ClientState {
    lifecycle: Lifecycle,
    pending: HashMap<String, PendingQuery>,
    child: Option<Child>,
    /// stdout が閉じた
    exited: bool,
}

struct Shared {
    state: Mutex<ClientState>,
    /// 保留表の削除・プロセス終了で通知
    changed: Condvar,
    queue: WriteQueue,
    unhealthy: AtomicBool,
}

impl Shared {
    fn remove_pending(&self, id: &str) -> Option<PendingQuery> {
        let removed = self.state.lock().pending.remove(id);
        if removed.is_some() {
            self.changed.notify_all();
        }
        removed
    }

    fn fail_query(&self, id: &str, error: EngineError) {
        if let Some(query) = self.remove_pending(id) {
            let _ = query.reply.send(Delivery {
                query_id: id.to_string(),
                kind: query.kind,
                node: query.node,
                outcome: QueryOutcome::Failed(error),
            });
        }
    }
}

/// 解析エンジン 1 プロセス分のクライアント。
///
/// `submit` は呼び出し側をブロックせず、結果は渡した `Sender<Delivery>` へ届く。
/// 1 つのクエリへの配信は高々 1 スレッドから、エンジンの出力順に行われる。
pub struct PrimaryEngineClient {
    config: PrimaryEngineConfig,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PrimaryEngineClient {
    pub fn new(config: PrimaryEngineConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(ClientState {
                    lifecycle: Lifecycle::NotStarted,
                    pending: HashMap::new(),
                    child: None,
                    exited: false,
                }),
                changed: Condvar::new(),
                queue: WriteQueue::default(),
                unhealthy: AtomicBool::new(false),
            }),
            next_id: AtomicU64::new(0),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PrimaryEngineConfig {
        &self.config
    }

    /// プロセスを起動し、バージョン問い合わせの応答を待つ。起動済みなら何もしない。
    pub fn start(&self) -> Result<()> {
        self.config.validate()?;
        {
            let mut state = self.shared.state.lock();
            match state.lifecycle {
                Lifecycle::NotStarted | Lifecycle::Stopped => {}
                Lifecycle::Starting | Lifecycle::Running => return Ok(()),
                Lifecycle::ShuttingDown => return Err(EngineError::NotRunning),
            }
            state.lifecycle = Lifecycle::Starting;
            state.exited = false;
        }

        if let Err(e) = self.spawn_process() {
            log::error!(
                "failed to start primary engine path={} error={e}",
                self.config.command.display()
            );
            self.shutdown(false);
            return Err(e);
        }
        if let Err(e) = self.handshake() {
            log::error!(
                "primary engine handshake failed path={} error={e}",
                self.config.command.display()
            );
            self.shutdown(false);
            return Err(e);
        }

        self.shared.state.lock().lifecycle = Lifecycle::Running;
        log::info!(
            "primary engine ready path={} max_visits={}",
            self.config.command.display(),
            self.config.max_visits
        );
        Ok(())
    }

    fn spawn_process(&self) -> Result<()> {
        let start_error = |reason: String| EngineError::ProcessStart {
            path: self.config.command.clone(),
            reason,
        };
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| start_error(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| start_error("stdin is not piped".to_string()));
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| start_error("stdout is not piped".to_string()));
        let stderr = child.stderr.take();
        log::debug!("spawned primary engine pid={} args={:?}", child.id(), self.config.args);

        self.shared.unhealthy.store(false, Ordering::SeqCst);
        self.shared.queue.reopen();
        self.shared.state.lock().child = Some(child);
        let (stdin, stdout) = (stdin?, stdout?);

        let mut threads = self.threads.lock();
        let shared = Arc::clone(&self.shared);
        threads.push(
            thread::Builder::new()
                .name("primary-writer".to_string())
                .spawn(move || writer_loop(&shared, BufWriter::new(stdin)))?,
        );
        let shared = Arc::clone(&self.shared);
        threads.push(
            thread::Builder::new()
                .name("primary-stdout".to_string())
                .spawn(move || stdout_loop(&shared, stdout))?,
        );
        if let Some(stderr) = stderr {
            threads.push(
                thread::Builder::new()
                    .name("primary-stderr".to_string())
                    .spawn(move || stderr_loop(stderr))?,
            );
        }
        Ok(())
    }

    fn handshake(&self) -> Result<()> {
        let (tx, rx) = unbounded();
        let id = self.next_id("VERSION");
        self.shared.state.lock().pending.insert(
            id.clone(),
            PendingQuery {
                kind: ResultKind::Normal,
                node: None,
                reply: tx,
                ponder: false,
            },
        );
        let request = EngineRequest::Action(ActionRequest::query_version(id.clone()));
        if !self.shared.queue.push(CONTROL_PRIORITY, request) {
            self.shared.remove_pending(&id);
            return Err(EngineError::Unhealthy);
        }

        let timeout = self.config.start_timeout();
        match rx.recv_timeout(timeout).map(|delivery| delivery.outcome) {
            Ok(QueryOutcome::Result(_)) => Ok(()),
            Ok(QueryOutcome::Failed(EngineError::EngineCrashed(reason))) => {
                Err(EngineError::ProcessStart {
                    path: self.config.command.clone(),
                    reason,
                })
            }
            Ok(QueryOutcome::Failed(e)) => Err(e),
            Err(_) => {
                self.shared.remove_pending(&id);
                self.shared.unhealthy.store(true, Ordering::SeqCst);
                Err(EngineError::Timeout(timeout))
            }
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}:{n}")
    }

    /// ノードの解析を投入する。応答は `reply` へ届く。
    ///
    /// 呼び出し側はブロックしない。返る id で `terminate` できる。
    pub fn submit(
        &self,
        node: &Arc<GameNode>,
        options: &AnalysisOptions,
        reply: &Sender<Delivery>,
    ) -> Result<String> {
        let id = self.next_id("QUERY");
        let request = QueryBuilder::new(&self.config).build(
            id,
            &node.snapshot(),
            &node.analyzed_moves(),
            options,
        );
        self.enqueue(request, options.result_kind(), Some(Arc::clone(node)), reply)
    }

    fn enqueue(
        &self,
        request: AnalysisRequest,
        kind: ResultKind,
        node: Option<Arc<GameNode>>,
        reply: &Sender<Delivery>,
    ) -> Result<String> {
        if self.shared.unhealthy.load(Ordering::SeqCst) {
            return Err(EngineError::Unhealthy);
        }
        let id = request.id.clone();
        let priority = request.priority;
        {
            let mut state = self.shared.state.lock();
            if state.lifecycle != Lifecycle::Running || state.exited {
                return Err(EngineError::NotRunning);
            }
            state.pending.insert(
                id.clone(),
                PendingQuery {
                    kind,
                    node,
                    reply: reply.clone(),
                    ponder: request.ponder,
                },
            );
        }
        log::debug!(
            "submit query id={id} kind={} priority={priority} visits={} turns={:?}",
            kind.label(),
            request.max_visits,
            request.analyze_turns
        );
        if !self.shared.queue.push(priority, EngineRequest::Analyze(Box::new(request))) {
            self.shared.remove_pending(&id);
            return Err(EngineError::Unhealthy);
        }
        Ok(id)
    }

    /// 保留中のクエリを打ち切る。何度呼んでもよく、既に終わっていれば `false`。
    ///
    /// 表から外した後に届いた応答は黙って捨てる。
    pub fn terminate(&self, query_id: &str) -> bool {
        if self.shared.remove_pending(query_id).is_none() {
            return false;
        }
        self.send_terminate(query_id);
        true
    }

    fn send_terminate(&self, query_id: &str) {
        log::debug!("terminate query id={query_id}");
        let action = ActionRequest::terminate(self.next_id("TERMINATE"), query_id);
        let request = EngineRequest::Action(action);
        self.shared.queue.push(CONTROL_PRIORITY, request);
    }

    fn terminate_where(&self, pred: impl Fn(&PendingQuery) -> bool) -> usize {
        let ids: Vec<String> = {
            let mut state = self.shared.state.lock();
            let ids: Vec<String> =
                state.pending.iter().filter(|(_, q)| pred(q)).map(|(id, _)| id.clone()).collect();
            for id in &ids {
                state.pending.remove(id);
            }
            ids
        };
        if !ids.is_empty() {
            self.shared.changed.notify_all();
        }
        for id in &ids {
            self.send_terminate(id);
        }
        ids.len()
    }

    /// 全クエリを打ち切る（新しい対局を始めるとき）
    pub fn terminate_all(&self) -> usize {
        self.terminate_where(|_| true)
    }

    /// ponder クエリだけを打ち切る
    pub fn stop_pondering(&self) -> usize {
        let n = self.terminate_where(|q| q.ponder);
        if n > 0 {
            log::debug!("stopped pondering queries={n}");
        }
        n
    }

    /// 保留表が空になるか、プロセスが終了するまで待つ。タイムアウトなら `false`。
    pub fn wait_to_finish(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.pending.is_empty() || state.exited {
                return true;
            }
            if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                return state.pending.is_empty() || state.exited;
            }
        }
    }

    /// プロセスが生きているかを調べる。ブロックしない。
    pub fn check_alive(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.lifecycle != Lifecycle::Running || state.exited {
            return false;
        }
        match state.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                log::warn!("primary engine has exited status={status}");
                false
            }
            Some(Err(e)) => {
                log::warn!("failed to poll primary engine error={e}");
                false
            }
            None => false,
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        self.shared.unhealthy.load(Ordering::SeqCst)
    }

    pub fn queries_remaining(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queries_remaining() == 0
    }

    pub fn state(&self) -> EngineState {
        let state = self.shared.state.lock();
        match state.lifecycle {
            Lifecycle::NotStarted => EngineState::NotStarted,
            Lifecycle::Starting => EngineState::Starting,
            Lifecycle::Running if state.exited => EngineState::Stopped,
            Lifecycle::Running if state.pending.is_empty() => EngineState::Idle,
            Lifecycle::Running => EngineState::Busy,
            Lifecycle::ShuttingDown => EngineState::ShuttingDown,
            Lifecycle::Stopped => EngineState::Stopped,
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state(),
            unhealthy: self.is_unhealthy(),
            queries_remaining: self.queries_remaining(),
        }
    }

    /// 解析を投入し、最終結果を待って返す。マージは呼び出し側で行う。
    ///
    /// タイムアウトしたらクエリを打ち切り、クライアントを unhealthy にする。
    /// 他のスレッドから打ち切られたら `Cancelled` を返す。
    pub fn analyze_blocking(
        &self,
        node: &Arc<GameNode>,
        options: &AnalysisOptions,
        timeout: Duration,
    ) -> Result<EngineResult> {
        let (tx, rx) = unbounded();
        let id = self.submit(node, options, &tx)?;
        // 残る送信側は保留表の 1 つだけ。表から外されれば受信側が切断を検出する
        drop(tx);
        let deadline = Instant::now() + timeout;
        loop {
            match rx.recv_deadline(deadline) {
                Ok(delivery) if !delivery.is_final() => continue,
                Ok(delivery) => {
                    return match delivery.outcome {
                        QueryOutcome::Result(result) => Ok(result),
                        QueryOutcome::Failed(e) => Err(e),
                    };
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::error!(
                        "blocking analysis timed out id={id} timeout_ms={}",
                        timeout.as_millis()
                    );
                    self.terminate(&id);
                    self.shared.unhealthy.store(true, Ordering::SeqCst);
                    return Err(EngineError::Timeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    log::debug!("blocking analysis cancelled id={id}");
                    return Err(EngineError::Cancelled);
                }
            }
        }
    }

    /// 停止する。`finish` なら保留中のクエリが終わるまで（設定の時間内で）待つ。
    ///
    /// stdin を閉じて終了を待ち、時間内に終わらなければ kill する。何度呼んでもよい。
    pub fn shutdown(&self, finish: bool) {
        {
            let state = self.shared.state.lock();
            if matches!(
                state.lifecycle,
                Lifecycle::NotStarted | Lifecycle::Stopped | Lifecycle::ShuttingDown
            ) {
                return;
            }
        }
        let timeout = self.config.shutdown_timeout();
        if finish && !self.wait_to_finish(timeout) {
            log::warn!(
                "primary engine still busy at shutdown queries={}",
                self.queries_remaining()
            );
        }

        let dropped = {
            let mut state = self.shared.state.lock();
            state.lifecycle = Lifecycle::ShuttingDown;
            let n = state.pending.len();
            state.pending.clear();
            n
        };
        self.shared.changed.notify_all();
        if dropped > 0 {
            log::debug!("discarded pending queries at shutdown count={dropped}");
        }
        // 書き込みスレッドが抜けて stdin が閉じる
        self.shared.queue.close();

        let deadline = Instant::now() + timeout;
        let mut child = {
            let mut state = self.shared.state.lock();
            while !state.exited && state.child.is_some() {
                if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            state.child.take()
        };
        if let Some(child) = child.as_mut() {
            reap(child);
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                log::warn!("primary engine io thread panicked");
            }
        }
        self.shared.state.lock().lifecycle = Lifecycle::Stopped;
        log::info!("primary engine stopped");
    }

    /// 停止してから起動し直す。unhealthy もここで解除される。
    pub fn restart(&self) -> Result<()> {
        log::info!("restarting primary engine");
        self.shutdown(false);
        self.start()
    }
}

impl Drop for PrimaryEngineClient {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

fn reap(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => log::debug!("primary engine exited status={status}"),
        _ => {
            log::warn!("primary engine did not exit in time, killing pid={}", child.id());
            let _ = child.kill();
            match child.wait() {
                Ok(status) => log::debug!("primary engine killed status={status}"),
                Err(e) => log::warn!("failed to reap primary engine error={e}"),
            }
        }
    }
}

fn writer_loop(shared: &Shared, mut stdin: BufWriter<ChildStdin>) {
    while let Some(request) = shared.queue.pop() {
        if let EngineRequest::Analyze(req) = &request {
            if !shared.state.lock().pending.contains_key(&req.id) {
                log::debug!("skip write of terminated query id={}", req.id);
                continue;
            }
        }
        let line = match request.to_line() {
            Ok(line) => line,
            Err(e) => {
                log::error!("failed to encode request id={} error={e}", request.id());
                shared.fail_query(request.id(), EngineError::Json(e));
                continue;
            }
        };
        log::trace!("primary <- {line}");
        if let Err(e) = writeln!(stdin, "{line}").and_then(|()| stdin.flush()) {
            log::error!("primary engine write failed id={} error={e}", request.id());
            shared.unhealthy.store(true, Ordering::SeqCst);
            shared.queue.close();
            shared.fail_query(request.id(), EngineError::WriteFailure(e.to_string()));
            break;
        }
    }
    log::debug!("primary writer exiting");
}

fn stdout_loop(shared: &Shared, stdout: ChildStdout) {
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::warn!("primary engine stdout read failed error={e}");
                break;
            }
        };
        let line = line.trim();
        if !line.is_empty() {
            handle_line(shared, line);
        }
    }
    on_stdout_closed(shared);
}

fn handle_line(shared: &Shared, line: &str) {
    log::trace!("primary -> {}", clip(line));
    let mut response = match RawResponse::parse(line) {
        Ok(response) => response,
        Err(e) => {
            log::warn!("malformed engine line skipped error={e} line={}", clip(line));
            return;
        }
    };
    let error = response.error.take();
    if let Some(version) = &response.version {
        log::info!("primary engine version={version}");
    }
    let Some(id) = response.id.clone() else {
        if let Some(error) = error {
            log::error!("primary engine error error={error}");
        }
        return;
    };
    if let Some(warning) = &response.warning {
        log::warn!("primary engine warning id={id} field={:?} message={warning}", response.field);
        // 警告だけの行は結果ではない
        if error.is_none() && response.root_info.is_none() && response.move_infos.is_empty() {
            return;
        }
    }

    let is_final = error.is_some() || !response.is_during_search;
    let target = {
        let mut state = shared.state.lock();
        if is_final {
            state.pending.remove(&id).map(|q| (q.reply, q.node, q.kind))
        } else {
            state.pending.get(&id).map(|q| (q.reply.clone(), q.node.clone(), q.kind))
        }
    };
    let Some((reply, node, kind)) = target else {
        log::debug!("dropped response for unknown query id={id} action={:?}", response.action);
        return;
    };
    if is_final {
        shared.changed.notify_all();
    }

    let outcome = match error {
        Some(error) => {
            log::warn!(
                "primary engine rejected query id={id} field={:?} error={error}",
                response.field
            );
            QueryOutcome::Failed(EngineError::Engine(error))
        }
        None => QueryOutcome::Result(response.into_result(id.clone())),
    };
    let delivery = Delivery {
        query_id: id,
        kind,
        node,
        outcome,
    };
    if reply.send(delivery).is_err() {
        log::debug!("reply channel closed, result discarded");
    }
}

fn on_stdout_closed(shared: &Shared) {
    let (drained, intentional, status) = {
        let mut state = shared.state.lock();
        state.exited = true;
        let intentional = state.lifecycle == Lifecycle::ShuttingDown;
        let status = state.child.as_mut().and_then(|c| c.try_wait().ok().flatten());
        let drained: Vec<(String, PendingQuery)> = state.pending.drain().collect();
        (drained, intentional, status)
    };
    shared.changed.notify_all();
    if intentional {
        log::debug!("primary engine stdout closed");
        return;
    }

    shared.unhealthy.store(true, Ordering::SeqCst);
    shared.queue.close();
    let reason = match status {
        Some(status) => format!("engine exited ({status})"),
        None => "engine closed its output".to_string(),
    };
    log::error!("primary engine crashed reason={reason} pending={}", drained.len());
    for (id, query) in drained {
        let _ = query.reply.send(Delivery {
            query_id: id,
            kind: query.kind,
            node: query.node,
            outcome: QueryOutcome::Failed(EngineError::EngineCrashed(reason.clone())),
        });
    }
}

fn stderr_loop(stderr: impl Read) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) if !line.trim().is_empty() => log::debug!("primary stderr: {line}"),
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

fn clip(line: &str) -> &str {
    match line.char_indices().nth(LOG_LINE_LIMIT) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
