//! GTP 比較エンジンのクライアント
//!
//! 有効なリクエストは常に 1 つで、新しいリクエストや `cancel` で古いものは捨てられる。
//! 解析スレッドは `session` ロックで直列化し、エンジンとの対話が混ざらないようにする。

use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;

use super::gtp::{self, SecondaryCandidate};
use super::token::{CancelToken, TokenSlot};
use crate::config::SecondaryEngineConfig;
use crate::error::{EngineError, Result};
use crate::position::PositionSnapshot;

/// 応答待ちの上限（局面設定コマンド 1 つ分）
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// 解析中にトークンを確かめる間隔
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// 終了時に `quit` の後で待つ時間
const QUIT_TIMEOUT: Duration = Duration::from_millis(500);

/// 比較エンジンからの結果
#[derive(Debug, Clone, PartialEq)]
pub enum SecondaryOutcome {
    /// 最後に受け取った候補手一覧（順位順）
    Candidates(Vec<SecondaryCandidate>),
    ParseError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecondaryDelivery {
    /// `request` が返したトークン
    pub token: u64,
    pub outcome: SecondaryOutcome,
}

struct GtpProcess {
    child: Mutex<Child>,
    stdin: Mutex<BufWriter<ChildStdin>>,
    lines: Receiver<String>,
    /// 解析スレッドの直列化
    session: Mutex<()>,
    /// セッション外（`cancel`）で送った中断コマンドのうち、応答をまだ読んでいない数
    unacked: AtomicUsize,
}

impl GtpProcess {
    fn send(&self, command: &str) -> Result<()> {
        log::trace!("secondary <- {command}");
        let mut stdin = self.stdin.lock();
        writeln!(stdin, "{command}")
            .and_then(|()| stdin.flush())
            .map_err(|e| EngineError::WriteFailure(e.to_string()))
    }

    /// 応答行（`=` か `?`）が来るまで読み捨てる。`?` なら `false`。
    fn wait_ack(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.lines.recv_deadline(deadline) {
                Ok(line) if gtp::is_response(&line) => return Ok(!gtp::is_error_response(&line)),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Err(EngineError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(output_closed());
                }
            }
        }
    }

    fn command(&self, command: &str) -> Result<bool> {
        self.send(command)?;
        self.wait_ack(ACK_TIMEOUT)
    }

    /// セッションの外から中断コマンドを送る。応答は次に `settle_interrupts` した解析スレッドが読む。
    fn interrupt(&self, command: &str) -> Result<()> {
        self.unacked.fetch_add(1, Ordering::SeqCst);
        let sent = self.send(command);
        if sent.is_err() {
            self.unacked.fetch_sub(1, Ordering::SeqCst);
        }
        sent
    }

    /// 未読の中断応答をすべて読み捨て、その数を返す
    fn settle_interrupts(&self) -> usize {
        let owed = self.unacked.swap(0, Ordering::SeqCst);
        for _ in 0..owed {
            if let Err(e) = self.wait_ack(ACK_TIMEOUT) {
                log::debug!("no ack for secondary interrupt error={e}");
                break;
            }
        }
        owed
    }

    fn drain(&self) -> usize {
        self.lines.try_iter().count()
    }
}

/// GTP 比較エンジン
pub struct SecondaryEngineClient {
    config: Arc<SecondaryEngineConfig>,
    tokens: Arc<TokenSlot>,
    process: Mutex<Option<Arc<GtpProcess>>>,
    last_request: Mutex<Option<Instant>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SecondaryEngineClient {
    pub fn new(config: SecondaryEngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            tokens: TokenSlot::new(),
            process: Mutex::new(None),
            last_request: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// プロセスを起動する。実行ファイルが無い・応答しない場合はログに残して `false`。
    pub fn start(&self) -> bool {
        let mut process = self.process.lock();
        if process.is_some() {
            return true;
        }
        match self.spawn() {
            Ok(p) => {
                log::info!("secondary engine ready path={}", self.config.command.display());
                *process = Some(p);
                true
            }
            Err(e) => {
                log::warn!(
                    "secondary engine unavailable path={} error={e}",
                    self.config.command.display()
                );
                false
            }
        }
    }

    fn spawn(&self) -> Result<Arc<GtpProcess>> {
        self.config.validate()?;
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
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(start_error("stdio is not piped".to_string()));
        };
        let stderr = child.stderr.take();

        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name("secondary-stdout".to_string())
            .spawn(move || stdout_loop(stdout, tx))?;
        if let Some(stderr) = stderr {
            thread::Builder::new()
                .name("secondary-stderr".to_string())
                .spawn(move || stderr_loop(stderr))?;
        }

        let process = Arc::new(GtpProcess {
            child: Mutex::new(child),
            stdin: Mutex::new(BufWriter::new(stdin)),
            lines: rx,
            session: Mutex::new(()),
            unacked: AtomicUsize::new(0),
        });
        if let Err(e) = process.command("name") {
            kill(&process);
            return Err(e);
        }
        Ok(process)
    }

    pub fn is_running(&self) -> bool {
        self.process.lock().is_some()
    }

    /// 局面の解析を依頼する。以前のリクエストは無効になる。
    ///
    /// `forced` でなければ前回の依頼から `min_interval` 経つまで開始を遅らせ、
    /// その間に次の依頼が来たらこの依頼は何もせずに終わる。
    /// 結果は、トークンがまだ有効な場合に限り `reply` へ 1 回だけ届く。
    pub fn request(
        &self,
        position: &PositionSnapshot,
        forced: bool,
        reply: Sender<SecondaryDelivery>,
    ) -> Result<u64> {
        let process = self.process.lock().clone().ok_or(EngineError::NotRunning)?;
        let delay = {
            let mut last = self.last_request.lock();
            let delay = match *last {
                Some(at) if !forced => self.config.min_interval().saturating_sub(at.elapsed()),
                _ => Duration::ZERO,
            };
            *last = Some(Instant::now());
            delay
        };
        let token = self.tokens.issue();
        let id = token.id();
        log::debug!("secondary request token={id} forced={forced} delay_ms={}", delay.as_millis());

        let job = AnalysisJob {
            process,
            config: Arc::clone(&self.config),
            token,
            position: position.clone(),
            delay,
            reply,
        };
        let handle = thread::Builder::new()
            .name(format!("secondary-analysis-{id}"))
            .spawn(move || job.run())?;
        let mut workers = self.workers.lock();
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
        Ok(id)
    }

    /// 有効なリクエストを取り消す。戻った後、取り消したリクエストの結果は届かない。
    pub fn cancel(&self) {
        if !self.tokens.clear() {
            return;
        }
        let process = self.process.lock().clone();
        if let Some(process) = process {
            if let Err(e) = process.interrupt(&self.config.interrupt_command) {
                log::warn!("failed to interrupt secondary engine error={e}");
            }
        }
    }

    /// 取り消して `quit` を送り、時間内に終わらなければ kill する。何度呼んでもよい。
    pub fn shutdown(&self) {
        self.cancel();
        let Some(process) = self.process.lock().take() else {
            return;
        };
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                log::warn!("secondary analysis thread panicked");
            }
        }
        let _ = process.send("quit");
        // stdout が閉じればプロセスは終了処理に入っている
        let deadline = Instant::now() + QUIT_TIMEOUT;
        let closed = loop {
            match process.lines.recv_deadline(deadline) {
                Ok(_) => {}
                Err(RecvTimeoutError::Disconnected) => break true,
                Err(RecvTimeoutError::Timeout) => break false,
            }
        };
        if closed {
            match process.child.lock().wait() {
                Ok(status) => log::debug!("secondary engine exited status={status}"),
                Err(e) => log::warn!("failed to reap secondary engine error={e}"),
            }
        } else {
            log::warn!("secondary engine did not exit in time, killing");
            kill(&process);
        }
        log::info!("secondary engine stopped");
    }
}

impl Drop for SecondaryEngineClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn kill(process: &GtpProcess) {
    let mut child = process.child.lock();
    let _ = child.kill();
    let _ = child.wait();
}

struct AnalysisJob {
    process: Arc<GtpProcess>,
    config: Arc<SecondaryEngineConfig>,
    token: CancelToken,
    position: PositionSnapshot,
    delay: Duration,
    reply: Sender<SecondaryDelivery>,
}

impl AnalysisJob {
    fn run(self) {
        let id = self.token.id();
        if !self.delay.is_zero() && self.token.wait_cancelled(self.delay) {
            log::debug!("secondary request superseded during debounce token={id}");
            return;
        }
        let _session = self.process.session.lock();
        if !self.token.is_current() {
            return;
        }
        self.process.settle_interrupts();
        let stale = self.process.drain();
        if stale > 0 {
            log::trace!("discarded stale secondary lines count={stale}");
        }

        let outcome = match self.analyze() {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return,
            Err(EngineError::ProtocolParse(message)) => SecondaryOutcome::ParseError(message),
            Err(EngineError::EngineCrashed(message)) => {
                log::warn!("secondary engine died during analysis token={id} reason={message}");
                SecondaryOutcome::ParseError(message)
            }
            Err(e) => {
                log::warn!("secondary analysis failed token={id} error={e}");
                return;
            }
        };
        let reply = &self.reply;
        let sent = self.token.emit_if_current(|| {
            let _ = reply.send(SecondaryDelivery { token: id, outcome });
        });
        if !sent {
            log::debug!("secondary result dropped for stale token={id}");
        }
    }

    /// 局面を設定して解析し、最後の候補手一覧を返す。取り消されたら `None`。
    fn analyze(&self) -> Result<Option<SecondaryOutcome>> {
        let process = &self.process;
        for cmd in gtp::position_commands(&self.position) {
            if !self.token.is_current() {
                return Ok(None);
            }
            if !process.command(&cmd)? {
                log::warn!("secondary engine rejected command={cmd}");
            }
        }
        let analyze = format!("{} {}", self.config.analyze_command, self.config.report_interval_cs);
        if !process.command(&analyze)? {
            return Err(EngineError::Engine(format!("'{analyze}' rejected")));
        }

        let deadline = Instant::now() + self.config.max_wait();
        let mut latest: Option<Vec<SecondaryCandidate>> = None;
        let mut parse_error = None;
        loop {
            if !self.token.is_current() {
                break;
            }
            if latest.as_ref().is_some_and(|c| gtp::total_visits(c) >= self.config.visits) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                log::debug!("secondary analysis reached max wait token={}", self.token.id());
                break;
            }
            match process.lines.recv_timeout(POLL_INTERVAL.min(deadline - now)) {
                Ok(line) if gtp::is_info_line(&line) => match gtp::parse_info_line(&line) {
                    Ok(cands) if !cands.is_empty() => latest = Some(cands),
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("unparseable secondary info error={e}");
                        parse_error = Some(e);
                    }
                },
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(output_closed());
                }
            }
        }

        // 解析を止め、その応答まで読み捨てて次のセッションに持ち越さない。
        // cancel が中断を送っていれば、その応答を読むだけにする
        if process.settle_interrupts() == 0 {
            process.send(&self.config.interrupt_command)?;
            if let Err(e) = process.wait_ack(ACK_TIMEOUT) {
                log::debug!("no ack for secondary interrupt error={e}");
            }
        }

        if !self.token.is_current() {
            return Ok(None);
        }
        Ok(Some(match (latest, parse_error) {
            (Some(cands), _) => SecondaryOutcome::Candidates(cands),
            (None, Some(EngineError::ProtocolParse(message))) => {
                SecondaryOutcome::ParseError(message)
            }
            (None, _) => SecondaryOutcome::Candidates(Vec::new()),
        }))
    }
}

fn stdout_loop(stdout: impl Read, tx: Sender<String>) {
    for line in BufReader::new(stdout).lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        log::trace!("secondary -> {line}");
        if tx.send(line.to_string()).is_err() {
            break;
        }
    }
}

fn stderr_loop(stderr: impl Read) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) if !line.trim().is_empty() => log::debug!("secondary stderr: {line}"),
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

fn output_closed() -> EngineError {
    EngineError::EngineCrashed("secondary engine closed its output".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn missing_config() -> SecondaryEngineConfig {
        SecondaryEngineConfig {
            command: PathBuf::from("/nonexistent/secondary-engine"),
            ..Default::default()
        }
    }

    #[test]
    fn missing_executable_is_reported_as_unavailable() {
        let client = SecondaryEngineClient::new(missing_config());
        assert!(!client.start());
        assert!(!client.is_running());
    }

    #[test]
    fn request_without_process_is_rejected() {
        let client = SecondaryEngineClient::new(missing_config());
        let (tx, _rx) = unbounded();
        let position = crate::position::GameNode::root(Default::default()).snapshot();
        assert!(matches!(client.request(&position, true, tx), Err(EngineError::NotRunning)));
        client.cancel();
        client.shutdown();
    }
}
