//! 結合テスト用の代役エンジン
//!
//! `mock-engine json [OPTIONS]` は JSON-lines 解析エンジン、`mock-engine gtp [OPTIONS]` は
//! `lz-analyze` を話す GTP エンジンとして振る舞う。
//!
//! json のオプション:
//! - `--hold N`       解析クエリを N 件ためてから、優先度の高い順（同じなら後着順）に返す
//! - `--silent`       解析クエリに応答しない
//! - `--crash-after N` 解析クエリを N 件受け取ったら終了コード 3 で落ちる
//! - `--delay-ms N`   各応答の前に待つ
//! - `--malformed`    応答の前に壊れた行を 1 行出す
//! - `--no-version`   `query_version` に応答しない
//! - `--close-stdin-after N` N 件目の解析クエリで stdin を閉じ、それに応答した後しばらく生き続ける
//!
//! gtp のオプション:
//! - `--garbage`      `info` 行を壊して出す
//! - `--die-on-analyze` 解析コマンドに応答した直後に終了する

use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use serde_json::{Value, json};

const CANDIDATES: &[&str] = &["E5", "C3", "G7", "C7", "G3", "D4", "F6"];

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "json".to_string());
    let rest: Vec<String> = args.collect();
    match mode.as_str() {
        "json" => run_json(JsonOptions::parse(&rest)?),
        "gtp" => {
            let flag = |name: &str| rest.iter().any(|a| a == name);
            run_gtp(flag("--garbage"), flag("--die-on-analyze"))
        }
        other => bail!("unknown mode: {other}"),
    }
}

#[derive(Debug, Default)]
struct JsonOptions {
    hold: usize,
    silent: bool,
    crash_after: Option<usize>,
    delay: Duration,
    malformed: bool,
    no_version: bool,
    close_stdin_after: Option<usize>,
}

impl JsonOptions {
    fn parse(args: &[String]) -> Result<Self> {
        let mut opts = JsonOptions::default();
        let mut it = args.iter();
        while let Some(arg) = it.next() {
            let mut value = |name: &str| -> Result<u64> {
                it.next()
                    .with_context(|| format!("{name} requires a value"))?
                    .parse()
                    .with_context(|| format!("{name} expects a number"))
            };
            match arg.as_str() {
                "--hold" => opts.hold = value("--hold")? as usize,
                "--crash-after" => opts.crash_after = Some(value("--crash-after")? as usize),
                "--close-stdin-after" => {
                    opts.close_stdin_after = Some(value("--close-stdin-after")? as usize);
                }
                "--delay-ms" => opts.delay = Duration::from_millis(value("--delay-ms")?),
                "--silent" => opts.silent = true,
                "--malformed" => opts.malformed = true,
                "--no-version" => opts.no_version = true,
                other => bail!("unknown option: {other}"),
            }
        }
        Ok(opts)
    }
}

type Out = Arc<Mutex<io::Stdout>>;

fn emit(out: &Out, value: &Value) {
    let mut out = out.lock();
    let _ = writeln!(out, "{value}");
    let _ = out.flush();
}

fn run_json(opts: JsonOptions) -> Result<()> {
    let out: Out = Arc::new(Mutex::new(io::stdout()));
    let terminated: Arc<Mutex<HashSet<String>>> = Arc::default();
    let mut held: Vec<Value> = Vec::new();
    let mut received = 0usize;
    let mut closing: Option<Value> = None;
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                emit(&out, &json!({ "error": format!("could not parse request: {e}") }));
                continue;
            }
        };
        let id = request["id"].as_str().unwrap_or_default().to_string();
        match request["action"].as_str() {
            Some("query_version") => {
                if !opts.no_version {
                    let version = json!({
                        "id": id,
                        "action": "query_version",
                        "version": "mock-1.0",
                    });
                    emit(&out, &version);
                }
                continue;
            }
            Some("terminate") => {
                let target = request["terminateId"].as_str().unwrap_or_default().to_string();
                terminated.lock().insert(target.clone());
                emit(&out, &json!({ "id": id, "action": "terminate", "terminateId": target }));
                continue;
            }
            Some(other) => {
                let error = json!({
                    "id": id,
                    "error": format!("unknown action {other}"),
                    "field": "action",
                });
                emit(&out, &error);
                continue;
            }
            None => {}
        }

        received += 1;
        if opts.crash_after.is_some_and(|n| received >= n) {
            eprintln!("mock-engine: crashing after {received} queries");
            std::process::exit(3);
        }
        if opts.close_stdin_after.is_some_and(|n| received >= n) {
            closing = Some(request);
            break;
        }
        if opts.silent {
            continue;
        }
        if opts.hold > 0 {
            held.push(request);
            if held.len() >= opts.hold {
                held.reverse();
                held.sort_by_key(|r| std::cmp::Reverse(r["priority"].as_i64().unwrap_or(0)));
                for request in held.drain(..) {
                    respond(&out, &terminated, &request, &opts);
                }
            }
            continue;
        }
        let out = Arc::clone(&out);
        let terminated = Arc::clone(&terminated);
        let delay = opts.delay;
        let malformed = opts.malformed;
        workers.retain(|h| !h.is_finished());
        workers.push(thread::spawn(move || {
            thread::sleep(delay);
            let opts = JsonOptions {
                malformed,
                ..JsonOptions::default()
            };
            respond(&out, &terminated, &request, &opts);
        }));
    }
    for handle in workers {
        let _ = handle.join();
    }
    if let Some(request) = closing {
        close_stdin()?;
        respond(&out, &terminated, &request, &opts);
        // stdout は開いたまま、書き込みだけが失敗する状態を保つ
        thread::sleep(Duration::from_millis(1500));
    }
    Ok(())
}

#[cfg(unix)]
fn close_stdin() -> Result<()> {
    use std::os::fd::{FromRawFd, OwnedFd};
    // SAFETY: fd 0 はこのプロセスの stdin で、以後どこからも読まない
    drop(unsafe { OwnedFd::from_raw_fd(0) });
    Ok(())
}

#[cfg(not(unix))]
fn close_stdin() -> Result<()> {
    bail!("--close-stdin-after is only supported on unix")
}

fn respond(out: &Out, terminated: &Mutex<HashSet<String>>, request: &Value, opts: &JsonOptions) {
    let id = request["id"].as_str().unwrap_or_default();
    if opts.malformed {
        let mut out = out.lock();
        let _ = writeln!(out, "{{\"id\": \"{id}\", this is not json");
        let _ = out.flush();
    }
    if request["rules"].as_str() == Some("invalid") {
        emit(out, &json!({ "id": id, "error": "unknown rules", "field": "rules" }));
        return;
    }
    if let Some(settings) = request["overrideSettings"].as_object() {
        let unknown = settings
            .keys()
            .filter(|k| !matches!(k.as_str(), "wideRootNoise" | "maxTime"));
        for key in unknown {
            let warning = json!({
                "id": id,
                "warning": format!("unknown override {key}"),
                "field": "overrideSettings",
            });
            emit(out, &warning);
        }
    }
    let report = request["reportDuringSearchEvery"].as_f64().is_some();
    let ponder = request["ponder"].as_bool().unwrap_or(false);
    if report || ponder {
        emit(out, &analysis_response(request, true));
    }
    // ponder は打ち切られるまで終わらない
    if ponder || terminated.lock().contains(id) {
        return;
    }
    emit(out, &analysis_response(request, false));
}

fn analysis_response(request: &Value, partial: bool) -> Value {
    let id = request["id"].as_str().unwrap_or_default();
    let max_visits = request["maxVisits"].as_u64().unwrap_or(100);
    let visits = if partial { max_visits / 2 } else { max_visits };
    let moves = request["moves"].as_array().map_or(0, Vec::len);
    let turn = request["analyzeTurns"][0].as_u64().unwrap_or(moves as u64);
    let width = request["boardXSize"].as_u64().unwrap_or(19);
    let points = width * request["boardYSize"].as_u64().unwrap_or(19);

    let avoided: HashSet<&str> = request["avoidMoves"]
        .as_array()
        .into_iter()
        .flatten()
        .flat_map(|a| a["moves"].as_array().into_iter().flatten())
        .filter_map(Value::as_str)
        .collect();
    let picks: Vec<&str> = CANDIDATES
        .iter()
        .copied()
        .filter(|m| !avoided.contains(m))
        .take(3)
        .collect();

    let score = 0.5 + moves as f64 * 0.1;
    let move_infos: Vec<Value> = picks
        .iter()
        .enumerate()
        .map(|(order, mv)| {
            let share = visits / (order as u64 + 2);
            json!({
                "move": mv,
                "order": order,
                "visits": share,
                "scoreLead": score - order as f64,
                "winrate": 0.5 - order as f64 * 0.05,
                "prior": 0.3 / (order as f64 + 1.0),
                "lcb": 0.45 - order as f64 * 0.05,
                "pv": [mv, "pass"],
            })
        })
        .collect();

    let mut response = json!({
        "id": id,
        "isDuringSearch": partial,
        "turnNumber": turn,
        "rootInfo": {
            "scoreLead": score,
            "winrate": 0.5,
            "visits": visits,
            "utility": 0.0,
            "scoreStdev": 10.0,
        },
        "moveInfos": move_infos,
    });
    if request["includeOwnership"].as_bool() == Some(true) {
        response["ownership"] = json!(vec![0.0; points as usize]);
    }
    if request["includePolicy"].as_bool() == Some(true) {
        response["policy"] = json!(vec![1.0 / (points + 1) as f64; points as usize + 1]);
    }
    response
}

struct Streamer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Streamer {
    fn finish(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

fn run_gtp(garbage: bool, die_on_analyze: bool) -> Result<()> {
    let out: Out = Arc::new(Mutex::new(io::stdout()));
    let reply = |body: &str| {
        let mut out = out.lock();
        let _ = write!(out, "{body}\n\n");
        let _ = out.flush();
    };
    let mut streamer: Option<Streamer> = None;

    for line in io::stdin().lock().lines() {
        let line = line?;
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else { continue };
        // どのコマンドも進行中の解析を止める
        if let Some(s) = streamer.take() {
            s.finish();
        }
        match cmd {
            "name" => reply("= mock-engine"),
            "boardsize" | "rectangular_boardsize" | "clear_board" | "komi" | "play" | "stop" => {
                reply("=")
            }
            "quit" => {
                reply("=");
                break;
            }
            "lz-analyze" | "kata-analyze" => {
                let interval_cs: u64 = words.next().and_then(|w| w.parse().ok()).unwrap_or(10);
                reply("=");
                if die_on_analyze {
                    std::process::exit(0);
                }
                streamer = Some(spawn_streamer(Arc::clone(&out), interval_cs, garbage));
            }
            _ => reply("? unknown command"),
        }
    }
    if let Some(s) = streamer.take() {
        s.finish();
    }
    Ok(())
}

fn spawn_streamer(out: Out, interval_cs: u64, garbage: bool) -> Streamer {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        let interval = Duration::from_millis((interval_cs * 10).max(5));
        let mut visits = 0u64;
        while !flag.load(Ordering::SeqCst) {
            thread::sleep(interval);
            visits += 20;
            let line = if garbage {
                "info move E5 visits many winrate".to_string()
            } else {
                format!(
                    "info move E5 visits {visits} winrate 5000 prior 2000 order 0 pv E5 C3 \
                     info move C3 visits {} winrate 4800 order 1 pv C3",
                    visits / 2
                )
            };
            let mut out = out.lock();
            if flag.load(Ordering::SeqCst) {
                break;
            }
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
        // lz-analyze の出力は空行で終わる
        let mut out = out.lock();
        let _ = writeln!(out);
        let _ = out.flush();
    });
    Streamer { stop, handle }
}
