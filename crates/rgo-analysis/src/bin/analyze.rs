/// 1 局面を解析エンジンにかけ、候補手を JSON Lines で出力する。
///
/// 解析エンジン（と任意で比較エンジン）を起動し、`--moves` で与えた手順の
/// 末尾局面を解析する。結果は局面木へマージしてから候補手一覧として出す。
///
/// # 使用例
///
/// ```shell
/// cargo run -p rgo-analysis --release --bin rgo-analyze -- \
///   --config analysis.toml \
///   --moves "B:D4 W:Q16 B:Q4" --komi 6.5 --visits 800
///
/// # 9 路で領域を絞る
/// cargo run -p rgo-analysis --release --bin rgo-analyze -- \
///   --size 9 --moves "B:E5" --region 3,5,3,5
/// ```
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser as _;
use crossbeam_channel::{self as chan, select};
use serde_json::json;

use rgo_analysis::analysis::candidate_moves;
use rgo_analysis::engine::{SecondaryDelivery, SecondaryOutcome};
use rgo_analysis::{
    AnalysisConfig, AnalysisDispatcher, AnalysisOptions, BoardSize, Event, EventKind, EventNotifier,
    GameNode, GameSetup, PlayerMove, PrimaryEngineClient, RegionOfInterest, Rules,
    SecondaryEngineClient,
};

#[derive(clap::Parser, Debug)]
#[command(author, version, about = "analyze a Go position with a JSON-lines analysis engine")]
struct Cli {
    /// TOML config file (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Analysis engine binary (overrides [primary].command)
    #[arg(long)]
    engine: Option<PathBuf>,

    /// Extra engine argument, repeatable (replaces [primary].args when given)
    #[arg(long = "engine-arg", num_args = 1, allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// Move sequence such as "B:D4 W:Q16"
    #[arg(long, default_value = "")]
    moves: String,

    /// Board size (square)
    #[arg(long, default_value_t = 19)]
    size: u8,

    #[arg(long, default_value_t = 6.5)]
    komi: f64,

    #[arg(long, default_value = "japanese")]
    rules: String,

    /// Visit budget (defaults to [primary].max_visits)
    #[arg(long)]
    visits: Option<u32>,

    /// Restrict the search to x_min,x_max,y_min,y_max (0-based, inclusive)
    #[arg(long)]
    region: Option<String>,

    /// After the first pass, search again avoiding the moves already found
    #[arg(long)]
    alternatives: bool,

    /// Also ask the GTP comparison engine ([secondary] section)
    #[arg(long)]
    secondary: bool,

    /// Overall timeout in seconds
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    use std::io::Write;
    let log_level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, log_level),
    )
    .format(|buf, record| {
        writeln!(buf, "[{}] {}: {}", record.level(), record.target(), record.args())
    })
    .write_style(env_logger::WriteStyle::Never)
    .target(env_logger::Target::Stderr)
    .init();
}

fn load_config(cli: &Cli) -> Result<AnalysisConfig> {
    let mut config = match &cli.config {
        Some(path) => AnalysisConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AnalysisConfig::default(),
    };
    if let Some(engine) = &cli.engine {
        config.primary.command = engine.clone();
    }
    if !cli.engine_args.is_empty() {
        config.primary.args = cli.engine_args.clone();
    }
    if cli.secondary && config.secondary.is_none() {
        config.secondary = Some(Default::default());
    }
    Ok(config)
}

fn build_position(cli: &Cli) -> Result<Arc<GameNode>> {
    let moves = cli
        .moves
        .split_whitespace()
        .map(|s| {
            PlayerMove::parse(s).with_context(|| format!("invalid move '{s}' (expected B:D4)"))
        })
        .collect::<Result<Vec<_>>>()?;
    let setup = GameSetup {
        board_size: BoardSize::square(cli.size),
        komi: cli.komi,
        rules: Rules(cli.rules.clone()),
        ..Default::default()
    };
    Ok(GameNode::root(setup).play_sequence(&moves))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = load_config(&cli)?;
    let node = build_position(&cli)?;
    let region = match &cli.region {
        Some(s) => {
            let r = RegionOfInterest::parse(s).with_context(|| format!("invalid --region '{s}'"))?;
            if !r.is_valid() {
                bail!("--region {s} has min greater than max");
            }
            Some(r)
        }
        None => None,
    };

    let (interrupt_tx, interrupt_rx) = chan::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("failed to install Ctrl-C handler")?;

    let notifier = Arc::new(EventNotifier::new());
    let (done_tx, done_rx) = chan::unbounded::<Event>();
    for kind in [EventKind::AnalysisComplete, EventKind::EngineFailure] {
        let tx = done_tx.clone();
        notifier.subscribe(
            kind,
            Arc::new(move |e: &Event| {
                let _ = tx.send(e.clone());
            }),
        );
    }
    let mut dispatcher = AnalysisDispatcher::spawn(Arc::clone(&notifier))?;

    let primary = PrimaryEngineClient::new(config.primary.clone());
    primary.start().context("failed to start analysis engine")?;

    let secondary = config.secondary.clone().map(SecondaryEngineClient::new);
    let (sec_tx, sec_rx) = chan::unbounded::<SecondaryDelivery>();
    if let Some(client) = &secondary {
        if client.start() {
            client.request(&node.snapshot(), true, sec_tx)?;
        }
    }

    let mut passes = vec![AnalysisOptions {
        visits: cli.visits,
        region_of_interest: region,
        include_ownership: true,
        include_policy: true,
        ..Default::default()
    }];
    if cli.alternatives {
        passes.push(AnalysisOptions {
            visits: cli.visits,
            find_alternatives: true,
            ..Default::default()
        });
    }

    let deadline = chan::after(Duration::from_secs(cli.timeout_secs));
    let mut interrupted = false;
    'passes: for options in &passes {
        let query_id = primary.submit(&node, options, &dispatcher.sender())?;
        loop {
            select! {
                recv(done_rx) -> event => {
                    let event = event?;
                    if event.get("query_id").and_then(|v| v.as_str()) != Some(query_id.as_str()) {
                        continue;
                    }
                    if event.kind == EventKind::EngineFailure {
                        let reason = event
                            .get("error")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown");
                        bail!("analysis failed: {reason}");
                    }
                    break;
                }
                recv(interrupt_rx) -> _ => {
                    log::warn!("interrupted, terminating query id={query_id}");
                    primary.terminate(&query_id);
                    interrupted = true;
                    break 'passes;
                }
                recv(deadline) -> _ => {
                    primary.terminate(&query_id);
                    bail!("analysis did not finish within {}s", cli.timeout_secs);
                }
            }
        }
    }

    let record = node.analysis();
    println!(
        "{}",
        json!({
            "node": node.id(),
            "moves": cli.moves,
            "score_lead": record.score(),
            "winrate": record.winrate(),
            "visits": record.root_visits(),
            "completed": record.completed,
            "candidates": candidate_moves(&node),
        })
    );

    if let Some(client) = &secondary {
        if !interrupted && client.is_running() {
            let max_wait = config
                .secondary
                .as_ref()
                .map_or(Duration::ZERO, |s| s.max_wait());
            let wait = max_wait + Duration::from_secs(5);
            select! {
                recv(sec_rx) -> delivery => match delivery.map(|d| d.outcome) {
                    Ok(SecondaryOutcome::Candidates(cands)) => {
                        println!("{}", json!({ "secondary": cands }));
                    }
                    Ok(SecondaryOutcome::ParseError(message)) => {
                        log::warn!("secondary engine output unreadable: {message}");
                    }
                    Err(_) => {}
                },
                recv(interrupt_rx) -> _ => client.cancel(),
                default(wait) => log::warn!("secondary engine gave no result"),
            }
        }
        client.shutdown();
    }

    primary.shutdown(!interrupted);
    dispatcher.shutdown();
    if interrupted {
        std::process::exit(130);
    }
    Ok(())
}
