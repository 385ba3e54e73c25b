//! Common test utilities for rgo-analysis integration tests

#![allow(dead_code)] // These utilities may be used by various test files

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use rgo_analysis::{
    Delivery, GameNode, GameSetup, PlayerMove, PrimaryEngineClient, PrimaryEngineConfig,
    SecondaryEngineConfig,
};

// Timeout constants for CI stability
pub const T_START: Duration = Duration::from_secs(10); // Engine start / handshake
pub const T_RESULT: Duration = Duration::from_secs(5); // Waiting for a delivery
pub const T_SHORT: Duration = Duration::from_millis(200); // Expecting silence

pub fn mock_engine() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock-engine"))
}

/// Primary config pointing at the mock engine in JSON mode with extra flags
pub fn primary_config(flags: &[&str]) -> PrimaryEngineConfig {
    let mut args = vec!["json".to_string()];
    args.extend(flags.iter().map(|s| s.to_string()));
    PrimaryEngineConfig {
        command: mock_engine(),
        args,
        max_visits: 100,
        start_timeout_ms: T_START.as_millis() as u64,
        shutdown_timeout_ms: 2000,
        ..Default::default()
    }
}

pub fn secondary_config(flags: &[&str]) -> SecondaryEngineConfig {
    let mut args = vec!["gtp".to_string()];
    args.extend(flags.iter().map(|s| s.to_string()));
    SecondaryEngineConfig {
        command: mock_engine(),
        args,
        visits: 60,
        report_interval_cs: 1,
        max_wait_ms: 3000,
        min_interval_ms: 300,
        ..Default::default()
    }
}

pub fn start_primary(flags: &[&str]) -> PrimaryEngineClient {
    let client = PrimaryEngineClient::new(primary_config(flags));
    client.start().expect("mock engine should start");
    client
}

/// 9x9 position after the given moves ("B:E5 W:C3")
pub fn position(moves: &str) -> Arc<GameNode> {
    let moves: Vec<PlayerMove> = moves
        .split_whitespace()
        .map(|m| PlayerMove::parse(m).expect("valid move"))
        .collect();
    let setup = GameSetup {
        board_size: rgo_analysis::BoardSize::square(9),
        ..Default::default()
    };
    GameNode::root(setup).play_sequence(&moves)
}

/// Receive deliveries until `count` final ones arrived or timeout
pub fn collect_final(rx: &Receiver<Delivery>, count: usize, timeout: Duration) -> Vec<Delivery> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    while out.len() < count {
        match rx.recv_deadline(deadline) {
            Ok(d) if d.is_final() => out.push(d),
            Ok(_) => {}
            Err(_) => break,
        }
    }
    out
}

/// Initialize logging once for tests that want engine chatter (RUST_LOG=debug)
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
