//! PrimaryEngineClient against the mock JSON-lines engine

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use crossbeam_channel::unbounded;
use rgo_analysis::{
    AnalysisOptions, EngineError, EngineState, GameNode, GameSetup, PrimaryEngineClient,
    QueryOutcome, Rules,
};
use serde_json::Value;

#[test]
fn submit_does_not_block_and_result_arrives() {
    init_logger();
    let client = start_primary(&["--delay-ms", "300"]);
    let node = position("B:E5");
    let (tx, rx) = unbounded();

    let started = Instant::now();
    let id = client.submit(&node, &AnalysisOptions::default(), &tx).unwrap();
    assert!(started.elapsed() < Duration::from_millis(200), "submit must not wait for the engine");
    assert_eq!(client.state(), EngineState::Busy);

    let done = collect_final(&rx, 1, T_RESULT);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].query_id, id);
    match &done[0].outcome {
        QueryOutcome::Result(result) => {
            assert!(!result.is_partial);
            assert_eq!(result.root_info.as_ref().unwrap().visits, 100);
            assert_eq!(result.move_infos[0].mv, "E5");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(client.wait_to_finish(T_RESULT));
    assert_eq!(client.state(), EngineState::Idle);
}

#[test]
fn out_of_order_responses_reach_their_own_query() {
    let client = start_primary(&["--hold", "2"]);
    let first = position("B:E5");
    let second = position("B:E5 W:C3");
    let (tx, rx) = unbounded();
    let id1 = client.submit(&first, &AnalysisOptions::default(), &tx).unwrap();
    let id2 = client.submit(&second, &AnalysisOptions::default(), &tx).unwrap();

    let done = collect_final(&rx, 2, T_RESULT);
    assert_eq!(done.len(), 2);
    // the mock answers the held pair in reverse
    assert_eq!(done[0].query_id, id2);
    assert_eq!(done[1].query_id, id1);
    for delivery in &done {
        let node = delivery.node.as_ref().unwrap();
        let expected = if delivery.query_id == id1 { &first } else { &second };
        assert_eq!(node.id(), expected.id());
    }
    assert!(client.is_idle());
}

#[test]
fn terminate_is_idempotent_and_late_results_are_dropped() {
    let client = start_primary(&["--delay-ms", "300"]);
    let node = position("B:E5");
    let (tx, rx) = unbounded();
    let id = client.submit(&node, &AnalysisOptions::default(), &tx).unwrap();

    assert!(client.terminate(&id));
    assert!(!client.terminate(&id));
    assert_eq!(client.queries_remaining(), 0);
    assert!(rx.recv_timeout(Duration::from_millis(700)).is_err());
}

#[test]
fn crash_fails_every_pending_query_exactly_once() {
    let client = start_primary(&["--silent", "--crash-after", "3"]);
    let (tx, rx) = unbounded();
    let nodes = [position("B:E5"), position("B:C3"), position("B:G7")];
    let ids: Vec<String> =
        nodes.iter().map(|n| client.submit(n, &AnalysisOptions::default(), &tx).unwrap()).collect();

    let done = collect_final(&rx, 3, T_RESULT);
    assert_eq!(done.len(), 3);
    for delivery in &done {
        assert!(ids.contains(&delivery.query_id));
        assert!(matches!(delivery.outcome, QueryOutcome::Failed(EngineError::EngineCrashed(_))));
    }
    assert!(rx.recv_timeout(T_SHORT).is_err(), "no second notification per query");
    assert_eq!(client.queries_remaining(), 0);
    assert!(client.is_unhealthy());
    assert!(!client.check_alive());

    let err = client.submit(&nodes[0], &AnalysisOptions::default(), &tx).unwrap_err();
    assert!(matches!(err, EngineError::Unhealthy));
}

#[test]
fn write_failure_marks_unhealthy_and_rejects_submits() {
    let client = start_primary(&["--close-stdin-after", "1"]);
    let (tx, rx) = unbounded();
    client.submit(&position("B:E5"), &AnalysisOptions::default(), &tx).unwrap();
    assert!(matches!(collect_final(&rx, 1, T_RESULT)[0].outcome, QueryOutcome::Result(_)));

    // the engine is still running but no longer reads its input
    let id = client.submit(&position("B:C3"), &AnalysisOptions::default(), &tx).unwrap();
    let done = collect_final(&rx, 1, T_RESULT);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].query_id, id);
    assert!(matches!(done[0].outcome, QueryOutcome::Failed(EngineError::WriteFailure(_))));
    assert!(client.is_unhealthy());
    assert_eq!(client.queries_remaining(), 0);

    let err = client.submit(&position("B:G7"), &AnalysisOptions::default(), &tx).unwrap_err();
    assert!(matches!(err, EngineError::Unhealthy));
}

#[test]
fn restart_recovers_after_crash() {
    let client = start_primary(&["--crash-after", "1"]);
    let (tx, rx) = unbounded();
    client.submit(&position("B:E5"), &AnalysisOptions::default(), &tx).unwrap();
    assert_eq!(collect_final(&rx, 1, T_RESULT).len(), 1);
    assert!(client.is_unhealthy());

    client.restart().unwrap();
    assert!(!client.is_unhealthy());
    assert!(client.check_alive());
    assert_eq!(client.state(), EngineState::Idle);
}

#[test]
fn wait_to_finish_reports_timeout_while_busy() {
    let client = start_primary(&["--silent"]);
    let (tx, _rx) = unbounded();
    client.submit(&position("B:E5"), &AnalysisOptions::default(), &tx).unwrap();

    let started = Instant::now();
    assert!(!client.wait_to_finish(Duration::from_millis(200)));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(client.terminate_all(), 1);
    assert!(client.wait_to_finish(Duration::from_millis(10)));
}

#[test]
fn stop_pondering_leaves_foreground_queries() {
    let client = start_primary(&["--silent"]);
    let (tx, _rx) = unbounded();
    let node = position("B:E5");
    let ponder = AnalysisOptions {
        ponder: true,
        ..Default::default()
    };
    client.submit(&node, &ponder, &tx).unwrap();
    let fg = client.submit(&node, &AnalysisOptions::default(), &tx).unwrap();

    assert_eq!(client.stop_pondering(), 1);
    assert_eq!(client.queries_remaining(), 1);
    assert!(client.terminate(&fg));
}

#[test]
fn partial_reports_precede_the_final_result() {
    let client = start_primary(&[]);
    let (tx, rx) = unbounded();
    let options = AnalysisOptions {
        report_every: Some(0.1),
        ..Default::default()
    };
    client.submit(&position("B:E5"), &options, &tx).unwrap();

    let first = rx.recv_timeout(T_RESULT).unwrap();
    assert!(!first.is_final());
    let second = rx.recv_timeout(T_RESULT).unwrap();
    assert!(second.is_final());
    assert_eq!(first.query_id, second.query_id);
}

#[test]
fn malformed_lines_and_warnings_do_not_break_the_stream() {
    let client = start_primary(&["--malformed"]);
    let (tx, rx) = unbounded();
    let mut options = AnalysisOptions::default();
    options.extra_settings.insert("unknownKnob".to_string(), Value::from(1));
    client.submit(&position("B:E5"), &options, &tx).unwrap();

    let done = collect_final(&rx, 1, T_RESULT);
    assert!(matches!(done[0].outcome, QueryOutcome::Result(_)));
    assert!(!client.is_unhealthy());
}

#[test]
fn engine_error_response_fails_only_that_query() {
    let client = start_primary(&[]);
    let (tx, rx) = unbounded();
    let bad = GameNode::root(GameSetup {
        rules: Rules("invalid".to_string()),
        ..Default::default()
    });
    client.submit(&bad, &AnalysisOptions::default(), &tx).unwrap();
    let done = collect_final(&rx, 1, T_RESULT);
    match &done[0].outcome {
        QueryOutcome::Failed(EngineError::Engine(message)) => assert!(message.contains("rules")),
        other => panic!("unexpected outcome {other:?}"),
    }

    client.submit(&position("B:E5"), &AnalysisOptions::default(), &tx).unwrap();
    assert!(matches!(collect_final(&rx, 1, T_RESULT)[0].outcome, QueryOutcome::Result(_)));
}

#[test]
fn analyze_blocking_returns_final_result() {
    let client = start_primary(&[]);
    let options = AnalysisOptions {
        visits: Some(40),
        ..Default::default()
    };
    let result = client.analyze_blocking(&position("B:E5"), &options, T_RESULT).unwrap();
    assert_eq!(result.root_info.unwrap().visits, 40);
}

#[test]
fn analyze_blocking_timeout_marks_unhealthy() {
    let client = start_primary(&["--silent"]);
    let options = AnalysisOptions::default();
    let err = client
        .analyze_blocking(&position("B:E5"), &options, Duration::from_millis(200))
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)));
    assert!(client.is_unhealthy());
    assert_eq!(client.queries_remaining(), 0);
}

#[test]
fn analyze_blocking_is_cancelled_by_terminate_all() {
    let client = Arc::new(start_primary(&["--silent"]));
    let waiter = {
        let client = Arc::clone(&client);
        std::thread::spawn(move || {
            client.analyze_blocking(&position("B:E5"), &AnalysisOptions::default(), T_RESULT)
        })
    };
    let deadline = Instant::now() + T_RESULT;
    while client.queries_remaining() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(client.terminate_all(), 1);
    assert!(matches!(waiter.join().unwrap(), Err(EngineError::Cancelled)));
    assert!(!client.is_unhealthy());
}

#[test]
fn missing_binary_fails_to_start() {
    let mut config = primary_config(&[]);
    config.command = "/nonexistent/analysis-engine".into();
    let client = PrimaryEngineClient::new(config);
    let err = client.start().unwrap_err();
    assert!(matches!(err, EngineError::ProcessStart { .. }));
    assert_eq!(client.state(), EngineState::Stopped);
}

#[test]
fn silent_handshake_times_out() {
    let mut config = primary_config(&["--no-version"]);
    config.start_timeout_ms = 300;
    let client = PrimaryEngineClient::new(config);
    assert!(matches!(client.start().unwrap_err(), EngineError::Timeout(_)));
    assert!(!client.check_alive());
}

#[test]
fn shutdown_is_idempotent() {
    let client = start_primary(&[]);
    client.shutdown(true);
    client.shutdown(true);
    assert_eq!(client.state(), EngineState::Stopped);
    let (tx, _rx) = unbounded();
    assert!(matches!(
        client.submit(&position(""), &AnalysisOptions::default(), &tx),
        Err(EngineError::NotRunning)
    ));
}
