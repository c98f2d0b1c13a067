// Session controller tests
//
// Every collaborator is an in-memory double; the tests drive the controller's
// event loop one step at a time.
mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{
    activate, drain, harness, harness_with, session_config, step_until, FailingProvisioner,
    MockDevice, MockSink, CALL_URL,
};
use serde_json::json;
use tokio::sync::mpsc;
use voice_session::audio::codec;
use voice_session::protocol::TransportEvent;
use voice_session::session::TranscriptStatus;
use voice_session::transcript::ReconnectPolicy;
use voice_session::{
    CallState, OutboundMessage, SessionError, SessionUpdate, Speaker, StaticProvisioner,
    UserCommand,
};

#[tokio::test]
async fn test_start_call_sends_handshake() {
    let mut h = harness();

    h.controller.start_call().await.unwrap();

    assert_eq!(h.controller.state(), CallState::Connecting);
    assert!(h.controller.is_capturing());
    assert!(!h.controller.is_interacting());

    let server = h.connector.call_server();
    assert_eq!(server.url, CALL_URL);
    assert_eq!(
        server.sent(),
        vec![OutboundMessage::handshake(16000, "elevenlabs")]
    );
}

#[tokio::test]
async fn test_session_id_activates_call_and_opens_feed() {
    let mut h = harness();
    activate(&mut h, "sess-1").await;

    assert_eq!(h.controller.state(), CallState::Active);
    assert!(h.controller.is_interacting());
    assert_eq!(h.controller.session().id.as_deref(), Some("sess-1"));
    assert!(h.controller.has_transcript_feed());

    step_until(&mut h.controller, |_| h.connector.feed_server().is_some()).await;
    assert_eq!(
        h.connector.feed_server().unwrap().url,
        "ws://backend.test/transcript/sess-1"
    );
}

#[tokio::test]
async fn test_no_audio_sent_before_backend_ready() {
    let mut h = harness();
    h.controller.start_call().await.unwrap();
    let server = h.connector.call_server();

    h.device.capture(0.5).await;
    step_until(&mut h.controller, |c| c.stats().frames_dropped == 1).await;
    assert_eq!(server.sent_kinds(), vec!["browser_audio"]);

    server.push_json(json!({"type": "session_id", "session_id": "sess-2"}));
    step_until(&mut h.controller, |c| c.state() == CallState::Active).await;

    h.device.capture(0.25).await;
    step_until(&mut h.controller, |_| server.sent_kinds().contains(&"audio")).await;

    let audio = server
        .sent()
        .into_iter()
        .find_map(|m| match m {
            OutboundMessage::Audio { data } => Some(data),
            _ => None,
        })
        .unwrap();
    let samples = codec::decode(&audio).unwrap();
    assert_eq!(samples, vec![0.25; 4]);
    assert_eq!(h.controller.stats().frames_sent, 1);
}

#[tokio::test]
async fn test_blocks_captured_before_ready_are_not_sent() {
    let mut h = harness();
    h.controller.start_call().await.unwrap();
    let server = h.connector.call_server();

    tokio::time::sleep(Duration::from_millis(30)).await;
    server.push_json(json!({"type": "session_id", "session_id": "sess-stale"}));
    step_until(&mut h.controller, |c| c.state() == CallState::Active).await;

    // Block recorded at device start, still queued when the backend became ready
    h.device.capture_at(0.5, 0).await;
    h.device.capture(0.25).await;
    step_until(&mut h.controller, |_| server.sent_kinds().contains(&"audio")).await;
    drain(&mut h.controller).await;

    let audio: Vec<String> = server
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            OutboundMessage::Audio { data } => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(audio.len(), 1);
    assert_eq!(codec::decode(&audio[0]).unwrap(), vec![0.25; 4]);

    let stats = h.controller.stats();
    assert_eq!(stats.frames_sent, 1);
    assert_eq!(stats.frames_dropped, 1);
}

#[tokio::test]
async fn test_soft_control_signals_keep_call_active() {
    let mut h = harness();
    let server = activate(&mut h, "sess-3").await;

    for action in ["interruption", "cancel", "end", "mystery"] {
        server.push_json(json!({"type": "control", "action": action}));
    }
    server.push_json(json!({"type": "agent_speaking", "is_speaking": true}));
    step_until(&mut h.controller, |c| c.agent_speaking()).await;

    assert_eq!(h.controller.state(), CallState::Active);
    assert!(h.controller.is_capturing());
    assert!(h.controller.is_connected());
    assert_eq!(h.device.stop_count(), 0);
    assert_eq!(server.close_count(), 0);
}

#[tokio::test]
async fn test_terminate_tears_everything_down() {
    let sink = MockSink::with_duration(Duration::from_secs(60));
    let mut h = harness_with(
        session_config(),
        MockDevice::new(),
        sink,
        Arc::new(StaticProvisioner::new(CALL_URL)),
    );
    let server = activate(&mut h, "sess-4").await;

    server.push_json(json!({"type": "audio", "data": codec::encode(&[0.1; 16])}));
    server.push_json(json!({"type": "audio", "data": codec::encode(&[0.2; 16])}));
    server.push_json(json!({"type": "transcript", "role": "agent", "text": "Hello", "is_final": true}));
    step_until(&mut h.controller, |c| c.queued_audio() == 1 && c.transcript().len() == 1).await;
    assert!(h.controller.is_playing());

    server.push_json(json!({"type": "control", "action": "terminate"}));
    step_until(&mut h.controller, |c| c.state() == CallState::Ended).await;

    assert_eq!(h.device.stop_count(), 1);
    assert_eq!(server.close_count(), 1);
    assert_eq!(server.sent_kinds().last(), Some(&"end_conversation"));
    assert!(!h.controller.is_capturing());
    assert!(!h.controller.is_connected());
    assert!(!h.controller.has_transcript_feed());
    assert!(!h.controller.is_playing());
    assert_eq!(h.controller.queued_audio(), 0);
    assert!(h.controller.transcript().is_empty());
    assert!(h.sink.played().is_empty());
}

#[tokio::test]
async fn test_end_call_is_idempotent() {
    let mut h = harness();
    let server = activate(&mut h, "sess-5").await;

    h.controller.end_call().await;
    h.controller.end_call().await;

    assert_eq!(h.controller.state(), CallState::Ended);
    assert_eq!(h.device.stop_count(), 1);
    assert_eq!(server.close_count(), 1);
    assert_eq!(
        server.sent_kinds(),
        vec!["browser_audio", "end_conversation"]
    );
}

#[tokio::test]
async fn test_end_call_before_start_is_noop() {
    let mut h = harness();

    let stats = h.controller.end_call().await;

    assert_eq!(stats.state, CallState::Idle);
    assert_eq!(h.controller.state(), CallState::Idle);
    assert_eq!(h.device.stop_count(), 0);
    assert!(h.connector.attempts().is_empty());
}

#[tokio::test]
async fn test_end_call_returns_stats_before_clearing() {
    let mut h = harness();
    let server = activate(&mut h, "sess-6").await;

    server.push_json(json!({"type": "transcript", "role": "user", "text": "Book a table", "is_final": true, "timestamp": 10}));
    step_until(&mut h.controller, |c| c.transcript().len() == 1).await;

    let stats = h.controller.end_call().await;

    assert_eq!(stats.state, CallState::Active);
    assert_eq!(stats.session_id.as_deref(), Some("sess-6"));
    assert_eq!(stats.transcript_entries, 1);
    assert!(stats.started_at.is_some());
    assert!(h.controller.transcript().is_empty());
}

#[tokio::test]
async fn test_duration_stops_when_call_ends() {
    let mut h = harness();
    activate(&mut h, "sess-clock").await;
    assert!(h.controller.stats().ended_at.is_none());

    h.controller.end_call().await;
    let ended = h.controller.stats();
    assert_eq!(ended.state, CallState::Ended);
    assert!(ended.ended_at.is_some());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let later = h.controller.stats();
    assert_eq!(later.ended_at, ended.ended_at);
    assert_eq!(later.duration_secs, ended.duration_secs);
}

#[tokio::test]
async fn test_interim_then_final_from_call_connection() {
    let mut h = harness();
    let mut updates = h.controller.subscribe();
    let server = activate(&mut h, "sess-7").await;

    for text in ["he", "hell"] {
        server.push_json(json!({"type": "transcript", "role": "user", "text": text, "is_final": false}));
    }
    step_until(&mut h.controller, |c| {
        c.interim_entries().first().map(|e| e.text.as_str()) == Some("hell")
    })
    .await;
    assert!(h.controller.transcript().is_empty());

    server.push_json(json!({"type": "transcript", "role": "user", "text": "hello", "is_final": true}));
    step_until(&mut h.controller, |c| c.transcript().len() == 1).await;

    assert_eq!(h.controller.transcript()[0].text, "hello");
    assert!(h.controller.interim_entries().is_empty());

    let mut interims = 0;
    let mut finals = 0;
    while let Ok(update) = updates.try_recv() {
        match update {
            SessionUpdate::Interim { .. } => interims += 1,
            SessionUpdate::Transcript { .. } => finals += 1,
            _ => {}
        }
    }
    assert_eq!(interims, 2);
    assert_eq!(finals, 1);
}

#[tokio::test]
async fn test_transcript_deduplicated_across_channels() {
    let mut h = harness();
    let server = activate(&mut h, "sess-8").await;
    step_until(&mut h.controller, |_| h.connector.feed_server().is_some()).await;
    let feed = h.connector.feed_server().unwrap();

    server.push_json(json!({"type": "transcript", "role": "assistant", "text": "How can I help?", "is_final": true, "timestamp": 1700000000}));
    feed.push_json(json!({"type": "transcript", "speaker": "agent", "text": "How can I help?", "is_final": true, "timestamp": 1700000000}));
    feed.push_json(json!({"type": "transcript", "speaker": "user", "text": "A table for two", "is_final": true, "timestamp": 1700000004}));
    step_until(&mut h.controller, |c| c.transcript().len() == 2).await;
    drain(&mut h.controller).await;

    let texts: Vec<&str> = h.controller.transcript().iter().map(|e| e.text.as_str()).collect();
    assert_eq!(texts, vec!["How can I help?", "A table for two"]);
}

#[tokio::test]
async fn test_duplicate_final_on_feed_clears_interim() {
    let mut h = harness();
    let mut updates = h.controller.subscribe();
    let server = activate(&mut h, "sess-dup").await;
    step_until(&mut h.controller, |_| h.connector.feed_server().is_some()).await;
    let feed = h.connector.feed_server().unwrap();

    server.push_json(json!({"type": "transcript", "role": "user", "text": "hello", "is_final": true, "timestamp": 5}));
    step_until(&mut h.controller, |c| c.transcript().len() == 1).await;

    feed.push_json(json!({"type": "transcript", "speaker": "user", "text": "hel", "is_final": false, "timestamp": 4}));
    step_until(&mut h.controller, |c| !c.interim_entries().is_empty()).await;
    feed.push_json(json!({"type": "transcript", "speaker": "user", "text": "hello", "is_final": true, "timestamp": 5}));
    drain(&mut h.controller).await;

    assert_eq!(h.controller.transcript().len(), 1);
    assert!(h.controller.interim_entries().is_empty());

    let mut last_user_update = None;
    while let Ok(update) = updates.try_recv() {
        match &update {
            SessionUpdate::Interim { entry } if entry.speaker == Speaker::User => {
                last_user_update = Some(update.clone())
            }
            SessionUpdate::InterimCleared {
                speaker: Speaker::User,
            } => last_user_update = Some(update.clone()),
            _ => {}
        }
    }
    assert_eq!(
        last_user_update,
        Some(SessionUpdate::InterimCleared {
            speaker: Speaker::User
        })
    );
}

#[tokio::test]
async fn test_feed_call_status_never_ends_call() {
    let mut h = harness();
    let mut updates = h.controller.subscribe();
    activate(&mut h, "sess-9").await;
    step_until(&mut h.controller, |_| h.connector.feed_server().is_some()).await;

    h.connector
        .feed_server()
        .unwrap()
        .push_json(json!({"type": "call_status", "status": "ended"}));
    drain(&mut h.controller).await;

    assert_eq!(h.controller.state(), CallState::Active);
    let mut saw_ended = false;
    while let Ok(update) = updates.try_recv() {
        if update
            == (SessionUpdate::TranscriptStatus {
                status: TranscriptStatus::Ended,
            })
        {
            saw_ended = true;
        }
    }
    assert!(saw_ended);
}

#[tokio::test]
async fn test_feed_give_up_keeps_call_active() {
    let mut config = session_config();
    config.reconnect = ReconnectPolicy {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_attempts: 2,
    };
    let mut h = harness_with(
        config,
        MockDevice::new(),
        MockSink::new(),
        Arc::new(StaticProvisioner::new(CALL_URL)),
    );
    h.connector.fail_urls_containing("/transcript/");
    let mut updates = h.controller.subscribe();

    activate(&mut h, "sess-nofeed").await;
    step_until(&mut h.controller, |c| !c.has_transcript_feed()).await;

    assert_eq!(h.controller.state(), CallState::Active);
    let feed_attempts = h
        .connector
        .attempts()
        .iter()
        .filter(|url| url.contains("/transcript/"))
        .count();
    assert_eq!(feed_attempts, 3);

    let mut saw_error = false;
    while let Ok(update) = updates.try_recv() {
        if update
            == (SessionUpdate::TranscriptStatus {
                status: TranscriptStatus::Error,
            })
        {
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn test_remote_close_while_active_keeps_call() {
    let mut h = harness();
    let server = activate(&mut h, "sess-10").await;

    server.push(TransportEvent::Closed { code: Some(1000) });
    drain(&mut h.controller).await;

    assert_eq!(h.controller.state(), CallState::Active);
    assert_eq!(h.device.stop_count(), 0);

    // Audio stops flowing to a closed connection
    h.device.capture(0.1).await;
    drain(&mut h.controller).await;
    assert!(!server.sent_kinds().contains(&"audio"));

    h.controller.end_call().await;
    assert_eq!(h.controller.state(), CallState::Ended);
    assert_eq!(server.close_count(), 0);
    assert_eq!(h.device.stop_count(), 1);
}

#[tokio::test]
async fn test_socket_error_fails_call() {
    let mut h = harness();
    let mut updates = h.controller.subscribe();
    let server = activate(&mut h, "sess-11").await;

    server.push(TransportEvent::Failed("connection reset".to_string()));
    step_until(&mut h.controller, |c| c.state() == CallState::Error).await;

    assert_eq!(h.device.stop_count(), 1);
    assert!(h.controller.session().last_error.is_some());

    let failure = std::iter::from_fn(|| updates.try_recv().ok())
        .find(|u| matches!(u, SessionUpdate::Failure { .. }));
    assert!(matches!(
        failure,
        Some(SessionUpdate::Failure {
            retryable: true,
            ..
        })
    ));
}

#[tokio::test]
async fn test_close_before_session_id_fails_call() {
    let mut h = harness();
    h.controller.start_call().await.unwrap();

    h.connector.call_server().push(TransportEvent::Closed { code: None });
    step_until(&mut h.controller, |c| c.state() == CallState::Error).await;

    assert!(!h.controller.is_capturing());
    assert_eq!(h.device.stop_count(), 1);
}

#[tokio::test]
async fn test_provisioning_failure_blocks_call() {
    let mut h = harness_with(
        session_config(),
        MockDevice::new(),
        MockSink::new(),
        Arc::new(FailingProvisioner),
    );

    let result = h.controller.start_call().await;

    assert!(matches!(result, Err(SessionError::Provisioning(_))));
    assert_eq!(h.controller.state(), CallState::Error);
    assert_eq!(h.device.starts.load(Ordering::SeqCst), 0);
    assert!(h.connector.attempts().is_empty());
}

#[tokio::test]
async fn test_denied_microphone_blocks_call() {
    let mut h = harness_with(
        session_config(),
        MockDevice::denied(),
        MockSink::new(),
        Arc::new(StaticProvisioner::new(CALL_URL)),
    );

    let result = h.controller.start_call().await;

    assert!(matches!(result, Err(SessionError::Device(_))));
    assert_eq!(h.controller.state(), CallState::Error);
    assert!(h.connector.attempts().is_empty());
}

#[tokio::test]
async fn test_call_can_restart_after_end() {
    let mut h = harness();
    let first = activate(&mut h, "sess-12").await;
    h.controller.end_call().await;

    h.controller.start_call().await.unwrap();
    assert_eq!(h.controller.state(), CallState::Connecting);
    assert_eq!(h.controller.session().id, None);

    // Late traffic from the finished call changes nothing
    first.push_json(json!({"type": "session_id", "session_id": "sess-12"}));
    drain(&mut h.controller).await;
    assert_eq!(h.controller.state(), CallState::Connecting);

    let second = h.connector.call_server();
    second.push_json(json!({"type": "session_id", "session_id": "sess-13"}));
    step_until(&mut h.controller, |c| c.state() == CallState::Active).await;
    assert_eq!(h.controller.session().id.as_deref(), Some("sess-13"));
}

#[tokio::test]
async fn test_start_while_live_is_ignored() {
    let mut h = harness();
    activate(&mut h, "sess-14").await;

    h.controller.start_call().await.unwrap();

    assert_eq!(h.controller.state(), CallState::Active);
    assert_eq!(h.device.starts.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.connector
            .attempts()
            .iter()
            .filter(|url| url.as_str() == CALL_URL)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_send_text_only_while_active() {
    let mut h = harness();
    assert!(h.controller.send_text("hello").await.is_err());

    let server = activate(&mut h, "sess-15").await;
    h.controller.send_text("I'd like a table").await.unwrap();

    assert_eq!(
        server.sent().last(),
        Some(&OutboundMessage::UserText {
            text: "I'd like a table".to_string()
        })
    );
}

#[tokio::test]
async fn test_agent_audio_plays_in_arrival_order() {
    let mut h = harness();
    let server = activate(&mut h, "sess-16").await;

    for value in [0.1f32, 0.2, 0.3] {
        server.push_json(json!({"type": "audio", "data": codec::encode(&[value; 8])}));
    }
    server.push_json(json!({"type": "audio", "data": "@@not-base64@@"}));
    step_until(&mut h.controller, |c| c.stats().playback_units_played == 3).await;

    let played = h.sink.played();
    assert_eq!(played.len(), 3);
    for (unit, expected) in played.iter().zip([0.1f32, 0.2, 0.3]) {
        assert!((unit[0] - expected).abs() < 1e-3);
    }
    assert_eq!(h.sink.overlaps.load(Ordering::SeqCst), 0);
    assert!(!h.controller.is_playing());
}

#[tokio::test]
async fn test_availability_cleared_by_booking() {
    let mut h = harness();
    let server = activate(&mut h, "sess-17").await;

    server.push_json(json!({
        "type": "function_result",
        "function_name": "check_availability",
        "result": {"slots": ["18:00", "19:30"]}
    }));
    step_until(&mut h.controller, |c| c.availability().is_some()).await;

    server.push_json(json!({"type": "booking_confirmed", "booking": {"time": "19:30"}}));
    step_until(&mut h.controller, |c| c.booking().is_some()).await;

    assert!(h.controller.availability().is_none());
    assert_eq!(h.controller.booking().unwrap()["time"], "19:30");
}

#[tokio::test]
async fn test_fallback_extraction_when_enabled() {
    let mut config = session_config();
    config.fallback_extraction = true;
    let mut h = harness_with(
        config,
        MockDevice::new(),
        MockSink::new(),
        Arc::new(StaticProvisioner::new(CALL_URL)),
    );
    let server = activate(&mut h, "sess-18").await;

    server.push_json(json!({"type": "llm_response", "message": "Anything else?"}));
    step_until(&mut h.controller, |c| c.transcript().len() == 1).await;

    assert_eq!(h.controller.transcript()[0].text, "Anything else?");
}

#[tokio::test]
async fn test_run_loop_handles_commands() {
    let h = harness();
    let connector = h.connector.clone();
    let mut updates = h.controller.subscribe();
    let (commands, command_rx) = mpsc::channel(8);

    let run = tokio::spawn(h.controller.run(command_rx));
    commands.send(UserCommand::Start).await.unwrap();

    let server = loop {
        if let Some(server) = connector.servers().into_iter().next() {
            break server;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    server.push_json(json!({"type": "session_id", "session_id": "sess-run"}));

    loop {
        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("state update")
            .expect("update channel open");
        if matches!(
            update,
            SessionUpdate::StateChanged {
                state: CallState::Active,
                ..
            }
        ) {
            break;
        }
    }

    commands
        .send(UserCommand::SendText("hi".to_string()))
        .await
        .unwrap();
    commands.send(UserCommand::Shutdown).await.unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run loop should stop")
        .unwrap();

    assert_eq!(stats.session_id.as_deref(), Some("sess-run"));
    assert_eq!(
        server.sent_kinds(),
        vec!["browser_audio", "user_text", "end_conversation"]
    );
    assert_eq!(server.close_count(), 1);
}
