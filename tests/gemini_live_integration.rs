//! Integration tests for the Gemini Live transport
//!
//! These tests verify, against a local mock WebSocket server:
//! - The setup handshake and the "channel ready" signal
//! - Outbound audio framing
//! - Inbound server content mapping and ordering
//! - Close handling (normal, abnormal, local)
//! - A complete voice session over the wire

mod fixtures;
mod mock_providers;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use fixtures::*;
use mock_providers::*;
use waav_live::core::codec::{self, AudioFrame};
use waav_live::core::devices::{ManualMicrophone, ManualOutput};
use waav_live::{
    BaseTransport, GeminiLive, GeminiLiveFactory, InboundEvent, SessionConfig, SessionState,
    Speaker, TransportConfig, TransportError, VoiceSession, get_supported_transport_providers,
};

const WAIT: Duration = Duration::from_secs(5);

async fn next_event(events: &mut waav_live::core::transport::EventStream) -> InboundEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

async fn open_client(mock: &GeminiMock, config: TransportConfig) -> GeminiLive {
    let mut client = GeminiLive::with_endpoint("test-key".to_string(), mock.url()).unwrap();
    tokio::time::timeout(WAIT, client.open(config))
        .await
        .expect("open timed out")
        .unwrap();
    client
}

#[test]
fn test_gemini_in_supported_transport_providers() {
    let providers = get_supported_transport_providers();
    assert!(providers.contains(&"gemini"));
}

#[tokio::test]
async fn test_open_sends_setup_and_waits_for_setup_complete() {
    let mock = spawn_gemini_mock(GeminiMockConfig::default()).await;

    let config = TransportConfig {
        voice: Some("Kore".to_string()),
        system_instruction: Some("You are Dak-Mitra.".to_string()),
        output_transcription: false,
        ..Default::default()
    };
    let client = open_client(&mock, config).await;
    assert!(client.is_ready());

    let received = mock.received();
    let setup = &received[0]["setup"];
    assert_eq!(
        setup["model"],
        "models/gemini-2.5-flash-native-audio-preview-09-2025"
    );
    assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
    assert_eq!(
        setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
        "Kore"
    );
    assert_eq!(
        setup["systemInstruction"]["parts"][0]["text"],
        "You are Dak-Mitra."
    );
    assert!(setup["inputAudioTranscription"].is_object());
    assert!(setup.get("outputAudioTranscription").is_none());

    assert_eq!(mock.last_query().as_deref(), Some("key=test-key"));
}

#[tokio::test]
async fn test_unknown_voice_falls_back_to_default() {
    let mock = spawn_gemini_mock(GeminiMockConfig::default()).await;

    let config = TransportConfig {
        voice: Some("Nonexistent".to_string()),
        ..Default::default()
    };
    let _client = open_client(&mock, config).await;

    let received = mock.received();
    assert_eq!(
        received[0]["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
            ["prebuiltVoiceConfig"]["voiceName"],
        "Zephyr"
    );
}

#[tokio::test]
async fn test_audio_chunks_are_sent_as_realtime_input() {
    let mock = spawn_gemini_mock(GeminiMockConfig::default()).await;
    let client = open_client(&mock, TransportConfig::default()).await;

    let samples = sine_i16(512, 220.0, 0.3, CAPTURE_RATE);
    let frame = AudioFrame::new(samples.clone(), CAPTURE_RATE, 1).unwrap();
    let sender = client.sender();
    sender.send(codec::encode(&frame));
    sender.send(codec::encode(&frame));

    assert!(mock.wait_for_inputs(2, WAIT).await);
    let inputs = mock.realtime_inputs();
    let audio = &inputs[0]["realtimeInput"]["audio"];
    assert_eq!(audio["mimeType"], "audio/pcm;rate=16000");

    let data = base64::engine::general_purpose::STANDARD
        .decode(audio["data"].as_str().unwrap())
        .unwrap();
    assert_eq!(bytes_to_samples(&data), samples);
}

#[tokio::test]
async fn test_server_content_maps_to_ordered_events() {
    let mock = spawn_gemini_mock(GeminiMockConfig::default()).await;
    let mut client = open_client(&mock, TransportConfig::default()).await;
    let mut events = client.events().unwrap();

    let pcm = samples_to_bytes(&[1, 2, 3, 4]);
    assert!(mock.send_json(transcript_message(true, "Where is my parcel?")));
    assert!(mock.send_json_binary(audio_message(&pcm)));
    assert!(mock.send_json(transcript_message(false, "Let me check.")));
    assert!(mock.send_json(interrupted_message()));
    assert!(mock.send_json(turn_complete_message()));

    assert_eq!(
        next_event(&mut events).await,
        InboundEvent::TranscriptDelta {
            speaker: Speaker::User,
            text: "Where is my parcel?".to_string()
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        InboundEvent::AudioDelta(bytes::Bytes::from(pcm))
    );
    assert_eq!(
        next_event(&mut events).await,
        InboundEvent::TranscriptDelta {
            speaker: Speaker::Agent,
            text: "Let me check.".to_string()
        }
    );
    assert_eq!(next_event(&mut events).await, InboundEvent::Interrupted);
    assert_eq!(next_event(&mut events).await, InboundEvent::TurnComplete);
}

#[tokio::test]
async fn test_unparseable_frames_are_skipped() {
    let mock = spawn_gemini_mock(GeminiMockConfig::default()).await;
    let mut client = open_client(&mock, TransportConfig::default()).await;
    let mut events = client.events().unwrap();

    assert!(mock.send_json(serde_json::json!({ "serverContent": "not an object" })));
    assert!(mock.send_json(turn_complete_message()));

    assert_eq!(next_event(&mut events).await, InboundEvent::TurnComplete);
}

#[tokio::test]
async fn test_abnormal_close_emits_error_then_closed() {
    let mock = spawn_gemini_mock(GeminiMockConfig::default()).await;
    let mut client = open_client(&mock, TransportConfig::default()).await;
    let mut events = client.events().unwrap();

    assert!(mock.close_with(1011, "internal error"));

    match next_event(&mut events).await {
        InboundEvent::Error(reason) => assert!(reason.contains("1011")),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(next_event(&mut events).await, InboundEvent::Closed);
}

#[tokio::test]
async fn test_normal_close_emits_closed() {
    let mock = spawn_gemini_mock(GeminiMockConfig::default()).await;
    let mut client = open_client(&mock, TransportConfig::default()).await;
    let mut events = client.events().unwrap();

    assert!(mock.close_with(1000, "bye"));
    assert_eq!(next_event(&mut events).await, InboundEvent::Closed);
}

#[tokio::test]
async fn test_local_close_is_quiet() {
    let mock = spawn_gemini_mock(GeminiMockConfig::default()).await;
    let mut client = open_client(&mock, TransportConfig::default()).await;
    let mut events = client.events().unwrap();
    let sender = client.sender();

    client.close().await.unwrap();
    assert!(!client.is_ready());

    // The stream ends without Error or Closed
    let next = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
    assert_eq!(next, None);

    // Sends after close are silent no-ops
    let frame = AudioFrame::new(vec![0; 16], CAPTURE_RATE, 1).unwrap();
    sender.send(codec::encode(&frame));
    assert!(mock.wait_for_disconnect(WAIT).await);
    assert!(mock.realtime_inputs().is_empty());
}

#[tokio::test]
async fn test_rejected_upgrade_is_authentication_failure() {
    let mock = spawn_gemini_mock(GeminiMockConfig {
        reject_status: Some(401),
        ..Default::default()
    })
    .await;

    let mut client = GeminiLive::with_endpoint("bad-key".to_string(), mock.url()).unwrap();
    let err = client.open(TransportConfig::default()).await.unwrap_err();
    assert!(matches!(err, TransportError::AuthenticationFailed(_)));
    assert!(!client.is_ready());
}

#[tokio::test]
async fn test_setup_rejection_fails_open() {
    let mock = spawn_gemini_mock(GeminiMockConfig {
        setup_reply: SetupReply::Close(1008, "unsupported model".to_string()),
        ..Default::default()
    })
    .await;

    let mut client = GeminiLive::with_endpoint("test-key".to_string(), mock.url()).unwrap();
    let err = client.open(TransportConfig::default()).await.unwrap_err();
    match err {
        TransportError::ConnectionFailed(reason) => assert!(reason.contains("1008")),
        other => panic!("expected connection failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_session_over_gemini_mock() {
    let mock = spawn_gemini_mock(GeminiMockConfig::default()).await;

    let mic = ManualMicrophone::new();
    let output = ManualOutput::new(PLAYBACK_RATE);
    let session = VoiceSession::new(
        SessionConfig::default(),
        Arc::new(GeminiLiveFactory::new("test-key".to_string()).with_endpoint(mock.url())),
        Arc::new(mic.clone()),
        Arc::new(output.provider()),
    );

    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Active);

    // One 32 ms frame from the microphone reaches the agent
    assert!(mic.push(mic_block(512, 0.25)));
    assert!(mock.wait_for_inputs(1, WAIT).await);

    // Agent audio is scheduled on the output clock
    let pcm = agent_audio(Duration::from_millis(40));
    assert!(mock.send_json(audio_message(&pcm)));
    assert!(mock.send_json(transcript_message(false, "Namaste")));

    let mut transcript = session.watch_transcript();
    tokio::time::timeout(WAIT, transcript.wait_for(|t| t.agent == "Namaste"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output.scheduled().len(), 1);
    assert_eq!(output.scheduled()[0].duration, Duration::from_millis(40));

    session.stop().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert!(mock.wait_for_disconnect(WAIT).await);
    assert!(!mic.is_open());
}

#[tokio::test]
async fn test_session_ends_when_agent_drops_channel() {
    let mock = spawn_gemini_mock(GeminiMockConfig::default()).await;

    let mic = ManualMicrophone::new();
    let output = ManualOutput::new(PLAYBACK_RATE);
    let session = VoiceSession::new(
        SessionConfig::default(),
        Arc::new(GeminiLiveFactory::new("test-key".to_string()).with_endpoint(mock.url())),
        Arc::new(mic.clone()),
        Arc::new(output.provider()),
    );
    let mut notices = session.notices();

    session.start().await.unwrap();
    assert!(mock.close_with(1011, "backend unavailable"));

    let mut state = session.watch_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == SessionState::Idle))
        .await
        .unwrap()
        .unwrap();

    let notice = tokio::time::timeout(WAIT, notices.recv()).await.unwrap().unwrap();
    assert!(matches!(
        notice,
        waav_live::SessionNotice::Fatal(waav_live::SessionError::Transport(_))
    ));
    assert!(!mic.is_open());
    assert!(output.is_closed());
}
