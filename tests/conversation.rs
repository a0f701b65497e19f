//! Conversation mode and reply session tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lotus_avatar::completion::{ChatMessage, Role};
use lotus_avatar::conversation::{ConversationEvent, NEWS_INSTRUCTION, NewsRetriever};
use lotus_avatar::voice::WakeState;
use lotus_avatar::{Avatar, Config, Error, Result, SpeechRecognizer};
use tokio::sync::broadcast;

use common::{ScriptedCompletion, fast_engine, harness, settle};

fn drain(rx: &mut broadcast::Receiver<ConversationEvent>) -> Vec<ConversationEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_mode_start_opens_microphone_and_recognizer() {
    let h = harness();
    let orchestrator = h.avatar.orchestrator();
    let mut events = orchestrator.subscribe();

    orchestrator.start_conversation_mode().await.unwrap();
    settle().await;

    let state = orchestrator.state();
    assert!(state.is_conversation_mode);
    assert!(state.is_listening);
    assert!(!state.is_speaking);
    assert_eq!(h.microphone.open_count(), 1);
    assert_eq!(h.recognizer.start_count(), 1);
    assert_eq!(h.avatar.gate().state(), WakeState::Listening);
    assert_eq!(
        drain(&mut events),
        vec![ConversationEvent::ModeChanged { enabled: true }]
    );

    // Starting again changes nothing
    orchestrator.start_conversation_mode().await.unwrap();
    assert_eq!(h.microphone.open_count(), 1);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_recognizer_paused_while_speaking() {
    let h = harness();
    let orchestrator = h.avatar.orchestrator();
    orchestrator.start_conversation_mode().await.unwrap();

    let ticket = h.avatar.say("Hello there friend.");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!h.recognizer.is_listening());
    assert!(orchestrator.state().is_speaking);
    assert!(!orchestrator.state().is_listening);

    ticket.await.unwrap();
    assert!(!orchestrator.state().is_speaking);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!h.recognizer.is_listening());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.recognizer.is_listening());
    assert!(orchestrator.state().is_listening);
    assert_eq!(h.recognizer.start_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_speech_resumes_once() {
    let h = harness();
    let orchestrator = h.avatar.orchestrator();
    orchestrator.start_conversation_mode().await.unwrap();

    let first = h.avatar.say("First part.");
    let second = h.avatar.say("Second part.");
    first.await.unwrap();
    second.await.unwrap();
    assert_eq!(h.recognizer.start_count(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(h.recognizer.is_listening());
    assert_eq!(h.recognizer.start_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_user_barge_in_stops_speech() {
    let h = harness();
    let orchestrator = h.avatar.orchestrator();
    orchestrator.start_conversation_mode().await.unwrap();
    let mut events = orchestrator.subscribe();

    let playing = h.avatar.say("one two three four five six seven eight nine ten.");
    let waiting = h.avatar.say("This should never be heard.");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(orchestrator.state().is_speaking);

    h.microphone.set_level(0.5);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        drain(&mut events),
        vec![
            ConversationEvent::UserSpeechStarted,
            ConversationEvent::Interrupted,
        ]
    );
    assert!(matches!(playing.await, Err(Error::Aborted)));
    assert!(matches!(waiting.await, Err(Error::QueueCleared)));
    assert!(!orchestrator.state().is_speaking);
    assert!(h.avatar.queue().is_empty());
    assert!(h.recognizer.is_listening());

    h.microphone.set_level(0.0);
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(drain(&mut events), vec![ConversationEvent::UserSpeechEnded]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        h.engine.spoken(),
        vec!["one two three four five six seven eight nine ten."]
    );
}

#[tokio::test(start_paused = true)]
async fn test_user_speech_while_silent_only_reports() {
    let h = harness();
    let orchestrator = h.avatar.orchestrator();
    orchestrator.start_conversation_mode().await.unwrap();
    let mut events = orchestrator.subscribe();

    h.microphone.set_level(0.5);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(drain(&mut events), vec![ConversationEvent::UserSpeechStarted]);
    assert_eq!(h.engine.cancel_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_denied_recognizer_rolls_back() {
    let h = harness();
    h.recognizer.deny_permission();
    let orchestrator = h.avatar.orchestrator();
    let mut events = orchestrator.subscribe();

    let result = orchestrator.start_conversation_mode().await;
    assert!(matches!(result, Err(Error::Permission(_))));

    let state = orchestrator.state();
    assert!(!state.is_conversation_mode);
    assert!(!state.is_listening);
    assert_eq!(h.microphone.open_count(), 1);
    assert_eq!(h.microphone.close_count(), 1);

    let events = drain(&mut events);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        ConversationEvent::Error { message } if message.starts_with("permission denied")
    ));
}

#[tokio::test(start_paused = true)]
async fn test_denied_microphone_rolls_back() {
    let h = harness();
    h.microphone.deny_permission();
    let orchestrator = h.avatar.orchestrator();

    let result = orchestrator.start_conversation_mode().await;
    assert!(matches!(result, Err(Error::Permission(_))));
    assert!(!orchestrator.state().is_conversation_mode);
    assert_eq!(h.recognizer.start_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transcripts_flow_through_wake_gate() {
    let h = harness();
    let orchestrator = h.avatar.orchestrator();
    orchestrator.start_conversation_mode().await.unwrap();
    let mut events = orchestrator.subscribe();

    assert!(h.recognizer.inject_final("what time is it"));
    settle().await;
    assert!(drain(&mut events).is_empty());

    assert!(h.recognizer.inject_final("Hi Lotus"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.avatar.gate().state(), WakeState::Active);
    assert_eq!(h.engine.spoken(), vec!["Hi Dear"]);
    assert!(h.recognizer.is_listening());
    drain(&mut events);

    assert!(h.recognizer.inject_interim("what time"));
    assert!(h.recognizer.inject_final("what time is it"));
    settle().await;

    assert_eq!(
        drain(&mut events),
        vec![
            ConversationEvent::Interim {
                text: "what time".to_string()
            },
            ConversationEvent::UserQuery {
                text: "what time is it".to_string()
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_routine_recognizer_codes_stay_quiet() {
    let h = harness();
    let orchestrator = h.avatar.orchestrator();
    orchestrator.start_conversation_mode().await.unwrap();
    let mut events = orchestrator.subscribe();

    h.recognizer.inject_error("no-speech");
    h.recognizer.inject_error("aborted");
    h.recognizer.inject_error("network");
    settle().await;

    assert_eq!(
        drain(&mut events),
        vec![ConversationEvent::Error {
            message: "Network error occurred. Please check your connection.".to_string()
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_mode_releases_everything() {
    let h = harness();
    let orchestrator = h.avatar.orchestrator();
    orchestrator.start_conversation_mode().await.unwrap();
    let mut events = orchestrator.subscribe();

    let ticket = h.avatar.say("Talking while we shut down.");
    tokio::time::sleep(Duration::from_millis(50)).await;

    orchestrator.stop_conversation_mode().await;
    assert!(ticket.await.is_err());

    let state = orchestrator.state();
    assert!(!state.is_conversation_mode);
    assert!(!state.is_listening);
    assert!(!state.is_speaking);
    assert!(!h.recognizer.is_listening());
    assert_eq!(h.microphone.close_count(), 1);
    assert!(!h.avatar.gate().timer_armed());
    assert!(drain(&mut events).contains(&ConversationEvent::ModeChanged { enabled: false }));

    // Nothing restarts listening once the mode is off
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!h.recognizer.is_listening());
}

#[tokio::test(start_paused = true)]
async fn test_emergency_stop_when_idle_is_harmless() {
    let h = harness();
    h.avatar.emergency_stop();
    h.avatar.emergency_stop();
    assert!(!h.avatar.orchestrator().state().is_speaking);
    h.avatar.say("Still works.").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_emergency_stop_clears_inactivity_timer() {
    let h = harness();
    let orchestrator = h.avatar.orchestrator();
    orchestrator.start_conversation_mode().await.unwrap();
    assert!(h.avatar.gate().timer_armed());

    h.avatar.emergency_stop();
    assert!(!h.avatar.gate().timer_armed());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.avatar.gate().state(), WakeState::Listening);
    assert!(h.engine.spoken().is_empty());

    // The next transcript arms it again
    assert!(h.recognizer.inject_final("what time is it"));
    settle().await;
    assert!(h.avatar.gate().timer_armed());
}

struct StaticNews(Vec<String>);

#[async_trait]
impl NewsRetriever for StaticNews {
    async fn retrieve(&self, _query: &str) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

struct BrokenNews;

#[async_trait]
impl NewsRetriever for BrokenNews {
    async fn retrieve(&self, _query: &str) -> Result<Vec<String>> {
        Err(Error::Completion("index offline".to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_reply_is_spoken_and_remembered() {
    let h = harness();
    let client = ScriptedCompletion::replying(&["Hello world. ", "This is a test."]);
    let session = h.avatar.session(Arc::new(client.clone()));

    let reply = session.respond("  hi there ").await.unwrap();
    assert!(!reply.aborted);
    assert_eq!(reply.text, "Hello world. This is a test.");
    reply.completion.wait().await.unwrap();
    assert_eq!(h.engine.spoken(), vec!["Hello world.", "This is a test."]);

    let history = session.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].user, "hi there");

    let _ = session.respond("and again").await.unwrap();
    let requests = client.requests();
    assert_eq!(requests[0], vec![ChatMessage::user("hi there")]);
    assert_eq!(
        requests[1],
        vec![
            ChatMessage::user("hi there"),
            ChatMessage::assistant("Hello world. This is a test."),
            ChatMessage::user("and again"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_history_is_capped() {
    let h = harness();
    let client = ScriptedCompletion::replying(&["Sure."]);
    let session = h
        .avatar
        .session(Arc::new(client))
        .with_history_limit(2);

    for question in ["one", "two", "three"] {
        let reply = session.respond(question).await.unwrap();
        reply.completion.wait().await.unwrap();
    }

    let users: Vec<_> = session.history().into_iter().map(|e| e.user).collect();
    assert_eq!(users, vec!["two", "three"]);

    session.clear_history();
    assert!(session.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_configured_system_prompt_leads() {
    let mut config = Config::default();
    config.completion.system_prompt = Some("You are Lotus.".to_string());
    let avatar = Avatar::builder(config)
        .engine(Arc::new(fast_engine()))
        .build()
        .unwrap();
    let client = ScriptedCompletion::replying(&["Hi."]);
    let session = avatar.session(Arc::new(client.clone()));

    let _ = session.respond("hello").await.unwrap();
    assert_eq!(
        client.requests()[0],
        vec![ChatMessage::system("You are Lotus."), ChatMessage::user("hello")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_news_context_precedes_history() {
    let h = harness();
    let client = ScriptedCompletion::replying(&["Rates held."]);
    let news = StaticNews(vec![
        "The central bank held rates.".to_string(),
        "   ".to_string(),
        "Markets rose.".to_string(),
    ]);
    let session = h
        .avatar
        .session(Arc::new(client.clone()))
        .with_news(Arc::new(news));

    let _ = session.respond("any news?").await.unwrap();
    let messages = &client.requests()[0];
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(
        messages[0].content,
        format!("{NEWS_INSTRUCTION}The central bank held rates.\nMarkets rose.")
    );
    assert_eq!(messages[1], ChatMessage::user("any news?"));
}

#[tokio::test(start_paused = true)]
async fn test_news_failure_does_not_block_reply() {
    let h = harness();
    let client = ScriptedCompletion::replying(&["Okay."]);
    let session = h
        .avatar
        .session(Arc::new(client.clone()))
        .with_news(Arc::new(BrokenNews));

    let reply = session.respond("hello").await.unwrap();
    assert_eq!(reply.text, "Okay.");
    assert_eq!(client.requests()[0], vec![ChatMessage::user("hello")]);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_request_propagates() {
    let h = harness();
    let client = ScriptedCompletion::replying(&["Unused."]);
    client.fail_requests();
    let session = h.avatar.session(Arc::new(client));

    let result = session.respond("hello").await;
    assert!(matches!(result, Err(Error::Completion(_))));
    assert!(!h.avatar.streaming().is_streaming());
    assert!(session.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_broken_stream_aborts_speech() {
    let h = harness();
    let client = ScriptedCompletion::replying(&["Hello there. ", "And more "]).failing_midway();
    let session = h.avatar.session(Arc::new(client));

    let result = session.respond("hello").await;
    assert!(matches!(result, Err(Error::Completion(_))));
    assert!(!h.avatar.streaming().is_streaming());
    assert!(h.avatar.queue().is_empty());
    assert!(session.history().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!h.avatar.speaker().is_speaking());
}

#[tokio::test(start_paused = true)]
async fn test_new_query_preempts_reply() {
    let h = harness();
    let client = ScriptedCompletion::replying(&["A slow answer. ", "Still going."])
        .with_delay(Duration::from_millis(300));
    let session = Arc::new(h.avatar.session(Arc::new(client)));

    let first = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.respond("first question").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = session.respond("second question").await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert!(first.aborted);
    assert!(!second.aborted);
    second.completion.wait().await.unwrap();

    let users: Vec<_> = session.history().into_iter().map(|e| e.user).collect();
    assert_eq!(users, vec!["second question"]);
    assert_eq!(h.engine.spoken(), vec!["A slow answer.", "Still going."]);
}
