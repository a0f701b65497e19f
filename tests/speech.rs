//! Speech output integration tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use lotus_avatar::completion::CompletionClient;
use lotus_avatar::speech::segment;
use lotus_avatar::{
    Activity, Avatar, Config, Error, FilePreferenceStore, SpeakOptions, Viseme, Voice, VoicePreferences,
};
use tokio_test::{assert_pending, assert_ready_ok, task};
use tokio_util::sync::CancellationToken;

use common::{ScriptedCompletion, fast_engine, harness};

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[test]
fn test_segmenting_to_exhaustion_keeps_every_word() {
    let text = "Sure! Here is the plan, step by step; first we gather the \
                ingredients, then we cook them slowly over a low flame until \
                everything smells wonderful and the kitchen feels warm and \
                then finally we eat";

    let mut spoken = Vec::new();
    let mut remaining = text.to_string();
    loop {
        let pass = segment(&remaining);
        if !pass.has_ready() {
            break;
        }
        spoken.push(pass.ready_text);
        remaining = pass.remaining_text;
    }
    spoken.push(remaining);

    assert!(spoken.len() > 2);
    assert_eq!(collapse(&spoken.join(" ")), collapse(text));
}

#[tokio::test(start_paused = true)]
async fn test_newer_speech_preempts_older() {
    let h = harness();
    let speaker = h.avatar.speaker();

    let first = tokio::spawn({
        let speaker = Arc::clone(&speaker);
        async move {
            speaker
                .speak("A rather long first sentence.", SpeakOptions::default())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    speaker
        .speak("Second.", SpeakOptions::default())
        .await
        .unwrap();

    assert!(matches!(first.await.unwrap(), Err(Error::Interrupted)));
    assert_eq!(h.engine.spoken(), vec!["A rather long first sentence.", "Second."]);
    assert_eq!(h.engine.max_concurrent(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_queue_plays_one_chunk_at_a_time() {
    let h = harness();

    let tickets: Vec<_> = ["One.", "Two words.", "Three little words."]
        .into_iter()
        .map(|text| h.avatar.say(text))
        .collect();
    for ticket in tickets {
        ticket.await.unwrap();
    }

    assert_eq!(
        h.engine.spoken(),
        vec!["One.", "Two words.", "Three little words."]
    );
    assert_eq!(h.engine.max_concurrent(), 1);
    assert!(h.avatar.queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ticket_resolves_when_spoken() {
    let h = harness();

    assert_ready_ok!(task::spawn(h.avatar.say("   ")).poll());

    let mut ticket = task::spawn(h.avatar.say("Wait for it."));
    assert_pending!(ticket.poll());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(ticket.is_woken());
    assert_ready_ok!(ticket.poll());
}

#[tokio::test(start_paused = true)]
async fn test_waiting_duplicates_collapse() {
    let h = harness();

    let first = h.avatar.say("Opening line.");
    let same = h.avatar.say("Same sentence.");
    assert_eq!(h.avatar.queue().len(), 2);

    let duplicate = h.avatar.say("  Same   sentence. ");
    assert_eq!(h.avatar.queue().len(), 2);
    duplicate.await.unwrap();

    first.await.unwrap();
    same.await.unwrap();
    assert_eq!(h.engine.spoken(), vec!["Opening line.", "Same sentence."]);
}

#[tokio::test(start_paused = true)]
async fn test_emergency_stop_silences_everything() {
    let h = harness();
    let avatar = &h.avatar;

    let playing = avatar.say("One two three four.");
    let waiting_a = avatar.say("Never heard.");
    let waiting_b = avatar.say("Also never heard.");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(avatar.signal().activity(), Activity::Speaking);

    avatar.emergency_stop();

    assert!(matches!(playing.await, Err(Error::Aborted)));
    assert!(matches!(waiting_a.await, Err(Error::QueueCleared)));
    assert!(matches!(waiting_b.await, Err(Error::QueueCleared)));

    assert!(avatar.queue().is_empty());
    assert!(!avatar.queue().is_processing());
    assert!(!avatar.speaker().is_speaking());
    assert_eq!(avatar.signal().activity(), Activity::Idle);
    assert_eq!(avatar.signal().viseme(), Viseme::Sil);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.engine.spoken(), vec!["One two three four."]);

    // The queue accepts new work straight away
    avatar.say("Back again.").await.unwrap();
    assert_eq!(h.engine.spoken().last().map(String::as_str), Some("Back again."));
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_silences_work_in_progress() {
    let h = harness();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = stop.send(());
    });

    let ticket = h.avatar.say("This sentence takes well over a second to say.");
    let _queued = h.avatar.say("Nobody hears this one.");
    let outcome = h.avatar.until_interrupted(ticket, stopped).await;

    assert!(outcome.is_none());
    assert!(h.avatar.queue().is_empty());
    assert!(!h.avatar.speaker().is_speaking());
    assert_eq!(h.avatar.signal().activity(), Activity::Idle);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
        h.engine.spoken(),
        vec!["This sentence takes well over a second to say."]
    );
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_cuts_off_streamed_reply() {
    let h = harness();
    let client = Arc::new(
        ScriptedCompletion::replying(&["One sentence now. ", "Another one later."])
            .with_delay(Duration::from_millis(300)),
    );
    let session = h.avatar.session(client);
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = stop.send(());
    });

    let outcome = h
        .avatar
        .until_interrupted(session.respond("Tell me something"), stopped)
        .await;

    assert!(outcome.is_none());
    assert!(h.avatar.queue().is_empty());
    assert_eq!(h.avatar.signal().activity(), Activity::Idle);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!h.engine.spoken().iter().any(|s| s.starts_with("Another")));
}

#[tokio::test(start_paused = true)]
async fn test_uninterrupted_work_completes() {
    let h = harness();
    let outcome = h
        .avatar
        .until_interrupted(h.avatar.say("Short."), std::future::pending::<()>())
        .await;
    assert!(matches!(outcome, Some(Ok(()))));
    assert_eq!(h.engine.spoken(), vec!["Short."]);
}

#[tokio::test(start_paused = true)]
async fn test_streamed_reply_flushes_sentences() {
    let h = harness();
    let streaming = h.avatar.streaming();
    streaming.start(&CancellationToken::new());

    let full = [
        "Hello ",
        "Hello world. ",
        "Hello world. This is a t",
        "Hello world. This is a test.",
    ];
    let mut queued = Vec::new();
    let mut previous = "";
    for text in full {
        queued.extend(streaming.push(&text[previous.len()..], text));
        previous = text;
    }
    let completion = streaming.finish();

    assert_eq!(queued, vec!["Hello world.", "This is a test."]);
    assert_eq!(completion.chunks(), 2);
    completion.wait().await.unwrap();
    assert_eq!(h.engine.spoken(), vec!["Hello world.", "This is a test."]);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_stream_reports_abort() {
    let h = harness();
    let client = ScriptedCompletion::replying(&[
        "First sentence here. ",
        "Second sentence here. ",
        "Third sentence here.",
    ])
    .with_delay(Duration::from_millis(400));
    let deltas = client.stream(&[]).await.unwrap();

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let streaming = h.avatar.streaming().clone();
        let cancel = cancel.clone();
        async move { streaming.speak_stream(deltas, cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();

    let outcome = task.await.unwrap().unwrap();
    assert!(outcome.aborted);
    assert_eq!(outcome.text, "First sentence here. ");
    assert!(!h.avatar.streaming().is_streaming());
    assert!(h.avatar.queue().is_empty());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!h.engine.spoken().iter().any(|s| s.starts_with("Second")));
}

#[tokio::test(start_paused = true)]
async fn test_signal_follows_playback() {
    let h = harness();
    let mut activity = h.avatar.signal().subscribe_activity();

    let ticket = h.avatar.say("Watch my mouth move.");
    activity.changed().await.unwrap();
    assert_eq!(*activity.borrow_and_update(), Activity::Speaking);

    ticket.await.unwrap();
    assert_eq!(h.avatar.signal().activity(), Activity::Idle);
    assert_eq!(h.avatar.signal().viseme(), Viseme::Sil);
}

#[tokio::test]
async fn test_voice_preferences_persist_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FilePreferenceStore::in_dir(dir.path()));
    let chosen = VoicePreferences {
        rate: 1.25,
        volume: 0.6,
        ..VoicePreferences::default()
    };

    let avatar = Avatar::builder(Config::default())
        .engine(Arc::new(fast_engine()))
        .preferences(Arc::clone(&store) as _)
        .build()
        .unwrap();
    avatar.set_voice_preferences(chosen.clone()).unwrap();
    drop(avatar);

    let restarted = Avatar::builder(Config::default())
        .engine(Arc::new(fast_engine()))
        .preferences(store)
        .build()
        .unwrap();
    assert_eq!(restarted.voice_preferences(), chosen);
}

#[tokio::test]
async fn test_voices_offered_in_display_order() {
    let engine = fast_engine().with_voices(vec![
        Voice::new("uk-male", "Google UK English Male", "en-GB"),
        Voice::new("daniel", "Daniel", "en-GB"),
        Voice::new("samantha", "Samantha", "en-US"),
        Voice::new("amelie", "Amelie", "fr-CA"),
        Voice::new("uk-female", "Google UK English Female", "en-GB"),
    ]);
    let avatar = Avatar::builder(Config::default())
        .engine(Arc::new(engine))
        .build()
        .unwrap();

    let ids: Vec<_> = avatar.voices().into_iter().map(|v| v.id).collect();
    assert_eq!(ids, vec!["samantha", "uk-female", "uk-male", "daniel"]);
}
