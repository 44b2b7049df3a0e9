//! Integration tests for the streaming audio source.
//!
//! Drives a `StreamingSource` over the in-memory decode backend and reads
//! frames the way the transport's send loop does.

mod common;

use common::*;

fn spawn_source(backend: &MemoryBackend) -> (StreamingSource, EventBus) {
    let bus = EventBus::new();
    let source = StreamingSource::spawn(backend, bus.clone(), GUILD).unwrap();
    (source, bus)
}

fn audio_count(frames: &[Frame]) -> usize {
    frames.iter().filter(|frame| frame.is_audio()).count()
}

/// A fresh source is paused and idle: silence, even with something queued.
#[tokio::test]
async fn test_fresh_source_is_silent() {
    let backend = MemoryBackend::new(10);
    let (mut source, _bus) = spawn_source(&backend);

    assert_eq!(source.player_state(), PlayerState::Idle);
    assert_eq!(source.read(), Frame::Silence);

    source.queue("track:abc123");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(source.read(), Frame::Silence);
    assert!(backend.loads().is_empty());
    assert_eq!(source.queued(), vec![TrackHandle::new("abc123")]);
}

/// Queue then resume: audio arrives, always in full output frames.
#[tokio::test]
async fn test_queue_and_resume_plays_audio() {
    let backend = MemoryBackend::new(20);
    let (mut source, _bus) = spawn_source(&backend);

    source.queue("track:abc123");
    source.resume();

    let frames = read_until(|| source.read(), Frame::is_audio).await;
    let Some(Frame::Audio(bytes)) = frames.last() else {
        panic!("expected audio");
    };
    assert_eq!(bytes.len(), OUTPUT_FRAME_BYTES);
    assert!(bytes.iter().any(|b| *b != 0));

    assert_eq!(backend.loads(), vec!["abc123".to_string()]);
    assert_eq!(source.loaded(), Some(TrackHandle::new("abc123")));
    assert_eq!(source.player_state(), PlayerState::Loaded);
}

/// Every frame is either a full output frame, silence or end.
#[tokio::test]
async fn test_frames_are_always_full() {
    let backend = MemoryBackend::new(5);
    let (mut source, _bus) = spawn_source(&backend);

    source.queue("track:a");
    source.resume();

    let frames = read_until(|| source.read(), |frame| *frame == Frame::End).await;
    for frame in frames {
        match frame {
            Frame::Audio(bytes) => assert_eq!(bytes.len(), OUTPUT_FRAME_BYTES),
            Frame::Silence | Frame::End => {}
        }
    }
}

/// The playlist advances on its own and the last track's tail is played out.
#[tokio::test]
async fn test_auto_advance_and_drain() {
    let backend = MemoryBackend::new(3);
    let (mut source, bus) = spawn_source(&backend);
    let mut events = bus.subscribe();

    source.queue("track:a");
    source.queue("musicsvc:track:b");
    source.resume();

    let frames = read_until(|| source.read(), |frame| *frame == Frame::End).await;

    // Every decoded frame made it out
    assert_eq!(audio_count(&frames), 6);
    assert_eq!(backend.loads(), vec!["a".to_string(), "b".to_string()]);

    // Back to idle silence afterwards
    assert_eq!(source.player_state(), PlayerState::Idle);
    assert_eq!(source.loaded(), None);
    assert_eq!(source.read(), Frame::Silence);

    let events = drain_events(&mut events);
    assert!(events.contains(&VoiceEvent::TrackStarted {
        guild: GUILD,
        track: "track:b".to_string(),
    }));
    assert!(events.contains(&VoiceEvent::PlaylistEnded { guild: GUILD }));
}

/// Queueing while the last track drains picks up without a gap.
#[tokio::test]
async fn test_queue_while_draining() {
    let backend = MemoryBackend::new(2);
    let (mut source, _bus) = spawn_source(&backend);

    source.queue("track:a");
    source.resume();
    wait_until(|| source.player_state() == PlayerState::Draining).await;

    source.queue("track:b");
    wait_until(|| source.loaded() == Some(TrackHandle::new("b"))).await;
    assert_eq!(source.player_state(), PlayerState::Loaded);

    let frames = read_until(|| source.read(), |frame| *frame == Frame::End).await;
    assert_eq!(audio_count(&frames), 4);
}

#[tokio::test]
async fn test_pause_silences_immediately() {
    let backend = MemoryBackend::new(40);
    let (mut source, _bus) = spawn_source(&backend);

    source.queue("track:a");
    source.resume();
    read_until(|| source.read(), Frame::is_audio).await;

    source.pause();
    assert_eq!(source.read(), Frame::Silence);
    assert_eq!(source.current(), Some("track:a (paused)".to_string()));

    source.resume();
    read_until(|| source.read(), Frame::is_audio).await;
    assert_eq!(source.current(), Some("track:a".to_string()));
}

#[tokio::test]
async fn test_skip() {
    let backend = MemoryBackend::new(1000);
    let (mut source, _bus) = spawn_source(&backend);

    source.queue("track:a");
    source.queue("track:b");
    source.queue("track:c");
    source.resume();
    wait_until(|| source.loaded() == Some(TrackHandle::new("a"))).await;
    assert_eq!(source.current(), Some("track:a, 2 more queued".to_string()));

    source.skip(1);
    wait_until(|| source.loaded() == Some(TrackHandle::new("b"))).await;
    assert_eq!(source.queued(), vec![TrackHandle::new("c")]);

    // Skipping past the end empties the playlist
    source.skip(5);
    wait_until(|| source.player_state() == PlayerState::Idle).await;
    assert_eq!(source.loaded(), None);
    assert!(source.queued().is_empty());
    assert_eq!(source.read(), Frame::Silence);
}

#[tokio::test]
async fn test_skip_zero_is_noop() {
    let backend = MemoryBackend::new(1000);
    let (mut source, _bus) = spawn_source(&backend);

    source.queue("track:a");
    source.resume();
    wait_until(|| source.loaded().is_some()).await;

    source.skip(0);
    source.previous(0);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(backend.loads(), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_previous_replays_history() {
    let backend = MemoryBackend::new(1000);
    let (mut source, _bus) = spawn_source(&backend);

    source.queue("track:a");
    source.queue("track:b");
    source.resume();
    wait_until(|| source.loaded() == Some(TrackHandle::new("a"))).await;

    source.skip(1);
    wait_until(|| source.loaded() == Some(TrackHandle::new("b"))).await;

    source.previous(1);
    wait_until(|| source.loaded() == Some(TrackHandle::new("a"))).await;

    // The interrupted track goes back to the front of the playlist
    assert_eq!(source.queued(), vec![TrackHandle::new("b")]);
    assert_eq!(
        backend.loads(),
        vec!["a".to_string(), "b".to_string(), "a".to_string()]
    );
}

/// The finish of a restarted track must not advance the playlist once the
/// same track has been loaded again.
#[tokio::test]
async fn test_restart_ignores_finish_of_earlier_load() {
    let backend = MemoryBackend::new(60);
    let (mut source, _bus) = spawn_source(&backend);

    source.queue("track:a");
    source.queue("track:b");
    source.resume();
    wait_until(|| source.loaded() == Some(TrackHandle::new("a"))).await;

    // Let the pipe fill up, then empty it in one go so the rest of the
    // track is written and finishes while `previous` is pending
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    for _ in 0..50 {
        source.read();
    }
    source.previous(1);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(backend.loads(), vec!["a".to_string(), "a".to_string()]);
    assert_eq!(source.loaded(), Some(TrackHandle::new("a")));
    assert_eq!(source.queued(), vec![TrackHandle::new("b")]);
}

#[tokio::test]
async fn test_previous_without_history_restarts_current() {
    let backend = MemoryBackend::new(1000);
    let (mut source, _bus) = spawn_source(&backend);

    source.queue("track:a");
    source.resume();
    wait_until(|| source.loaded().is_some()).await;

    source.previous(3);
    wait_until(|| backend.loads().len() == 2).await;

    assert_eq!(backend.loads(), vec!["a".to_string(), "a".to_string()]);
    assert!(source.queued().is_empty());
}

#[tokio::test]
async fn test_unrecognized_items_are_ignored() {
    let backend = MemoryBackend::new(10);
    let (mut source, _bus) = spawn_source(&backend);

    source.queue("never gonna give you up");
    source.queue("album:abc123");

    assert!(source.queued().is_empty());
}

/// `stop` is terminal: silence afterwards, and it can be repeated.
#[tokio::test]
async fn test_stop() {
    let backend = MemoryBackend::new(1000);
    let (mut source, _bus) = spawn_source(&backend);

    source.queue("track:a");
    source.resume();
    read_until(|| source.read(), Frame::is_audio).await;

    source.stop();
    assert_eq!(source.player_state(), PlayerState::Stopped);
    assert_eq!(source.read(), Frame::Silence);
    assert_eq!(source.current(), None);

    source.stop();
    source.resume();
    source.queue("track:b");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(source.read(), Frame::Silence);
    assert!(!source.is_terminated());
    assert_eq!(backend.loads(), vec!["a".to_string()]);
}

/// A track that cannot be loaded takes the source down.
#[tokio::test]
async fn test_backend_failure_terminates_source() {
    let backend = MemoryBackend::new(10).failing_on("bad");
    let (mut source, _bus) = spawn_source(&backend);

    source.queue("track:bad");
    source.resume();
    wait_until(|| source.player_state() == PlayerState::Failed).await;

    assert!(source.is_terminated());
    assert_eq!(source.read(), Frame::End);
    assert_eq!(source.loaded(), None);
}

#[tokio::test]
async fn test_spawn_fails_when_backend_cannot_start() {
    let mut backend = MemoryBackend::new(10);
    backend.fail_start = true;

    let result = StreamingSource::spawn(&backend, EventBus::new(), GUILD);
    assert!(result.is_err());
}
