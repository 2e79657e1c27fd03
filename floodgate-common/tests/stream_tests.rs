//! Integration tests for event streams and subscriptions

use floodgate_common::config::StreamConfig;
use floodgate_common::events::Event;
use floodgate_common::sse::{EventStream, Subscription};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config() -> StreamConfig {
    StreamConfig {
        subscriber_capacity: 16,
        subscriber_send_timeout_ms: 2_000,
        ..StreamConfig::default()
    }
}

async fn next(sub: &mut Subscription) -> Option<Arc<Event>> {
    tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("timed out waiting for subscription")
}

async fn wait_for_log(stream: &EventStream, len: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while stream.log_len() < len {
        assert!(Instant::now() < deadline, "events were never logged");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_replay_then_live_then_stop() {
    let stream = EventStream::new("s1", config());
    stream.publish(Event::new("x")).await;
    stream.publish(Event::new("y")).await;
    wait_for_log(&stream, 2).await;

    let mut sub = stream.add_subscription(0, "http://localhost/s1");
    assert_eq!(next(&mut sub).await.unwrap().data(), "x");
    assert_eq!(next(&mut sub).await.unwrap().data(), "y");

    stream.publish(Event::new("z")).await;
    let c = next(&mut sub).await.unwrap();
    assert_eq!(c.data(), "z");
    assert_eq!(c.id(), Some(2));

    stream.stop();
    assert!(next(&mut sub).await.is_none());
    assert!(sub.is_stopped());
}

#[tokio::test]
async fn test_cursor_skips_older_events() {
    let stream = EventStream::new("cursor", config());
    for data in ["a", "b", "c", "d"] {
        stream.publish(Event::new(data)).await;
    }
    wait_for_log(&stream, 4).await;

    let mut sub = stream.add_subscription(2, "u");
    assert_eq!(next(&mut sub).await.unwrap().data(), "c");
    assert_eq!(next(&mut sub).await.unwrap().data(), "d");
    assert_eq!(sub.cursor(), 2);
    assert_eq!(sub.last_event_id(), Some(3));
}

#[tokio::test]
async fn test_live_events_delivered_past_cursor() {
    let stream = EventStream::new("future", config());
    stream.publish(Event::new("a")).await;
    wait_for_log(&stream, 1).await;

    // cursor ahead of the log, as after a server restart: nothing to replay,
    // but every live event still reaches the client
    let mut sub = stream.add_subscription(50, "u");
    for data in ["b", "c", "d"] {
        stream.publish(Event::new(data)).await;
    }

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = next(&mut sub).await.unwrap();
        seen.push((event.data().to_string(), event.id().unwrap()));
    }
    assert_eq!(
        seen,
        vec![("b".to_string(), 1), ("c".to_string(), 2), ("d".to_string(), 3)]
    );
    assert_eq!(sub.cursor(), 50);
    assert_eq!(sub.last_event_id(), Some(3));
}

#[tokio::test]
async fn test_all_subscribers_see_publish_order() {
    let stream = EventStream::new("order", config());
    let subs: Vec<_> = (0..3).map(|i| stream.add_subscription(0, format!("sub-{i}"))).collect();

    let readers: Vec<_> = subs
        .into_iter()
        .map(|mut sub| {
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while seen.len() < 100 {
                    match next(&mut sub).await {
                        Some(event) => seen.push(event.id().unwrap()),
                        None => break,
                    }
                }
                seen
            })
        })
        .collect();

    for i in 0..100 {
        stream.publish(Event::new(format!("event {i}"))).await;
    }

    let expected: Vec<u64> = (0..100).collect();
    for reader in readers {
        assert_eq!(reader.await.unwrap(), expected);
    }
}

#[tokio::test]
async fn test_subscribing_mid_publish_has_no_gaps_or_duplicates() {
    let stream = EventStream::new("mid", config());
    let producer = {
        let stream = Arc::clone(&stream);
        tokio::spawn(async move {
            for i in 0..200 {
                stream.publish(Event::new(i.to_string())).await;
                if i % 20 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    wait_for_log(&stream, 10).await;
    let mut sub = stream.add_subscription(0, "late");

    let mut ids = Vec::new();
    while ids.len() < 200 {
        ids.push(next(&mut sub).await.unwrap().id().unwrap());
    }
    producer.await.unwrap();

    let expected: Vec<u64> = (0..200).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_end_of_stream_is_delivered_but_not_logged() {
    let stream = EventStream::new("eos", config());
    let mut sub = stream.add_subscription(0, "u");
    stream.publish(Event::new("a")).await;
    stream.publish(Event::end_of_stream()).await;

    assert_eq!(next(&mut sub).await.unwrap().data(), "a");
    assert!(next(&mut sub).await.unwrap().is_end_of_stream());
    assert_eq!(stream.log_len(), 1);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let stream = EventStream::new("idem", config());
    let sub = stream.add_subscription(0, "u");
    stream.stop();
    stream.stop();
    stream.graceful_stop(Duration::from_millis(100)).await;
    assert!(stream.is_stopping());
    assert!(sub.is_stopped());
}

#[tokio::test]
async fn test_graceful_stop_delivers_queued_events() {
    let stream = EventStream::new("graceful", config());
    let mut sub = stream.add_subscription(0, "u");
    for data in ["a", "b", "c"] {
        stream.publish(Event::new(data)).await;
    }

    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = next(&mut sub).await {
            seen.push(event.data().to_string());
        }
        (seen, sub.is_stopped())
    });

    stream.graceful_stop(Duration::from_secs(2)).await;
    let (seen, stopped) = reader.await.unwrap();
    assert_eq!(seen, vec!["a", "b", "c"]);
    assert!(stopped);
    assert!(stream.try_publish(Event::new("late")).await.is_err());
}

#[tokio::test]
async fn test_graceful_stop_bounded_by_deadline() {
    let stream = EventStream::new(
        "stuck",
        StreamConfig {
            subscriber_capacity: 1,
            subscriber_send_timeout_ms: 30_000,
            ..StreamConfig::default()
        },
    );
    // never read: the dispatcher blocks on this subscriber's full channel
    let _sub = stream.add_subscription(0, "stuck");
    for data in ["a", "b", "c"] {
        stream.publish(Event::new(data)).await;
    }

    let started = Instant::now();
    stream.graceful_stop(Duration::from_millis(200)).await;
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_slow_subscriber_is_dropped() {
    let stream = EventStream::new(
        "slow",
        StreamConfig {
            subscriber_capacity: 1,
            subscriber_send_timeout_ms: 50,
            ..StreamConfig::default()
        },
    );
    let mut slow = stream.add_subscription(0, "slow");
    let mut fast = stream.add_subscription(0, "fast");

    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        while seen.len() < 3 {
            seen.push(next(&mut fast).await.unwrap().data().to_string());
        }
        seen
    });

    for data in ["a", "b", "c"] {
        stream.publish(Event::new(data)).await;
    }

    assert_eq!(reader.await.unwrap(), vec!["a", "b", "c"]);
    assert!(slow.is_stopped());
    assert!(slow.recv().await.is_none());
}
