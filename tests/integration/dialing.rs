use crate::*;

use peerlink::{Context, Error};

/// Streams dialed with reuse share one session and stay independent.
#[tokio::test]
async fn test_reuse_multiplexes_streams() -> Result<()> {
    let h = harness(config(true));
    h.listener.start()?;

    let mut pairs = Vec::new();
    for label in ["A", "B", "C"] {
        let client = h.dialer.dial(label).await?;
        let server = h.listener.accept().await?;
        assert_eq!(server.label(), label);
        pairs.push((client, server));
    }

    // One session on each side.
    assert_eq!(h.network.session_count(), 2);
    assert_eq!(h.listener.session_count().await, 1);

    let ids: std::collections::HashSet<u16> = pairs.iter().map(|(c, _)| c.stream_id()).collect();
    assert_eq!(ids.len(), 3);

    pairs[0].0.close().await?;
    for (client, server) in &pairs[1..] {
        roundtrip(client, server, client.label().as_bytes()).await?;
        roundtrip(server, client, b"ack").await?;
    }
    assert!(h.dialer.has_session().await);
    Ok(())
}

/// Concurrent dials with reuse negotiate exactly one session.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dials_share_session() -> Result<()> {
    let h = harness(config(true));
    h.listener.start()?;

    let mut dials = Vec::new();
    for i in 0..4 {
        let dialer = h.dialer.clone();
        dials.push(tokio::spawn(async move { dialer.dial(&format!("s{i}")).await }));
    }

    let mut clients = Vec::new();
    for dial in dials {
        clients.push(dial.await??);
    }
    for _ in 0..clients.len() {
        h.listener.accept().await?;
    }

    assert_eq!(h.network.session_count(), 2);
    assert_eq!(h.listener.session_count().await, 1);
    Ok(())
}

/// Without reuse each dial negotiates its own session, and closing the
/// stream tears that session down.
#[tokio::test]
async fn test_no_reuse_session_per_dial() -> Result<()> {
    let h = harness(config(false));
    h.listener.start()?;

    let first = h.dialer.dial("one").await?;
    let _first_server = h.listener.accept().await?;
    let second = h.dialer.dial("two").await?;
    let second_server = h.listener.accept().await?;

    assert_eq!(h.network.session_count(), 4);
    assert_eq!(h.listener.session_count().await, 2);
    assert!(!h.dialer.has_session().await);

    first.close().await?;
    let network = &h.network;
    let listener = &h.listener;
    assert!(
        wait_until(Duration::from_secs(2), move || async move {
            network.session_count() == 2 && listener.session_count().await == 1
        })
        .await
    );

    roundtrip(&second, &second_server, b"still up").await?;
    Ok(())
}

/// A context cancelled before or during the dial fails it with `Cancelled`.
#[tokio::test]
async fn test_cancelled_dial() -> Result<()> {
    let h = harness(config(false));

    let (ctx, cancel) = Context::with_cancel();
    cancel.cancel();
    assert!(matches!(h.dialer.dial_context(&ctx, "early").await, Err(Error::Cancelled)));

    // Nobody answers, so the dial is still waiting when the cancel lands.
    let (ctx, cancel) = Context::with_cancel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    assert!(matches!(h.dialer.dial_context(&ctx, "late").await, Err(Error::Cancelled)));

    let network = &h.network;
    let drained = move || async move { network.session_count() == 0 };
    assert!(wait_until(Duration::from_secs(1), drained).await);
    Ok(())
}

/// With no listener the dial runs into its deadline and leaves nothing behind.
#[tokio::test]
async fn test_dial_deadline_without_listener() -> Result<()> {
    let h = harness(config(true));

    let ctx = Context::with_timeout(Duration::from_millis(300));
    let started = Instant::now();
    assert!(matches!(
        h.dialer.dial_context(&ctx, "nobody").await,
        Err(Error::DeadlineExceeded)
    ));
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(h.network.session_count(), 0);
    assert!(!h.dialer.has_session().await);
    assert_eq!(h.signal.queued_offers(), 1);
    Ok(())
}

/// A failed session is dropped from the cache and the next dial renegotiates.
#[tokio::test]
async fn test_recovers_after_session_failure() -> Result<()> {
    let h = harness(config(true));
    h.listener.start()?;

    let before = h.dialer.dial("before").await?;
    let _before_server = h.listener.accept().await?;

    h.network.fail_sessions();
    let dialer = &h.dialer;
    assert!(
        wait_until(Duration::from_secs(2), move || async move { !dialer.has_session().await }).await
    );
    assert!(before.write(b"x").await.is_err() || before.is_closed());

    let after = h.dialer.dial("after").await?;
    let after_server = h.listener.accept().await?;
    roundtrip(&after, &after_server, b"recovered").await?;
    assert!(h.dialer.has_session().await);
    Ok(())
}
