use crate::*;

use bytes::Bytes;
use peerlink::{Context, Error, Signal, Status};

/// Stopping the listener fails pending accepts and closes every remote stream.
#[tokio::test]
async fn test_stop_closes_everything() -> Result<()> {
    let h = harness(config(true));
    h.listener.start()?;

    let client = h.dialer.dial("doomed").await?;
    let _server = h.listener.accept().await?;

    let pending = {
        let listener = h.listener.clone();
        tokio::spawn(async move { listener.accept().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.listener.stop().await?;
    assert_eq!(h.listener.status(), Status::Stopped);
    assert!(matches!(pending.await?, Err(Error::ListenerClosed)));
    assert!(matches!(h.listener.accept().await, Err(Error::ListenerClosed)));
    assert_eq!(h.listener.session_count().await, 0);

    let mut buf = [0u8; 8];
    client.set_read_deadline(Some(Instant::now() + Duration::from_secs(2)))?;
    assert_eq!(client.read(&mut buf).await?, 0);
    assert!(matches!(client.write(b"x").await, Err(Error::StreamClosed)));

    let dialer = &h.dialer;
    assert!(
        wait_until(Duration::from_secs(2), move || async move { !dialer.has_session().await }).await
    );
    Ok(())
}

/// While suspended, offers wait in the signal; resuming serves them.
#[tokio::test]
async fn test_suspend_and_resume() -> Result<()> {
    let h = harness(config(false));
    h.listener.start()?;
    h.listener.suspend()?;
    assert_eq!(h.listener.status(), Status::Suspended);

    let dial = {
        let dialer = h.dialer.clone();
        tokio::spawn(async move { dialer.dial("parked").await })
    };

    let signal = &h.signal;
    assert!(
        wait_until(Duration::from_secs(2), move || async move { signal.queued_offers() == 1 }).await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.signal.queued_offers(), 1);
    assert_eq!(h.listener.session_count().await, 0);

    h.listener.start()?;
    let client = dial.await??;
    let server = h.listener.accept().await?;
    assert_eq!(h.signal.queued_offers(), 0);
    roundtrip(&client, &server, b"resumed").await?;
    Ok(())
}

/// A stopped listener can be started again and serves new dials.
#[tokio::test]
async fn test_restart_after_stop() -> Result<()> {
    let h = harness(config(false));
    h.listener.start()?;
    h.listener.stop().await?;
    assert!(matches!(h.listener.suspend(), Err(Error::InvalidTransition { .. })));

    h.listener.start()?;
    assert_eq!(h.listener.status(), Status::Running);
    let client = h.dialer.dial("again").await?;
    let server = h.listener.accept().await?;
    roundtrip(&client, &server, b"back").await?;
    Ok(())
}

/// A session with no streams left is evicted after the listener idle timeout.
#[tokio::test]
async fn test_idle_session_eviction() -> Result<()> {
    let mut config = config(true);
    config.listener.idle_timeout_ms = 200;
    let h = harness(config);
    h.listener.start()?;

    let client = h.dialer.dial("brief").await?;
    let _server = h.listener.accept().await?;
    assert_eq!(h.listener.session_count().await, 1);

    client.close().await?;
    let listener = &h.listener;
    let evicted = move || async move { listener.session_count().await == 0 };
    assert!(wait_until(Duration::from_secs(2), evicted).await);
    let dialer = &h.dialer;
    assert!(
        wait_until(Duration::from_secs(2), move || async move { !dialer.has_session().await }).await
    );
    Ok(())
}

/// A session that keeps a stream open is not evicted.
#[tokio::test]
async fn test_busy_session_survives_idle_timeout() -> Result<()> {
    let mut config = config(true);
    config.listener.idle_timeout_ms = 200;
    let h = harness(config);
    h.listener.start()?;

    let client = h.dialer.dial("kept").await?;
    let server = h.listener.accept().await?;

    let started = Instant::now();
    while started.elapsed() < Duration::from_millis(600) {
        roundtrip(&server, &client, b"ping").await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(h.listener.session_count().await, 1);
    assert!(h.dialer.has_session().await);
    Ok(())
}

/// Every dial is matched by one accept; an extra accept times out.
#[tokio::test]
async fn test_accept_matches_dials() -> Result<()> {
    let h = harness(config(true));
    h.listener.start()?;

    let mut clients = Vec::new();
    for i in 0..5 {
        clients.push(h.dialer.dial(&format!("n{i}")).await?);
    }

    let mut labels = Vec::new();
    for _ in 0..clients.len() {
        let ctx = Context::with_timeout(Duration::from_secs(2));
        labels.push(h.listener.accept_context(&ctx).await?.label().to_string());
    }
    labels.sort();
    assert_eq!(labels, ["n0", "n1", "n2", "n3", "n4"]);

    let ctx = Context::with_timeout(Duration::from_millis(200));
    assert!(matches!(
        h.listener.accept_context(&ctx).await,
        Err(Error::DeadlineExceeded)
    ));
    Ok(())
}

/// A garbage offer fails on its own; the accept loop keeps serving.
#[tokio::test]
async fn test_malformed_offer_keeps_loop_running() -> Result<()> {
    let h = harness(config(false));
    h.listener.start()?;

    h.signal.offer(Bytes::from_static(b"garbage")).await?;
    let signal = &h.signal;
    let consumed = move || async move { signal.queued_offers() == 0 };
    assert!(wait_until(Duration::from_secs(2), consumed).await);

    let client = h.dialer.dial("ok").await?;
    let server = h.listener.accept().await?;
    roundtrip(&client, &server, b"still serving").await?;
    assert_eq!(h.listener.session_count().await, 1);
    assert_eq!(h.listener.status(), Status::Running);
    Ok(())
}

/// An offer whose dialer already gave up is dropped instead of answered.
#[tokio::test]
async fn test_abandoned_offer_is_not_served() -> Result<()> {
    let mut config = config(false);
    config.listener.negotiation_timeout_ms = 500;
    let signal = DebugSignal::new(16).with_expiry(Duration::from_millis(300));
    let h = harness_with_signal(config, signal);

    let ctx = Context::with_timeout(Duration::from_millis(200));
    assert!(matches!(
        h.dialer.dial_context(&ctx, "gone").await,
        Err(Error::DeadlineExceeded)
    ));
    assert_eq!(h.signal.queued_offers(), 1);
    tokio::time::sleep(Duration::from_millis(400)).await;

    h.listener.start()?;
    let signal = &h.signal;
    let consumed = move || async move { signal.queued_offers() == 0 };
    assert!(wait_until(Duration::from_secs(2), consumed).await);

    let client = h.dialer.dial("live").await?;
    let server = h.listener.accept().await?;
    assert_eq!(server.label(), "live");
    roundtrip(&client, &server, b"fresh").await?;

    assert_eq!(h.listener.session_count().await, 1);
    assert_eq!(h.network.session_count(), 2);
    assert_eq!(h.signal.in_flight(), 0);
    Ok(())
}
