use crate::*;

use peerlink::wire::MAX_MESSAGE_SIZE;
use peerlink::Error;

/// Dial "A", accept it, write "Hello" and read it back on the listener side.
#[tokio::test]
async fn test_hello() -> Result<()> {
    let h = harness(config(false));
    h.listener.start()?;

    let client = h.dialer.dial("A").await?;
    let server = h.listener.accept().await?;
    assert_eq!(server.label(), "A");
    assert_eq!(server.stream_id(), client.stream_id());

    client.write(b"Hello").await?;
    let mut buf = [0u8; 32];
    let n = server.read(&mut buf).await?;
    assert_eq!(n, 5);
    assert_eq!(&buf[..n], b"Hello");

    roundtrip(&server, &client, b"Hello back").await?;
    Ok(())
}

/// Path metadata is reported from both ends of the selected path.
#[tokio::test]
async fn test_path_metadata_mirrors() -> Result<()> {
    let h = harness(config(false));
    h.listener.start()?;

    let client = h.dialer.dial("meta").await?;
    let server = h.listener.accept().await?;
    assert!(client.local_addr().is_some());
    assert_eq!(client.local_addr(), server.remote_addr());
    assert_eq!(client.remote_addr(), server.local_addr());
    Ok(())
}

/// A full-size message crosses intact; one byte more is refused and nothing is sent.
#[tokio::test]
async fn test_payload_limit() -> Result<()> {
    let h = harness(config(false));
    h.listener.start()?;
    let client = h.dialer.dial("big").await?;
    let server = h.listener.accept().await?;

    let max: Vec<u8> = (0..MAX_MESSAGE_SIZE).map(|i| (i % 251) as u8).collect();
    roundtrip(&client, &server, &max).await?;

    let oversized = vec![0u8; MAX_MESSAGE_SIZE + 1];
    assert!(matches!(
        client.write(&oversized).await,
        Err(Error::PayloadTooLarge(65536))
    ));

    server.set_read_deadline(Some(Instant::now() + Duration::from_millis(150)))?;
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    assert!(matches!(server.read(&mut buf).await, Err(Error::DeadlineExceeded)));
    Ok(())
}

/// Closing one end surfaces as end-of-stream on the other.
#[tokio::test]
async fn test_close_propagates() -> Result<()> {
    let h = harness(config(true));
    h.listener.start()?;
    let client = h.dialer.dial("closing").await?;
    let server = h.listener.accept().await?;

    client.close().await?;
    assert!(matches!(client.write(b"x").await, Err(Error::StreamClosed)));
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).await?, 0);

    server.set_read_deadline(Some(Instant::now() + Duration::from_secs(2)))?;
    assert_eq!(server.read(&mut buf).await?, 0);
    assert!(server.is_closed());
    assert!(matches!(server.write(b"x").await, Err(Error::StreamClosed)));
    Ok(())
}

/// A reader that never reads eventually blocks the writer; the write deadline fires.
#[tokio::test]
async fn test_write_deadline_under_backpressure() -> Result<()> {
    let h = harness(config(false));
    h.listener.start()?;
    let client = h.dialer.dial("slow").await?;
    let _server = h.listener.accept().await?;

    client.set_write_deadline(Some(Instant::now() + Duration::from_millis(300)))?;
    let mut outcome = Ok(0);
    for _ in 0..1000 {
        outcome = client.write(b"flood").await;
        if outcome.is_err() {
            break;
        }
    }
    assert!(matches!(outcome, Err(Error::DeadlineExceeded)));
    assert!(!client.is_closed());
    Ok(())
}

/// A message that arrives after a read timed out is still delivered to the next read.
#[tokio::test]
async fn test_read_deadline_keeps_late_message() -> Result<()> {
    let h = harness(config(false));
    h.listener.start()?;
    let client = h.dialer.dial("late").await?;
    let server = h.listener.accept().await?;

    server.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))?;
    let mut buf = [0u8; 16];
    assert!(matches!(server.read(&mut buf).await, Err(Error::DeadlineExceeded)));

    client.write(b"after").await?;
    server.set_read_deadline(None)?;
    let n = server.read(&mut buf).await?;
    assert_eq!(&buf[..n], b"after");
    Ok(())
}

/// No writes for longer than the idle timeout closes a conn; periodic writes keep one open.
#[tokio::test]
async fn test_idle_timeout() -> Result<()> {
    let mut config = config(true);
    config.dialer.idle_timeout_ms = 200;
    let h = harness(config);
    h.listener.start()?;

    let quiet = h.dialer.dial("quiet").await?;
    let quiet_server = h.listener.accept().await?;
    let busy = h.dialer.dial("busy").await?;
    let busy_server = h.listener.accept().await?;

    let started = Instant::now();
    while started.elapsed() < Duration::from_millis(700) {
        busy.write(b"tick").await?;
        let mut buf = [0u8; 8];
        busy_server.read(&mut buf).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(quiet.is_closed());
    assert!(!busy.is_closed());

    let mut buf = [0u8; 8];
    quiet_server.set_read_deadline(Some(Instant::now() + Duration::from_secs(2)))?;
    assert_eq!(quiet_server.read(&mut buf).await?, 0);
    Ok(())
}
