//! Descriptions exchanged by hand, with no signal configured.

use crate::*;

use bytes::Bytes;
use peerlink::{Context, Error, Phase};

fn manual_pair() -> (MemoryNetwork, Dialer, Listener) {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = Transport::new(config(false), Arc::new(network.engine()));
    (network, transport.dialer(), transport.listener())
}

async fn wait_for_offer(dialer: &Dialer) -> Result<Bytes> {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(offer) = dialer.local_description().await {
            return Ok(offer);
        }
        ensure!(Instant::now() < deadline, "no offer gathered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_manual_exchange() -> Result<()> {
    let (network, dialer, listener) = manual_pair();
    listener.start()?;

    let dial = {
        let dialer = dialer.clone();
        tokio::spawn(async move { dialer.dial("by-hand").await })
    };

    let offer = wait_for_offer(&dialer).await?;
    let answer = listener.answer_offer(&Context::background(), offer).await?;
    dialer.set_remote_description(answer).await?;

    let client = dial.await??;
    let server = listener.accept().await?;
    assert_eq!(server.label(), "by-hand");
    assert_eq!(network.session_count(), 2);
    roundtrip(&client, &server, b"manual").await?;
    roundtrip(&server, &client, b"reply").await?;
    Ok(())
}

#[tokio::test]
async fn test_manual_answer_before_dial() -> Result<()> {
    let (_network, dialer, _listener) = manual_pair();
    assert!(dialer.local_description().await.is_none());
    assert!(matches!(
        dialer.set_remote_description(Bytes::from_static(b"{}")).await,
        Err(Error::SessionUnavailable)
    ));
    Ok(())
}

#[tokio::test]
async fn test_malformed_answer_is_decode_error() -> Result<()> {
    let (_network, dialer, _listener) = manual_pair();

    let dial = {
        let dialer = dialer.clone();
        tokio::spawn(async move {
            let ctx = Context::with_timeout(Duration::from_millis(500));
            dialer.dial_context(&ctx, "garbled").await
        })
    };
    wait_for_offer(&dialer).await?;

    let err = dialer
        .set_remote_description(Bytes::from_static(b"not a description"))
        .await
        .expect_err("garbage must not apply");
    assert_eq!(err.phase(), Some(Phase::Decode));

    assert!(matches!(dial.await?, Err(Error::DeadlineExceeded)));
    Ok(())
}

#[tokio::test]
async fn test_answer_offer_rejected_when_stopped() -> Result<()> {
    let (_network, _dialer, listener) = manual_pair();
    listener.start()?;
    listener.stop().await?;
    let outcome = listener
        .answer_offer(&Context::background(), Bytes::from_static(b"{}"))
        .await;
    assert!(matches!(outcome, Err(Error::ListenerClosed)));
    Ok(())
}
