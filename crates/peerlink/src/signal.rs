//! Offer/answer rendezvous.
//!
//! A `Signal` moves opaque session descriptions between the two ends of a
//! negotiation. Offers are keyed by a correlation id chosen by the signal;
//! the answering side posts its answer under the same id.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use peerlink_core::SignalError;

use crate::lock;

/// Asynchronous offer/answer exchange. All methods are cancel-safe.
#[async_trait]
pub trait Signal: Send + Sync + 'static {
    /// Publish an offer. Returns the correlation id the answer will carry.
    async fn offer(&self, offer: Bytes) -> Result<u64, SignalError>;

    /// Wait for the next offer.
    async fn read_offer(&self) -> Result<(u64, Bytes), SignalError>;

    /// Post the answer for offer `id`.
    async fn answer(&self, id: u64, answer: Bytes) -> Result<(), SignalError>;

    /// Fetch the answer for offer `id`.
    ///
    /// Returns `SignalError::AnswerNotReady` until one has been posted; callers poll.
    async fn read_answer(&self, id: u64) -> Result<Bytes, SignalError>;
}

/// How long an offer may go without its answer being polled before it is dropped.
pub const DEFAULT_OFFER_EXPIRY: Duration = Duration::from_secs(30);

struct Pending {
    answer: Option<Bytes>,
    touched: Instant,
}

/// In-process signal for tests and single-process wiring.
///
/// An offer whose dialer stops polling for the answer expires: it is never
/// handed to `read_offer`, and its answer slot is dropped.
pub struct DebugSignal {
    offers_tx: mpsc::Sender<(u64, Bytes)>,
    offers_rx: tokio::sync::Mutex<mpsc::Receiver<(u64, Bytes)>>,
    pending: DashMap<u64, Pending>,
    expiry: Duration,
    rng: Mutex<StdRng>,
    closed: watch::Sender<bool>,
}

impl DebugSignal {
    /// `capacity` bounds the number of queued, unread offers.
    pub fn new(capacity: usize) -> Self {
        let (offers_tx, offers_rx) = mpsc::channel(capacity.max(1));
        Self {
            offers_tx,
            offers_rx: tokio::sync::Mutex::new(offers_rx),
            pending: DashMap::new(),
            expiry: DEFAULT_OFFER_EXPIRY,
            rng: Mutex::new(StdRng::from_entropy()),
            closed: watch::channel(false).0,
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// Offers published but not yet read.
    pub fn queued_offers(&self) -> usize {
        self.offers_tx.max_capacity() - self.offers_tx.capacity()
    }

    /// Offers published whose answer has not been read.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Fail every later call with `SignalError::Closed`.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn allocate_id(&self) -> u64 {
        let mut rng = lock(&self.rng);
        loop {
            let id: u64 = rng.gen();
            if let Entry::Vacant(slot) = self.pending.entry(id) {
                slot.insert(Pending {
                    answer: None,
                    touched: Instant::now(),
                });
                return id;
            }
        }
    }

    /// Drop offers nobody has polled for within the expiry.
    fn expire(&self) {
        let now = Instant::now();
        self.pending
            .retain(|_, pending| now.duration_since(pending.touched) < self.expiry);
    }
}

#[async_trait]
impl Signal for DebugSignal {
    async fn offer(&self, offer: Bytes) -> Result<u64, SignalError> {
        if self.is_closed() {
            return Err(SignalError::Closed);
        }
        self.expire();
        let permit = self
            .offers_tx
            .reserve()
            .await
            .map_err(|_| SignalError::Closed)?;
        let id = self.allocate_id();
        permit.send((id, offer));
        tracing::trace!(offer = %hex::encode(id.to_be_bytes()), "offer queued");
        Ok(id)
    }

    async fn read_offer(&self) -> Result<(u64, Bytes), SignalError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(SignalError::Closed);
        }
        let mut rx = self.offers_rx.lock().await;
        loop {
            let (id, offer) = tokio::select! {
                offer = rx.recv() => offer.ok_or(SignalError::Closed)?,
                _ = closed.changed() => return Err(SignalError::Closed),
            };
            self.expire();
            if self.pending.contains_key(&id) {
                return Ok((id, offer));
            }
            tracing::trace!(offer = %hex::encode(id.to_be_bytes()), "expired offer dropped");
        }
    }

    async fn answer(&self, id: u64, answer: Bytes) -> Result<(), SignalError> {
        if self.is_closed() {
            return Err(SignalError::Closed);
        }
        self.expire();
        match self.pending.get_mut(&id) {
            Some(mut slot) => {
                slot.answer = Some(answer);
                slot.touched = Instant::now();
                Ok(())
            }
            None => Err(SignalError::UnknownOffer(id)),
        }
    }

    async fn read_answer(&self, id: u64) -> Result<Bytes, SignalError> {
        if self.is_closed() {
            return Err(SignalError::Closed);
        }
        let answered = self.pending.remove_if(&id, |_, pending| pending.answer.is_some());
        if let Some((_, Pending { answer: Some(answer), .. })) = answered {
            return Ok(answer);
        }
        match self.pending.get_mut(&id) {
            Some(mut slot) => {
                slot.touched = Instant::now();
                Err(SignalError::AnswerNotReady)
            }
            None => Err(SignalError::UnknownOffer(id)),
        }
    }
}
