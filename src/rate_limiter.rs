//! Per-sink rate limiting.
//!
//! Without a window every measurement is handed to the publisher right away.
//! With a window, measurements are coalesced per sensor (last value wins) and
//! published as one batch when the window ends. Window lengths are jittered by
//! up to 20% in either direction so that several limiters don't flush in
//! lockstep.

use crate::measurement::PublishableMeasurement;
use crate::sink::SinkError;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// Depth of the queue in front of the coalescer. A full queue blocks `publish`.
const QUEUE_DEPTH: usize = 4;

/// Shortest window; shorter ones are raised to it.
pub const MIN_WINDOW: Duration = Duration::from_secs(1);

/// Maximum relative deviation of a window from its configured length.
const WINDOW_JITTER: f64 = 0.2;

/// Boxed future returned by [`BatchPublisher::publish_batch`].
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// Something that can deliver a batch of measurements downstream.
pub trait BatchPublisher: Send + Sync {
    fn publish_batch(&self, batch: Vec<PublishableMeasurement>) -> PublishFuture<'_>;
}

/// Rate limiter in front of a single [`BatchPublisher`].
pub struct RateLimiter {
    mode: Mode,
}

enum Mode {
    PassThrough(Arc<dyn BatchPublisher>),
    Coalescing {
        queue: mpsc::Sender<PublishableMeasurement>,
        coalescer: JoinHandle<()>,
    },
}

impl RateLimiter {
    /// Create a limiter publishing at most one batch per `window`, or every
    /// measurement immediately when `window` is `None`.
    ///
    /// With a window, this spawns the coalescing task on the current tokio
    /// runtime. Windows shorter than [`MIN_WINDOW`] are raised to it.
    pub fn new(window: Option<Duration>, publisher: Arc<dyn BatchPublisher>) -> Self {
        let mode = match window {
            None => Mode::PassThrough(publisher),
            Some(window) => {
                if window < MIN_WINDOW {
                    warn!(
                        ?window,
                        minimum = ?MIN_WINDOW,
                        "rate limit window too short, using the minimum"
                    );
                }
                let window = window.max(MIN_WINDOW);
                let (queue, rx) = mpsc::channel(QUEUE_DEPTH);
                let coalescer = tokio::spawn(coalesce(window, rx, publisher));
                Mode::Coalescing { queue, coalescer }
            }
        };
        RateLimiter { mode }
    }

    /// Hand a measurement to the limiter.
    ///
    /// Delivery failures are logged, never returned: each batch is published
    /// at most once.
    pub async fn publish(&self, measurement: PublishableMeasurement) {
        match &self.mode {
            Mode::PassThrough(publisher) => dispatch(publisher.as_ref(), vec![measurement]).await,
            Mode::Coalescing { queue, .. } => {
                if queue.send(measurement).await.is_err() {
                    warn!("rate limiter stopped, dropping measurement");
                }
            }
        }
    }

    /// Stop the limiter, publishing whatever the current window holds.
    pub async fn close(self) {
        if let Mode::Coalescing { queue, coalescer } = self.mode {
            drop(queue);
            if let Err(e) = coalescer.await {
                warn!(error = %e, "rate limiter task failed");
            }
        }
    }
}

async fn dispatch(publisher: &dyn BatchPublisher, batch: Vec<PublishableMeasurement>) {
    let size = batch.len();
    if let Err(e) = publisher.publish_batch(batch).await {
        warn!(error = %e, size, "failed to publish batch, dropping it");
    }
}

/// `window` scaled by a uniform factor in `[1 - WINDOW_JITTER, 1 + WINDOW_JITTER)`.
fn jittered(window: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-WINDOW_JITTER..WINDOW_JITTER);
    window.mul_f64(factor)
}

async fn coalesce(
    window: Duration,
    mut queue: mpsc::Receiver<PublishableMeasurement>,
    publisher: Arc<dyn BatchPublisher>,
) {
    let mut pending: HashMap<String, PublishableMeasurement> = HashMap::new();
    let deadline = time::sleep(jittered(window));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            received = queue.recv() => match received {
                Some(measurement) => {
                    pending.insert(measurement.sensor_id(), measurement);
                }
                None => break,
            },
            () = &mut deadline => {
                if !pending.is_empty() {
                    let batch = pending.drain().map(|(_, m)| m).collect();
                    dispatch(publisher.as_ref(), batch).await;
                }
                deadline.as_mut().reset(Instant::now() + jittered(window));
            }
        }
    }

    if !pending.is_empty() {
        debug!(sensors = pending.len(), "flushing pending window on shutdown");
        dispatch(publisher.as_ref(), pending.into_values().collect()).await;
    }
}
