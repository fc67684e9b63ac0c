//! Transfer progress and speed tracking for the source stream
//!
//! [`ProgressMeter::wrap`] turns the source reader into a [`ProgressReader`]
//! that counts every byte read. Once started, the meter publishes progress,
//! average speed and current speed to a [`MetricsSink`] on a fixed interval.

use crate::logging::format_speed;
use crate::monitoring::metrics::MetricsSink;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Interval between two published samples
pub const EMIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct ProgressState {
    transmitted: AtomicU64,
    done: AtomicBool,
}

/// Snapshot of the transfer at one point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub transmitted_bytes: u64,
    pub elapsed_seconds: f64,
}

/// Reader wrapper that feeds the byte counter of its [`ProgressMeter`]
///
/// Owns the source reader; dropping it closes the source and marks the
/// transfer as done.
pub struct ProgressReader<R> {
    inner: R,
    state: Arc<ProgressState>,
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let had_room = buf.remaining() > 0;
        let before = buf.filled().len();

        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = (buf.filled().len() - before) as u64;
            if read > 0 {
                this.state.transmitted.fetch_add(read, Ordering::AcqRel);
            } else if had_room {
                this.state.done.store(true, Ordering::Release);
            }
        }
        poll
    }
}

impl<R> Drop for ProgressReader<R> {
    fn drop(&mut self) {
        self.state.done.store(true, Ordering::Release);
    }
}

pub struct ProgressMeter {
    total: u64,
    state: Arc<ProgressState>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
    stop: CancellationToken,
    ticker: Option<JoinHandle<()>>,
}

impl ProgressMeter {
    pub fn new(total: u64, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            total,
            state: Arc::new(ProgressState::default()),
            sink,
            interval: EMIT_INTERVAL,
            started_at: None,
            stopped_at: None,
            stop: CancellationToken::new(),
            ticker: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Wrap the source reader so that reads are counted by this meter
    pub fn wrap<R>(&self, reader: R) -> ProgressReader<R> {
        ProgressReader {
            inner: reader,
            state: self.state.clone(),
        }
    }

    /// Start the clock and the periodic publishing task
    pub fn start(&mut self) {
        if self.started_at.is_some() {
            return;
        }

        let started_at = Instant::now();
        self.started_at = Some(started_at);

        let ticker = Ticker {
            total: self.total,
            state: self.state.clone(),
            sink: self.sink.clone(),
            interval: self.interval,
            started_at,
            stop: self.stop.clone(),
        };
        self.ticker = Some(tokio::spawn(ticker.run()));
    }

    /// Halt the periodic task and freeze the average speed; idempotent
    pub fn stop(&mut self) {
        if self.stopped_at.is_none() {
            self.stopped_at = Some(Instant::now());
        }
        self.stop.cancel();
        self.ticker.take();
    }

    pub fn transmitted(&self) -> u64 {
        self.state.transmitted.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    pub fn sample(&self) -> ProgressSample {
        let elapsed = match self.started_at {
            Some(started) => self.stopped_at.unwrap_or_else(Instant::now).duration_since(started),
            None => Duration::ZERO,
        };
        ProgressSample {
            transmitted_bytes: self.transmitted(),
            elapsed_seconds: elapsed.as_secs_f64(),
        }
    }

    /// Average speed in bytes/sec; measured up to the stop time once stopped
    pub fn average_speed(&self) -> u64 {
        if self.started_at.is_none() {
            return 0;
        }
        let sample = self.sample();
        bytes_per_second(sample.transmitted_bytes, sample.elapsed_seconds)
    }
}

impl Drop for ProgressMeter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn bytes_per_second(bytes: u64, seconds: f64) -> u64 {
    if seconds > 0.0 {
        (bytes as f64 / seconds) as u64
    } else {
        bytes
    }
}

struct Ticker {
    total: u64,
    state: Arc<ProgressState>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
    started_at: Instant,
    stop: CancellationToken,
}

impl Ticker {
    async fn run(self) {
        if self.total == 0 {
            return;
        }

        let mut ticks = tokio::time::interval_at(self.started_at + self.interval, self.interval);
        let mut prev_transmitted = 0u64;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = ticks.tick() => {
                    let finished = self.state.done.load(Ordering::Acquire);
                    let transmitted = self.state.transmitted.load(Ordering::Acquire).min(self.total);
                    self.publish(transmitted, prev_transmitted);
                    prev_transmitted = transmitted;
                    if finished {
                        return;
                    }
                }
            }
        }
    }

    fn publish(&self, transmitted: u64, prev_transmitted: u64) {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let average = if elapsed > 0.0 { transmitted as f64 / elapsed } else { 0.0 };
        let current = (transmitted - prev_transmitted) as f64 / self.interval.as_secs_f64();
        let progress = transmitted as f64 / self.total as f64 * 100.0;

        debug!(
            progress = format!("{:.2}%", progress),
            average = %format_speed(average as u64),
            current = %format_speed(current as u64),
            "Import progress"
        );

        let delivered = self
            .sink
            .set_progress(progress)
            .and_then(|_| self.sink.set_average_speed(average))
            .and_then(|_| self.sink.set_current_speed(current));
        if let Err(e) = delivered {
            warn!(error = %e, "Failed to publish progress metrics, retrying on next tick");
        }
    }
}
