//! Per-subscriber delivery with disk overflow.
//!
//! A listener wraps the channel one subscriber reads from. While the
//! subscriber keeps up, rows are handed over directly. The first time a
//! handoff would block, the row goes to the listener's spool file and the
//! listener switches to buffered mode: from then on every row is spooled,
//! and a background pump drains the spool into the channel. Once the spool
//! is empty the pump switches back to direct mode.
//!
//! Because nothing bypasses the spool while it has backlog, the subscriber
//! sees rows in the order they were sent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::QueueOptions;
use crate::buffer::{Leased, RingBufferFile, TempFileProvider};
use crate::config::Config;
use crate::Row;

/// Owner name used for spool files when none is given.
pub const DEFAULT_OWNER: &str = "master";

/// Delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Rows are handed to the subscriber without touching disk.
    Direct,
    /// Rows are spooled and drained by the pump.
    Buffered,
}

impl Mode {
    pub fn is_buffered(&self) -> bool {
        matches!(self, Mode::Buffered)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Direct => write!(f, "direct"),
            Mode::Buffered => write!(f, "buffered"),
        }
    }
}

/// Point-in-time view of a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerStats {
    pub id: Uuid,
    pub name: String,
    pub mode: Mode,
    pub closed: bool,
    pub file_buffering: bool,
    /// Spool file, if one currently exists.
    pub backing_file: Option<std::path::PathBuf>,
    pub pending_bytes: i64,
    pub file_size: u64,
    /// Rows handed to the subscriber so far.
    pub delivered: u64,
}

struct State {
    mode: Mode,
    closed: bool,
    /// Dropped on close so the subscriber sees end of stream.
    output: Option<mpsc::Sender<Row>>,
    /// Mirrors `mode` for the pump.
    signal: watch::Sender<Mode>,
}

impl State {
    fn switch_to_buffered(&mut self, listener: &str) {
        if self.mode == Mode::Direct {
            self.mode = Mode::Buffered;
            self.signal.send_replace(Mode::Buffered);
            debug!(listener, "Switched to buffered delivery");
        }
    }

    fn switch_to_direct(&mut self, listener: &str) {
        if self.mode == Mode::Buffered {
            self.mode = Mode::Direct;
            self.signal.send_replace(Mode::Direct);
            debug!(listener, "Switched to direct delivery");
        }
    }
}

/// Delivers rows to one subscriber, spilling to disk under backpressure.
pub struct Listener {
    id: Uuid,
    name: String,
    state: Arc<Mutex<State>>,
    /// `None` when file buffering is disabled.
    buffer: Option<Arc<RingBufferFile>>,
    lease_size: usize,
    delivered: Arc<AtomicU64>,
    token: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("file_buffering", &self.buffer.is_some())
            .finish()
    }
}

impl Listener {
    /// Create a listener and start its drain pump.
    ///
    /// The listener's token is a child of `parent`. Returns the listener and
    /// the stream its subscriber reads from.
    pub fn spawn(
        name: impl Into<String>,
        options: &QueueOptions,
        config: &Config,
        spool: Arc<dyn TempFileProvider>,
        parent: &CancellationToken,
    ) -> (Arc<Self>, ReceiverStream<Row>) {
        let name = name.into();
        let file_buffering =
            !(options.disable_file_buffering || config.listener.disable_file_buffering);
        // Without a spool every send is a rendezvous, which needs one slot.
        let capacity = if file_buffering {
            options
                .channel_capacity
                .unwrap_or(config.listener.channel_capacity)
                .max(1)
        } else {
            1
        };
        let lease_size = options
            .lease_size
            .unwrap_or(config.buffer.lease_size)
            .max(1);

        let (output, receiver) = mpsc::channel(capacity);
        let (signal, signal_rx) = watch::channel(Mode::Direct);
        let token = parent.child_token();
        let delivered = Arc::new(AtomicU64::new(0));

        let state = Arc::new(Mutex::new(State {
            mode: Mode::Direct,
            closed: false,
            output: Some(output.clone()),
            signal,
        }));

        let buffer = file_buffering.then(|| {
            let owner = options.owner_name.as_deref().unwrap_or(DEFAULT_OWNER);
            let prefix = format!(
                "journal_{}_{}_",
                sanitize_file_component(&name),
                sanitize_file_component(owner)
            );
            Arc::new(RingBufferFile::new(prefix, config.buffer.clone(), spool))
        });

        let pump = buffer.as_ref().map(|buffer| {
            let pump = Pump {
                name: name.clone(),
                state: Arc::clone(&state),
                signal: signal_rx,
                buffer: Arc::clone(buffer),
                output,
                lease_size,
                delivered: Arc::clone(&delivered),
                token: token.clone(),
            };
            tokio::spawn(pump.run())
        });

        debug!(
            listener = %name,
            capacity,
            lease_size,
            file_buffering,
            "Listener created"
        );

        let listener = Arc::new(Self {
            id: Uuid::new_v4(),
            name,
            state,
            buffer,
            lease_size,
            delivered,
            token,
            pump: Mutex::new(pump),
        });

        (listener, ReceiverStream::new(receiver))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancellation token for this listener.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn mode(&self) -> Mode {
        self.state.lock().await.mode
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Deliver a row.
    ///
    /// Never blocks with file buffering enabled: the row is either handed
    /// over immediately or spooled. With file buffering disabled this returns
    /// only once the subscriber has read the row. Rows sent after close or
    /// cancellation are dropped.
    pub async fn send(&self, row: Row) {
        if self.token.is_cancelled() {
            return;
        }

        let Some(buffer) = &self.buffer else {
            return self.send_blocking(row).await;
        };

        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        let Some(output) = state.output.as_ref() else {
            return;
        };

        match state.mode {
            Mode::Buffered => spill(buffer, &row).await,
            Mode::Direct => match output.try_send(row) {
                Ok(()) => record_delivery(&self.delivered, &self.name, Mode::Direct),
                Err(mpsc::error::TrySendError::Full(row)) => {
                    spill(buffer, &row).await;
                    state.switch_to_buffered(&self.name);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(listener = %self.name, "Subscriber gone, dropping row");
                }
            },
        }
    }

    async fn send_blocking(&self, row: Row) {
        let output = {
            let state = self.state.lock().await;
            if state.closed {
                return;
            }
            match &state.output {
                Some(output) => output.clone(),
                None => return,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            taken = handoff(&output, row) => {
                if taken {
                    record_delivery(&self.delivered, &self.name, Mode::Direct);
                }
            }
        }
    }

    /// Stop accepting rows, flush the backlog and end the subscriber's stream.
    ///
    /// Waits for the subscriber to take every spooled row unless the
    /// listener is cancelled, in which case the backlog is discarded.
    /// Calling close more than once is a no-op.
    pub async fn close(&self) {
        let output = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.switch_to_direct(&self.name);
            state.output.take()
        };

        if let Some(buffer) = &self.buffer {
            // The pump leases nothing once closed; wait out what it holds.
            tokio::select! {
                _ = buffer.wait_outstanding() => {}
                _ = self.token.cancelled() => {}
            }

            if let Some(output) = &output {
                loop {
                    if self.token.is_cancelled() {
                        buffer.reset().await;
                        break;
                    }
                    let batch = buffer.lease(self.lease_size).await;
                    if batch.is_empty() {
                        break;
                    }
                    for leased in batch {
                        forward(output, leased, &self.token, &self.delivered, &self.name).await;
                    }
                }
            }

            buffer.wait_outstanding().await;
            buffer.close().await;
        }

        drop(output);
        self.token.cancel();

        if let Some(pump) = self.pump.lock().await.take() {
            let _ = pump.await;
        }

        debug!(
            listener = %self.name,
            delivered = self.delivered.load(Ordering::Relaxed),
            "Listener closed"
        );
    }

    pub async fn stats(&self) -> ListenerStats {
        let (mode, closed) = {
            let state = self.state.lock().await;
            (state.mode, state.closed)
        };
        let buffer = match &self.buffer {
            Some(buffer) => buffer.stats().await,
            None => Default::default(),
        };

        ListenerStats {
            id: self.id,
            name: self.name.clone(),
            mode,
            closed,
            file_buffering: self.buffer.is_some(),
            backing_file: buffer.path,
            pending_bytes: buffer.pending_bytes,
            file_size: buffer.file_size,
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Background task draining the spool into the subscriber's channel.
struct Pump {
    name: String,
    state: Arc<Mutex<State>>,
    signal: watch::Receiver<Mode>,
    buffer: Arc<RingBufferFile>,
    output: mpsc::Sender<Row>,
    lease_size: usize,
    delivered: Arc<AtomicU64>,
    token: CancellationToken,
}

impl Pump {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                ready = self.signal.wait_for(Mode::is_buffered) => {
                    if ready.is_err() {
                        return;
                    }
                }
            }

            // Lease under the state lock so `send` cannot interleave a
            // direct handoff with the switch back to direct mode.
            let batch = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return;
                }
                let batch = self.buffer.lease(self.lease_size).await;
                if batch.is_empty() {
                    state.switch_to_direct(&self.name);
                }
                batch
            };

            for leased in batch {
                forward(&self.output, leased, &self.token, &self.delivered, &self.name).await;
            }
        }
    }
}

/// Put a row in the single-slot channel and wait until the subscriber has
/// taken it. A free slot can only be reserved once the row is gone.
async fn handoff(output: &mpsc::Sender<Row>, row: Row) -> bool {
    if output.send(row).await.is_err() {
        return false;
    }
    output.reserve().await.is_ok()
}

/// Spool a row. Failures are already logged and the buffer reset; the row
/// is lost.
async fn spill(buffer: &RingBufferFile, row: &Row) {
    if let Err(e) = buffer.enqueue(row).await {
        debug!(buffer = %buffer.name(), error = %e, "Row dropped while spooling");
    }
}

/// Hand a leased row to the subscriber, or discard it on cancellation.
/// The lease ticket is released either way.
async fn forward(
    output: &mpsc::Sender<Row>,
    leased: Leased,
    token: &CancellationToken,
    delivered: &AtomicU64,
    listener: &str,
) {
    let (row, ticket) = leased.into_parts();
    tokio::select! {
        biased;
        _ = token.cancelled() => {}
        sent = output.send(row) => {
            if sent.is_ok() {
                record_delivery(delivered, listener, Mode::Buffered);
            }
        }
    }
    ticket.complete();
}

#[cfg_attr(not(feature = "otel"), allow(unused_variables))]
fn record_delivery(delivered: &AtomicU64, listener: &str, mode: Mode) {
    delivered.fetch_add(1, Ordering::Relaxed);

    #[cfg(feature = "otel")]
    {
        use crate::utils::metrics::{self, LISTENER_DELIVERED};
        LISTENER_DELIVERED.add(
            1,
            &[
                metrics::topic_attr(listener),
                metrics::mode_attr(&mode.to_string()),
            ],
        );
    }
}

/// Make a topic or owner name safe for use in a file name.
fn sanitize_file_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
