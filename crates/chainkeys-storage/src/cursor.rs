//! Idle-deadline row cursor.
//!
//! Rows are produced by a spawned task into a one-slot channel. If the
//! consumer leaves a row untaken for longer than the idle deadline, the
//! producer gives up, dropping its query stream (which cancels the query),
//! and the consumer sees a single [`SyncError::Timeout`] before the stream
//! ends. A cursor cannot be restarted.

use futures::future::Future;
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use chainkeys_core::error::{Result, SyncError};

/// Producer half of a cursor.
pub struct RowSink<T> {
    tx: mpsc::Sender<Result<T>>,
    idle: Duration,
    timed_out: Arc<AtomicBool>,
}

impl<T: Send + 'static> RowSink<T> {
    /// Hand one row to the consumer.
    ///
    /// Returns `false` once the producer must stop: the consumer went away or
    /// sat idle past the deadline.
    pub async fn send(&self, row: Result<T>) -> bool {
        match tokio::time::timeout(self.idle, self.tx.send(row)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!(idle_ms = self.idle.as_millis() as u64, "cursor idle, cancelling query");
                self.timed_out.store(true, Ordering::Release);
                false
            }
        }
    }
}

/// Spawn `producer` and return the consumer stream.
pub fn spawn_cursor<T, F, Fut>(idle: Duration, producer: F) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: FnOnce(RowSink<T>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let timed_out = Arc::new(AtomicBool::new(false));
    let sink = RowSink {
        tx,
        idle,
        timed_out: Arc::clone(&timed_out),
    };
    tokio::spawn(producer(sink));

    let ms = idle.as_millis() as u64;
    futures::stream::unfold(
        (rx, timed_out, false),
        move |(mut rx, timed_out, finished)| async move {
            if finished {
                return None;
            }
            match rx.recv().await {
                Some(row) => Some((row, (rx, timed_out, false))),
                None if timed_out.load(Ordering::Acquire) => {
                    Some((Err(SyncError::Timeout { ms }), (rx, timed_out, true)))
                }
                None => None,
            }
        },
    )
    .boxed()
}

/// Cursor over rows already in memory.
pub fn cursor_from_vec<T: Send + 'static>(
    rows: Vec<T>,
    idle: Duration,
) -> BoxStream<'static, Result<T>> {
    spawn_cursor(idle, move |sink| async move {
        for row in rows {
            if !sink.send(Ok(row)).await {
                break;
            }
        }
    })
}
