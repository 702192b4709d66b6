use futures::Stream;
use futures::stream::{BoxStream, StreamExt};
use probe_eventlog::{Event, EventLog, Position};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

/// Ordered, resumable feed of one session's events.
///
/// Starts at a caller-chosen position, replays history from the log, then
/// follows live appends. Yields until the session is closed and every event
/// committed before the close has been delivered. A lagging subscriber
/// re-reads the log by position instead of slowing the writer.
pub struct EventStream {
    inner: BoxStream<'static, Event>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.inner.poll_next_unpin(cx)
    }
}

struct Cursor {
    log: EventLog,
    receiver: broadcast::Receiver<Event>,
    next: Position,
    closed: CancellationToken,
}

impl Cursor {
    async fn next_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.log.get(self.next) {
                self.next += 1;
                return Some(event);
            }
            if self.closed.is_cancelled() {
                return None;
            }

            tokio::select! {
                biased;
                _ = self.closed.cancelled() => {}
                received = self.receiver.recv() => match received {
                    Ok(event) if event.position == self.next => {
                        self.next += 1;
                        return Some(event);
                    }
                    // Already delivered, or ahead of a gap the log fills in.
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(
                            session_id = %self.log.session_id(),
                            skipped,
                            next = self.next,
                            "event subscriber lagged, catching up from log"
                        );
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }
}

impl EventStream {
    /// Subscribes before reading history so no append falls between the
    /// replay and the live feed.
    pub fn follow(log: EventLog, from: Position, closed: CancellationToken) -> Self {
        let receiver = log.subscribe();
        let cursor = Cursor {
            log,
            receiver,
            next: from,
            closed,
        };
        let inner = futures::stream::unfold(cursor, |mut cursor| async move {
            let event = cursor.next_event().await?;
            Some((event, cursor))
        })
        .boxed();
        Self { inner }
    }
}
