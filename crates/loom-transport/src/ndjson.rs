use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{ready, Stream};
use pin_project_lite::pin_project;

use loom_core::element::WireElement;
use loom_core::errors::{MalformedElement, SourceError};
use loom_core::source::SourceEvent;

/// Longest line accepted before it is reported as malformed and skipped.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

pin_project! {
    /// Turns a byte stream of newline-delimited JSON into source events.
    ///
    /// Lines may span chunk boundaries. A final line without a trailing
    /// newline is still decoded when the inner stream ends. A line longer
    /// than the limit yields one `Malformed` event and is dropped up to the
    /// next newline. After an inner error the stream yields one `Failed`
    /// event and ends.
    pub struct NdjsonStream<S> {
        #[pin]
        inner: S,
        // Bytes of the current partial line; never holds a newline.
        buffer: Vec<u8>,
        pending: VecDeque<SourceEvent>,
        max_line: usize,
        discarding: bool,
        done: bool,
    }
}

impl<S> NdjsonStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            max_line: DEFAULT_MAX_LINE_BYTES,
            discarding: false,
            done: false,
        }
    }

    pub fn with_max_line(mut self, bytes: usize) -> Self {
        self.max_line = bytes;
        self
    }
}

impl<S, E> Stream for NdjsonStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    type Item = SourceEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if *this.done {
                return Poll::Ready(None);
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => {
                    let mut rest: &[u8] = &chunk;
                    // Only the new chunk is scanned; the buffer has no newline.
                    while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
                        let (head, tail) = (&rest[..pos], &rest[pos + 1..]);
                        if std::mem::take(this.discarding) {
                            this.buffer.clear();
                        } else if this.buffer.len() + head.len() > *this.max_line {
                            this.buffer.clear();
                            this.pending.push_back(oversized(*this.max_line));
                        } else if this.buffer.is_empty() {
                            push_line(head, this.pending);
                        } else {
                            this.buffer.extend_from_slice(head);
                            let line = std::mem::take(this.buffer);
                            push_line(&line, this.pending);
                        }
                        rest = tail;
                    }
                    if *this.discarding {
                        continue;
                    }
                    if this.buffer.len() + rest.len() > *this.max_line {
                        this.buffer.clear();
                        *this.discarding = true;
                        this.pending.push_back(oversized(*this.max_line));
                    } else {
                        this.buffer.extend_from_slice(rest);
                    }
                }
                Some(Err(e)) => {
                    *this.done = true;
                    this.buffer.clear();
                    this.pending
                        .push_back(SourceEvent::Failed(SourceError::Interrupted(e.to_string())));
                }
                None => {
                    *this.done = true;
                    let rest = std::mem::take(this.buffer);
                    if !*this.discarding {
                        push_line(&rest, this.pending);
                    }
                }
            }
        }
    }
}

fn oversized(limit: usize) -> SourceEvent {
    SourceEvent::Malformed(MalformedElement::Decode(format!(
        "line exceeds {limit} bytes"
    )))
}

fn push_line(raw: &[u8], pending: &mut VecDeque<SourceEvent>) {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line.trim_end_matches('\r'),
        Err(e) => {
            pending.push_back(SourceEvent::Malformed(MalformedElement::Decode(format!(
                "invalid utf-8: {e}"
            ))));
            return;
        }
    };
    if line.trim().is_empty() {
        return;
    }
    pending.push_back(match WireElement::decode(line) {
        Ok(element) => SourceEvent::Element(element),
        Err(err) => SourceEvent::Malformed(err),
    });
}
