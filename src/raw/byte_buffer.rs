use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::raw::channel_error::ChannelError;

struct BufferState {
    data: VecDeque<u8>,
    closed: bool,
    aborted: Option<String>,
}

/// A bounded byte queue between the handler receiving a raw channel's blocks and the
///  application reading them. Writers wait while it is full, readers while it is empty.
pub struct ByteRingBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
    not_full: Notify,
    not_empty: Notify,
}

impl ByteRingBuffer {
    pub fn new(capacity: usize) -> ByteRingBuffer {
        ByteRingBuffer {
            capacity,
            state: Mutex::new(BufferState {
                data: VecDeque::new(),
                closed: false,
                aborted: None,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends all of `data`, waiting for free space as necessary
    pub async fn write_all(&self, mut data: &[u8]) -> Result<(), ChannelError> {
        while !data.is_empty() {
            let notified = self.not_full.notified();
            {
                let mut state = self.lock();
                if let Some(reason) = &state.aborted {
                    return Err(ChannelError::Aborted(reason.clone()));
                }
                if state.closed {
                    return Err(ChannelError::Closed);
                }

                let n = data.len().min(self.capacity - state.data.len());
                if n > 0 {
                    state.data.extend(&data[..n]);
                    data = &data[n..];
                    drop(state);
                    self.not_empty.notify_waiters();
                    continue;
                }
            }
            notified.await;
        }
        Ok(())
    }

    /// Reads available bytes, waiting until there are some. Returns 0 at the end of the stream,
    ///  i.e. after the buffer was closed and drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.not_empty.notified();
            {
                let mut state = self.lock();
                if let Some(reason) = &state.aborted {
                    return Err(ChannelError::Aborted(reason.clone()));
                }
                if !state.data.is_empty() {
                    let n = buf.len().min(state.data.len());
                    for (dst, src) in buf.iter_mut().zip(state.data.drain(..n)) {
                        *dst = src;
                    }
                    drop(state);
                    self.not_full.notify_waiters();
                    return Ok(n);
                }
                if state.closed {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    /// No more data is written. Readers get the remaining bytes, then end-of-stream.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Fails pending and future reads and writes, discarding buffered data. This has no effect
    ///  on a buffer that was closed regularly, so readers can still drain it.
    pub fn abort(&self, reason: &str) {
        {
            let mut state = self.lock();
            if state.closed || state.aborted.is_some() {
                return;
            }
            state.aborted = Some(reason.to_string());
            state.data.clear();
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}
