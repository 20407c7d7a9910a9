//! SENDME flow control
//!
//! ## How It Works:
//!
//! 1. **Windows:** Each stream and circuit has a send window and a receive counter
//! 2. **Decrement:** Only RELAY_DATA cells count against either side
//! 3. **SENDME:** After `increment` received DATA cells, a SENDME goes back
//! 4. **Increment:** Receiving SENDME reopens the send window by `increment`
//!
//! A sender whose window is exhausted parks on a [`Notify`] until a SENDME
//! arrives, the owner closes the window, or the wait times out.

use crate::config::Settings;
use crate::error::{Result, TorError};
use crate::protocol::cell::StreamId;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Sending half of a SENDME window
#[derive(Debug)]
pub struct SendWindow {
    state: Mutex<SendState>,
    increment: u16,
    notify: Notify,
}

#[derive(Debug)]
struct SendState {
    window: u16,
    closed: bool,
}

impl SendWindow {
    pub fn new(initial: u16, increment: u16) -> Self {
        Self {
            state: Mutex::new(SendState {
                window: initial,
                closed: false,
            }),
            increment,
            notify: Notify::new(),
        }
    }

    /// Cells that can still be sent
    pub fn available(&self) -> u16 {
        self.state.lock().map(|s| s.window).unwrap_or(0)
    }

    /// Take one cell from the window without waiting
    pub fn try_consume(&self) -> Result<bool> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TorError::Internal("Flow-control lock poisoned".into()))?;
        if state.closed {
            return Err(TorError::Stream("Window closed".into()));
        }
        if state.window == 0 {
            return Ok(false);
        }
        state.window -= 1;
        Ok(true)
    }

    /// Take one cell from the window, waiting for a SENDME if it is exhausted
    pub async fn consume(&self, wait: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register interest before checking so a SENDME in between is not lost
            let notified = self.notify.notified();
            if self.try_consume()? {
                return Ok(());
            }
            log::debug!("⏸️ Send window exhausted, waiting for SENDME");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TorError::StreamTimeout(
                    "Send window stayed exhausted (no SENDME)".into(),
                ));
            }
        }
    }

    /// Give back one cell taken but never sent
    pub fn release(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.window = state.window.saturating_add(1);
        }
        self.notify.notify_waiters();
    }

    /// Reopen the window after a SENDME
    pub fn on_sendme_received(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.window = state.window.saturating_add(self.increment);
            log::debug!("Send window: {} (+{})", state.window, self.increment);
        }
        self.notify.notify_waiters();
    }

    /// Fail every current and future waiter
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.notify.notify_waiters();
    }
}

/// Receiving half of a SENDME window
#[derive(Debug, Clone)]
pub struct RecvWindow {
    remaining: u16,
    increment: u16,
}

impl RecvWindow {
    pub fn new(increment: u16) -> Self {
        Self {
            remaining: increment,
            increment,
        }
    }

    /// Count one received DATA cell; `true` means a SENDME is due
    pub fn on_receive(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.remaining = self.increment;
            return true;
        }
        false
    }
}

/// Circuit-level flow control
#[derive(Debug)]
pub struct CircuitFlowControl {
    pub send: SendWindow,
    recv: Mutex<RecvWindow>,
}

impl CircuitFlowControl {
    pub fn new(settings: &Settings) -> Self {
        Self {
            send: SendWindow::new(settings.circuit_window, settings.circuit_window_increment),
            recv: Mutex::new(RecvWindow::new(settings.circuit_window_increment)),
        }
    }

    /// Count a received DATA cell; `true` means a circuit SENDME is due
    pub fn on_receive_data(&self) -> bool {
        self.recv.lock().map(|mut r| r.on_receive()).unwrap_or(false)
    }
}

/// Stream-level flow control
#[derive(Debug)]
pub struct StreamFlowControl {
    pub stream_id: StreamId,
    pub send: SendWindow,
    recv: Mutex<RecvWindow>,
}

impl StreamFlowControl {
    pub fn new(stream_id: StreamId, settings: &Settings) -> Self {
        Self {
            stream_id,
            send: SendWindow::new(settings.stream_window, settings.stream_window_increment),
            recv: Mutex::new(RecvWindow::new(settings.stream_window_increment)),
        }
    }

    /// Count a received DATA cell; `true` means a stream SENDME is due
    pub fn on_receive_data(&self) -> bool {
        let due = self.recv.lock().map(|mut r| r.on_receive()).unwrap_or(false);
        if due {
            log::debug!("Stream {} recv window depleted, sending SENDME", self.stream_id);
        }
        due
    }

    /// Take one DATA cell from this stream's window and then from `circuit`
    ///
    /// If the circuit window cannot be had, the stream cell is given back.
    pub async fn reserve_cell(&self, circuit: &SendWindow, wait: Duration) -> Result<()> {
        self.send.consume(wait).await?;
        if let Err(e) = circuit.consume(wait).await {
            self.send.release();
            return Err(e);
        }
        Ok(())
    }

    /// Check if stream is blocked (can't send more data)
    pub fn is_blocked(&self) -> bool {
        self.send.available() == 0
    }
}
