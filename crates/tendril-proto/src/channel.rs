//! Channel handles: ordered duplex byte streams multiplexed over one transport
//!
//! Writes are flow controlled per channel. A writer spends send credit for
//! every byte it queues and waits once the credit is gone; the peer's reader
//! returns credit with WINDOW_UPDATE frames as the application consumes data.

use crate::mux::MuxShared;
use crate::{Frame, ProtocolError};
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::trace;

/// Events delivered from the multiplexer to a channel's reader
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    End,
    Reset,
}

/// Bytes this endpoint may still send before the peer returns credit
#[derive(Debug, Default)]
pub(crate) struct SendCredit {
    /// Negative after whole-message sends overdraw the window
    available: i64,
    waker: Option<Waker>,
}

/// Per-channel state shared by the multiplexer and the handles
#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    /// Remote END does not end the local write side
    pub half_open: AtomicBool,
    /// We sent END
    pub local_ended: AtomicBool,
    /// Peer sent END
    pub remote_ended: AtomicBool,
    /// Either side reset the channel
    pub reset: AtomicBool,
    credit: Mutex<SendCredit>,
}

impl ChannelState {
    fn credit(&self) -> MutexGuard<'_, SendCredit> {
        self.credit.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_window(&self, window: usize) {
        self.credit().available = i64::try_from(window).unwrap_or(i64::MAX);
    }

    /// Take up to `want` bytes of credit, or park the writer until some is
    /// returned
    fn poll_credit(&self, cx: &mut Context<'_>, want: usize) -> Poll<usize> {
        let mut credit = self.credit();
        if credit.available > 0 {
            let granted = want.min(credit.available as usize);
            credit.available -= granted as i64;
            Poll::Ready(granted)
        } else {
            credit.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }

    /// Spend credit without waiting
    fn charge(&self, bytes: usize) {
        self.credit().available -= bytes as i64;
    }

    /// Return credit granted by the peer
    pub(crate) fn grant(&self, bytes: u32) {
        let waker = {
            let mut credit = self.credit();
            credit.available += i64::from(bytes);
            if credit.available > 0 {
                credit.waker.take()
            } else {
                None
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wake a writer parked on credit so it observes a reset or shutdown
    pub(crate) fn wake_writer(&self) {
        let waker = self.credit().waker.take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Identity of a channel plus the way back to the multiplexer
pub(crate) struct ChannelLink {
    pub id: u32,
    /// True when this endpoint opened the channel
    pub local_origin: bool,
    pub name: String,
    pub state: Arc<ChannelState>,
    pub mux: Arc<MuxShared>,
    /// Keeps multi-chunk sends contiguous
    send_lock: Mutex<()>,
}

impl ChannelLink {
    pub(crate) fn new(id: u32, local_origin: bool, name: String, state: Arc<ChannelState>, mux: Arc<MuxShared>) -> Self {
        Self {
            id,
            local_origin,
            name,
            state,
            mux,
            send_lock: Mutex::new(()),
        }
    }

    fn check_writable(&self) -> Result<(), ProtocolError> {
        if self.state.reset.load(Ordering::Acquire) {
            return Err(ProtocolError::StreamReset(self.name.clone()));
        }
        if self.state.local_ended.load(Ordering::Acquire) || self.mux.is_closed() {
            return Err(ProtocolError::StreamClosed);
        }
        Ok(())
    }

    fn lock_sends(&self) -> MutexGuard<'_, ()> {
        self.send_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle that writes whole messages to a channel
///
/// Unlike [`ChannelWriter`], dropping a sender never ends the channel.
#[derive(Clone)]
pub struct ChannelSender {
    link: Arc<ChannelLink>,
}

impl ChannelSender {
    /// Channel name
    pub fn name(&self) -> &str {
        &self.link.name
    }

    /// Send bytes; larger payloads are split into several frames that the
    /// peer receives back to back.
    ///
    /// Whole-message sends never wait for send credit. They overdraw the
    /// window instead, which holds back later [`ChannelWriter`] writes on
    /// the same channel until the peer catches up.
    pub fn send(&self, data: Bytes) -> Result<(), ProtocolError> {
        let link = &self.link;
        link.check_writable()?;

        let max_chunk = link.mux.config.max_chunk_size.max(1);
        let _guard = link.lock_sends();
        link.state.charge(data.len());
        let mut data = data;
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(max_chunk));
            link.mux.send_frame(Frame::data(link.id, link.local_origin, chunk))?;
        }
        Ok(())
    }

    /// Finish the local write side. Idempotent.
    pub fn end(&self) {
        self.link.mux.end_local(&self.link);
    }

    /// Abort the channel in both directions. Idempotent.
    pub fn reset(&self) {
        self.link.mux.reset_channel(&self.link);
    }

    /// Whether further sends will fail
    pub fn is_closed(&self) -> bool {
        let state = &self.link.state;
        state.reset.load(Ordering::Acquire) || state.local_ended.load(Ordering::Acquire) || self.link.mux.is_closed()
    }
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("name", &self.link.name)
            .field("id", &self.link.id)
            .field("local_origin", &self.link.local_origin)
            .finish()
    }
}

/// Read state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Open,
    Eof,
    Reset,
    Aborted,
}

/// Read half of a channel
///
/// Consumed bytes are returned to the peer as send credit.
pub struct ChannelReader {
    link: Arc<ChannelLink>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    pending: Bytes,
    state: ReadState,
    /// Bytes consumed since the last window update
    unacked: usize,
    reset_on_drop: bool,
}

impl ChannelReader {
    /// Channel name
    pub fn name(&self) -> &str {
        &self.link.name
    }

    /// Reset the channel if this reader is dropped before the end of the
    /// stream, so the peer stops producing data nobody will read
    pub fn set_reset_on_drop(&mut self, enabled: bool) {
        self.reset_on_drop = enabled;
    }

    fn consumed(&mut self, bytes: usize) {
        self.unacked += bytes;
        if self.unacked >= (self.link.mux.config.initial_window / 2).max(1) {
            self.return_credit();
        }
    }

    fn return_credit(&mut self) {
        if self.unacked == 0 {
            return;
        }
        let credit = u32::try_from(self.unacked).unwrap_or(u32::MAX);
        self.unacked -= credit as usize;
        let state = &self.link.state;
        if state.remote_ended.load(Ordering::Acquire) || state.reset.load(Ordering::Acquire) {
            return;
        }
        let link = &self.link;
        let _ = link.mux.send_frame(Frame::window_update(link.id, link.local_origin, credit));
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = buf.remaining().min(this.pending.len());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                this.consumed(n);
                return Poll::Ready(Ok(()));
            }

            match this.state {
                ReadState::Eof => return Poll::Ready(Ok(())),
                ReadState::Reset => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        format!("channel {} reset", this.link.name),
                    )))
                }
                ReadState::Aborted => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        format!("channel {} aborted: multiplexer closed", this.link.name),
                    )))
                }
                ReadState::Open => {}
            }

            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Inbound::Data(bytes))) => this.pending = bytes,
                Poll::Ready(Some(Inbound::End)) => this.state = ReadState::Eof,
                Poll::Ready(Some(Inbound::Reset)) => this.state = ReadState::Reset,
                Poll::Ready(None) => this.state = ReadState::Aborted,
                Poll::Pending => {
                    // Caught up: hand back whatever credit is outstanding
                    this.return_credit();
                    return Poll::Pending;
                }
            }
        }
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        let link = &self.link;
        if self.reset_on_drop && self.state == ReadState::Open && !link.state.remote_ended.load(Ordering::Acquire) {
            trace!(channel = %link.name, "reader dropped before end of stream");
            link.mux.reset_channel(link);
        }
    }
}

/// Write half of a channel. Dropping it ends the local write side.
pub struct ChannelWriter {
    sender: ChannelSender,
}

impl ChannelWriter {
    /// Channel name
    pub fn name(&self) -> &str {
        self.sender.name()
    }

    /// Cloneable message sender for the same channel
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Abort the channel in both directions
    pub fn reset(&self) {
        self.sender.reset();
    }
}

impl AsyncWrite for ChannelWriter {
    /// Writes at most one chunk, and only as much as the send credit allows
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let link = &self.sender.link;
        link.check_writable()?;

        let want = buf.len().min(link.mux.config.max_chunk_size.max(1));
        let granted = match link.state.poll_credit(cx, want) {
            Poll::Ready(granted) => granted,
            Poll::Pending => {
                // A reset between the check above and parking finds no waker
                link.check_writable()?;
                return Poll::Pending;
            }
        };

        let _guard = link.lock_sends();
        link.mux
            .send_frame(Frame::data(link.id, link.local_origin, Bytes::copy_from_slice(&buf[..granted])))?;
        Poll::Ready(Ok(granted))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.sender.end();
        Poll::Ready(Ok(()))
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        self.sender.end();
    }
}

/// A named duplex sub-channel
pub struct Channel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl Channel {
    pub(crate) fn new(link: ChannelLink, rx: mpsc::UnboundedReceiver<Inbound>) -> Self {
        let link = Arc::new(link);
        Self {
            reader: ChannelReader {
                link: Arc::clone(&link),
                rx,
                pending: Bytes::new(),
                state: ReadState::Open,
                unacked: 0,
                reset_on_drop: false,
            },
            writer: ChannelWriter {
                sender: ChannelSender { link },
            },
        }
    }

    /// Channel name
    pub fn name(&self) -> &str {
        self.reader.name()
    }

    /// Whether this endpoint opened the channel
    pub fn is_local(&self) -> bool {
        self.writer.sender.link.local_origin
    }

    /// Keep the local write side open after the peer ends its side
    pub fn set_half_open(&self, half_open: bool) {
        self.writer.sender.link.state.half_open.store(half_open, Ordering::Release);
    }

    /// Whether the channel is half-open
    pub fn is_half_open(&self) -> bool {
        self.writer.sender.link.state.half_open.load(Ordering::Acquire)
    }

    /// Cloneable message sender for this channel
    pub fn sender(&self) -> ChannelSender {
        self.writer.sender()
    }

    /// Abort the channel in both directions
    pub fn reset(&self) {
        self.writer.reset();
    }

    /// Split into independently owned halves
    pub fn into_split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("local", &self.is_local())
            .finish()
    }
}

impl AsyncRead for Channel {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for Channel {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
