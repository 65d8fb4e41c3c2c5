//! Tokio TCP transport building block.
//!
//! [`TokioTransport`] provides the connection and event-set half of the
//! [`Api`](crate::Api) surface over plain TCP with length-delimited
//! frames: nonblocking connects held as stored futures and polled to
//! readiness, `try_read`/`try_write` for the async verbs, and a
//! `block_on` readiness select for the event-set wait. Hosts compose it
//! with their own clock/WAL/callback half into a full `Api`
//! implementation; the methods here mirror the trait's signatures
//! one-to-one so that composition is pure delegation.
//!
//! Endpoints are fixed at construction; the conninfo string handed to
//! [`TokioTransport::connect_start`] is accepted for interface parity but
//! the TCP address wins.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures::future::select_all;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::api::{
    AsyncRead, AsyncWrite, ConnStatus, ConnectPoll, ExecResult, Flush, Readiness, WaitEvent,
};

/// Frame a safekeeper sends to confirm the control query opened a
/// bidirectional copy stream.
pub const COPY_BOTH_RESPONSE: &[u8] = b"CopyBothResponse";

const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

fn new_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum ConnState {
    Idle,
    /// Connect in flight. Polled in place so that losing a readiness
    /// race does not drop the attempt.
    Connecting(ConnectFuture),
    Open(TcpStream),
}

struct Conn {
    addr: String,
    state: ConnState,
    error: Option<String>,
    codec: LengthDelimitedCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Conn {
    fn new(addr: String) -> Self {
        Self {
            addr,
            state: ConnState::Idle,
            error: None,
            codec: new_codec(),
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
        }
    }

    fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    /// Resolve once the connection is ready for `interest`.
    async fn wait_ready(&mut self, idx: usize, interest: Readiness) -> WaitEvent {
        enum Resolved {
            Connected(io::Result<TcpStream>),
            Ready(io::Result<tokio::io::Ready>),
        }

        let resolved = match &mut self.state {
            ConnState::Connecting(fut) => {
                Resolved::Connected(std::future::poll_fn(|cx| fut.as_mut().poll(cx)).await)
            }
            ConnState::Open(stream) => Resolved::Ready(stream.ready(tokio_interest(interest)).await),
            ConnState::Idle => return std::future::pending().await,
        };

        match resolved {
            Resolved::Connected(Ok(stream)) => {
                self.state = ConnState::Open(stream);
                WaitEvent::Socket(idx, interest)
            }
            Resolved::Connected(Err(e)) => {
                self.state = ConnState::Idle;
                self.fail(e.to_string());
                WaitEvent::Socket(idx, interest)
            }
            Resolved::Ready(Ok(ready)) => {
                let readiness = Readiness {
                    read: ready.is_readable(),
                    write: ready.is_writable(),
                };
                if readiness.is_none() {
                    // Closed-only readiness; report what was asked for so
                    // the state machine reads the error out.
                    return WaitEvent::Socket(idx, interest);
                }
                WaitEvent::Socket(idx, readiness)
            }
            Resolved::Ready(Err(e)) => {
                self.fail(e.to_string());
                WaitEvent::Socket(idx, interest)
            }
        }
    }

    /// Push buffered frame bytes into the socket until done or blocked.
    fn drain_writes(&mut self) -> Flush {
        let ConnState::Open(stream) = &mut self.state else {
            return Flush::Failed;
        };
        while !self.write_buf.is_empty() {
            match stream.try_write(&self.write_buf) {
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flush::Pending,
                Err(e) => {
                    self.error = Some(e.to_string());
                    return Flush::Failed;
                }
            }
        }
        Flush::Done
    }
}

fn tokio_interest(readiness: Readiness) -> Interest {
    match (readiness.read, readiness.write) {
        (_, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (true, true) => Interest::READABLE | Interest::WRITABLE,
    }
}

/// TCP connections plus the event set, one slot per safekeeper.
pub struct TokioTransport {
    runtime: Runtime,
    latch: Arc<Notify>,
    conns: Vec<Conn>,
    registered: Vec<Option<Readiness>>,
}

impl TokioTransport {
    /// One slot per `host:port` endpoint, in safekeeper order.
    pub fn new(addrs: Vec<String>) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let registered = vec![None; addrs.len()];
        let conns = addrs.into_iter().map(Conn::new).collect();
        Ok(Self {
            runtime,
            latch: Arc::new(Notify::new()),
            conns,
            registered,
        })
    }

    /// Handle the host notifies when new WAL is available; wakes
    /// [`TokioTransport::wait`] with [`WaitEvent::Latch`].
    #[must_use]
    pub fn latch(&self) -> Arc<Notify> {
        self.latch.clone()
    }

    pub fn connect_start(&mut self, sk: usize, _conninfo: &str) {
        let _guard = self.runtime.enter();
        let conn = &mut self.conns[sk];
        let addr = conn.addr.clone();
        conn.state = ConnState::Connecting(Box::pin(TcpStream::connect(addr)));
        conn.error = None;
        conn.codec = new_codec();
        conn.read_buf.clear();
        conn.write_buf.clear();
    }

    pub fn conn_status(&mut self, sk: usize) -> ConnStatus {
        match &self.conns[sk].state {
            ConnState::Connecting(_) => ConnStatus::InProgress,
            ConnState::Open(_) => ConnStatus::Ok,
            ConnState::Idle => ConnStatus::Bad,
        }
    }

    pub fn connect_poll(&mut self, sk: usize) -> ConnectPoll {
        let Self { runtime, conns, .. } = self;
        let conn = &mut conns[sk];
        match &mut conn.state {
            ConnState::Connecting(fut) => {
                let _guard = runtime.enter();
                let waker = futures::task::noop_waker();
                let mut cx = Context::from_waker(&waker);
                match fut.as_mut().poll(&mut cx) {
                    // Readiness arrives through `wait`; nothing to do yet.
                    Poll::Pending => ConnectPoll::NeedWrite,
                    Poll::Ready(Ok(stream)) => {
                        conn.state = ConnState::Open(stream);
                        ConnectPoll::Ok
                    }
                    Poll::Ready(Err(e)) => {
                        conn.state = ConnState::Idle;
                        conn.fail(e.to_string());
                        ConnectPoll::Failed
                    }
                }
            }
            ConnState::Open(_) => ConnectPoll::Ok,
            ConnState::Idle => ConnectPoll::Failed,
        }
    }

    pub fn send_query(&mut self, sk: usize, query: &str) -> bool {
        self.blocking_write(sk, query.as_bytes())
    }

    pub fn query_result(&mut self, sk: usize) -> ExecResult {
        match self.read_message(sk) {
            AsyncRead::Message(frame) => {
                if frame.as_ref() == COPY_BOTH_RESPONSE {
                    ExecResult::CopyBothStarted
                } else {
                    ExecResult::UnexpectedSuccess
                }
            }
            AsyncRead::WouldBlock => ExecResult::NeedsInput,
            AsyncRead::Failed => ExecResult::Failed,
        }
    }

    pub fn read_message(&mut self, sk: usize) -> AsyncRead {
        let conn = &mut self.conns[sk];
        let ConnState::Open(stream) = &mut conn.state else {
            return AsyncRead::Failed;
        };
        loop {
            match conn.codec.decode(&mut conn.read_buf) {
                Ok(Some(frame)) => return AsyncRead::Message(frame.freeze()),
                Ok(None) => {}
                Err(e) => {
                    conn.error = Some(e.to_string());
                    return AsyncRead::Failed;
                }
            }
            match stream.try_read_buf(&mut conn.read_buf) {
                Ok(0) => {
                    conn.error = Some("connection closed by peer".to_owned());
                    return AsyncRead::Failed;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return AsyncRead::WouldBlock,
                Err(e) => {
                    conn.error = Some(e.to_string());
                    return AsyncRead::Failed;
                }
            }
        }
    }

    pub fn write_message(&mut self, sk: usize, msg: &[u8]) -> AsyncWrite {
        let conn = &mut self.conns[sk];
        if let Err(e) = conn
            .codec
            .encode(Bytes::copy_from_slice(msg), &mut conn.write_buf)
        {
            conn.fail(e.to_string());
            return AsyncWrite::Failed;
        }
        match conn.drain_writes() {
            Flush::Done => AsyncWrite::Done,
            Flush::Pending => AsyncWrite::TryFlush,
            Flush::Failed => AsyncWrite::Failed,
        }
    }

    pub fn blocking_write(&mut self, sk: usize, msg: &[u8]) -> bool {
        let Self { runtime, conns, .. } = self;
        let conn = &mut conns[sk];
        if let Err(e) = conn
            .codec
            .encode(Bytes::copy_from_slice(msg), &mut conn.write_buf)
        {
            conn.fail(e.to_string());
            return false;
        }
        let ConnState::Open(stream) = &mut conn.state else {
            conn.error = Some("not connected".to_owned());
            return false;
        };
        match runtime.block_on(stream.write_all_buf(&mut conn.write_buf)) {
            Ok(()) => true,
            Err(e) => {
                conn.error = Some(e.to_string());
                false
            }
        }
    }

    pub fn flush(&mut self, sk: usize) -> Flush {
        self.conns[sk].drain_writes()
    }

    pub fn close(&mut self, sk: usize) {
        let conn = &mut self.conns[sk];
        conn.state = ConnState::Idle;
        conn.error = None;
        conn.read_buf.clear();
        conn.write_buf.clear();
    }

    pub fn conn_error(&mut self, sk: usize) -> String {
        self.conns[sk]
            .error
            .clone()
            .unwrap_or_else(|| "unknown connection error".to_owned())
    }

    pub fn reset_event_set(&mut self) {
        self.registered.fill(None);
    }

    pub fn register(&mut self, sk: usize, interest: Readiness) {
        self.registered[sk] = Some(interest);
    }

    pub fn update_interest(&mut self, sk: usize, interest: Readiness) {
        self.registered[sk] = Some(interest);
    }

    /// Block until the latch fires, a registered socket becomes ready,
    /// or the timeout elapses.
    pub fn wait(&mut self, timeout: Option<Duration>) -> WaitEvent {
        let Self {
            runtime,
            latch,
            conns,
            registered,
        } = self;
        runtime.block_on(async {
            let mut futs: Vec<Pin<Box<dyn Future<Output = WaitEvent> + '_>>> = Vec::new();

            let latch = latch.clone();
            futs.push(Box::pin(async move {
                latch.notified().await;
                WaitEvent::Latch
            }));

            if let Some(timeout) = timeout {
                futs.push(Box::pin(async move {
                    tokio::time::sleep(timeout).await;
                    WaitEvent::Timeout
                }));
            }

            for (i, conn) in conns.iter_mut().enumerate() {
                match registered[i] {
                    Some(interest) if !interest.is_none() => {
                        futs.push(Box::pin(conn.wait_ready(i, interest)));
                    }
                    _ => {}
                }
            }

            let (event, _, _) = select_all(futs).await;
            event
        })
    }
}
