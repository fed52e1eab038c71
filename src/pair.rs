//! Paired inbound/outbound connections.
//!
//! Every accepted client gets a session. The inbound leg starts paused and is
//! not read from until an outbound leg created for the same session is linked
//! to it; unread client bytes wait in the kernel receive buffer meanwhile.
//! Once linked, bytes are copied verbatim in both directions and the end of
//! either leg closes the other.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, info};

use crate::error::{RelayError, Result};
use crate::stream::StreamType;

pub const BUFFER_SIZE: usize = 8192;

/// Upper bound on a single leg's shutdown, e.g. a TLS close_notify to a peer
/// that stopped reading.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, waiting for the outbound leg.
    Paused,
    /// Both legs exist and bytes flow.
    Linked,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionRecord {
    pub client_addr: SocketAddr,
    pub state: SessionState,
}

/// Live sessions, keyed by id. An entry exists from accept until the pair is
/// torn down; a closed session has no entry.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a new paused session. The entry is removed when the returned
    /// handle is dropped.
    pub fn open(self: &Arc<Self>, client_addr: SocketAddr) -> SessionHandle {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.sessions().insert(
            id,
            SessionRecord {
                client_addr,
                state: SessionState::Paused,
            },
        );
        SessionHandle {
            id,
            registry: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<SessionRecord> {
        self.sessions().get(&id).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_state(&self, id: SessionId, state: SessionState) {
        if let Some(record) = self.sessions().get_mut(&id) {
            record.state = state;
        }
    }

    fn close(&self, id: SessionId) {
        self.sessions().remove(&id);
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionRecord>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ownership of one registry entry.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    registry: Arc<SessionRegistry>,
}

impl SessionHandle {
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.close(self.id);
    }
}

/// Client-facing leg.
pub struct InboundConnection<S = TcpStream> {
    session: SessionHandle,
    stream: S,
    opposite: Option<SessionId>,
    accepting_data: bool,
}

impl<S> InboundConnection<S> {
    /// Wraps an accepted stream. Data flow starts suspended.
    pub fn new(session: SessionHandle, stream: S) -> Self {
        Self {
            session,
            stream,
            opposite: None,
            accepting_data: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.session.id
    }

    #[must_use]
    pub const fn is_accepting_data(&self) -> bool {
        self.accepting_data
    }

    pub fn opposite(&self) -> Result<SessionId> {
        self.opposite
            .ok_or(RelayError::NoOppositeConnection(self.id()))
    }

    /// Records the outbound leg and resumes data flow. Allowed exactly once.
    pub fn set_opposite<T>(&mut self, outbound: &OutboundConnection<T>) -> Result<()> {
        if self.opposite.is_some() {
            return Err(RelayError::AlreadyLinked(self.id()));
        }
        if outbound.opposite() != self.id() {
            return Err(RelayError::SessionMismatch {
                inbound: self.id(),
                outbound: outbound.opposite(),
            });
        }

        self.opposite = Some(outbound.opposite());
        self.accepting_data = true;
        self.session
            .registry
            .set_state(self.id(), SessionState::Linked);
        Ok(())
    }

    /// Drops the leg without relaying, closing the client socket.
    pub async fn close(mut self)
    where
        S: AsyncWrite + Unpin,
    {
        let session = self.id();
        close_leg(&mut self.stream, session, "client").await;
    }
}

/// Upstream-facing leg. Always created for a known inbound session.
#[derive(Debug)]
pub struct OutboundConnection<S = StreamType> {
    stream: S,
    opposite: SessionId,
}

impl<S> OutboundConnection<S> {
    pub fn new(opposite: SessionId, stream: S) -> Self {
        Self { stream, opposite }
    }

    #[must_use]
    pub const fn opposite(&self) -> SessionId {
        self.opposite
    }

    pub const fn stream(&self) -> &S {
        &self.stream
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Both legs of a linked session.
pub struct PairedConnection<I = TcpStream, O = StreamType> {
    inbound: InboundConnection<I>,
    outbound: OutboundConnection<O>,
}

impl<I, O> PairedConnection<I, O>
where
    I: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    /// Links an established outbound leg to its inbound peer, resuming the
    /// inbound data flow. On failure both legs are dropped and thereby closed.
    pub fn link(
        mut inbound: InboundConnection<I>,
        outbound: OutboundConnection<O>,
    ) -> Result<Self> {
        inbound.set_opposite(&outbound)?;
        Ok(Self { inbound, outbound })
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.inbound.id()
    }

    /// Copies bytes in both directions until either leg ends, then closes both.
    pub async fn relay(self) -> Result<RelayStats> {
        let session = self.id();
        self.inbound.opposite()?;
        debug_assert!(self.inbound.is_accepting_data());

        let Self { inbound, outbound } = self;
        let _handle = inbound.session;
        let (mut client_reader, mut client_writer) = tokio::io::split(inbound.stream);
        let (mut upstream_reader, mut upstream_writer) = tokio::io::split(outbound.stream);

        let mut stats = RelayStats::default();
        let ended = tokio::select! {
            result = forward(&mut client_reader, &mut upstream_writer, &mut stats.client_to_upstream) => {
                ("client", result)
            }
            result = forward(&mut upstream_reader, &mut client_writer, &mut stats.upstream_to_client) => {
                ("upstream", result)
            }
        };

        match &ended.1 {
            Ok(()) => info!(%session, side = ended.0, "Connection closed by peer"),
            Err(e) => info!(%session, side = ended.0, error = %e, "Connection lost"),
        }

        close_leg(&mut upstream_writer, session, "upstream").await;
        close_leg(&mut client_writer, session, "client").await;

        info!(
            %session,
            client_to_upstream = stats.client_to_upstream,
            upstream_to_client = stats.upstream_to_client,
            "Session closed"
        );
        Ok(stats)
    }
}

/// Shuts down one leg. Closing twice is harmless; the peer may already be gone.
async fn close_leg<W>(writer: &mut W, session: SessionId, side: &'static str)
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%session, side, error = %e, "Leg already closed"),
        Err(_) => debug!(%session, side, "Leg did not shut down in time, dropping it"),
    }
}

async fn forward<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        debug!(bytes = n, "Forwarding data");
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };
    use tokio::{
        io::{DuplexStream, ReadBuf, duplex},
        time::timeout,
    };
    use tokio_test::{assert_err, assert_ok};

    const TEST_TIMEOUT: Duration = Duration::from_secs(1);

    fn client_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    /// Returns the inbound leg plus the far (client) end of its pipe.
    fn inbound(registry: &Arc<SessionRegistry>) -> (InboundConnection<DuplexStream>, DuplexStream) {
        let (near, far) = duplex(BUFFER_SIZE);
        (InboundConnection::new(registry.open(client_addr()), near), far)
    }

    /// Returns an outbound leg for `session` plus the far (upstream) end of its pipe.
    fn outbound(session: SessionId) -> (OutboundConnection<DuplexStream>, DuplexStream) {
        let (near, far) = duplex(BUFFER_SIZE);
        (OutboundConnection::new(session, near), far)
    }

    async fn read_to_end(stream: &mut DuplexStream) -> Vec<u8> {
        let mut data = Vec::new();
        timeout(TEST_TIMEOUT, stream.read_to_end(&mut data))
            .await
            .expect("stream did not close")
            .unwrap();
        data
    }

    /// Upstream transport whose shutdown never completes, like a TLS peer
    /// that stopped reading before close_notify.
    struct StuckOnShutdown(DuplexStream);

    impl AsyncRead for StuckOnShutdown {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for StuckOnShutdown {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    #[test]
    fn registry_assigns_distinct_ids_and_forgets_dropped_sessions() {
        let registry = SessionRegistry::new();
        let first = registry.open(client_addr());
        let second = registry.open(client_addr());

        assert_ne!(first.id(), second.id());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(first.id()).unwrap().state, SessionState::Paused);

        let id = first.id();
        drop(first);
        assert!(registry.get(id).is_none());
        assert_eq!(registry.len(), 1);

        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn inbound_starts_paused_without_opposite() {
        let registry = SessionRegistry::new();
        let (inbound, _client) = inbound(&registry);

        assert!(!inbound.is_accepting_data());
        let err = inbound.opposite().unwrap_err();
        assert!(matches!(err, RelayError::NoOppositeConnection(id) if id == inbound.id()));
    }

    #[test]
    fn linking_resumes_inbound_and_marks_session_linked() {
        let registry = SessionRegistry::new();
        let (mut inbound, _client) = inbound(&registry);
        let (outbound, _upstream) = outbound(inbound.id());

        assert_ok!(inbound.set_opposite(&outbound));
        assert!(inbound.is_accepting_data());
        assert_eq!(inbound.opposite().unwrap(), inbound.id());
        assert_eq!(registry.get(inbound.id()).unwrap().state, SessionState::Linked);

        let err = assert_err!(inbound.set_opposite(&outbound));
        assert!(matches!(err, RelayError::AlreadyLinked(_)));
    }

    #[test]
    fn refuses_outbound_leg_of_another_session() {
        let registry = SessionRegistry::new();
        let (a, _client_a) = inbound(&registry);
        let (b, _client_b) = inbound(&registry);
        let (outbound_b, _upstream) = outbound(b.id());

        let err = PairedConnection::link(a, outbound_b).err().unwrap();
        assert!(matches!(err, RelayError::SessionMismatch { .. }));
        // The failed pair was dropped, so its session is gone.
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn early_client_data_is_held_until_linked() {
        let registry = SessionRegistry::new();
        let (inbound, mut client) = inbound(&registry);

        client.write_all(b"EHLO early\r\n").await.unwrap();
        assert_eq!(registry.get(inbound.id()).unwrap().state, SessionState::Paused);

        let (outbound, mut upstream) = outbound(inbound.id());
        let pair = PairedConnection::link(inbound, outbound).unwrap();
        let relay = tokio::spawn(pair.relay());

        let mut buf = [0u8; 12];
        timeout(TEST_TIMEOUT, upstream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"EHLO early\r\n");

        drop(client);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.client_to_upstream, 12);
    }

    #[tokio::test]
    async fn relays_both_directions_in_order() {
        let registry = SessionRegistry::new();
        let (inbound, mut client) = inbound(&registry);
        let (outbound, mut upstream) = outbound(inbound.id());
        let relay = tokio::spawn(PairedConnection::link(inbound, outbound).unwrap().relay());

        upstream.write_all(b"220 ready\r\n").await.unwrap();
        let mut greeting = [0u8; 11];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"220 ready\r\n");

        let chunks: Vec<Vec<u8>> = (0..50).map(|i| format!("line {i}\r\n").into_bytes()).collect();
        for chunk in &chunks {
            client.write_all(chunk).await.unwrap();
        }
        let expected = chunks.concat();
        let mut received = vec![0u8; expected.len()];
        timeout(TEST_TIMEOUT, upstream.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);

        drop(client);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.upstream_to_client, 11);
        assert_eq!(stats.client_to_upstream, expected.len() as u64);
    }

    #[tokio::test]
    async fn client_close_closes_upstream_and_ends_session() {
        let registry = SessionRegistry::new();
        let (inbound, client) = inbound(&registry);
        let (outbound, mut upstream) = outbound(inbound.id());
        let relay = tokio::spawn(PairedConnection::link(inbound, outbound).unwrap().relay());

        drop(client);
        assert!(read_to_end(&mut upstream).await.is_empty());

        assert_ok!(relay.await.unwrap());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn upstream_close_closes_client() {
        let registry = SessionRegistry::new();
        let (inbound, mut client) = inbound(&registry);
        let (outbound, mut upstream) = outbound(inbound.id());
        let relay = tokio::spawn(PairedConnection::link(inbound, outbound).unwrap().relay());

        upstream.write_all(b"221 bye\r\n").await.unwrap();
        drop(upstream);

        assert_eq!(read_to_end(&mut client).await, b"221 bye\r\n");
        assert_ok!(relay.await.unwrap());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn closing_unlinked_inbound_closes_client() {
        let registry = SessionRegistry::new();
        let (inbound, mut client) = inbound(&registry);

        inbound.close().await;

        assert!(read_to_end(&mut client).await.is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stuck_upstream_shutdown_still_closes_client() {
        let registry = SessionRegistry::new();
        let (inbound, mut client) = inbound(&registry);
        let (near, _upstream) = duplex(BUFFER_SIZE);
        let outbound = OutboundConnection::new(inbound.id(), StuckOnShutdown(near));
        let relay = tokio::spawn(PairedConnection::link(inbound, outbound).unwrap().relay());

        client.shutdown().await.unwrap();

        let mut rest = Vec::new();
        timeout(CLOSE_TIMEOUT * 3, client.read_to_end(&mut rest))
            .await
            .expect("client leg was not closed")
            .unwrap();
        assert!(rest.is_empty());
        assert_ok!(relay.await.unwrap());
        assert!(registry.is_empty());
    }
}
