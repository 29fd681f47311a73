//! A DNS transport multiplexing queries over a single stream connection.

// RFC 7766 describes DNS over TCP, including pipelining of queries and
// out-of-order responses over a single connection.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use core::fmt;
use core::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace};

use crate::codec::{LengthPrefixed, StreamCodec};
use crate::error::Error;
use crate::message::{Message, Metadata, Transport};
use crate::protocol::{self, Proxy, ServerAddr, SocketConfig};
use crate::transaction::{Reply, Transaction, Transactions};
use crate::utils::config::DefMinMax;

//------------ Configuration Constants ----------------------------------------

/// Limits for the time allowed to establish a connection.
const CONNECT_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    "connect timeout",
    Duration::from_secs(5),
    Duration::from_millis(1),
    Duration::from_secs(60),
);

/// Limits for the time a single write may stall.
const WRITE_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    "write timeout",
    Duration::from_secs(5),
    Duration::from_millis(1),
    Duration::from_secs(60),
);

/// Limits for the initial size of the read buffer.
///
/// The maximum fits the largest possible message plus its length prefix.
const READ_BUFFER_SIZE: DefMinMax<usize> =
    DefMinMax::new("read buffer size", 4096, 512, 65537);

//------------ Config ---------------------------------------------------------

/// Configuration for a multiplexed stream connection.
#[derive(Clone, Debug)]
pub struct Config {
    /// Time allowed for establishing a connection.
    connect_timeout: Duration,

    /// Time a single write may stall before the connection is given up.
    write_timeout: Duration,

    /// Initial size of the read buffer.
    read_buffer_size: usize,

    /// Size of the socket send buffer.
    send_buffer_size: Option<usize>,

    /// Size of the socket receive buffer.
    recv_buffer_size: Option<usize>,
}

impl Config {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Sets the connect timeout.
    ///
    /// If this value is too small or too large, it will be caped.
    pub fn set_connect_timeout(&mut self, value: Duration) {
        self.connect_timeout = CONNECT_TIMEOUT.limit(value)
    }

    /// Returns the write timeout.
    ///
    /// This is the longest time writing a single request may take. If it
    /// takes longer, the connection is considered broken.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Sets the write timeout.
    ///
    /// If this value is too small or too large, it will be caped.
    pub fn set_write_timeout(&mut self, value: Duration) {
        self.write_timeout = WRITE_TIMEOUT.limit(value)
    }

    /// Returns the initial size of the read buffer.
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    /// Sets the initial size of the read buffer.
    ///
    /// If this value is too small or too large, it will be caped.
    pub fn set_read_buffer_size(&mut self, value: usize) {
        self.read_buffer_size = READ_BUFFER_SIZE.limit(value)
    }

    /// Returns the socket send buffer size if one was set.
    pub fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size
    }

    /// Sets the socket send buffer size.
    ///
    /// With `None`, the system default is used.
    pub fn set_send_buffer_size(&mut self, value: Option<usize>) {
        self.send_buffer_size = value
    }

    /// Returns the socket receive buffer size if one was set.
    pub fn recv_buffer_size(&self) -> Option<usize> {
        self.recv_buffer_size
    }

    /// Sets the socket receive buffer size.
    ///
    /// With `None`, the system default is used.
    pub fn set_recv_buffer_size(&mut self, value: Option<usize>) {
        self.recv_buffer_size = value
    }

    /// Returns the socket level part of the config.
    fn socket(&self) -> SocketConfig {
        SocketConfig {
            connect_timeout: self.connect_timeout,
            send_buffer: self.send_buffer_size,
            recv_buffer: self.recv_buffer_size,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT.default(),
            write_timeout: WRITE_TIMEOUT.default(),
            read_buffer_size: READ_BUFFER_SIZE.default(),
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

//------------ Connection -----------------------------------------------------

/// A DNS transport over a single, shared stream connection.
///
/// Values of this type are cheap to clone. All clones share the same
/// underlying connection.
///
/// The connection to the server is only established when the first query
/// is sent. If the connection breaks, all queries waiting for a response
/// fail with [`Error::ConnectionClosed`] and the next query will connect
/// again.
#[derive(Clone)]
pub struct Connection {
    /// Reference to the actual connection object.
    inner: Arc<InnerConnection>,
}

impl Connection {
    /// Creates a new connection with default configuration.
    ///
    /// If `proxy` is given, the connection is established through it.
    /// Nothing happens on the network until the first query.
    pub fn new(
        server: impl Into<ServerAddr>,
        proxy: Option<Arc<dyn Proxy>>,
    ) -> Self {
        Self::with_config(server, proxy, Config::default())
    }

    /// Creates a new connection with the given configuration.
    pub fn with_config(
        server: impl Into<ServerAddr>,
        proxy: Option<Arc<dyn Proxy>>,
        config: Config,
    ) -> Self {
        Self::with_codec(server, proxy, config, LengthPrefixed::new())
    }

    /// Creates a new connection using a custom codec.
    pub fn with_codec(
        server: impl Into<ServerAddr>,
        proxy: Option<Arc<dyn Proxy>>,
        config: Config,
        codec: impl StreamCodec,
    ) -> Self {
        Connection {
            inner: Arc::new(InnerConnection {
                config,
                server: server.into(),
                proxy,
                codec: Arc::new(codec),
                state: Mutex::new(ConnState {
                    status: Status::Unconnected,
                    addr: None,
                    generation: 0,
                }),
                transactions: Transactions::new(),
                pooled: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                last_queried: parking_lot::Mutex::new(Instant::now()),
                unmatched: AtomicU64::new(0),
            }),
        }
    }

    /// Sends a request and waits for the response.
    ///
    /// The ID of the request identifies the response. If the ID is already
    /// in use by another query on this connection, the request is given a
    /// new random ID first.
    ///
    /// Both sending the request and waiting for the response are limited by
    /// `timeout` each. If either takes longer, `Ok(None)` is returned. The
    /// same happens if the connection turned out to be broken while
    /// sending, in which case trying again will use a new connection.
    ///
    /// If the connection is closed while waiting for the response, the
    /// query fails with [`Error::ConnectionClosed`]. Errors establishing
    /// the connection and codec errors are returned as they are. A request
    /// longer than 65535 octets fails with [`Error::StreamLongMessage`]
    /// without touching the connection.
    pub async fn query(
        &self,
        mut request: Message,
        timeout: Duration,
    ) -> Result<Option<Message>, Error> {
        let (txn, reply) = match self.inner.transactions.register(&mut request)
        {
            Ok(res) => res,
            Err(err) => {
                self.inner.touch();
                return Err(err);
            }
        };
        let _pending = PendingGuard {
            conn: &self.inner,
            txn: txn.clone(),
        };
        self.inner.clone().exchange(txn, request, reply, timeout).await
    }

    /// Marks the connection as managed by a connection pool.
    ///
    /// A pooled connection is not closed by [`dispose`][Self::dispose] but
    /// only by [`evict`][Self::evict].
    pub fn mark_pooled(&self) {
        self.inner.pooled.store(true, Ordering::Relaxed)
    }

    /// Returns whether the connection is managed by a connection pool.
    pub fn is_pooled(&self) -> bool {
        self.inner.pooled.load(Ordering::Relaxed)
    }

    /// Returns when the connection was last used for a query.
    ///
    /// This is updated at the end of every query, whether it succeeded or
    /// not. Before the first query, it is the time of creation.
    pub fn last_queried(&self) -> Instant {
        *self.inner.last_queried.lock()
    }

    /// Disposes of the connection.
    ///
    /// This closes the stream unless the connection is pooled, in which
    /// case nothing happens. Queries still waiting for a response fail
    /// once the reader has noticed the closed stream. Later queries return
    /// no response.
    ///
    /// Calling this more than once is harmless.
    pub async fn dispose(&self) {
        if self.is_pooled() {
            trace!("Not disposing of pooled connection to {}", self.server());
            return;
        }
        self.inner.close().await
    }

    /// Closes the connection even if it is pooled.
    ///
    /// This is meant to be used by the pool manager when evicting the
    /// connection from the pool.
    pub async fn evict(&self) {
        self.inner.close().await
    }

    /// Returns whether the connection has been disposed of.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Relaxed)
    }

    /// Returns whether there currently is a live stream.
    pub async fn is_connected(&self) -> bool {
        matches!(self.inner.state.lock().await.status, Status::Connected(_))
    }

    /// Returns the number of queries currently in flight.
    pub fn pending(&self) -> usize {
        self.inner.transactions.len()
    }

    /// Returns the number of responses that were dropped.
    ///
    /// These are responses that arrived for an ID without a waiting query,
    /// usually because the query had already timed out.
    pub fn unmatched_responses(&self) -> u64 {
        self.inner.unmatched.load(Ordering::Relaxed)
    }

    /// Returns the address of the server.
    pub fn server(&self) -> &ServerAddr {
        &self.inner.server
    }

    /// Returns the configuration of the connection.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.inner.server)
            .field("proxy", &self.inner.proxy)
            .field("pooled", &self.is_pooled())
            .field("disposed", &self.is_disposed())
            .field("pending", &self.pending())
            .finish()
    }
}

//------------ PendingGuard ---------------------------------------------------

/// Cleans up after a query however it ends.
///
/// Removes the transaction from the table, cancels it if it is still
/// pending, and records the time of the query.
struct PendingGuard<'a> {
    /// The connection the query was sent on.
    conn: &'a InnerConnection,

    /// The transaction of the query.
    txn: Arc<Transaction>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.conn.transactions.remove_entry(&self.txn) && self.txn.cancel()
        {
            trace!("Canceled transaction {}", self.txn.id());
        }
        self.conn.touch();
    }
}

//------------ InnerConnection ------------------------------------------------

/// The actual implementation of the connection.
struct InnerConnection {
    /// User configuration variables.
    config: Config,

    /// The server to connect to.
    server: ServerAddr,

    /// The proxy to connect through, if any.
    proxy: Option<Arc<dyn Proxy>>,

    /// The codec for putting messages onto the stream.
    codec: Arc<dyn StreamCodec>,

    /// The connection state.
    ///
    /// Whoever writes to the stream needs to hold this lock.
    state: Mutex<ConnState>,

    /// The transactions currently in flight.
    transactions: Transactions,

    /// Is the connection managed by a pool?
    pooled: AtomicBool,

    /// Has the connection been disposed of?
    disposed: AtomicBool,

    /// When the last query finished.
    last_queried: parking_lot::Mutex<Instant>,

    /// Number of responses dropped because nobody was waiting for them.
    unmatched: AtomicU64,
}

/// The state of the stream behind the connection lock.
struct ConnState {
    /// Where the stream is at.
    status: Status,

    /// The resolved server address once we have it.
    addr: Option<SocketAddr>,

    /// The number of streams established so far.
    generation: u64,
}

/// The status of the stream.
enum Status {
    /// There is no stream. The next query will create one.
    Unconnected,

    /// There is a live stream.
    Connected(LiveStream),

    /// The connection has been disposed of. There will be no more streams.
    Closed,
}

/// The write side of a live stream.
struct LiveStream {
    /// The write half of the socket.
    write: OwnedWriteHalf,

    /// Tells the reader to stop reading.
    close: Option<oneshot::Sender<()>>,

    /// The number of this stream.
    generation: u64,
}

impl LiveStream {
    /// Shuts down the stream and tells the reader to go away.
    async fn close(&mut self) {
        let _ = self.write.shutdown().await;
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }
}

impl InnerConnection {
    /// Runs a registered query.
    ///
    /// The request is sent by a separate task so that it can finish even
    /// if we stop waiting for it. Such a task skips the write if the query
    /// has been given up by the time it holds the lock. If the query is
    /// given up during the write, the request still goes out after its ID
    /// was freed, and a later query reusing the ID may see the response
    /// meant for it.
    async fn exchange(
        self: Arc<Self>,
        txn: Arc<Transaction>,
        request: Message,
        reply: oneshot::Receiver<Reply>,
        timeout: Duration,
    ) -> Result<Option<Message>, Error> {
        // Never worth a connection.
        if request.size() > usize::from(u16::MAX) {
            return Err(Error::StreamLongMessage);
        }

        let deadline = Instant::now() + timeout;
        let send =
            tokio::spawn(self.clone().send(txn.clone(), request, deadline));

        match timeout_at(deadline, send).await {
            Err(_) => {
                trace!(
                    "Timeout sending request {}, it may still be sent",
                    txn.id()
                );
                return Ok(None);
            }
            Ok(Err(err)) => {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
                return Ok(None);
            }
            Ok(Ok(Err(err))) if err.is_connection_fault() => {
                debug!("Sending request {} failed: {}", txn.id(), err);
                return Ok(None);
            }
            Ok(Ok(Err(err))) => return Err(err),
            Ok(Ok(Ok(()))) => {}
        }

        match tokio::time::timeout(timeout, reply).await {
            Err(_) => {
                trace!("Timeout waiting for response {}", txn.id());
                Ok(None)
            }
            // The transaction was canceled.
            Ok(Err(_)) => Ok(None),
            Ok(Ok(Ok(response))) => Ok(Some(response)),
            Ok(Ok(Err(err))) => Err(err),
        }
    }

    /// Sends the request of a transaction.
    ///
    /// Gives up with [`Error::LockTimeout`] if the connection lock cannot
    /// be acquired before `deadline`. In this case, the stream has not been
    /// touched.
    async fn send(
        self: Arc<Self>,
        txn: Arc<Transaction>,
        request: Message,
        deadline: Instant,
    ) -> Result<(), Error> {
        let mut state = timeout_at(deadline, self.state.lock())
            .await
            .map_err(|_| Error::LockTimeout)?;
        if !txn.is_pending() {
            trace!("Query {} given up, not sending it", txn.id());
            return Ok(());
        }
        let stream = self.ensure_connection(&mut state).await?;

        txn.start_timer();
        let res = match timeout(
            self.config.write_timeout,
            self.codec.write_request(&mut stream.write, &request),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(Error::StreamWriteTimeout),
        };
        if let Err(err) = &res {
            if err.is_connection_fault() {
                debug!(
                    "Closing stream {} to {}: {}",
                    stream.generation, self.server, err
                );
                stream.close().await;
            }
        }
        res
    }

    /// Returns the live stream, connecting first if necessary.
    ///
    /// A new connection also starts a new reader task.
    async fn ensure_connection<'a>(
        self: &Arc<Self>,
        state: &'a mut ConnState,
    ) -> Result<&'a mut LiveStream, Error> {
        if let Status::Unconnected = state.status {
            let addr = match state.addr {
                Some(addr) => addr,
                None => {
                    let addr = self
                        .server
                        .resolve()
                        .await
                        .map_err(|err| Error::Connect(Arc::new(err)))?;
                    state.addr = Some(addr);
                    addr
                }
            };
            let (sock, transport) = protocol::connect(
                addr,
                self.proxy.as_deref(),
                self.config.socket(),
            )
            .await
            .map_err(|err| Error::Connect(Arc::new(err)))?;

            state.generation += 1;
            let (read, write) = sock.into_split();
            let (close_tx, close_rx) = oneshot::channel();
            debug!(
                "Connected to {} via {} as stream {}",
                addr, transport, state.generation
            );
            let reader = Reader {
                conn: Arc::downgrade(self),
                codec: self.codec.clone(),
                read,
                close: close_rx,
                buf: BytesMut::with_capacity(self.config.read_buffer_size),
                generation: state.generation,
                server: addr,
                transport,
            };
            tokio::spawn(reader.run());
            state.status = Status::Connected(LiveStream {
                write,
                close: Some(close_tx),
                generation: state.generation,
            });
        }
        match &mut state.status {
            Status::Connected(stream) => Ok(stream),
            Status::Unconnected | Status::Closed => {
                Err(Error::ConnectionDisposed)
            }
        }
    }

    /// Hands a response to the transaction waiting for it.
    fn deliver(
        &self,
        mut response: Message,
        server: SocketAddr,
        transport: Transport,
    ) {
        let id = response.id();
        let txn = match self.transactions.remove(id) {
            Some(txn) => txn,
            None => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping response with unknown ID {id}");
                return;
            }
        };
        let elapsed = txn.stop_timer();
        response.set_metadata(Metadata {
            server,
            transport,
            size: response.size(),
            elapsed,
        });
        if !txn.resolve(Ok(response)) {
            self.unmatched.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping response for finished transaction {id}");
        }
    }

    /// Clears the stream after its reader has stopped.
    ///
    /// All transactions still in flight fail with
    /// [`Error::ConnectionClosed`].
    async fn teardown(&self, generation: u64) {
        let mut state = self.state.lock().await;
        let current = match &state.status {
            Status::Connected(stream) => stream.generation == generation,
            Status::Unconnected | Status::Closed => false,
        };
        if current {
            if let Status::Connected(mut stream) =
                mem::replace(&mut state.status, Status::Unconnected)
            {
                stream.close().await;
            }
        }
        let pending = self.transactions.drain();
        debug!(
            "Stream {} to {} closed, failing {} pending queries",
            generation,
            self.server,
            pending.len()
        );
        for txn in pending {
            txn.resolve(Err(Error::ConnectionClosed));
        }
    }

    /// Closes the stream for good.
    async fn close(&self) {
        if self.disposed.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut state = self.state.lock().await;
        if let Status::Connected(mut stream) =
            mem::replace(&mut state.status, Status::Closed)
        {
            stream.close().await;
        }
        trace!("Disposed of connection to {}", self.server);
    }

    /// Records that a query has just finished.
    fn touch(&self) {
        let now = Instant::now();
        let mut last = self.last_queried.lock();
        if now > *last {
            *last = now;
        }
    }
}

//------------ Reader ---------------------------------------------------------

/// The task reading responses from a stream.
///
/// There is exactly one reader per stream. It runs until the stream fails,
/// is closed by the server, or is closed by us.
struct Reader {
    /// The connection the responses are for.
    ///
    /// If the connection goes away, so does the reader.
    conn: Weak<InnerConnection>,

    /// The codec for reading messages.
    codec: Arc<dyn StreamCodec>,

    /// The read half of the stream.
    read: OwnedReadHalf,

    /// Receives the signal to stop.
    close: oneshot::Receiver<()>,

    /// The read buffer.
    buf: BytesMut,

    /// The number of the stream.
    generation: u64,

    /// The address of the server.
    server: SocketAddr,

    /// The kind of transport of the stream.
    transport: Transport,
}

impl Reader {
    /// Runs the reader until the stream ends.
    async fn run(mut self) {
        let err = loop {
            let res = tokio::select! {
                res = self.codec.read_response(&mut self.read, &mut self.buf) => res,
                _ = &mut self.close => Err(Error::ConnectionClosed),
            };
            let response = match res {
                Ok(response) => response,
                Err(err) => break err,
            };
            match self.conn.upgrade() {
                Some(conn) => {
                    conn.deliver(response, self.server, self.transport)
                }
                None => return,
            }
        };
        trace!("Reader for stream {} stopped: {}", self.generation, err);
        if let Some(conn) = self.conn.upgrade() {
            conn.teardown(self.generation).await;
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::HEADER_LEN;
    use tokio::net::TcpListener;

    fn request(id: u16) -> Message {
        let mut msg = Message::from_slice(&[0; HEADER_LEN]).unwrap();
        msg.set_id(id);
        msg
    }

    #[test]
    fn config_limits() {
        let mut config = Config::new();
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        config.set_connect_timeout(Duration::ZERO);
        assert_eq!(config.connect_timeout(), Duration::from_millis(1));
        config.set_write_timeout(Duration::from_secs(3600));
        assert_eq!(config.write_timeout(), Duration::from_secs(60));
        config.set_read_buffer_size(1);
        assert_eq!(config.read_buffer_size(), 512);
        config.set_send_buffer_size(Some(1 << 16));
        assert_eq!(config.socket().send_buffer, Some(1 << 16));
        assert_eq!(config.socket().recv_buffer, None);
    }

    #[tokio::test]
    async fn send_gives_up_on_busy_lock() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new(listener.local_addr().unwrap(), None);

        let busy = conn.inner.state.lock().await;
        let (txn, _reply) = Transaction::new(1);
        let res = conn
            .inner
            .clone()
            .send(
                txn.clone(),
                request(1),
                Instant::now() + Duration::from_millis(50),
            )
            .await;
        assert!(matches!(res, Err(Error::LockTimeout)));
        assert!(txn.elapsed().is_none());
        assert!(matches!(busy.status, Status::Unconnected));
        drop(busy);
    }

    #[tokio::test]
    async fn query_times_out_on_busy_lock() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new(listener.local_addr().unwrap(), None);

        let busy = conn.inner.state.lock().await;
        let start = Instant::now();
        let res = conn.query(request(1), Duration::from_millis(100)).await;
        assert!(matches!(res, Ok(None)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(conn.pending(), 0);

        // The stream must not have been touched.
        assert!(
            timeout(Duration::from_millis(200), listener.accept())
                .await
                .is_err()
        );
        assert!(matches!(busy.status, Status::Unconnected));
        drop(busy);
    }

    #[tokio::test]
    async fn send_skips_given_up_query() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new(listener.local_addr().unwrap(), None);

        let (txn, _reply) = Transaction::new(1);
        assert!(txn.cancel());
        let res = conn
            .inner
            .clone()
            .send(
                txn.clone(),
                request(1),
                Instant::now() + Duration::from_millis(50),
            )
            .await;
        assert!(res.is_ok());
        assert!(!conn.is_connected().await);
        assert!(
            timeout(Duration::from_millis(100), listener.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn long_request_never_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new(listener.local_addr().unwrap(), None);

        let mut octets = vec![0; usize::from(u16::MAX) + 1];
        octets[1] = 5;
        let long = Message::from_slice(&octets).unwrap();
        let res = conn.query(long, Duration::from_secs(1)).await;
        assert!(matches!(res, Err(Error::StreamLongMessage)));
        assert_eq!(conn.pending(), 0);
        assert!(!conn.is_connected().await);
        assert!(
            timeout(Duration::from_millis(100), listener.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn connect_error_propagates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = Connection::new(addr, None);
        let before = conn.last_queried();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let res = conn.query(request(1), Duration::from_secs(2)).await;
        assert!(matches!(res, Err(Error::Connect(_))));
        assert!(conn.last_queried() > before);
        assert_eq!(conn.pending(), 0);
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn disposed_connection_gives_no_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new(listener.local_addr().unwrap(), None);
        conn.dispose().await;
        conn.dispose().await;
        assert!(conn.is_disposed());

        let res = conn.query(request(1), Duration::from_millis(500)).await;
        assert!(matches!(res, Ok(None)));
        assert!(
            timeout(Duration::from_millis(100), listener.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn pooled_connection_survives_dispose() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new(listener.local_addr().unwrap(), None);
        conn.mark_pooled();
        assert!(conn.is_pooled());
        conn.dispose().await;
        assert!(!conn.is_disposed());

        conn.evict().await;
        assert!(conn.is_disposed());
        assert!(matches!(
            conn.inner.state.lock().await.status,
            Status::Closed
        ));
    }
}
