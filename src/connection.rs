use crate::command::Command;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult, ConnectionError, ProtocolError, TransactionError};
use crate::framer::LineFramer;
use crate::pipeline::Pipeline;
use crate::resp::{self, RespValue};
use crate::signal::{Listener, ReadySignal};
use std::fmt::Display;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Link lifecycle.
///
/// `Disconnected` and `Destroyed` fail calls immediately; `Connecting` and
/// `Reconnecting` make callers wait for the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Destroyed,
}

/// Observable connection signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    ConnectError(String),
    Closed { had_error: bool },
    /// A protocol or socket failure on an established link.
    Error(String),
    /// One request/response exchange finished.
    Completed,
}

#[derive(Debug)]
struct Transport {
    stream: TcpStream,
    framer: LineFramer,
}

impl Transport {
    fn new(stream: TcpStream) -> Self {
        Transport {
            stream,
            framer: LineFramer::new(),
        }
    }

    /// Non-blocking check for a peer that went away while we were idle.
    fn check_alive(&mut self) -> Result<(), ConnectionError> {
        let mut scratch = [0u8; 512];
        loop {
            match self.stream.try_read(&mut scratch) {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(n) => self.framer.extend(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Resolves once the idle socket hits EOF or an error. Unsolicited bytes
    /// stay buffered for the next exchange.
    async fn closed(&mut self) -> ConnectionError {
        loop {
            match self.framer.fill(&mut self.stream).await {
                Ok(0) => return ConnectionError::Closed,
                Ok(_) => {}
                Err(e) => return e.into(),
            }
        }
    }

    /// One write, then exactly `modes.len()` replies in order.
    async fn round_trip<F>(&mut self, payload: &[u8], modes: &[bool], on_reply: &mut F) -> ClientResult<()>
    where
        F: FnMut(usize, ClientResult<RespValue>),
    {
        self.stream.write_all(payload).await?;
        for (index, &want_object) in modes.iter().enumerate() {
            match self.read_reply(want_object).await {
                Ok(RespValue::Error(message)) => on_reply(index, Err(ClientError::Redis(message))),
                Ok(value) => on_reply(index, Ok(value)),
                Err(err) if err.is_recoverable() => on_reply(index, Err(err)),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn read_reply(&mut self, want_object: bool) -> ClientResult<RespValue> {
        // decoding restarts from the reply's first byte, so skip it until
        // enough has arrived to possibly finish
        let mut needed = 0;
        loop {
            if self.framer.buffered() >= needed {
                let mut lines = self.framer.cursor();
                let decoded = resp::decode(&mut lines, want_object);
                let used = lines.position();
                needed = lines.needed();
                match decoded {
                    Ok(Some(value)) => {
                        self.framer.consume(used);
                        return Ok(value);
                    }
                    Ok(None) => {}
                    Err(ClientError::Transaction(err)) => {
                        self.framer.consume(used);
                        return Err(err.into());
                    }
                    Err(err) => return Err(err),
                }
            }

            if self.framer.fill(&mut self.stream).await? == 0 {
                return Err(ConnectionError::Closed.into());
            }
        }
    }

    /// Half-close and wait for the server to hang up.
    async fn close(mut self) {
        if self.stream.shutdown().await.is_err() {
            return;
        }
        self.framer.clear();
        while let Ok(n) = self.framer.fill(&mut self.stream).await {
            if n == 0 {
                break;
            }
            self.framer.clear();
        }
    }
}

/// Where an idle transport waits between exchanges.
#[derive(Debug)]
enum Parked {
    Idle(Transport),
    /// Held by a task that fails the link as soon as the server hangs up.
    Watched {
        stop: CancellationToken,
        handle: JoinHandle<Option<Transport>>,
    },
}

impl Parked {
    /// Hand `transport` to a watcher task. Without a runtime it just sits
    /// idle until the next exchange checks it.
    fn new(conn: &Connection, transport: Transport, token: &CancellationToken) -> Self {
        let Ok(runtime) = Handle::try_current() else {
            return Parked::Idle(transport);
        };
        let stop = CancellationToken::new();
        let handle = runtime.spawn(watch_idle(
            Arc::downgrade(&conn.shared),
            transport,
            token.clone(),
            stop.clone(),
        ));
        Parked::Watched { stop, handle }
    }

    /// Take the transport back. `None` when the watcher saw the link die.
    async fn reclaim(self) -> Option<Transport> {
        match self {
            Parked::Idle(transport) => Some(transport),
            Parked::Watched { stop, handle } => {
                stop.cancel();
                handle.await.ok().flatten()
            }
        }
    }
}

async fn watch_idle(
    shared: Weak<Shared>,
    mut transport: Transport,
    token: CancellationToken,
    stop: CancellationToken,
) -> Option<Transport> {
    tokio::select! {
        biased;
        _ = stop.cancelled() => {}
        _ = token.cancelled() => return None,
        err = transport.closed() => {
            if let Some(shared) = shared.upgrade() {
                let conn = Connection { shared };
                debug!("Connection {} lost while idle: {err}", conn.id());
                conn.fail_link(&token, &err.into());
            }
            return None;
        }
    }
    Some(transport)
}

#[derive(Debug)]
struct Link {
    phase: Phase,
    /// Present while connected and idle; checked out by the in-flight exchange.
    transport: Option<Parked>,
    /// Cancelled whenever the current link is torn down.
    cancel: CancellationToken,
    retry: Option<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug)]
struct Shared {
    id: u64,
    config: ClientConfig,
    link: Mutex<Link>,
    in_flight: AtomicBool,
    transaction_open: AtomicBool,
    reconnect_enabled: AtomicBool,
    ready: ReadySignal,
    events: broadcast::Sender<ConnectionEvent>,
}

/// One TCP connection to the server, carrying at most one request at a time.
///
/// Handles are cheap to clone and all refer to the same socket. Concurrent
/// callers wait for the in-flight exchange to finish and then race to claim
/// the connection again; there is no FIFO ordering among waiters.
#[derive(Debug, Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Connection {
            shared: Arc::new(Shared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                config,
                link: Mutex::new(Link {
                    phase: Phase::Disconnected,
                    transport: None,
                    cancel: CancellationToken::new(),
                    retry: None,
                }),
                in_flight: AtomicBool::new(false),
                transaction_open: AtomicBool::new(false),
                reconnect_enabled: AtomicBool::new(false),
                ready: ReadySignal::new(),
                events,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn phase(&self) -> Phase {
        self.link().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == Phase::Connected
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn is_transaction_open(&self) -> bool {
        self.shared.transaction_open.load(Ordering::Acquire)
    }

    /// Connected, idle and not holding a transaction.
    pub fn is_available(&self) -> bool {
        self.is_connected() && !self.is_in_flight() && !self.is_transaction_open()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) fn listen(&self) -> Listener<'_> {
        self.shared.ready.listen()
    }

    /// Open the socket. Success enables automatic reconnection for later
    /// link failures.
    pub async fn connect(&self) -> ClientResult<()> {
        {
            let mut link = self.link();
            if link.phase == Phase::Connected {
                return Ok(());
            }
            if let Some(retry) = link.retry.take() {
                retry.abort();
            }
            link.phase = Phase::Connecting;
        }
        self.establish().await
    }

    /// Graceful close. Disables reconnection, waits for an in-flight request
    /// to finish, then half-closes the socket and waits for the server to
    /// hang up. Calling it again is a no-op.
    pub async fn disconnect(&self) -> ClientResult<()> {
        self.shared.reconnect_enabled.store(false, Ordering::Release);
        let mut slot = loop {
            let listener = self.listen();
            {
                let mut link = self.link();
                if let Some(retry) = link.retry.take() {
                    retry.abort();
                }
                match link.phase {
                    Phase::Disconnected | Phase::Destroyed => return Ok(()),
                    Phase::Connecting | Phase::Reconnecting => {
                        link.phase = Phase::Disconnected;
                        link.cancel.cancel();
                        drop(link);
                        self.emit(ConnectionEvent::Closed { had_error: false });
                        self.shared.ready.notify();
                        return Ok(());
                    }
                    Phase::Connected => {}
                }
            }
            if let Some(slot) = self.try_acquire() {
                break slot;
            }
            listener.await;
        };

        // stop the idle watcher before the token goes
        let transport = slot.take_transport().await;
        {
            let mut link = self.link();
            link.phase = Phase::Disconnected;
            link.cancel.cancel();
            link.transport = None;
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        drop(slot);
        info!("Connection {} closed", self.id());
        self.emit(ConnectionEvent::Closed { had_error: false });
        Ok(())
    }

    /// Drop the link immediately. Reconnection is disabled and pending calls
    /// fail; a later `connect` starts over.
    pub fn destroy(&self) {
        self.shared.reconnect_enabled.store(false, Ordering::Release);
        let was_up = {
            let mut link = self.link();
            let was_up = self.teardown(&mut link);
            link.phase = Phase::Destroyed;
            was_up
        };
        if was_up {
            self.emit(ConnectionEvent::Closed { had_error: false });
        }
        self.shared.ready.notify();
    }

    /// Drop the current link (if any) and connect again right away.
    pub async fn reconnect(&self) -> ClientResult<()> {
        let was_up = {
            let mut link = self.link();
            let was_up = self.teardown(&mut link);
            link.phase = Phase::Connecting;
            was_up
        };
        if was_up {
            self.emit(ConnectionEvent::Closed { had_error: false });
        }
        self.establish().await
    }

    /// Drop the current link and connect again after the configured delay.
    pub fn reconnect_after(&self) -> ClientResult<()> {
        let (was_up, scheduled) = {
            let mut link = self.link();
            let was_up = self.teardown(&mut link);
            let scheduled = self.schedule_reconnect(&mut link);
            if !scheduled {
                link.phase = Phase::Destroyed;
            }
            (was_up, scheduled)
        };
        if was_up {
            self.emit(ConnectionEvent::Closed { had_error: false });
        }
        self.shared.ready.notify();
        if scheduled {
            Ok(())
        } else {
            Err(ConnectionError::ReconnectDisabled.into())
        }
    }

    /// `true` once connected; waits while a connect is in progress; `false`
    /// when the connection is down with nothing that will bring it back.
    pub async fn ensure_connected(&self) -> bool {
        loop {
            let listener = self.listen();
            match self.phase() {
                Phase::Connected => return true,
                Phase::Disconnected | Phase::Destroyed => return false,
                Phase::Connecting | Phase::Reconnecting => {}
            }
            listener.await;
        }
    }

    /// Send one command and wait for its reply. A `-` reply becomes
    /// `ClientError::Redis` and leaves the connection usable.
    pub async fn call<I, T>(&self, tokens: I, want_object: bool) -> ClientResult<RespValue>
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        self.call_command(&Command::from_tokens(tokens), want_object)
            .await
    }

    pub async fn call_command(&self, command: &Command, want_object: bool) -> ClientResult<RespValue> {
        let mut slot = self.checkout().await?;
        slot.request(&command.encode(), want_object).await
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::for_connection(self.clone())
    }

    /// A pipeline that starts with MULTI and is closed with EXEC on send.
    pub fn pmulti(&self) -> Pipeline {
        Pipeline::for_connection(self.clone()).begin_transaction()
    }

    /// Send MULTI. Fails locally if this connection already has an open
    /// transaction.
    pub async fn multi(&self) -> ClientResult<()> {
        if !self.try_open_transaction() {
            return Err(TransactionError::NestedMulti.into());
        }
        self.send_multi().await
    }

    /// Send EXEC. The local transaction flag is cleared once the connection
    /// is claimed for EXEC, or when claiming it fails.
    pub async fn exec(&self) -> ClientResult<RespValue> {
        // while the flag is set the pool never hands this member out, so
        // the claim has to come first
        let claimed = self.checkout().await;
        self.shared.transaction_open.store(false, Ordering::Release);
        let mut slot = claimed?;
        slot.request(&Command::new("EXEC").encode(), false).await
    }

    pub(crate) fn try_open_transaction(&self) -> bool {
        self.shared
            .transaction_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// MULTI on a connection whose transaction flag is already set.
    pub(crate) async fn send_multi(&self) -> ClientResult<()> {
        let result = match self.call(["MULTI"], false).await {
            Ok(RespValue::SimpleString(s)) if s == "OK" => return Ok(()),
            Ok(other) => Err(TransactionError::UnexpectedReply(format!("{other:?}")).into()),
            Err(err) => Err(err),
        };
        self.shared.transaction_open.store(false, Ordering::Release);
        self.shared.ready.notify();
        result
    }

    /// Claim the connection if it is connected and idle.
    pub(crate) fn try_acquire(&self) -> Option<InFlight> {
        let mut link = self.link();
        if link.phase != Phase::Connected {
            return None;
        }
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        match link.transport.take() {
            Some(parked) => Some(InFlight {
                conn: self.clone(),
                parked: Some(parked),
                transport: None,
                token: link.cancel.clone(),
                clean: true,
            }),
            None => {
                self.shared.in_flight.store(false, Ordering::Release);
                None
            }
        }
    }

    /// Wait until the connection can be claimed. Fails fast when it is down
    /// and nothing will reconnect it.
    pub(crate) async fn acquire(&self) -> ClientResult<InFlight> {
        loop {
            let listener = self.listen();
            match self.phase() {
                Phase::Disconnected | Phase::Destroyed => {
                    return Err(ConnectionError::NotConnected.into());
                }
                Phase::Connected => {
                    if let Some(slot) = self.try_acquire() {
                        return Ok(slot);
                    }
                }
                Phase::Connecting | Phase::Reconnecting => {}
            }
            listener.await;
        }
    }

    /// `acquire` plus taking the transport back from its watcher; a link
    /// found dead is failed and the wait starts over.
    pub(crate) async fn checkout(&self) -> ClientResult<InFlight> {
        loop {
            let mut slot = self.acquire().await?;
            if slot.prepare().await {
                return Ok(slot);
            }
        }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.shared
            .link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.shared.events.send(event);
    }

    /// Cancel the current link and any pending retry. Returns whether a link
    /// was up.
    fn teardown(&self, link: &mut Link) -> bool {
        if let Some(retry) = link.retry.take() {
            retry.abort();
        }
        link.cancel.cancel();
        link.transport = None;
        link.phase == Phase::Connected
    }

    /// Open the socket for a link already marked `Connecting`; on failure
    /// fall back to the retry loop or to `Disconnected`.
    async fn establish(&self) -> ClientResult<()> {
        match self.open().await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Connection {} failed to connect: {err}", self.id());
                self.emit(ConnectionEvent::ConnectError(err.to_string()));
                {
                    let mut link = self.link();
                    if link.phase == Phase::Connecting {
                        let retrying = self.shared.reconnect_enabled.load(Ordering::Acquire)
                            && self.schedule_reconnect(&mut link);
                        if !retrying {
                            link.phase = Phase::Disconnected;
                        }
                    }
                }
                self.shared.ready.notify();
                Err(err.into())
            }
        }
    }

    async fn open(&self) -> Result<(), ConnectionError> {
        let addr = self.shared.config.addr();
        debug!("Connection {} connecting to {addr}", self.id());
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;

        {
            let mut link = self.link();
            match link.phase {
                Phase::Connecting => {}
                // a concurrent connect won; this socket is surplus
                Phase::Connected => return Ok(()),
                // disconnect() or destroy() got here first
                _ => return Err(ConnectionError::NotConnected),
            }
            let token = CancellationToken::new();
            link.transport = Some(Parked::new(self, Transport::new(stream), &token));
            link.cancel = token;
            link.phase = Phase::Connected;
            link.retry = None;
        }
        self.shared.reconnect_enabled.store(true, Ordering::Release);
        info!("Connection {} connected to {addr}", self.id());
        self.emit(ConnectionEvent::Connected);
        self.shared.ready.notify();
        Ok(())
    }

    /// Move `link` to `Reconnecting` and start the retry loop. Returns false,
    /// leaving the phase alone, if reconnection is disabled in the
    /// configuration or there is no runtime to run it on.
    fn schedule_reconnect(&self, link: &mut Link) -> bool {
        let Some(delay) = self.shared.config.auto_reconnect_delay else {
            return false;
        };
        let Ok(runtime) = Handle::try_current() else {
            return false;
        };
        if let Some(retry) = link.retry.take() {
            retry.abort();
        }
        link.phase = Phase::Reconnecting;
        info!("Connection {} reconnecting in {delay:?}", self.id());
        let conn = self.clone();
        link.retry = Some(runtime.spawn(async move { conn.retry_loop(delay).await }));
        true
    }

    async fn retry_loop(self, delay: Duration) {
        loop {
            tokio::time::sleep(delay).await;
            {
                let mut link = self.link();
                if link.phase != Phase::Reconnecting {
                    return;
                }
                link.phase = Phase::Connecting;
            }
            match self.open().await {
                Ok(()) => return,
                Err(err) => {
                    warn!("Connection {} reconnect failed: {err}", self.id());
                    self.emit(ConnectionEvent::ConnectError(err.to_string()));
                    let mut link = self.link();
                    if link.phase != Phase::Connecting {
                        return;
                    }
                    link.phase = Phase::Reconnecting;
                }
            }
        }
    }

    /// The link behind `token` broke: tear it down and reconnect or give up.
    fn fail_link(&self, token: &CancellationToken, err: &ClientError) {
        let retrying = {
            let mut link = self.link();
            if token.is_cancelled() || link.phase != Phase::Connected {
                return;
            }
            self.teardown(&mut link);
            let retrying = self.shared.reconnect_enabled.load(Ordering::Acquire)
                && self.schedule_reconnect(&mut link);
            if !retrying {
                link.phase = Phase::Destroyed;
            }
            retrying
        };
        warn!("Connection {} link failed: {err}", self.id());
        self.emit(ConnectionEvent::Error(err.to_string()));
        self.emit(ConnectionEvent::Closed { had_error: true });
        if !retrying {
            debug!("Connection {} destroyed", self.id());
        }
        self.shared.ready.notify();
    }
}

/// Exclusive claim on a connection for one exchange.
///
/// Starts out holding the parked transport and takes it back from the idle
/// watcher in `prepare`. Dropping it parks the transport again unless an
/// exchange was interrupted, in which case the stream position is unknown
/// and the link is failed. Either way the connection becomes claimable again
/// and waiters are woken.
#[derive(Debug)]
pub(crate) struct InFlight {
    conn: Connection,
    parked: Option<Parked>,
    transport: Option<Transport>,
    token: CancellationToken,
    clean: bool,
}

impl InFlight {
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Take the transport back and make sure the peer has not hung up.
    /// `false` means the link is gone and the claim is useless.
    pub(crate) async fn prepare(&mut self) -> bool {
        if let Some(parked) = self.parked.take() {
            self.transport = parked.reclaim().await;
        }
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        match transport.check_alive() {
            Ok(()) => true,
            Err(err) => {
                debug!("Connection {} found dead before write: {err}", self.conn.id());
                self.conn.fail_link(&self.token, &err.into());
                false
            }
        }
    }

    async fn take_transport(&mut self) -> Option<Transport> {
        if let Some(parked) = self.parked.take() {
            self.transport = parked.reclaim().await;
        }
        self.transport.take()
    }

    pub(crate) async fn request(&mut self, payload: &[u8], want_object: bool) -> ClientResult<RespValue> {
        let mut reply = None;
        self.exchange(payload, &[want_object], |_, result| reply = Some(result))
            .await?;
        reply.unwrap_or_else(|| Err(ProtocolError::UnexpectedEnd.into()))
    }

    /// Write `payload` once and read one reply per entry of `modes`, handing
    /// each to `on_reply` as soon as it is decoded. Only link-fatal errors
    /// are returned; per-reply errors go to `on_reply`.
    pub(crate) async fn exchange<F>(&mut self, payload: &[u8], modes: &[bool], mut on_reply: F) -> ClientResult<()>
    where
        F: FnMut(usize, ClientResult<RespValue>),
    {
        let token = self.token.clone();
        self.clean = false;
        let transport = self
            .transport
            .as_mut()
            .ok_or(ConnectionError::NotConnected)?;

        let result = tokio::select! {
            _ = token.cancelled() => Err(ConnectionError::Destroyed.into()),
            result = transport.round_trip(payload, modes, &mut on_reply) => result,
        };

        self.conn.emit(ConnectionEvent::Completed);
        match result {
            Ok(()) => {
                self.clean = true;
                Ok(())
            }
            Err(err) => {
                self.conn.fail_link(&token, &err);
                Err(err)
            }
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let parked = self.parked.take();
        let transport = self.transport.take();
        let lost = {
            let mut link = self.conn.link();
            if self.token.is_cancelled() || link.phase != Phase::Connected {
                false
            } else if let Some(parked) = parked {
                // never taken back from the watcher
                link.transport = Some(parked);
                false
            } else if let (true, Some(transport)) = (self.clean, transport) {
                link.transport = Some(Parked::new(&self.conn, transport, &self.token));
                false
            } else {
                true
            }
        };
        if lost {
            let err = ClientError::Connection(ConnectionError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "exchange abandoned mid-reply",
            )));
            self.conn.fail_link(&self.token, &err);
        }
        self.conn.shared.in_flight.store(false, Ordering::Release);
        self.conn.shared.ready.notify();
    }
}
