use std::{
    cell::Cell,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    ops::ControlFlow,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use chim_core::{
    ChatMessage, CoreError, DEFAULT_GROUP, DEFAULT_PORT, MAX_DATAGRAM_BYTES, MULTICAST_TTL,
    RECV_TIMEOUT, decode_datagram, encode_datagram, validate_identity,
};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

const LISTENER_THREAD_NAME: &str = "chim-listener";

thread_local! {
    /// Set while this thread is inside a message handler.
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[source] CoreError),
    #[error("{group} is not an IPv4 multicast address")]
    NotMulticast { group: Ipv4Addr },
    #[error("failed to join multicast group {group}:{port}: {source}")]
    Join {
        group: Ipv4Addr,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to send message: {0}")]
    Send(#[source] io::Error),
    #[error(transparent)]
    Encode(#[from] CoreError),
    #[error("failed to start listener thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("a listener is already running")]
    ListenerRunning,
    #[error("messenger is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessengerConfig {
    pub identity: String,
    pub group: Ipv4Addr,
    pub port: u16,
    /// Interface used for the group join; unspecified lets the OS choose.
    pub interface: Ipv4Addr,
    pub ttl: u32,
    /// Whether our own datagrams loop back to sockets on this host.
    pub loopback: bool,
    pub recv_timeout: Duration,
}

impl MessengerConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: MULTICAST_TTL,
            loopback: true,
            recv_timeout: RECV_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: Ipv4Addr, port: u16) -> Self {
        self.group = group;
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_recv_timeout(mut self, recv_timeout: Duration) -> Self {
        self.recv_timeout = recv_timeout;
        self
    }

    pub fn group_addr(&self) -> SocketAddr {
        SocketAddrV4::new(self.group, self.port).into()
    }
}

/// A joined multicast group: one socket shared by `send` and the listener thread.
///
/// Dropping the messenger closes it.
#[derive(Debug)]
pub struct GroupMessenger {
    config: MessengerConfig,
    /// `None` once closed.
    socket: Option<Arc<UdpSocket>>,
    shutdown: Arc<AtomicBool>,
    /// Held by a listener for the duration of each handler call.
    dispatch: Arc<Mutex<()>>,
    listener: Option<JoinHandle<()>>,
}

impl GroupMessenger {
    pub fn join(mut config: MessengerConfig) -> Result<Self, MessengerError> {
        config.identity = config.identity.trim().to_owned();
        validate_identity(&config.identity).map_err(MessengerError::InvalidIdentity)?;
        if !config.group.is_multicast() {
            return Err(MessengerError::NotMulticast {
                group: config.group,
            });
        }

        let socket = open_multicast_socket(&config).map_err(|source| MessengerError::Join {
            group: config.group,
            port: config.port,
            source,
        })?;

        info!(
            identity = %config.identity,
            group = %config.group_addr(),
            ttl = config.ttl,
            "joined multicast group"
        );

        Ok(Self {
            config,
            socket: Some(Arc::new(socket)),
            shutdown: Arc::new(AtomicBool::new(false)),
            dispatch: Arc::new(Mutex::new(())),
            listener: None,
        })
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub fn group_addr(&self) -> SocketAddr {
        self.config.group_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.socket {
            Some(socket) => socket.local_addr(),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Broadcasts `text` to the group as a single best-effort datagram.
    pub fn send(&self, text: &str) -> Result<(), MessengerError> {
        let socket = self.open_socket()?;
        let datagram = encode_datagram(&self.config.identity, text)?;
        socket
            .send_to(&datagram, self.group_addr())
            .map_err(MessengerError::Send)?;
        trace!(bytes = datagram.len(), "datagram sent");
        Ok(())
    }

    fn open_socket(&self) -> Result<&Arc<UdpSocket>, MessengerError> {
        match &self.socket {
            Some(socket) if !self.is_closed() => Ok(socket),
            _ => Err(MessengerError::Closed),
        }
    }

    /// Receive loop bound to this messenger's socket, identity and shutdown flag.
    ///
    /// The loop may run on any thread; `close` still waits for a handler call
    /// that is in progress.
    pub fn listener(&self) -> Result<Listener, MessengerError> {
        Ok(Listener {
            socket: Arc::clone(self.open_socket()?),
            identity: self.config.identity.clone(),
            shutdown: Arc::clone(&self.shutdown),
            dispatch: Arc::clone(&self.dispatch),
            pause: self.config.recv_timeout,
        })
    }

    /// Runs the receive loop on a background thread, handing each message to `on_message`.
    pub fn spawn_listener<F>(&mut self, mut on_message: F) -> Result<(), MessengerError>
    where
        F: FnMut(ChatMessage) + Send + 'static,
    {
        self.spawn_dispatch(move |message| {
            on_message(message);
            ControlFlow::Continue(())
        })
    }

    /// Runs the listener and returns the channel it feeds. The listener stops
    /// once the receiver is dropped.
    pub fn subscribe(&mut self) -> Result<mpsc::Receiver<ChatMessage>, MessengerError> {
        let (tx, rx) = mpsc::channel();
        self.spawn_dispatch(forward_to(tx))?;
        Ok(rx)
    }

    fn spawn_dispatch<F>(&mut self, on_message: F) -> Result<(), MessengerError>
    where
        F: FnMut(ChatMessage) -> ControlFlow<()> + Send + 'static,
    {
        if self.listener.is_some() {
            return Err(MessengerError::ListenerRunning);
        }

        let listener = self.listener()?;
        let handle = thread::Builder::new()
            .name(LISTENER_THREAD_NAME.to_owned())
            .spawn(move || listener.run_until(on_message))
            .map_err(MessengerError::Spawn)?;
        self.listener = Some(handle);
        Ok(())
    }

    /// Stops the listener, leaves the group and releases the socket. Returns
    /// once no further handler call can happen, at most one receive timeout later.
    pub fn close(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(socket) = &self.socket
            && let Err(err) = socket.leave_multicast_v4(&self.config.group, &self.config.interface)
        {
            debug!(group = %self.config.group, "leave multicast group failed: {err}");
        }

        // Inside a handler the lock is already held by this thread.
        if !IN_HANDLER.get() {
            drop(self.dispatch.lock().unwrap_or_else(PoisonError::into_inner));
        }

        if let Some(handle) = self.listener.take()
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            warn!("listener thread panicked");
        }

        self.socket = None;
        info!(identity = %self.config.identity, "left multicast group");
    }
}

impl Drop for GroupMessenger {
    fn drop(&mut self) {
        self.close();
    }
}

/// Blocking receive loop over a shared socket.
#[derive(Debug)]
pub struct Listener {
    socket: Arc<UdpSocket>,
    identity: String,
    shutdown: Arc<AtomicBool>,
    dispatch: Arc<Mutex<()>>,
    pause: Duration,
}

impl Listener {
    /// Receives until the owning messenger is closed. Datagrams without a
    /// separator and our own echoes are dropped.
    pub fn run<F>(self, mut on_message: F)
    where
        F: FnMut(ChatMessage),
    {
        self.run_until(|message| {
            on_message(message);
            ControlFlow::Continue(())
        });
    }

    /// Like [`Listener::run`], but also stops when `on_message` breaks.
    pub fn run_until<F>(self, mut on_message: F)
    where
        F: FnMut(ChatMessage) -> ControlFlow<()>,
    {
        let mut buf = vec![0_u8; MAX_DATAGRAM_BYTES];

        while !self.shutdown.load(Ordering::Acquire) {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) if is_timeout(&err) => continue,
                Err(err) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    warn!("receive failed: {err}");
                    thread::sleep(self.pause);
                    continue;
                }
            };

            let message = match decode_datagram(&buf[..len]) {
                Ok(message) if message.sender == self.identity => {
                    trace!(%from, "dropping own echo");
                    continue;
                }
                Ok(message) => message,
                Err(err) => {
                    debug!(%from, len, "dropping datagram: {err}");
                    continue;
                }
            };

            let _dispatching = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            IN_HANDLER.set(true);
            let flow = on_message(message);
            IN_HANDLER.set(false);
            if flow.is_break() {
                break;
            }
        }

        debug!("listener stopped");
    }
}

fn forward_to(tx: mpsc::Sender<ChatMessage>) -> impl FnMut(ChatMessage) -> ControlFlow<()> {
    move |message| match tx.send(message) {
        Ok(()) => ControlFlow::Continue(()),
        Err(_) => {
            debug!("subscriber dropped; stopping listener");
            ControlFlow::Break(())
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn open_multicast_socket(config: &MessengerConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_multicast_ttl_v4(config.ttl)?;
    socket.set_multicast_loop_v4(config.loopback)?;
    if !config.interface.is_unspecified() {
        socket.set_multicast_if_v4(&config.interface)?;
    }
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port).into())?;
    socket.join_multicast_v4(&config.group, &config.interface)?;
    socket.set_read_timeout(Some(config.recv_timeout))?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_the_lan_group() {
        let config = MessengerConfig::new("alice");
        assert_eq!(config.group, Ipv4Addr::new(224, 1, 1, 1));
        assert_eq!(config.port, 5007);
        assert_eq!(config.ttl, 1);
        assert_eq!(config.recv_timeout, Duration::from_secs(1));
        assert_eq!(config.group_addr().to_string(), "224.1.1.1:5007");
    }

    #[test]
    fn join_rejects_identity_with_separator() {
        let err = GroupMessenger::join(MessengerConfig::new("a:b")).unwrap_err();
        assert!(matches!(
            err,
            MessengerError::InvalidIdentity(CoreError::IdentityContainsSeparator)
        ));
    }

    #[test]
    fn join_rejects_unicast_group() {
        let config = MessengerConfig::new("alice").with_group(Ipv4Addr::new(10, 0, 0, 1), 5007);
        let err = GroupMessenger::join(config).unwrap_err();
        assert!(matches!(err, MessengerError::NotMulticast { .. }));
    }

    #[test]
    fn forwarding_stops_once_receiver_is_dropped() {
        let (tx, rx) = mpsc::channel();
        let mut forward = forward_to(tx);
        assert!(forward(ChatMessage::new("carol", "one")).is_continue());
        assert_eq!(rx.recv().unwrap(), ChatMessage::new("carol", "one"));

        drop(rx);
        assert!(forward(ChatMessage::new("carol", "two")).is_break());
    }

    #[test]
    fn listener_exits_when_handler_breaks() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let target = socket.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let listener = Listener {
            socket: Arc::new(socket),
            identity: "bob".to_owned(),
            shutdown: Arc::clone(&shutdown),
            dispatch: Arc::new(Mutex::new(())),
            pause: Duration::from_millis(100),
        };

        let (tx, rx) = mpsc::channel();
        drop(rx);
        let worker = thread::spawn(move || listener.run_until(forward_to(tx)));

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sender.send_to(b"carol:hello", target).unwrap();

        let started = std::time::Instant::now();
        while !worker.is_finished() && started.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(20));
        }
        let finished = worker.is_finished();
        shutdown.store(true, Ordering::Release);
        worker.join().unwrap();
        assert!(finished, "listener kept running after its receiver was dropped");
    }

    #[test]
    fn timeouts_are_not_errors() {
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_timeout(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}
