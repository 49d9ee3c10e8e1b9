use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::Ack;
use super::Connection;
use super::Frame;
use super::Handshake;
use super::MsgType;
use super::RepControl;
use super::SendFrame;
use super::SiteTable;
use super::WireCodec;
use crate::config::TransportSettings;
use crate::constants::LOG_VERSION;
use crate::constants::WIRE_VERSION;
use crate::metrics::CONNECTION_DROPS;
use crate::replication::Destination;
use crate::replication::ElectionView;
use crate::replication::RepSender;
use crate::replication::ReplicationEngine;
use crate::replication::SendOutcome;
use crate::Error;
use crate::NetworkError;
use crate::RepMessage;
use crate::Result;

/// How often the retry scanner looks for due reconnects.
const RETRY_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// A whole replication message received from a site, handed to the worker.
#[derive(Debug)]
pub struct InboundRep {
    pub eid: u32,
    pub msg: RepMessage,
}

/// Things the embedding engine (election layer included) wants to hear
/// about; the decisions they trigger live outside this subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// A handshake completed and the site is usable
    SiteConnected { eid: u32 },
    /// The connection to the current primary died
    PrimaryConnectionLost { eid: u32 },
}

/// The connection-management half of the subsystem: accepts connections,
/// re-establishes failed ones on a backoff schedule, runs each
/// connection's I/O, and reassembles frames for the worker.
pub struct Transport {
    settings: TransportSettings,
    sites: Arc<SiteTable>,
    connections: DashMap<u64, Arc<Connection>>,
    election: Arc<dyn ElectionView>,
    inbound_tx: mpsc::UnboundedSender<InboundRep>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
    next_conn_id: AtomicU64,
}

impl Transport {
    /// Binds the listener, seeds the site table from configuration, and
    /// spawns the accept and retry loops.
    pub async fn start(
        settings: TransportSettings,
        sites: Arc<SiteTable>,
        election: Arc<dyn ElectionView>,
        inbound_tx: mpsc::UnboundedSender<InboundRep>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let listener =
            TcpListener::bind((settings.listen_host.as_str(), settings.listen_port)).await?;
        info!("listening on {}:{}", settings.listen_host, settings.listen_port);

        for site in &settings.sites {
            sites.add_site(&site.host, site.port);
        }

        let transport = Arc::new(Self {
            settings,
            sites,
            connections: DashMap::new(),
            election,
            inbound_tx,
            events_tx,
            cancel,
            next_conn_id: AtomicU64::new(1),
        });

        let accept = transport.clone();
        tokio::spawn(async move { accept.accept_loop(listener).await });
        let retry = transport.clone();
        tokio::spawn(async move { retry.retry_loop().await });

        Ok(transport)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("accepted connection from {}", addr);
                        let conn = self.register(stream, None);
                        let this = self.clone();
                        tokio::spawn(async move { this.run_connection(conn).await });
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
            }
        }
    }

    /// Periodically scans for idle sites whose retry timers came due and
    /// fires a connect attempt for each.
    async fn retry_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(RETRY_SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    for (eid, host, port) in self.sites.due_retries() {
                        let this = self.clone();
                        tokio::spawn(async move { this.connect_site(eid, host, port).await });
                    }
                }
            }
        }
    }

    /// One outbound connect attempt: resolve the site's name and try each
    /// address in turn until one of them answers.
    async fn connect_site(self: Arc<Self>, eid: u32, host: String, port: u16) {
        let addrs = match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("cannot resolve {}:{}: {}", host, port, e);
                self.sites.connect_failed(eid);
                return;
            }
        };
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => debug!("connect to {} failed: {}", addr, e),
            }
        }
        let Some(stream) = stream else {
            self.sites.connect_failed(eid);
            return;
        };

        let conn = self.register(stream, Some(eid));
        if let Err(e) = conn.send_frame(&self.handshake_frame(), None) {
            debug!("handshake to site {} not sent: {}", eid, e);
            self.bust_connection(&conn, Some(e));
            return;
        }
        if self.sites.bind_connected(eid, conn.clone(), None).is_err() {
            debug!("site {} already connected; dropping fresh connection", eid);
            self.bust_connection(&conn, None);
            return;
        }
        info!("connected to site {} at {}:{}", eid, host, port);
        let this = self.clone();
        tokio::spawn(async move { this.run_connection(conn).await });
    }

    fn register(&self, stream: TcpStream, eid: Option<u32>) -> Arc<Connection> {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, stream, eid));
        self.connections.insert(id, conn.clone());
        conn
    }

    /// Per-connection I/O: resumes partial reads through the codec's
    /// header/payload phases and, while the outbound queue is non-empty,
    /// owns the socket's write side.
    async fn run_connection(self: Arc<Self>, conn: Arc<Connection>) {
        let mut codec = WireCodec::new(self.settings.max_frame_size);
        let mut read_buf = BytesMut::with_capacity(16 * 1024);

        let result: Result<()> = loop {
            let has_queued = conn.has_queued();
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                _ = conn.cancel_token().cancelled() => break Ok(()),
                ready = conn.stream().readable() => {
                    if let Err(e) = ready {
                        break Err(e.into());
                    }
                    match conn.stream().try_read_buf(&mut read_buf) {
                        Ok(0) => {
                            break Err(NetworkError::Eof {
                                eid: conn.eid().unwrap_or(0),
                            }
                            .into())
                        }
                        Ok(_) => {
                            let r = loop {
                                match codec.decode(&mut read_buf) {
                                    Ok(Some(frame)) => {
                                        if let Err(e) = self.dispatch(&conn, frame) {
                                            break Err(e);
                                        }
                                    }
                                    Ok(None) => break Ok(()),
                                    Err(e) => break Err(e),
                                }
                            };
                            if let Err(e) = r {
                                break Err(e);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => break Err(e.into()),
                    }
                }
                _ = conn.write_wake().notified(), if !has_queued => {
                    // A worker handed us ownership of the outbound queue;
                    // the next pass arms the writable branch.
                }
                writable = conn.stream().writable(), if has_queued => {
                    if let Err(e) = writable {
                        break Err(e.into());
                    }
                    if let Err(e) = conn.drive_writes() {
                        break Err(e);
                    }
                }
            }
        };

        self.bust_connection(&conn, result.err());
    }

    /// Dispatches one reassembled frame: handshakes and acks are handled
    /// right here, application messages are queued for the worker.
    fn dispatch(&self, conn: &Arc<Connection>, frame: Frame) -> Result<()> {
        if conn.eid().is_none() && frame.msg_type != MsgType::Handshake {
            return Err(NetworkError::BadFrame(
                "expected handshake as first msg from passively connected site".into(),
            )
            .into());
        }
        match frame.msg_type {
            MsgType::Handshake => self.handle_handshake(conn, &frame),
            MsgType::Ack => {
                let ack = Ack::decode(&frame.control, &frame.payload)?;
                let eid = conn.eid().expect("ack on unbound connection");
                self.sites.record_ack(eid, ack, self.election.generation());
                Ok(())
            }
            MsgType::Rep => {
                let control = RepControl::decode(&frame.control)?;
                let msg = RepMessage::from_wire(&control, &frame.payload)?;
                let eid = conn.eid().expect("rep message on unbound connection");
                // Worker gone means we are shutting down; nothing to do.
                let _ = self.inbound_tx.send(InboundRep { eid, msg });
                Ok(())
            }
        }
    }

    fn handle_handshake(&self, conn: &Arc<Connection>, frame: &Frame) -> Result<()> {
        let hs = Handshake::decode(&frame.control, &frame.payload)?;

        if let Some(eid) = conn.eid() {
            // We initiated this connection, so we already know the site;
            // all the handshake adds is its election priority.
            self.sites.set_priority(eid, hs.priority);
            let _ = self.events_tx.send(TransportEvent::SiteConnected { eid });
            return Ok(());
        }

        debug!("got handshake {}:{}, pri {}", hs.hostname, hs.port, hs.priority);
        let eid = match self.sites.find_eid(&hs.hostname, hs.port) {
            Some(eid) => eid,
            None => {
                debug!("handshake introduces unknown site");
                self.sites.add_site(&hs.hostname, hs.port)
            }
        };
        if self
            .sites
            .bind_connected(eid, conn.clone(), Some(hs.priority))
            .is_err()
        {
            warn!("redundant incoming connection will be ignored");
            return Err(NetworkError::Unavailable { eid }.into());
        }
        conn.bind_eid(eid);
        let _ = self.events_tx.send(TransportEvent::SiteConnected { eid });
        Ok(())
    }

    /// Abandons a connection: frees its buffered I/O, reverts the owning
    /// site to idle with a retry scheduled, and lets the election layer
    /// know when it was the primary we lost.
    fn bust_connection(&self, conn: &Arc<Connection>, err: Option<Error>) {
        if let Some(e) = err {
            match &e {
                Error::Network(NetworkError::VersionMismatch { remote, ours }) => {
                    error!(
                        "mismatched wire protocol version from site (theirs {}, ours {})",
                        remote, ours
                    );
                }
                _ => debug!("connection {} dropped: {}", conn.id(), e),
            }
            CONNECTION_DROPS.inc();
        }
        conn.mark_defunct();
        self.connections.remove(&conn.id());
        if let Some(eid) = conn.eid() {
            if self.sites.detach_conn(eid, conn.id())
                && self.election.primary() == Some(eid)
            {
                let _ = self
                    .events_tx
                    .send(TransportEvent::PrimaryConnectionLost { eid });
            }
        }
    }

    fn handshake_frame(&self) -> SendFrame {
        let hs = Handshake {
            version: WIRE_VERSION,
            priority: self.settings.priority,
            port: self.settings.listen_port,
            hostname: self.settings.listen_host.clone(),
        };
        SendFrame::new(
            MsgType::Handshake,
            hs.encode_control().to_vec(),
            hs.encode_payload(),
        )
    }
}

/// The transport's implementation of the engine's sending seam.
pub struct NetSender {
    transport: Arc<Transport>,
}

impl NetSender {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    fn send_one(&self, eid: u32, frame: &SendFrame) -> Result<SendOutcome> {
        let Some((conn, priority)) = self.transport.sites.site_conn(eid) else {
            return Err(NetworkError::Unavailable { eid }.into());
        };
        if let Err(e) = conn.send_frame(frame, None) {
            conn.mark_defunct();
            return Err(e);
        }
        Ok(SendOutcome {
            sites: 1,
            peers: u32::from(priority > 0),
        })
    }
}

impl RepSender for NetSender {
    fn send(&self, dest: Destination, msg: &RepMessage) -> Result<SendOutcome> {
        let (control, payload) = msg.to_wire(self.transport.election.generation(), LOG_VERSION);
        let frame = SendFrame::new(MsgType::Rep, control.encode().to_vec(), payload);
        match dest {
            Destination::Site(eid) => self.send_one(eid, &frame),
            Destination::Anywhere { rerequest } => {
                let primary = self.transport.election.primary();
                let Some((eid, _)) = self.transport.sites.anywhere_conn(rerequest, primary) else {
                    return Err(NetworkError::NoSiteAvailable { request: "log request" }.into());
                };
                self.send_one(eid, &frame)
            }
            Destination::Broadcast => {
                // Best effort over the whole connections list: skip anything
                // still mid-handshake or already defunct, and drop rather
                // than queue behind a slow consumer.
                let mut outcome = SendOutcome::default();
                let limit = self.transport.settings.out_queue_limit;
                for entry in self.transport.connections.iter() {
                    let conn = entry.value();
                    let Some(eid) = conn.eid() else { continue };
                    if conn.is_defunct() {
                        continue;
                    }
                    match conn.send_frame(&frame, Some(limit)) {
                        Ok(()) => {
                            outcome.sites += 1;
                            if self.transport.sites.priority_of(eid) > 0 {
                                outcome.peers += 1;
                            }
                        }
                        Err(_) => conn.mark_defunct(),
                    }
                }
                Ok(outcome)
            }
        }
    }

    fn send_ack(&self, eid: u32, ack: Ack) -> Result<()> {
        let frame = SendFrame::new(MsgType::Ack, ack.encode_control().to_vec(), Vec::new());
        self.send_one(eid, &frame).map(|_| ())
    }
}

/// Message worker: consumes whole replication messages as the transport
/// reassembles them and runs each through the engine.
pub async fn run_worker<S: RepSender>(
    engine: Arc<ReplicationEngine<S>>,
    mut inbound_rx: mpsc::UnboundedReceiver<InboundRep>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = inbound_rx.recv() => match inbound {
                Some(InboundRep { eid, msg }) => {
                    if let Err(e) = engine.process_message(eid, msg) {
                        warn!("message from site {} failed: {}", eid, e);
                    }
                }
                None => break,
            },
        }
    }
}
