use std::convert::TryFrom;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use mqtt3_packet::{
    Connect, ConnectAck, ConnectReturnCode, LastWill, Packet, Publish, PublishAck,
    PublishComplete, PublishReceived, PublishRelease, QoS, Subscribe, SubscribeAck, Type,
    Unsubscribe, UnsubscribeAck, WriteTo, PROTOCOL_LEVEL,
};

use crate::acks::{AckList, ScanMode};
use crate::buffer::{PacketBuffer, BUF_DEFAULT_SIZE};
use crate::error::{Error, Result};
use crate::handlers::{Subscription, SubscriptionList};
use crate::message::{InterceptorHandler, Message, MessageData, MessageHandler, ReconnectHandler};
use crate::timer::Timer;
use crate::transport::{Connector, TcpConnector, Transport};

/// Default keep-alive interval in seconds.
pub const KEEP_ALIVE_INTERVAL_DEFAULT: u16 = 100;

const CMD_TIMEOUT_DEFAULT_MS: u64 = 5000;
const RECONNECT_TRY_DURATION_DEFAULT_MS: u64 = 1000;
const PACKET_ID_MAX: u16 = u16::max_value();
const REMAINING_LENGTH_MAX_BYTES: usize = 4;
const PUBLISH_DUP_BIT: u8 = 0x08;

/// Lifecycle state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Released, or torn down after a clean session.
    Invalid,
    /// Created and configured, never connected or connect failed.
    Initialized,
    /// CONNECT/CONNACK handshake completed.
    Connected,
    /// The link dropped; the background loop is reconnecting.
    Disconnected,
    /// A disconnect was requested; the background loop is tearing down.
    CleanSession,
}

/// Will message carried in the CONNECT packet.
///
/// Changing it after a connect has no effect until the next connect.
#[derive(Debug, Clone)]
pub struct WillOptions {
    pub topic: String,
    pub qos: QoS,
    pub retained: bool,
    pub message: Vec<u8>,
}

/// Session configuration.
///
/// `host`, `port` and `client_id` are required; everything else has the
/// protocol defaults.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    host: String,
    port: u16,
    client_id: String,
    username: Option<String>,
    password: Option<Vec<u8>>,
    ca: Option<Vec<u8>>,
    version: u8,
    keep_alive_interval: u16,
    clean_session: bool,
    cmd_timeout_ms: u64,
    reconnect_try_duration_ms: u64,
    read_buf_size: usize,
    write_buf_size: usize,
    will: Option<WillOptions>,
}

impl ClientOptions {
    pub fn new<H: Into<String>, C: Into<String>>(host: H, port: u16, client_id: C) -> Self {
        ClientOptions {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            ca: None,
            version: PROTOCOL_LEVEL,
            keep_alive_interval: KEEP_ALIVE_INTERVAL_DEFAULT,
            clean_session: false,
            cmd_timeout_ms: CMD_TIMEOUT_DEFAULT_MS,
            reconnect_try_duration_ms: RECONNECT_TRY_DURATION_DEFAULT_MS,
            read_buf_size: BUF_DEFAULT_SIZE,
            write_buf_size: BUF_DEFAULT_SIZE,
            will: None,
        }
    }

    pub fn username<S: Into<String>>(mut self, username: S) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password<S: Into<Vec<u8>>>(mut self, password: S) -> Self {
        self.password = Some(password.into());
        self
    }

    /// PEM CA bundle handed to the [`Connector`] to enable TLS.
    pub fn ca<S: Into<Vec<u8>>>(mut self, ca: S) -> Self {
        self.ca = Some(ca.into());
        self
    }

    /// MQTT protocol level byte carried in CONNECT.
    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn keep_alive_interval(mut self, seconds: u16) -> Self {
        self.keep_alive_interval = seconds;
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// Bound on every blocking I/O operation, in milliseconds.
    pub fn cmd_timeout(mut self, ms: u64) -> Self {
        self.cmd_timeout_ms = ms;
        self
    }

    /// Pause between failed reconnect attempts, in milliseconds.
    pub fn reconnect_try_duration(mut self, ms: u64) -> Self {
        self.reconnect_try_duration_ms = ms;
        self
    }

    pub fn read_buf_size(mut self, size: usize) -> Self {
        self.read_buf_size = size;
        self
    }

    pub fn write_buf_size(mut self, size: usize) -> Self {
        self.write_buf_size = size;
        self
    }

    pub fn will<T: Into<String>, M: Into<Vec<u8>>>(
        mut self,
        topic: T,
        qos: QoS,
        retained: bool,
        message: M,
    ) -> Self {
        self.will = Some(WillOptions {
            topic: topic.into(),
            qos,
            retained,
            message: message.into(),
        });
        self
    }
}

/// State shared with the background thread, guarded by the global lock.
struct SessionCore {
    state: ClientState,
    packet_id: u16,
    ping_outstanding: u8,
    acks: AckList,
    subscriptions: SubscriptionList,
    last_sent: Timer,
    last_received: Timer,
    thread_spawned: bool,
}

struct ClientInner {
    options: Mutex<ClientOptions>,
    connector: Box<dyn Connector>,
    network: Mutex<Option<Arc<dyn Transport>>>,
    /// Read buffer, owned by whoever drives the session: the connect path
    /// during the handshake, the background loop afterwards.
    read: Mutex<PacketBuffer>,
    /// Write buffer; the lock spans serialize, send and ack-record so
    /// producers cannot interleave.
    write: Mutex<PacketBuffer>,
    session: Mutex<SessionCore>,
    reconnect_handler: Mutex<Option<ReconnectHandler>>,
    interceptor: Mutex<Option<InterceptorHandler>>,
}

/// Handle to an MQTT 3.1.1 session.
///
/// Cheap to clone; all clones refer to the same session. The handle is
/// safe to use from any thread, including from message handlers running
/// on the background thread (with the exception of [`MqttClient::release`],
/// which would wait on that very thread).
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<ClientInner>,
}

// Mutex poisoning is not propagated: a panicking message handler must not
// wedge the session for every other thread.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn next_packet_id_locked(session: &mut SessionCore) -> u16 {
    session.packet_id = if session.packet_id >= PACKET_ID_MAX {
        1
    } else {
        session.packet_id + 1
    };
    session.packet_id
}

/// Serializes one packet into the front of `buf`, or `BufferTooShort`.
fn serialize_packet(buf: &mut PacketBuffer, packet: &Packet) -> Result<usize> {
    let len = packet.size();
    if len > buf.capacity() {
        return Err(Error::BufferTooShort);
    }

    let mut sink = &mut buf.as_mut_slice()[..len];
    packet.write_to(&mut sink);

    Ok(len)
}

/// Flips the DUP bit on a serialized PUBLISH packet, so the retained
/// retransmission copy is a well-formed re-delivery.
fn set_publish_dup(buf: &mut [u8]) -> Result<()> {
    if buf.is_empty() || (buf[0] >> 4) != Type::PUBLISH as u8 {
        return Err(Error::SetPublishDupFailed);
    }

    buf[0] |= PUBLISH_DUP_BIT;
    Ok(())
}

fn parse_failure(first_byte: u8) -> Error {
    match Type::try_from(first_byte >> 4) {
        Ok(Type::PUBLISH) => Error::PublishParseFailed,
        Ok(Type::SUBACK) => Error::SubscribeAckParseFailed,
        Ok(Type::UNSUBACK) => Error::UnsubscribeAckParseFailed,
        _ => Error::Failed,
    }
}

fn default_msg_handler() -> MessageHandler {
    Arc::new(|_client, data| {
        info!(
            "topic: {:?}, qos: {:?}, payload: {:?}",
            data.topic_name,
            data.message.qos,
            String::from_utf8_lossy(data.message.payload)
        );
    })
}

impl MqttClient {
    /// Creates a session over the default plain TCP connector.
    pub fn new(options: ClientOptions) -> MqttClient {
        MqttClient::with_connector(options, Box::new(TcpConnector::default()))
    }

    /// Creates a session over a custom transport, e.g. a TLS connector.
    pub fn with_connector(options: ClientOptions, connector: Box<dyn Connector>) -> MqttClient {
        let read = PacketBuffer::new(options.read_buf_size);
        let write = PacketBuffer::new(options.write_buf_size);

        MqttClient {
            inner: Arc::new(ClientInner {
                options: Mutex::new(options),
                connector,
                network: Mutex::new(None),
                read: Mutex::new(read),
                write: Mutex::new(write),
                session: Mutex::new(SessionCore {
                    state: ClientState::Initialized,
                    packet_id: 0,
                    ping_outstanding: 0,
                    acks: AckList::new(),
                    subscriptions: SubscriptionList::new(),
                    last_sent: Timer::new(),
                    last_received: Timer::new(),
                    thread_spawned: false,
                }),
                reconnect_handler: Mutex::new(None),
                interceptor: Mutex::new(None),
            }),
        }
    }

    /// Connects to the broker and waits for CONNACK.
    ///
    /// On the first success the background loop is spawned; it dispatches
    /// incoming packets, drives keep-alive and reconnects on its own from
    /// then on. Connecting an already connected session is a no-op.
    pub fn connect(&self) -> Result<()> {
        if self.state() == ClientState::Connected {
            return Ok(());
        }

        let options = lock(&self.inner.options).clone();

        let transport = match self
            .inner
            .connector
            .open(&options.host, options.port, options.ca.as_deref())
        {
            Ok(transport) => transport,
            Err(e) => {
                error!(
                    "transport connect to {}:{} failed: {}",
                    options.host, options.port, e
                );
                return Err(Error::ConnectFailed(None));
            }
        };
        *lock(&self.inner.network) = Some(transport);

        {
            let keep_alive_ms = u64::from(options.keep_alive_interval) * 1000;
            lock(&self.inner.session).last_received.countdown_ms(keep_alive_ms);
        }

        match self.connect_handshake(&options) {
            Ok(ack) if ack.return_code == ConnectReturnCode::ConnectionAccepted => {
                let spawn = {
                    let mut session = lock(&self.inner.session);
                    session.state = ClientState::Connected;
                    session.ping_outstanding = 0;
                    let spawn = !session.thread_spawned;
                    session.thread_spawned = true;
                    spawn
                };

                if spawn {
                    let client = self.clone();
                    let spawned = thread::Builder::new()
                        .name("mqtt-yield".into())
                        .spawn(move || background_loop(client));

                    if let Err(e) = spawned {
                        error!("failed to spawn the background loop: {}", e);
                        lock(&self.inner.session).thread_spawned = false;
                        self.release_network();
                        self.fail_back_to_initialized();
                        return Err(Error::ConnectFailed(None));
                    }
                }

                info!("mqtt connect success");
                Ok(())
            }
            Ok(ack) => {
                warn!("broker refused the connection: {}", ack.return_code);
                self.release_network();
                self.fail_back_to_initialized();
                Err(Error::ConnectFailed(Some(ack.return_code)))
            }
            Err(e) => {
                debug!("connect handshake failed: {}", e);
                self.release_network();
                self.fail_back_to_initialized();
                Err(e)
            }
        }
    }

    /// Sends DISCONNECT and hands the session to the background loop for
    /// teardown; the state reaches [`ClientState::Invalid`] once the loop
    /// has cleaned up.
    ///
    /// On a session that is not connected this returns `NotConnected`. A
    /// reconnecting session still transitions to the clean-session state
    /// so the teardown happens regardless.
    pub fn disconnect(&self) -> Result<()> {
        let mut session = lock(&self.inner.session);
        let state = session.state;
        match state {
            ClientState::Connected => {
                drop(session);
                let result = {
                    let mut write = lock(&self.inner.write);
                    serialize_packet(&mut write, &Packet::Disconnect)
                        .and_then(|len| self.send_bytes(&write.as_slice()[..len]))
                };
                self.set_state(ClientState::CleanSession);
                result
            }
            // the background loop is between reconnect attempts; route it
            // into teardown anyway
            ClientState::Disconnected | ClientState::Initialized if session.thread_spawned => {
                session.state = ClientState::CleanSession;
                Err(Error::NotConnected)
            }
            _ => Err(Error::NotConnected),
        }
    }

    /// Subscribes to a topic filter.
    ///
    /// Passing no handler falls back to one that logs each message. The
    /// subscription is installed only once the broker's SUBACK confirms
    /// it; until then it lives in the acknowledgment table and survives
    /// reconnects the same way QoS publishes do.
    pub fn subscribe(
        &self,
        topic_filter: &str,
        qos: QoS,
        handler: Option<MessageHandler>,
    ) -> Result<()> {
        if self.state() != ClientState::Connected {
            return Err(Error::NotConnected);
        }

        let timeout = self.cmd_timeout_ms();
        let mut write = lock(&self.inner.write);
        let packet_id = self.next_packet_id();

        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![(topic_filter, qos)],
        });
        let len = serialize_packet(&mut write, &packet)?;

        let subscription = Subscription {
            topic_filter: topic_filter.to_string(),
            qos,
            handler: handler.unwrap_or_else(default_msg_handler),
        };

        // the record must exist before the broker can answer, the
        // background loop matches the SUBACK against it
        lock(&self.inner.session).acks.record(
            Type::SUBACK,
            packet_id,
            &write.as_slice()[..len],
            Some(subscription),
            timeout,
        )?;

        debug!("subscribe to {:?} with packet id {}", topic_filter, packet_id);

        if let Err(e) = self.send_bytes(&write.as_slice()[..len]) {
            lock(&self.inner.session).acks.unrecord(Type::SUBACK, packet_id);
            return Err(e);
        }

        Ok(())
    }

    /// Unsubscribes from a previously subscribed topic filter.
    ///
    /// The subscription record is removed and destroyed when the broker's
    /// UNSUBACK arrives.
    pub fn unsubscribe(&self, topic_filter: &str) -> Result<()> {
        if self.state() != ClientState::Connected {
            return Err(Error::NotConnected);
        }

        let timeout = self.cmd_timeout_ms();
        let mut write = lock(&self.inner.write);
        let packet_id = self.next_packet_id();

        let packet = Packet::Unsubscribe(Unsubscribe {
            packet_id,
            topic_filters: vec![topic_filter],
        });
        let len = serialize_packet(&mut write, &packet)?;

        {
            let mut session = lock(&self.inner.session);
            let subscription = match session.subscriptions.find_filter(topic_filter) {
                Some(subscription) => subscription.clone(),
                None => {
                    warn!("no subscription registered for {:?}", topic_filter);
                    return Err(Error::Failed);
                }
            };

            // recorded before the send so the UNSUBACK cannot race it
            session.acks.record(
                Type::UNSUBACK,
                packet_id,
                &write.as_slice()[..len],
                Some(subscription),
                timeout,
            )?;
        }

        if let Err(e) = self.send_bytes(&write.as_slice()[..len]) {
            lock(&self.inner.session).acks.unrecord(Type::UNSUBACK, packet_id);
            return Err(e);
        }

        Ok(())
    }

    /// Publishes a message.
    ///
    /// Returns once the bytes are handed to the transport. For QoS 1/2
    /// the serialized packet is retained (DUP already set) and
    /// retransmitted until the matching acknowledgment arrives. Resource
    /// exhaustion (`AckTableFull`) drops the session to disconnected so
    /// the background loop reconnects with a clean slate.
    pub fn publish(&self, topic_name: &str, message: &Message) -> Result<()> {
        if self.state() != ClientState::Connected {
            return Err(Error::NotConnected);
        }

        let timeout = self.cmd_timeout_ms();
        let result = (|| {
            let mut write = lock(&self.inner.write);

            if message.payload.len() > write.capacity() {
                error!("publish payload is larger than the write buffer");
                return Err(Error::BufferTooShort);
            }

            let packet_id = if message.qos != QoS::AtMostOnce {
                let mut session = lock(&self.inner.session);
                if session.acks.is_full() {
                    return Err(Error::AckTableFull);
                }
                Some(next_packet_id_locked(&mut session))
            } else {
                None
            };

            let publish = Publish {
                dup: message.dup,
                qos: message.qos,
                retain: message.retained,
                topic_name,
                packet_id,
                payload: message.payload,
            };

            let len = serialize_packet(&mut write, &Packet::Publish(publish))?;

            if let Some(packet_id) = packet_id {
                // the retained copy carries DUP so a retransmit is well
                // formed; it is recorded before the first transmission so
                // the acknowledgment cannot race the record
                let mut retained = write.as_slice()[..len].to_vec();
                set_publish_dup(&mut retained)?;

                let expect = if message.qos == QoS::AtLeastOnce {
                    Type::PUBACK
                } else {
                    Type::PUBREC
                };
                lock(&self.inner.session)
                    .acks
                    .record(expect, packet_id, &retained, None, timeout)?;

                if let Err(e) = self.send_bytes(&write.as_slice()[..len]) {
                    lock(&self.inner.session).acks.unrecord(expect, packet_id);
                    return Err(e);
                }
            } else {
                self.send_bytes(&write.as_slice()[..len])?;
            }

            Ok(())
        })();

        if let Err(Error::AckTableFull) = result {
            warn!("ack table exhausted, dropping the session for a clean reconnect");
            self.release_network();
            let mut session = lock(&self.inner.session);
            if session.state == ClientState::Connected {
                session.state = ClientState::Disconnected;
            }
        }

        result
    }

    /// Sets the will carried in the next CONNECT packet.
    pub fn set_will<T: Into<String>, M: Into<Vec<u8>>>(
        &self,
        topic: T,
        qos: QoS,
        retained: bool,
        message: M,
    ) {
        lock(&self.inner.options).will = Some(WillOptions {
            topic: topic.into(),
            qos,
            retained,
            message: message.into(),
        });
    }

    /// Invoked just before each reconnect attempt.
    pub fn set_reconnect_handler(&self, handler: ReconnectHandler) {
        *lock(&self.inner.reconnect_handler) = Some(handler);
    }

    /// Catch-all for messages whose topic matches no subscription.
    pub fn set_interceptor_handler(&self, handler: InterceptorHandler) {
        *lock(&self.inner.interceptor) = Some(handler);
    }

    pub fn set_keep_alive_interval(&self, seconds: u16) {
        lock(&self.inner.options).keep_alive_interval = seconds;
    }

    pub fn set_clean_session(&self, clean_session: bool) {
        lock(&self.inner.options).clean_session = clean_session;
    }

    pub fn set_version(&self, version: u8) {
        lock(&self.inner.options).version = version;
    }

    pub fn set_cmd_timeout(&self, ms: u64) {
        lock(&self.inner.options).cmd_timeout_ms = ms;
    }

    pub fn set_reconnect_try_duration(&self, ms: u64) {
        lock(&self.inner.options).reconnect_try_duration_ms = ms;
    }

    /// Reallocates the read buffer; returns the effective size.
    pub fn set_read_buf_size(&self, size: usize) -> usize {
        lock(&self.inner.read).resize(size)
    }

    /// Reallocates the write buffer; returns the effective size.
    pub fn set_write_buf_size(&self, size: usize) -> usize {
        lock(&self.inner.write).resize(size)
    }

    pub fn state(&self) -> ClientState {
        lock(&self.inner.session).state
    }

    /// Number of in-flight acknowledgment records.
    pub fn pending_acks(&self) -> usize {
        lock(&self.inner.session).acks.len()
    }

    /// Logs and returns the currently installed subscriptions.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        let session = lock(&self.inner.session);

        if session.subscriptions.is_empty() {
            info!("there are no subscribed topics");
        }

        session
            .subscriptions
            .iter()
            .enumerate()
            .map(|(i, subscription)| {
                info!("[{}] subscribed topic: {:?}", i + 1, subscription.topic_filter);
                (subscription.topic_filter.clone(), subscription.qos)
            })
            .collect()
    }

    /// Waits for the background loop to finish tearing the session down.
    ///
    /// Returns `Failed` if the state does not reach
    /// [`ClientState::Invalid`] within the command timeout. Must not be
    /// called from a message handler.
    pub fn release(&self) -> Result<()> {
        let mut timer = Timer::new();
        timer.countdown_ms(self.cmd_timeout_ms());

        while self.state() != ClientState::Invalid {
            if timer.expired() {
                error!("mqtt release failed, the session never reached the invalid state");
                return Err(Error::Failed);
            }
            thread::sleep(Duration::from_millis(1));
        }

        Ok(())
    }

    fn cmd_timeout_ms(&self) -> u64 {
        lock(&self.inner.options).cmd_timeout_ms
    }

    fn keep_alive_ms(&self) -> u64 {
        u64::from(lock(&self.inner.options).keep_alive_interval) * 1000
    }

    fn reconnect_try_duration_ms(&self) -> u64 {
        lock(&self.inner.options).reconnect_try_duration_ms
    }

    fn set_state(&self, state: ClientState) {
        lock(&self.inner.session).state = state;
    }

    fn check_connected(&self) -> Result<()> {
        match self.state() {
            ClientState::Connected => Ok(()),
            ClientState::CleanSession => Err(Error::CleanSessionPending),
            _ => Err(Error::NotConnected),
        }
    }

    // A concurrent disconnect must not be overwritten by a failing
    // connect attempt, the background loop still has to observe it.
    fn fail_back_to_initialized(&self) {
        let mut session = lock(&self.inner.session);
        if session.state != ClientState::CleanSession {
            session.state = ClientState::Initialized;
        }
    }

    fn next_packet_id(&self) -> u16 {
        next_packet_id_locked(&mut lock(&self.inner.session))
    }

    fn current_network(&self) -> Result<Arc<dyn Transport>> {
        lock(&self.inner.network).clone().ok_or(Error::NotConnected)
    }

    fn release_network(&self) {
        if let Some(network) = lock(&self.inner.network).take() {
            network.shutdown();
        }
    }

    fn drop_link(&self, err: io::Error) -> Error {
        warn!("transport failed: {}, dropping the link", err);
        self.release_network();

        let mut session = lock(&self.inner.session);
        if session.state == ClientState::Connected {
            session.state = ClientState::Disconnected;
        }

        Error::NotConnected
    }

    /// Hands `data` to the transport, retrying partial writes under one
    /// command-timeout deadline. Refreshes the keep-alive send deadline
    /// on success. The caller holds the write lock.
    fn send_bytes(&self, data: &[u8]) -> Result<()> {
        let network = self.current_network()?;
        let keep_alive_ms = self.keep_alive_ms();

        let mut timer = Timer::new();
        timer.countdown_ms(self.cmd_timeout_ms());

        let mut sent = 0;
        while sent < data.len() {
            if timer.expired() {
                return Err(Error::SendFailed(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "send timed out",
                )));
            }

            match network.write(&data[sent..], timer.remaining()) {
                Ok(0) => continue,
                Ok(n) => sent += n,
                Err(e) => return Err(Error::SendFailed(e)),
            }
        }

        lock(&self.inner.session).last_sent.countdown_ms(keep_alive_ms);
        Ok(())
    }

    /// Reads one whole packet into the read buffer: fixed header byte,
    /// remaining-length field, then the body. `Ok(None)` means nothing
    /// arrived within the command timeout.
    ///
    /// A packet too large for the buffer is drained from the transport in
    /// buffer-sized chunks so stream framing survives, and reported as
    /// `BufferTooShort`.
    fn read_packet(&self, read: &mut PacketBuffer) -> Result<Option<usize>> {
        let network = self.current_network()?;

        let mut timer = Timer::new();
        timer.countdown_ms(self.cmd_timeout_ms());

        let mut header = [0u8; 1];
        match network.read(&mut header, timer.remaining()) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(self.drop_link(e)),
        }

        let mut len_bytes = [0u8; REMAINING_LENGTH_MAX_BYTES];
        let mut len_count = 0;
        let mut remaining: usize = 0;
        let mut multiplier: usize = 1;

        loop {
            if len_count >= REMAINING_LENGTH_MAX_BYTES {
                // framing is lost beyond recovery at this point
                return Err(self.drop_link(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "remaining length field exceeds 4 bytes",
                )));
            }

            let mut byte = [0u8; 1];
            match network.read(&mut byte, timer.remaining()) {
                Ok(0) => return Err(Error::NothingToRead),
                Ok(_) => {}
                Err(e) => return Err(self.drop_link(e)),
            }

            len_bytes[len_count] = byte[0];
            len_count += 1;
            remaining += usize::from(byte[0] & 0x7F) * multiplier;
            multiplier *= 128;

            if byte[0] & 0x80 == 0 {
                break;
            }
        }

        let header_len = 1 + len_count;
        let total = header_len + remaining;

        if total > read.capacity() {
            self.packet_drain(&network, &timer, remaining, read);
            return Err(Error::BufferTooShort);
        }

        let buf = read.as_mut_slice();
        buf[0] = header[0];
        buf[1..header_len].copy_from_slice(&len_bytes[..len_count]);

        let mut got = 0;
        while got < remaining {
            match network.read(&mut buf[header_len + got..total], timer.remaining()) {
                Ok(0) => {
                    if timer.expired() {
                        return Err(Error::NothingToRead);
                    }
                }
                Ok(n) => got += n,
                Err(e) => return Err(self.drop_link(e)),
            }
        }

        let keep_alive_ms = self.keep_alive_ms();
        lock(&self.inner.session).last_received.countdown_ms(keep_alive_ms);

        Ok(Some(total))
    }

    /// Reads and discards exactly `packet_len` bytes in buffer-sized
    /// chunks, keeping the stream aligned on the next fixed header.
    fn packet_drain(
        &self,
        network: &Arc<dyn Transport>,
        timer: &Timer,
        packet_len: usize,
        read: &mut PacketBuffer,
    ) {
        let mut total = 0;

        while total < packet_len && !timer.expired() {
            let want = (packet_len - total).min(read.capacity());
            match network.read(&mut read.as_mut_slice()[..want], timer.remaining()) {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
    }

    /// One dispatch iteration: read a packet, route it by type, then run
    /// the keep-alive check. Returns the handled packet type, or `None`
    /// when nothing arrived.
    fn packet_handle(&self, read: &mut PacketBuffer) -> Result<Option<Type>> {
        let total = match self.read_packet(read) {
            Ok(total) => total,
            Err(Error::BufferTooShort) => {
                error!("the read buffer is too short for the incoming packet, use set_read_buf_size() to grow it");
                None
            }
            Err(Error::NothingToRead) => None,
            Err(e) => return Err(e),
        };

        let mut handled = None;

        if let Some(total) = total {
            match mqtt3_packet::parse(&read.as_slice()[..total]) {
                Ok((_, packet)) => {
                    handled = Some(packet.packet_type());

                    // only valid during connect, where the handshake
                    // re-parses the buffer
                    if let Packet::ConnectAck(_) = packet {
                        return Ok(handled);
                    }

                    if let Err(e) = self.dispatch_packet(&packet) {
                        warn!("failed to handle {:?}: {}", packet.packet_type(), e);
                    }
                }
                Err(_) => {
                    // the stream resumes with the next fixed header
                    error!(
                        "dropping {} undecodable bytes: {}",
                        total,
                        parse_failure(read.as_slice()[0])
                    );
                }
            }
        }

        self.keep_alive()?;

        Ok(handled)
    }

    fn dispatch_packet(&self, packet: &Packet) -> Result<()> {
        match packet {
            Packet::Publish(publish) => self.publish_packet_handle(publish),
            Packet::PublishAck(ack) => {
                self.check_connected()?;
                lock(&self.inner.session)
                    .acks
                    .unrecord(Type::PUBACK, ack.packet_id);
                Ok(())
            }
            Packet::PublishComplete(ack) => {
                self.check_connected()?;
                lock(&self.inner.session)
                    .acks
                    .unrecord(Type::PUBCOMP, ack.packet_id);
                Ok(())
            }
            Packet::PublishReceived(ack) => {
                self.check_connected()?;
                self.publish_ack_packet(ack.packet_id, Type::PUBREC)?;
                lock(&self.inner.session)
                    .acks
                    .unrecord(Type::PUBREC, ack.packet_id);
                Ok(())
            }
            Packet::PublishRelease(ack) => {
                self.check_connected()?;
                self.publish_ack_packet(ack.packet_id, Type::PUBREL)?;
                lock(&self.inner.session)
                    .acks
                    .unrecord(Type::PUBREL, ack.packet_id);
                Ok(())
            }
            Packet::SubscribeAck(ack) => self.suback_handle(ack),
            Packet::UnsubscribeAck(ack) => self.unsuback_handle(ack),
            Packet::Pong => {
                lock(&self.inner.session).ping_outstanding = 0;
                Ok(())
            }
            // broker-bound packet types are not expected on a client
            _ => Ok(()),
        }
    }

    /// Handles an incoming PUBLISH: acknowledge per QoS, then deliver.
    ///
    /// QoS 2 messages are de-duplicated through the PUBREL expectation:
    /// only the first occurrence of a packet id reaches the handler. A
    /// failed acknowledgment serialization is logged and the message is
    /// still delivered; a failed send aborts without delivery.
    fn publish_packet_handle(&self, publish: &Publish) -> Result<()> {
        self.check_connected()?;

        let message = Message {
            qos: publish.qos,
            retained: publish.retain,
            dup: publish.dup,
            id: publish.packet_id.unwrap_or(0),
            payload: publish.payload,
        };

        if publish.qos != QoS::ExactlyOnce {
            if publish.qos == QoS::AtLeastOnce {
                let mut write = lock(&self.inner.write);
                let ack = Packet::PublishAck(PublishAck { packet_id: message.id });
                match serialize_packet(&mut write, &ack) {
                    Ok(len) => self.send_bytes(&write.as_slice()[..len])?,
                    Err(_) => error!("{}", Error::PublishAckSerializeFailed),
                }
            }

            self.deliver_message(publish.topic_name, &message);
            return Ok(());
        }

        // QoS 2: the PUBREL expectation doubles as the de-duplication
        // marker and must exist before the broker can answer the PUBREC
        let timeout = self.cmd_timeout_ms();
        let recorded = {
            let mut write = lock(&self.inner.write);
            let ack = Packet::PublishReceived(PublishReceived { packet_id: message.id });
            match serialize_packet(&mut write, &ack) {
                Ok(len) => {
                    let ack_bytes = write.as_slice()[..len].to_vec();
                    let recorded = lock(&self.inner.session).acks.record(
                        Type::PUBREL,
                        message.id,
                        &ack_bytes,
                        None,
                        timeout,
                    );

                    if let Err(e) = self.send_bytes(&write.as_slice()[..len]) {
                        if recorded.is_ok() {
                            lock(&self.inner.session)
                                .acks
                                .unrecord(Type::PUBREL, message.id);
                        }
                        return Err(e);
                    }

                    recorded
                }
                Err(_) => {
                    // the marker is still needed so a redelivery is not
                    // handed to the application twice
                    error!("{}", Error::PublishAckSerializeFailed);
                    lock(&self.inner.session).acks.record(
                        Type::PUBREL,
                        message.id,
                        &[],
                        None,
                        timeout,
                    )
                }
            }
        };

        match recorded {
            Err(Error::AckNodeExists) => {
                debug!("duplicate QoS 2 publish {} suppressed", message.id);
                Ok(())
            }
            Err(e) => {
                self.deliver_message(publish.topic_name, &message);
                Err(e)
            }
            Ok(()) => {
                self.deliver_message(publish.topic_name, &message);
                Ok(())
            }
        }
    }

    /// Delivers to the first matching subscription handler, or to the
    /// interceptor when no filter matches. Handlers run without any
    /// session lock held.
    fn deliver_message(&self, topic_name: &str, message: &Message) {
        let handler = lock(&self.inner.session)
            .subscriptions
            .find(topic_name)
            .map(|subscription| subscription.handler.clone());

        let data = MessageData::new(topic_name, message);

        match handler {
            Some(handler) => (*handler)(self, &data),
            None => {
                let interceptor = lock(&self.inner.interceptor).clone();
                match interceptor {
                    Some(interceptor) => (*interceptor)(self, &data),
                    None => debug!("no handler matches topic {:?}", data.topic_name),
                }
            }
        }
    }

    /// Builds and sends the QoS 2 continuation for an incoming PUBREC
    /// (answer PUBREL, expect PUBCOMP) or PUBREL (answer PUBCOMP).
    fn publish_ack_packet(&self, packet_id: u16, incoming: Type) -> Result<()> {
        let mut write = lock(&self.inner.write);

        let len = match incoming {
            Type::PUBREC => {
                let len = serialize_packet(
                    &mut write,
                    &Packet::PublishRelease(PublishRelease { packet_id }),
                )
                .map_err(|_| Error::PublishAckBuildFailed)?;

                let timeout = self.cmd_timeout_ms();
                let bytes = write.as_slice()[..len].to_vec();
                lock(&self.inner.session).acks.record(
                    Type::PUBCOMP,
                    packet_id,
                    &bytes,
                    None,
                    timeout,
                )?;
                len
            }
            Type::PUBREL => serialize_packet(
                &mut write,
                &Packet::PublishComplete(PublishComplete { packet_id }),
            )
            .map_err(|_| Error::PublishAckBuildFailed)?,
            _ => return Err(Error::PublishAckTypeInvalid),
        };

        self.send_bytes(&write.as_slice()[..len])
    }

    /// Resolves a pending subscription registration: install on success,
    /// destroy on the broker's failure sentinel.
    fn suback_handle(&self, ack: &SubscribeAck) -> Result<()> {
        self.check_connected()?;

        let granted = match ack.status.first() {
            Some(granted) => *granted,
            None => return Err(Error::SubscribeAckParseFailed),
        };

        let mut session = lock(&self.inner.session);
        let subscription = match session.acks.unrecord(Type::SUBACK, ack.packet_id) {
            Some(subscription) => subscription,
            None => return Err(Error::Failed),
        };

        if granted.is_failure() {
            warn!(
                "broker rejected the subscription to {:?}",
                subscription.topic_filter
            );
            return Err(Error::SubscribeNack);
        }

        session.subscriptions.install(subscription);
        Ok(())
    }

    fn unsuback_handle(&self, ack: &UnsubscribeAck) -> Result<()> {
        self.check_connected()?;

        let mut session = lock(&self.inner.session);
        match session.acks.unrecord(Type::UNSUBACK, ack.packet_id) {
            Some(subscription) => {
                session.subscriptions.remove(&subscription.topic_filter);
                Ok(())
            }
            None => Err(Error::Failed),
        }
    }

    /// The keep-alive probe, run after every dispatch iteration.
    ///
    /// Any broker activity is proof of liveness, so both deadlines are
    /// refreshed on every successful read or write, not just on
    /// PINGRESP. When one of them expires with a PINGREQ already
    /// outstanding the link is declared dead.
    fn keep_alive(&self) -> Result<()> {
        self.check_connected()?;

        let outstanding = {
            let session = lock(&self.inner.session);
            if !(session.last_sent.expired() || session.last_received.expired()) {
                return Ok(());
            }
            session.ping_outstanding
        };

        if outstanding > 0 {
            warn!("no PINGRESP within the keep-alive interval, link is dead");
            self.release_network();
            let mut session = lock(&self.inner.session);
            if session.state == ClientState::Connected {
                session.state = ClientState::Disconnected;
            }
            return Err(Error::NotConnected);
        }

        let result = {
            let mut write = lock(&self.inner.write);
            serialize_packet(&mut write, &Packet::Ping)
                .and_then(|len| self.send_bytes(&write.as_slice()[..len]))
        };
        lock(&self.inner.session).ping_outstanding += 1;

        result
    }

    /// Scans the acknowledgment table: retransmits QoS continuations and
    /// reaps expired subscription registrations.
    fn ack_scan(&self, mode: ScanMode) {
        let timeout = self.cmd_timeout_ms();

        let resend = {
            let mut session = lock(&self.inner.session);
            if session.state != ClientState::Connected || session.acks.is_empty() {
                return;
            }

            let outcome = session.acks.scan(mode, timeout);
            for (expect, subscription) in outcome.expired {
                warn!(
                    "pending {:?} for {:?} expired unanswered",
                    expect, subscription.topic_filter
                );
                if expect == Type::UNSUBACK {
                    session.subscriptions.remove(&subscription.topic_filter);
                }
            }
            outcome.resend
        };

        for payload in resend {
            let _write = lock(&self.inner.write);
            warn!("retransmitting a {} byte request", payload.len());
            if let Err(e) = self.send_bytes(&payload) {
                warn!("retransmit failed: {}", e);
            }
        }
    }

    fn connect_handshake(&self, options: &ClientOptions) -> Result<ConnectAck> {
        let connect = Connect {
            protocol_level: options.version,
            clean_session: options.clean_session,
            keep_alive: options.keep_alive_interval,
            client_id: &options.client_id,
            last_will: options.will.as_ref().map(|will| LastWill {
                qos: will.qos,
                retain: will.retained,
                topic_name: &will.topic,
                message: &will.message,
            }),
            username: options.username.as_deref(),
            password: options.password.as_deref(),
        };

        {
            let mut write = lock(&self.inner.write);
            let len = serialize_packet(&mut write, &Packet::Connect(connect))?;
            self.send_bytes(&write.as_slice()[..len])?;
        }

        let mut deadline = Timer::new();
        deadline.countdown_ms(options.cmd_timeout_ms);

        let mut read = lock(&self.inner.read);
        self.wait_connack(&mut read, &deadline)
    }

    /// Waits for CONNACK, skipping whatever else the broker interleaves.
    fn wait_connack(&self, read: &mut PacketBuffer, deadline: &Timer) -> Result<ConnectAck> {
        while !deadline.expired() {
            let total = match self.read_packet(read)? {
                Some(total) => total,
                None => continue,
            };

            match mqtt3_packet::parse(&read.as_slice()[..total]) {
                Ok((_, Packet::ConnectAck(ack))) => return Ok(ack),
                Ok((_, packet)) => debug!(
                    "ignoring {:?} while waiting for CONNACK",
                    packet.packet_type()
                ),
                Err(_) => error!("dropping an undecodable packet while waiting for CONNACK"),
            }
        }

        Err(Error::ConnectFailed(None))
    }

    /// One reconnect attempt: refresh credentials via the reconnect
    /// handler, connect, re-issue every subscription, kick all pending
    /// requests. A failed attempt pauses for the retry duration.
    fn try_reconnect(&self) -> Result<()> {
        let handler = lock(&self.inner.reconnect_handler).clone();
        if let Some(handler) = handler {
            (*handler)(self);
        }

        if let Err(e) = self.try_do_reconnect() {
            debug!("reconnect attempt failed: {}", e);
            thread::sleep(Duration::from_millis(self.reconnect_try_duration_ms()));
            return Err(Error::ReconnectTimeout);
        }

        Ok(())
    }

    fn try_do_reconnect(&self) -> Result<()> {
        if self.state() != ClientState::Connected {
            self.connect()?;
        }

        let resubscribed = self.try_resubscribe();
        self.ack_scan(ScanMode::Immediate);
        resubscribed
    }

    fn try_resubscribe(&self) -> Result<()> {
        let installed: Vec<(String, QoS, MessageHandler)> = lock(&self.inner.session)
            .subscriptions
            .iter()
            .map(|subscription| {
                (
                    subscription.topic_filter.clone(),
                    subscription.qos,
                    subscription.handler.clone(),
                )
            })
            .collect();

        if installed.is_empty() {
            return Ok(());
        }

        warn!("re-issuing {} subscriptions after reconnect", installed.len());

        let mut result = Ok(());
        for (topic_filter, qos, handler) in installed {
            if let Err(e) = self.subscribe(&topic_filter, qos, Some(handler)) {
                warn!("resubscribe of {:?} failed: {}", topic_filter, e);
                result = Err(Error::Resubscribe);
            }
        }

        result
    }

    /// One pass of the background loop, bounded by `timeout_ms`:
    /// reconnect while disconnected, otherwise dispatch packets and scan
    /// the acknowledgment table.
    fn yield_once(&self, timeout_ms: u64) -> Result<()> {
        let mut timer = Timer::new();
        timer.countdown_ms(timeout_ms);

        while !timer.expired() {
            match self.state() {
                ClientState::CleanSession => return Err(Error::CleanSessionPending),
                ClientState::Connected => {}
                _ => {
                    self.try_reconnect()?;
                    continue;
                }
            }

            let result = {
                let mut read = lock(&self.inner.read);
                self.packet_handle(&mut read)
            };

            match result {
                Ok(_) => self.ack_scan(ScanMode::Deadline),
                Err(e) => debug!("dispatch failed: {}", e),
            }
        }

        Ok(())
    }

    /// Empties both tables and invalidates the session; the final step of
    /// the background loop's teardown.
    fn clean_session_teardown(&self) {
        let mut session = lock(&self.inner.session);
        session.acks.clear();
        session.subscriptions.clear();
        session.ping_outstanding = 0;
        session.thread_spawned = false;
        session.state = ClientState::Invalid;
    }
}

/// The background loop: yields until a clean session is requested, then
/// tears the session down and exits.
fn background_loop(client: MqttClient) {
    debug!("mqtt background loop started");

    loop {
        let timeout = client.cmd_timeout_ms();

        match client.yield_once(timeout) {
            Err(Error::CleanSessionPending) => {
                warn!("mqtt clean session");
                client.release_network();
                client.clean_session_teardown();
                break;
            }
            Err(Error::ReconnectTimeout) => warn!("mqtt reconnect timed out"),
            Err(e) => debug!("yield failed: {}", e),
            Ok(()) => {}
        }
    }

    debug!("mqtt background loop finished");
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use super::*;

    fn client() -> MqttClient {
        MqttClient::new(ClientOptions::new("localhost", 1883, "unittest"))
    }

    #[test]
    fn test_packet_id_wraps_and_skips_zero() {
        let client = client();

        assert_eq!(client.next_packet_id(), 1);
        assert_eq!(client.next_packet_id(), 2);

        lock(&client.inner.session).packet_id = PACKET_ID_MAX - 1;
        assert_eq!(client.next_packet_id(), PACKET_ID_MAX);
        assert_eq!(client.next_packet_id(), 1);
    }

    #[test]
    fn test_api_requires_connection() {
        let client = client();

        assert_matches!(
            client.publish("t", &Message::new(b"x", QoS::AtMostOnce)),
            Err(Error::NotConnected)
        );
        assert_matches!(
            client.subscribe("t", QoS::AtMostOnce, None),
            Err(Error::NotConnected)
        );
        assert_matches!(client.unsubscribe("t"), Err(Error::NotConnected));
        assert_matches!(client.disconnect(), Err(Error::NotConnected));
    }

    #[test]
    fn test_disconnect_while_reconnecting_still_tears_down() {
        let client = client();
        {
            let mut session = lock(&client.inner.session);
            session.state = ClientState::Disconnected;
            session.thread_spawned = true;
        }

        assert_matches!(client.disconnect(), Err(Error::NotConnected));
        assert_eq!(client.state(), ClientState::CleanSession);
    }

    #[test]
    fn test_publish_payload_bounded_by_write_buffer() {
        let client = client();
        client.set_write_buf_size(64);
        client.set_state(ClientState::Connected);

        let payload = vec![0u8; 65];
        assert_matches!(
            client.publish("t", &Message::new(&payload, QoS::AtMostOnce)),
            Err(Error::BufferTooShort)
        );
    }

    #[test]
    fn test_buffer_size_setters_clamp() {
        let client = client();

        assert_eq!(client.set_read_buf_size(0), BUF_DEFAULT_SIZE);
        assert_eq!(client.set_read_buf_size(128), 128);
        assert_eq!(client.set_write_buf_size(usize::max_value()), BUF_DEFAULT_SIZE);
    }

    #[test]
    fn test_set_publish_dup() {
        let mut buf = PacketBuffer::new(16);

        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic_name: "t",
            packet_id: Some(1),
            payload: b"x",
        });
        let len = serialize_packet(&mut buf, &publish).unwrap();
        assert_eq!(buf.as_slice()[0], 0x32);

        set_publish_dup(buf.as_mut_slice()).unwrap();
        assert_eq!(buf.as_slice()[0], 0x3A);

        // still a parsable PUBLISH, now flagged as a re-delivery
        let (_, reparsed) = mqtt3_packet::parse(&buf.as_slice()[..len]).unwrap();
        match reparsed {
            Packet::Publish(publish) => assert!(publish.dup),
            other => panic!("unexpected packet {:?}", other),
        }

        serialize_packet(&mut buf, &Packet::Ping).unwrap();
        assert_matches!(
            set_publish_dup(buf.as_mut_slice()),
            Err(Error::SetPublishDupFailed)
        );
    }
}
