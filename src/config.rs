use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    cid_generator::{ConnectionIdGenerator, RandomConnectionIdGenerator},
    congestion,
    crypto::{HandshakeTokenKey, HmacKey},
    token::TokenStore,
    VarInt, VarIntBoundsExceeded, DEFAULT_SUPPORTED_VERSIONS, MAX_CID_SIZE, MIN_CID_SIZE,
};

/// Parameters governing the core QUIC state machine
///
/// Default values should be suitable for most internet applications. Applications
/// protocols which forbid remotely-initiated streams should set `max_concurrent_bidi_streams`
/// and `max_concurrent_uni_streams` to zero.
///
/// In particular, window sizes for streams, stream data, and overall connection data
/// should be set differently depending on the expected round trip time, link capacity,
/// and memory availability. Tuning for higher bandwidths and latencies increases
/// worst-case memory consumption, but does not impair performance at lower bandwidths
/// and latencies. The default configuration is tuned for a 100Mbps link with a 100ms
/// round trip time.
pub struct TransportConfig {
    pub(crate) max_concurrent_bidi_streams: VarInt,
    pub(crate) max_concurrent_uni_streams: VarInt,
    pub(crate) max_idle_timeout: Option<VarInt>,
    pub(crate) handshake_idle_timeout: Duration,
    pub(crate) stream_receive_window: VarInt,
    pub(crate) max_stream_receive_window: VarInt,
    pub(crate) receive_window: VarInt,
    pub(crate) max_receive_window: VarInt,
    pub(crate) send_window: u64,

    pub(crate) packet_threshold: u32,
    pub(crate) time_threshold: f32,
    pub(crate) initial_rtt: Duration,
    pub(crate) initial_mtu: u16,
    pub(crate) persistent_congestion_threshold: u32,
    pub(crate) keep_alive_interval: Option<Duration>,
    pub(crate) crypto_buffer_size: usize,
    pub(crate) allow_spin: bool,
    pub(crate) datagram_receive_buffer_size: Option<usize>,
    pub(crate) datagram_send_buffer_size: usize,
    /// Skip packet numbers on the 1-RTT path to defend against peers that acknowledge
    /// packets they never received
    pub(crate) skip_packet_numbers: bool,
    /// Accept RETIRE_CONNECTION_ID frames that name the connection ID the frame itself
    /// arrived on, for compatibility with peers that predate the prohibition
    pub(crate) allow_retirement_of_current_cid: bool,

    pub(crate) congestion_controller_factory: Arc<dyn congestion::ControllerFactory + Send + Sync>,
}

impl TransportConfig {
    /// Maximum number of incoming bidirectional streams that may be open concurrently
    ///
    /// Must be nonzero for the peer to open any bidirectional streams.
    pub fn max_concurrent_bidi_streams(&mut self, value: VarInt) -> &mut Self {
        self.max_concurrent_bidi_streams = value;
        self
    }

    /// Variant of `max_concurrent_bidi_streams` affecting unidirectional streams
    pub fn max_concurrent_uni_streams(&mut self, value: VarInt) -> &mut Self {
        self.max_concurrent_uni_streams = value;
        self
    }

    /// Maximum duration of inactivity to accept before timing out the connection
    ///
    /// The true idle timeout is the minimum of this and the peer's own max idle timeout.
    /// `None` represents an infinite timeout.
    ///
    /// **WARNING**: If a peer or its network path malfunctions or acts maliciously, an
    /// infinite idle timeout can result in permanently hung futures!
    pub fn max_idle_timeout(&mut self, value: Option<Duration>) -> Result<&mut Self, ConfigError> {
        self.max_idle_timeout = value
            .map(|x| VarInt::from_u64(x.as_millis() as u64).map_err(|_| ConfigError::OutOfBounds))
            .transpose()?;
        Ok(self)
    }

    /// Maximum duration of inactivity to accept before timing out a handshake
    ///
    /// At least twice this long is always tolerated, so that slow peers get the benefit
    /// of the doubt while their first round trips complete.
    pub fn handshake_idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.handshake_idle_timeout = value;
        self
    }

    /// Maximum number of bytes the peer may transmit without acknowledgement on any one
    /// stream before becoming blocked
    ///
    /// This is the initial window; it grows automatically up to
    /// `max_stream_receive_window` when the peer saturates it within few round trips.
    pub fn stream_receive_window(&mut self, value: VarInt) -> &mut Self {
        self.stream_receive_window = value;
        self
    }

    /// Upper bound for per-stream receive windows grown by auto-tuning
    pub fn max_stream_receive_window(&mut self, value: VarInt) -> &mut Self {
        self.max_stream_receive_window = value;
        self
    }

    /// Maximum number of bytes the peer may transmit across all streams of a connection
    /// before becoming blocked
    pub fn receive_window(&mut self, value: VarInt) -> &mut Self {
        self.receive_window = value;
        self
    }

    /// Upper bound for the connection receive window grown by auto-tuning
    pub fn max_receive_window(&mut self, value: VarInt) -> &mut Self {
        self.max_receive_window = value;
        self
    }

    /// Maximum number of bytes to transmit to a peer without acknowledgment
    ///
    /// Provides an upper bound on memory when communicating with peers that issue large
    /// amounts of flow control credit.
    pub fn send_window(&mut self, value: u64) -> &mut Self {
        self.send_window = value;
        self
    }

    /// Maximum reordering in packet number space before FACK style loss detection
    /// considers a packet lost. Should not be less than 3, per RFC5681.
    pub fn packet_threshold(&mut self, value: u32) -> &mut Self {
        self.packet_threshold = value;
        self
    }

    /// Maximum reordering in time space before time based loss detection considers a
    /// packet lost, as a factor of RTT
    pub fn time_threshold(&mut self, value: f32) -> &mut Self {
        self.time_threshold = value;
        self
    }

    /// The RTT used before an RTT sample is taken
    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }

    /// The initial value to be used as the maximum UDP payload size before running MTU
    /// discovery (which is out of scope for this crate)
    pub fn initial_mtu(&mut self, value: u16) -> &mut Self {
        self.initial_mtu = value.max(1200);
        self
    }

    /// Number of consecutive PTOs after which network is considered to be experiencing
    /// persistent congestion
    pub fn persistent_congestion_threshold(&mut self, value: u32) -> &mut Self {
        self.persistent_congestion_threshold = value;
        self
    }

    /// Period of inactivity before sending a keep-alive packet
    ///
    /// Keep-alive packets prevent an inactive but otherwise healthy connection from
    /// timing out. `None` to disable, which is the default. Only one side of any given
    /// connection needs keep-alive enabled for the connection to be preserved. Must be
    /// set lower than the idle_timeout of both peers to be effective.
    pub fn keep_alive_interval(&mut self, value: Option<Duration>) -> &mut Self {
        self.keep_alive_interval = value;
        self
    }

    /// Maximum quantity of out-of-order crypto layer data to buffer
    pub fn crypto_buffer_size(&mut self, value: usize) -> &mut Self {
        self.crypto_buffer_size = value.max(4096);
        self
    }

    /// Whether the implementation is permitted to set the spin bit on this connection
    ///
    /// This allows passive observers to easily judge the round trip time of a
    /// connection, which can be useful for network administration but sacrifices a small
    /// amount of privacy.
    pub fn allow_spin(&mut self, value: bool) -> &mut Self {
        self.allow_spin = value;
        self
    }

    /// Maximum quantity of unacknowledged datagrams to buffer on receive
    ///
    /// `None` disables incoming datagrams, and is announced to the peer through the
    /// transport parameters.
    pub fn datagram_receive_buffer_size(&mut self, value: Option<usize>) -> &mut Self {
        self.datagram_receive_buffer_size = value;
        self
    }

    /// Maximum quantity of datagrams to buffer for sending
    pub fn datagram_send_buffer_size(&mut self, value: usize) -> &mut Self {
        self.datagram_send_buffer_size = value;
        self
    }

    /// Whether to occasionally skip a 1-RTT packet number
    ///
    /// A peer that acknowledges a skipped number reveals that it acknowledges packets it
    /// never received, and the connection is closed. Enabled by default.
    pub fn skip_packet_numbers(&mut self, value: bool) -> &mut Self {
        self.skip_packet_numbers = value;
        self
    }

    /// Tolerate peers that retire the connection ID their RETIRE_CONNECTION_ID frame
    /// arrived on
    ///
    /// The protocol forbids this, but some older peers do it anyway. Disabled by default.
    pub fn allow_retirement_of_current_cid(&mut self, value: bool) -> &mut Self {
        self.allow_retirement_of_current_cid = value;
        self
    }

    /// How to construct the congestion controller for a connection
    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn congestion::ControllerFactory + Send + Sync>,
    ) -> &mut Self {
        self.congestion_controller_factory = factory;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        const EXPECTED_RTT: u32 = 100; // ms
        const MAX_STREAM_BANDWIDTH: u32 = 12500 * 1000; // bytes/s
        // Window size needed to avoid pipeline stalls
        const STREAM_RWND: u32 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT;

        Self {
            max_concurrent_bidi_streams: 100u32.into(),
            max_concurrent_uni_streams: 100u32.into(),
            max_idle_timeout: Some(VarInt(10_000)),
            handshake_idle_timeout: Duration::from_secs(5),
            stream_receive_window: STREAM_RWND.into(),
            max_stream_receive_window: (8 * STREAM_RWND).into(),
            receive_window: STREAM_RWND.into(),
            max_receive_window: VarInt::MAX,
            send_window: (8 * STREAM_RWND) as u64,

            packet_threshold: 3,
            time_threshold: 9.0 / 8.0,
            initial_rtt: Duration::from_millis(333), // per recovery draft 6.2.2
            initial_mtu: 1200,
            persistent_congestion_threshold: 3,
            keep_alive_interval: None,
            crypto_buffer_size: 16 * 1024,
            allow_spin: true,
            datagram_receive_buffer_size: Some(STREAM_RWND as usize),
            datagram_send_buffer_size: 1024 * 1024,
            skip_packet_numbers: true,
            allow_retirement_of_current_cid: false,

            congestion_controller_factory: Arc::new(congestion::NewRenoConfig::default()),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TransportConfig")
            .field(
                "max_concurrent_bidi_streams",
                &self.max_concurrent_bidi_streams,
            )
            .field(
                "max_concurrent_uni_streams",
                &self.max_concurrent_uni_streams,
            )
            .field("max_idle_timeout", &self.max_idle_timeout)
            .field("stream_receive_window", &self.stream_receive_window)
            .field("receive_window", &self.receive_window)
            .field("send_window", &self.send_window)
            .field("packet_threshold", &self.packet_threshold)
            .field("time_threshold", &self.time_threshold)
            .field("initial_rtt", &self.initial_rtt)
            .field(
                "persistent_congestion_threshold",
                &self.persistent_congestion_threshold,
            )
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("crypto_buffer_size", &self.crypto_buffer_size)
            .field("allow_spin", &self.allow_spin)
            .field(
                "datagram_receive_buffer_size",
                &self.datagram_receive_buffer_size,
            )
            .field("datagram_send_buffer_size", &self.datagram_send_buffer_size)
            .field("skip_packet_numbers", &self.skip_packet_numbers)
            .finish_non_exhaustive()
    }
}

/// Global configuration for the endpoint, affecting all connections
///
/// Default values should be suitable for most internet applications.
#[derive(Clone)]
pub struct EndpointConfig {
    pub(crate) reset_key: Arc<dyn HmacKey>,
    pub(crate) max_udp_payload_size: VarInt,
    /// Length of local connection IDs
    pub(crate) cid_len: usize,
    /// CID generator factory
    ///
    /// Create a cid generator for local cid in Endpoint struct
    pub(crate) cid_generator_factory: Arc<dyn Fn() -> Box<dyn ConnectionIdGenerator> + Send + Sync>,
    pub(crate) supported_versions: Vec<u32>,
}

impl EndpointConfig {
    /// Create a default config with a particular `reset_key`
    pub fn new(reset_key: Arc<dyn HmacKey>) -> Self {
        let cid_factory: fn() -> Box<dyn ConnectionIdGenerator> =
            || Box::<RandomConnectionIdGenerator>::default();
        Self {
            reset_key,
            max_udp_payload_size: 1480u32.into(), // Typical internet MTU minus IPv4 and UDP overhead, rounded up
            cid_len: RandomConnectionIdGenerator::default().cid_len(),
            cid_generator_factory: Arc::new(cid_factory),
            supported_versions: DEFAULT_SUPPORTED_VERSIONS.to_vec(),
        }
    }

    /// Supply a custom connection ID generator factory
    ///
    /// The length produced by the generator must be 0 or within [4, 18].
    pub fn cid_generator<F: Fn() -> Box<dyn ConnectionIdGenerator> + Send + Sync + 'static>(
        &mut self,
        factory: F,
    ) -> Result<&mut Self, ConfigError> {
        let len = factory().cid_len();
        if len != 0 && !(MIN_CID_SIZE..=MAX_CID_SIZE).contains(&len) {
            return Err(ConfigError::IllegalValue(
                "local connection ID length must be 0 or in [4, 18]",
            ));
        }
        self.cid_len = len;
        self.cid_generator_factory = Arc::new(factory);
        Ok(self)
    }

    /// Private key used to send authenticated connection resets to peers who were
    /// communicating with a previous instance of this endpoint
    pub fn reset_key(&mut self, key: Arc<dyn HmacKey>) -> &mut Self {
        self.reset_key = key;
        self
    }

    /// Maximum UDP payload size accepted from peers (excluding UDP and IP overhead)
    ///
    /// Must be greater or equal than 1200.
    pub fn max_udp_payload_size(&mut self, value: u16) -> Result<&mut Self, ConfigError> {
        if value < 1200 {
            return Err(ConfigError::IllegalValue(
                "max UDP payload size must be at least 1200",
            ));
        }
        self.max_udp_payload_size = u32::from(value).into();
        Ok(self)
    }

    /// QUIC protocol versions to offer and accept, in order of preference
    pub fn supported_versions(&mut self, versions: Vec<u32>) -> &mut Self {
        self.supported_versions = versions;
        self
    }
}

#[cfg(feature = "ring")]
impl Default for EndpointConfig {
    fn default() -> Self {
        let mut reset_key = [0; 64];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut reset_key);
        Self::new(Arc::new(ring::hmac::Key::new(
            ring::hmac::HMAC_SHA256,
            &reset_key,
        )))
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EndpointConfig")
            .field("max_udp_payload_size", &self.max_udp_payload_size)
            .field("cid_len", &self.cid_len)
            .field("supported_versions", &self.supported_versions)
            .finish_non_exhaustive()
    }
}

/// Parameters governing incoming connections
///
/// Default values should be suitable for most internet applications.
#[derive(Clone)]
pub struct ServerConfig {
    /// Transport configuration to use for incoming connections
    pub transport: Arc<TransportConfig>,

    /// Private key used to authenticate data included in handshake tokens
    pub(crate) token_key: Arc<dyn HandshakeTokenKey>,
    /// Whether to require clients to prove ownership of an address before committing resources
    ///
    /// Introduces an additional round-trip to the handshake to make denial of service
    /// attacks more difficult.
    pub(crate) use_retry: bool,
    /// Duration after a stateless retry token was issued for which it's considered valid
    pub(crate) retry_token_lifetime: Duration,
    /// Duration after a NEW_TOKEN token was issued for which it's considered valid
    pub(crate) validation_token_lifetime: Duration,
    /// Whether to allow clients to migrate to new addresses
    pub(crate) migration: bool,
}

impl ServerConfig {
    /// Create a default config with a particular handshake token key
    pub fn new(token_key: Arc<dyn HandshakeTokenKey>) -> Self {
        Self {
            transport: Arc::new(TransportConfig::default()),
            token_key,
            use_retry: false,
            retry_token_lifetime: Duration::from_secs(5),
            validation_token_lifetime: Duration::from_secs(24 * 60 * 60),
            migration: true,
        }
    }

    /// Whether to require clients to prove ownership of an address before committing resources
    pub fn use_retry(&mut self, value: bool) -> &mut Self {
        self.use_retry = value;
        self
    }

    /// Duration after a stateless retry token was issued for which it's considered valid
    pub fn retry_token_lifetime(&mut self, value: Duration) -> &mut Self {
        self.retry_token_lifetime = value;
        self
    }

    /// Duration after a NEW_TOKEN token was issued for which it's considered valid
    pub fn validation_token_lifetime(&mut self, value: Duration) -> &mut Self {
        self.validation_token_lifetime = value;
        self
    }

    /// Whether to allow clients to migrate to new addresses
    pub fn migration(&mut self, value: bool) -> &mut Self {
        self.migration = value;
        self
    }
}

#[cfg(feature = "ring")]
impl Default for ServerConfig {
    fn default() -> Self {
        let mut master_key = [0; 64];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut master_key);
        let master_key = ring::hkdf::Salt::new(ring::hkdf::HKDF_SHA256, &[]).extract(&master_key);
        Self::new(Arc::new(master_key))
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ServerConfig")
            .field("transport", &self.transport)
            .field("use_retry", &self.use_retry)
            .field("retry_token_lifetime", &self.retry_token_lifetime)
            .field("validation_token_lifetime", &self.validation_token_lifetime)
            .field("migration", &self.migration)
            .finish_non_exhaustive()
    }
}

/// Configuration for outgoing connections
#[derive(Clone)]
pub struct ClientConfig {
    /// Transport configuration to use
    pub transport: Arc<TransportConfig>,
    /// Source of address-validation tokens issued by servers we connected to before
    pub(crate) token_store: Option<Arc<dyn TokenStore>>,
    /// QUIC protocol version to use
    pub(crate) version: u32,
}

impl ClientConfig {
    /// Create a default config
    pub fn new() -> Self {
        Self {
            transport: Arc::new(TransportConfig::default()),
            token_store: None,
            version: DEFAULT_SUPPORTED_VERSIONS[0],
        }
    }

    /// Supply a store for NEW_TOKEN tokens, enabling address validation across connections
    pub fn token_store(&mut self, store: Arc<dyn TokenStore>) -> &mut Self {
        self.token_store = Some(store);
        self
    }

    /// QUIC protocol version to use
    pub fn version(&mut self, version: u32) -> &mut Self {
        self.version = version;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ClientConfig")
            .field("transport", &self.transport)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Errors in the configuration of an endpoint
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
    /// The supplied configuration contained an invalid value
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}

impl From<VarIntBoundsExceeded> for ConfigError {
    fn from(_: VarIntBoundsExceeded) -> Self {
        Self::OutOfBounds
    }
}
