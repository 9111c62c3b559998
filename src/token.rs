use std::{
    fmt,
    mem::size_of,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::{Buf, BufMut};
use rand::Rng;

use crate::{
    coding::{BufExt, BufMutExt},
    config::ServerConfig,
    crypto::{HandshakeTokenKey, HmacKey},
    shared::ConnectionId,
    RESET_TOKEN_SIZE,
};

/// Responsible for storing validation tokens received from servers and retrieving them for
/// use in subsequent connections
pub trait TokenStore: Send + Sync {
    /// Potentially store a token for later one-time use
    ///
    /// Called when a NEW_TOKEN frame is received from the server.
    fn insert(&self, server_name: &str, token: bytes::Bytes);

    /// Try to find and take a token that was stored with the given server name
    ///
    /// The same token must never be returned from `take` twice, as doing so can be used to
    /// de-anonymize a client's traffic.
    ///
    /// Called when trying to connect to a server. It is always ok for this to return `None`.
    fn take(&self, server_name: &str) -> Option<bytes::Bytes>;
}

/// Null implementation of [`TokenStore`], which does not store any tokens
pub struct NoneTokenStore;

impl TokenStore for NoneTokenStore {
    fn insert(&self, _: &str, _: bytes::Bytes) {}
    fn take(&self, _: &str) -> Option<bytes::Bytes> {
        None
    }
}

/// Mints and checks address-validation tokens on behalf of a server endpoint
///
/// Retry tokens prove a current round trip and bind the connection IDs the handshake
/// will be checked against; NEW_TOKEN tokens prove a past connection from the same IP
/// and stay valid much longer. Both are sealed so clients can neither read nor forge
/// them.
pub struct TokenGenerator {
    key: Arc<dyn HandshakeTokenKey>,
    retry_lifetime: Duration,
    validation_lifetime: Duration,
}

impl TokenGenerator {
    /// Build a generator sharing the server's token key and lifetimes
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            key: config.token_key.clone(),
            retry_lifetime: config.retry_token_lifetime,
            validation_lifetime: config.validation_token_lifetime,
        }
    }

    /// Mint the token carried by a Retry packet
    pub fn retry_token(
        &self,
        remote: SocketAddr,
        orig_dst_cid: ConnectionId,
        retry_src_cid: ConnectionId,
    ) -> Vec<u8> {
        let token = Token::new(
            TokenPayload::Retry {
                address: remote,
                orig_dst_cid,
                retry_src_cid,
                issued: SystemTime::now(),
            },
            &mut rand::thread_rng(),
        );
        token.encode(&*self.key)
    }

    /// Mint a token for a NEW_TOKEN frame
    ///
    /// Only the IP is bound, so the client can redeem the token from another port.
    pub fn validation_token(&self, remote: SocketAddr) -> Vec<u8> {
        let token = Token::new(
            TokenPayload::Validation {
                ip: remote.ip(),
                issued: SystemTime::now(),
            },
            &mut rand::thread_rng(),
        );
        token.encode(&*self.key)
    }

    /// Inspect the token of a client Initial, or error if the connection cannot be
    /// established
    ///
    /// `header_dst_cid` is the destination CID of the Initial carrying the token.
    pub fn validate(
        &self,
        token_bytes: &[u8],
        header_dst_cid: ConnectionId,
        remote_address: SocketAddr,
    ) -> Result<IncomingToken, InvalidRetryTokenError> {
        let unvalidated = IncomingToken {
            retry_src_cid: None,
            orig_dst_cid: header_dst_cid,
            validated: false,
        };

        if token_bytes.is_empty() {
            return Ok(unvalidated);
        }

        // A token that fails to decrypt or decode need not be client malfeasance: it may
        // have been minted by an incompatible endpoint, e.g. a different version or a
        // neighbor behind the same load balancer. Proceed as if there was no token.
        let Some(token) = Token::decode(&*self.key, token_bytes) else {
            return Ok(unvalidated);
        };

        match token.payload {
            TokenPayload::Retry {
                address,
                orig_dst_cid,
                retry_src_cid,
                issued,
            } => {
                // A bogus retry token is fatal: the client unambiguously echoed a Retry
                // we could not have sent.
                if address != remote_address {
                    return Err(InvalidRetryTokenError);
                }
                if issued + self.retry_lifetime < SystemTime::now() {
                    return Err(InvalidRetryTokenError);
                }

                Ok(IncomingToken {
                    retry_src_cid: Some(retry_src_cid),
                    orig_dst_cid,
                    validated: true,
                })
            }
            TokenPayload::Validation { ip, issued } => {
                if ip != remote_address.ip() {
                    return Ok(unvalidated);
                }
                if issued + self.validation_lifetime < SystemTime::now() {
                    return Ok(unvalidated);
                }

                Ok(IncomingToken {
                    retry_src_cid: None,
                    orig_dst_cid: header_dst_cid,
                    validated: true,
                })
            }
        }
    }
}

/// State for an incoming connection attempt determined by its token, or lack thereof
#[derive(Debug)]
pub struct IncomingToken {
    /// The CID the server chose when it sent a Retry, to be echoed in the transport
    /// parameters
    pub retry_src_cid: Option<ConnectionId>,
    /// The destination CID of the client's very first Initial
    pub orig_dst_cid: ConnectionId,
    /// Whether the client's address is proven, lifting the amplification limit
    pub validated: bool,
}

/// Error for a token being unambiguously from a Retry packet, and not valid
///
/// The connection cannot be established, and is refused with `INVALID_TOKEN`.
#[derive(Debug)]
pub struct InvalidRetryTokenError;

/// Retry or address-validation token
pub(crate) struct Token {
    /// Content that is encrypted from the client
    pub(crate) payload: TokenPayload,
    /// Randomly generated value, which must be unique, and is visible to the client
    nonce: u128,
}

impl Token {
    /// Construct with newly sampled randomness
    pub(crate) fn new(payload: TokenPayload, rng: &mut impl Rng) -> Self {
        Self {
            nonce: rng.gen(),
            payload,
        }
    }

    /// Encode and encrypt
    pub(crate) fn encode(&self, key: &dyn HandshakeTokenKey) -> Vec<u8> {
        let mut buf = Vec::new();

        match self.payload {
            TokenPayload::Retry {
                address,
                orig_dst_cid,
                retry_src_cid,
                issued,
            } => {
                buf.put_u8(TokenType::Retry as u8);
                encode_addr(&mut buf, address);
                orig_dst_cid.encode_long(&mut buf);
                retry_src_cid.encode_long(&mut buf);
                encode_unix_secs(&mut buf, issued);
            }
            TokenPayload::Validation { ip, issued } => {
                buf.put_u8(TokenType::Validation as u8);
                encode_ip(&mut buf, ip);
                encode_unix_secs(&mut buf, issued);
            }
        }

        let aead_key = key.aead_from_hkdf(&self.nonce.to_le_bytes());
        aead_key.seal(&mut buf, &[]).unwrap();
        buf.extend(&self.nonce.to_le_bytes());

        buf
    }

    /// Decrypt and decode
    pub(crate) fn decode(key: &dyn HandshakeTokenKey, raw_token_bytes: &[u8]) -> Option<Self> {
        let sealed_len = raw_token_bytes.len().checked_sub(size_of::<u128>())?;
        let (sealed_token, nonce_bytes) = raw_token_bytes.split_at(sealed_len);
        let nonce = u128::from_le_bytes(nonce_bytes.try_into().unwrap());

        let aead_key = key.aead_from_hkdf(nonce_bytes);
        let mut sealed_token = sealed_token.to_vec();
        let data = aead_key.open(&mut sealed_token, &[]).ok()?;

        let mut reader = &data[..];
        let payload = match TokenType::from_byte((&mut reader).get::<u8>().ok()?)? {
            TokenType::Retry => TokenPayload::Retry {
                address: decode_addr(&mut reader)?,
                orig_dst_cid: ConnectionId::decode_long(&mut reader)?,
                retry_src_cid: ConnectionId::decode_long(&mut reader)?,
                issued: decode_unix_secs(&mut reader)?,
            },
            TokenType::Validation => TokenPayload::Validation {
                ip: decode_ip(&mut reader)?,
                issued: decode_unix_secs(&mut reader)?,
            },
        };

        if !reader.is_empty() {
            // Consider extra bytes a decoding error (it may be from an incompatible endpoint)
            return None;
        }

        Some(Self { nonce, payload })
    }
}

/// Content of a [`Token`] that is encrypted from the client
pub(crate) enum TokenPayload {
    /// Token originating from a Retry packet
    Retry {
        /// The client's address
        address: SocketAddr,
        /// The destination connection ID set in the very first packet from the client
        orig_dst_cid: ConnectionId,
        /// The source connection ID the server chose for the Retry packet
        retry_src_cid: ConnectionId,
        /// The time at which this token was issued
        issued: SystemTime,
    },
    /// Token originating from a NEW_TOKEN frame
    Validation {
        /// The client's IP address (its port is likely to change between sessions)
        ip: IpAddr,
        /// The time at which this token was issued
        issued: SystemTime,
    },
}

/// Variant tag for a [`TokenPayload`]
#[derive(Copy, Clone)]
#[repr(u8)]
enum TokenType {
    Retry = 0,
    Validation = 1,
}

impl TokenType {
    fn from_byte(n: u8) -> Option<Self> {
        use TokenType::*;
        [Retry, Validation].into_iter().find(|ty| *ty as u8 == n)
    }
}

fn encode_addr(buf: &mut Vec<u8>, address: SocketAddr) {
    encode_ip(buf, address.ip());
    buf.put_u16(address.port());
}

fn decode_addr<B: Buf>(buf: &mut B) -> Option<SocketAddr> {
    let ip = decode_ip(buf)?;
    let port = buf.get().ok()?;
    Some(SocketAddr::new(ip, port))
}

fn encode_ip(buf: &mut Vec<u8>, ip: IpAddr) {
    match ip {
        IpAddr::V4(x) => {
            buf.put_u8(0);
            buf.put_slice(&x.octets());
        }
        IpAddr::V6(x) => {
            buf.put_u8(1);
            buf.put_slice(&x.octets());
        }
    }
}

fn decode_ip<B: Buf>(buf: &mut B) -> Option<IpAddr> {
    match buf.get::<u8>().ok()? {
        0 => buf.get().ok().map(IpAddr::V4),
        1 => buf.get().ok().map(IpAddr::V6),
        _ => None,
    }
}

fn encode_unix_secs(buf: &mut Vec<u8>, time: SystemTime) {
    buf.write::<u64>(
        time.duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    );
}

fn decode_unix_secs<B: Buf>(buf: &mut B) -> Option<SystemTime> {
    Some(UNIX_EPOCH + Duration::from_secs(buf.get::<u64>().ok()?))
}

/// Stateless reset token
///
/// Used for an endpoint to securely communicate that it has lost state for a connection.
#[derive(Debug, Copy, Clone, Hash)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl ResetToken {
    pub(crate) fn new(key: &dyn HmacKey, id: ConnectionId) -> Self {
        let mut signature = vec![0; key.signature_len()];
        key.sign(&id, &mut signature);
        let mut result = [0; RESET_TOKEN_SIZE];
        result.copy_from_slice(&signature[..RESET_TOKEN_SIZE]);
        result.into()
    }
}

impl PartialEq for ResetToken {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time to resist timing side channels on the reset path
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for ResetToken {}

impl Default for ResetToken {
    fn default() -> Self {
        Self([0; RESET_TOKEN_SIZE])
    }
}

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl std::ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "ring"))]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use rand::RngCore;
    use ring::hkdf;
    use std::net::Ipv6Addr;

    fn new_token_key() -> hkdf::Prk {
        let mut master_key = [0; 64];
        rand::thread_rng().fill_bytes(&mut master_key);
        hkdf::Salt::new(hkdf::HKDF_SHA256, &[]).extract(&master_key)
    }

    fn token_round_trip(payload: TokenPayload) -> TokenPayload {
        let rng = &mut rand::thread_rng();
        let token = Token::new(payload, rng);
        let prk = new_token_key();
        let encoded = token.encode(&prk);
        let decoded = Token::decode(&prk, &encoded).expect("token didn't decrypt / decode");
        assert_eq!(token.nonce, decoded.nonce);
        decoded.payload
    }

    #[test]
    fn retry_token_sanity() {
        let address_1 = SocketAddr::new("192.0.2.1".parse().unwrap(), 4242);
        let orig_dst_cid_1 = ConnectionId::new(&[1, 2, 3, 4]);
        let retry_src_cid_1 = ConnectionId::new(&[5, 6, 7, 8]);
        let issued_1 = UNIX_EPOCH + Duration::from_secs(42); // Fractional seconds would be lost
        let payload_1 = TokenPayload::Retry {
            address: address_1,
            orig_dst_cid: orig_dst_cid_1,
            retry_src_cid: retry_src_cid_1,
            issued: issued_1,
        };
        let TokenPayload::Retry {
            address: address_2,
            orig_dst_cid: orig_dst_cid_2,
            retry_src_cid: retry_src_cid_2,
            issued: issued_2,
        } = token_round_trip(payload_1)
        else {
            panic!("token decoded as wrong variant");
        };

        assert_eq!(address_1, address_2);
        assert_eq!(orig_dst_cid_1, orig_dst_cid_2);
        assert_eq!(retry_src_cid_1, retry_src_cid_2);
        assert_eq!(issued_1, issued_2);
    }

    #[test]
    fn validation_token_sanity() {
        let ip_1: IpAddr = "192.0.2.1".parse().unwrap();
        let issued_1 = UNIX_EPOCH + Duration::from_secs(42);

        let payload_1 = TokenPayload::Validation {
            ip: ip_1,
            issued: issued_1,
        };
        let TokenPayload::Validation {
            ip: ip_2,
            issued: issued_2,
        } = token_round_trip(payload_1)
        else {
            panic!("token decoded as wrong variant");
        };

        assert_eq!(ip_1, ip_2);
        assert_eq!(issued_1, issued_2);
    }

    #[test]
    fn validation_token_ipv6() {
        let ip: IpAddr = Ipv6Addr::LOCALHOST.into();
        let issued = UNIX_EPOCH + Duration::from_secs(42);
        match token_round_trip(TokenPayload::Validation { ip, issued }) {
            TokenPayload::Validation { ip: ip_2, .. } => assert_eq!(ip, ip_2),
            _ => panic!("token decoded as wrong variant"),
        }
    }

    #[test]
    fn invalid_token_returns_none() {
        let prk = new_token_key();
        let mut invalid_token = vec![0; 48];
        rand::thread_rng().fill_bytes(&mut invalid_token);
        assert!(Token::decode(&prk, &invalid_token).is_none());
    }

    #[test]
    fn tampered_token_returns_none() {
        let rng = &mut rand::thread_rng();
        let prk = new_token_key();
        let token = Token::new(
            TokenPayload::Validation {
                ip: "192.0.2.7".parse().unwrap(),
                issued: SystemTime::now(),
            },
            rng,
        );
        let mut encoded = token.encode(&prk);
        encoded[0] ^= 0x40;
        assert!(Token::decode(&prk, &encoded).is_none());
    }

    #[test]
    fn generator_round_trip() {
        let config = ServerConfig::default();
        let generator = TokenGenerator::new(&config);
        let addr: SocketAddr = "192.0.2.1:4242".parse().unwrap();
        let header_cid = ConnectionId::new(&[9; 8]);

        // NEW_TOKEN tokens bind the IP only
        let bytes = generator.validation_token(addr);
        let state = generator.validate(&bytes, header_cid, addr).unwrap();
        assert!(state.validated);
        assert!(state.retry_src_cid.is_none());
        assert_eq!(state.orig_dst_cid, header_cid);

        let other_port: SocketAddr = "192.0.2.1:9999".parse().unwrap();
        assert!(generator.validate(&bytes, header_cid, other_port).unwrap().validated);
        let other_ip: SocketAddr = "192.0.2.99:4242".parse().unwrap();
        assert!(!generator.validate(&bytes, header_cid, other_ip).unwrap().validated);

        // Retry tokens carry both connection IDs and demand an exact address
        let orig_dst_cid = ConnectionId::new(&[1, 2, 3, 4]);
        let retry_src_cid = ConnectionId::new(&[5, 6, 7, 8]);
        let bytes = generator.retry_token(addr, orig_dst_cid, retry_src_cid);
        let state = generator.validate(&bytes, retry_src_cid, addr).unwrap();
        assert!(state.validated);
        assert_eq!(state.retry_src_cid, Some(retry_src_cid));
        assert_eq!(state.orig_dst_cid, orig_dst_cid);
        assert!(generator.validate(&bytes, retry_src_cid, other_ip).is_err());
    }

    #[test]
    fn empty_token_is_merely_unvalidated() {
        let config = ServerConfig::default();
        let generator = TokenGenerator::new(&config);
        let addr: SocketAddr = "192.0.2.1:4242".parse().unwrap();
        let state = generator
            .validate(&[], ConnectionId::new(&[9; 8]), addr)
            .unwrap();
        assert!(!state.validated);
    }

    #[test]
    fn expired_tokens() {
        let rng = &mut rand::thread_rng();
        let config = ServerConfig::default();
        let generator = TokenGenerator::new(&config);
        let addr: SocketAddr = "192.0.2.1:4242".parse().unwrap();
        let cid = ConnectionId::new(&[9; 8]);

        // A stale retry token is fatal
        let token = Token::new(
            TokenPayload::Retry {
                address: addr,
                orig_dst_cid: cid,
                retry_src_cid: cid,
                issued: UNIX_EPOCH,
            },
            rng,
        );
        assert!(generator
            .validate(&token.encode(&*config.token_key), cid, addr)
            .is_err());

        // A stale NEW_TOKEN token just fails to validate the address
        let token = Token::new(
            TokenPayload::Validation {
                ip: addr.ip(),
                issued: UNIX_EPOCH,
            },
            rng,
        );
        let state = generator
            .validate(&token.encode(&*config.token_key), cid, addr)
            .unwrap();
        assert!(!state.validated);
    }

    #[test]
    fn reset_tokens_are_deterministic_and_distinct() {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &[0x17; 64]);
        let a = ResetToken::new(&key, ConnectionId::new(&[1, 2, 3, 4]));
        let b = ResetToken::new(&key, ConnectionId::new(&[1, 2, 3, 4]));
        let c = ResetToken::new(&key, ConnectionId::new(&[4, 3, 2, 1]));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
