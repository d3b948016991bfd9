// Session state machine: handshake, authentication, ready flush.
// Numan Thabit 2025

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::{DeviceConfig, DeviceIdentity},
    crypto::{
        aead::SessionKey,
        handshake::{HandshakeError, Keypair},
        nonce::{NonceError, NonceSeq},
    },
    wire::{self, Cmd, WireError},
};

/// AUTH_ACK payload status accepted as success.
pub const AUTH_OK: u8 = 0x00;

/// Protocol phase of the current server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No connection, or torn down after an error.
    Disconnected,
    /// HANDSHAKE_INIT emitted, waiting for the peer key.
    HandshakeSent,
    /// Shared key computed, AUTH_VERIFY or DEVICE_REGISTER emitted.
    AuthSent,
    /// Authenticated; queued reports may flush.
    Ready,
}

/// Session-level error. Frame and crypto failures all tear the session
/// down; the connection owner closes the socket on any of these.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Frame parse, CRC, or AEAD failure.
    #[error("frame error: {0}")]
    Wire(#[from] WireError),

    /// Key agreement failure.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Nonce space exhausted; the session must end.
    #[error("nonce error: {0}")]
    Nonce(#[from] NonceError),

    /// Command not valid for the current state.
    #[error("unexpected command {cmd_id:#06x} in state {state:?}")]
    UnexpectedCmd { cmd_id: u16, state: State },

    /// Sealed frame arrived before key agreement completed.
    #[error("sealed frame before key agreement")]
    NoSessionKey,

    /// Payload shorter than the command requires.
    #[error("payload too short for command {cmd_id:#06x}")]
    ShortPayload { cmd_id: u16 },

    /// Transmit requested outside the Ready state.
    #[error("session not ready to transmit")]
    NotReady,
}

/// Caller-visible outcome of consuming one inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Frame consumed, nothing further to do.
    None,
    /// Authentication accepted; a token is present when the server issued
    /// one for the caller to persist.
    Ready { token: Option<String> },
    /// Authentication rejected: clear the queue, close the socket, and
    /// stop retrying until operator intervention.
    AuthRejected { status: u8 },
    /// Server echoed an uplink report as an application-level ack. The
    /// matching entry already popped when it was written.
    ReportAcked,
    /// Informational configuration push from the server.
    ConfigPushed(Vec<u8>),
}

/// One authenticated server connection from handshake to close.
///
/// The session owns the key material and the nonce counter; nothing else
/// mutates them. It is sans-IO: inbound frames come in as byte slices and
/// outbound frames leave as byte vectors for the connection owner to write.
#[derive(Debug)]
pub struct Session {
    state: State,
    keypair: Option<Keypair>,
    session_key: Option<SessionKey>,
    key_id: u32,
    nonce: NonceSeq,
}

impl Session {
    /// Creates a disconnected session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Disconnected,
            keypair: None,
            session_key: None,
            key_id: 0,
            nonce: NonceSeq::new(),
        }
    }

    /// Current protocol phase.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns `true` when queued reports may flush.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// Server-assigned session identifier, zero before auth.
    #[must_use]
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Begins a fresh handshake right after the TCP connect, returning the
    /// single plaintext HANDSHAKE_INIT frame to write.
    pub fn start(&mut self) -> Result<Vec<u8>, SessionError> {
        self.reset();
        let keypair = Keypair::generate();
        let nonce = self.nonce.next()?;
        let frame = wire::encode_plain(
            Cmd::HandshakeInit.into(),
            0,
            nonce,
            &keypair.public_bytes(),
        )?;
        self.keypair = Some(keypair);
        self.state = State::HandshakeSent;
        info!("session state: handshake_sent");
        Ok(frame)
    }

    /// Consumes one complete inbound frame.
    ///
    /// Returns the event for the caller plus an optional reply frame to
    /// write. Any `Err` means the connection owner must close the socket
    /// and reset the session.
    pub fn handle_frame(
        &mut self,
        bytes: &[u8],
        config: &DeviceConfig,
        identity: &DeviceIdentity,
    ) -> Result<(SessionEvent, Option<Vec<u8>>), SessionError> {
        let parts = wire::parse_frame(bytes)?;
        let header = parts.header.clone();

        let payload = if header.is_encrypted() {
            let key = self.session_key.as_ref().ok_or(SessionError::NoSessionKey)?;
            parts.decrypt_payload(key)?
        } else {
            parts.payload.to_vec()
        };

        match (Cmd::from_raw(header.cmd_id), self.state) {
            (Some(Cmd::HandshakeResp), State::HandshakeSent) => {
                let keypair = self.keypair.take().ok_or(SessionError::UnexpectedCmd {
                    cmd_id: header.cmd_id,
                    state: self.state,
                })?;
                let key = keypair.diffie_hellman(&payload)?;
                self.session_key = Some(key);
                self.key_id = header.key_id;
                debug!(key_id = self.key_id, "shared key computed");

                let reply = self.build_auth_frame(config, identity)?;
                self.state = State::AuthSent;
                info!("session state: auth_sent");
                Ok((SessionEvent::None, Some(reply)))
            }

            (Some(Cmd::AuthAck), State::AuthSent) => {
                let status = *payload.first().ok_or(SessionError::ShortPayload {
                    cmd_id: header.cmd_id,
                })?;
                if status == AUTH_OK {
                    self.state = State::Ready;
                    info!("session state: ready");
                    let token = parse_token(&payload[1..]);
                    Ok((SessionEvent::Ready { token }, None))
                } else {
                    warn!(status, "authentication rejected");
                    self.reset();
                    Ok((SessionEvent::AuthRejected { status }, None))
                }
            }

            // Late duplicate of the ack we already acted on.
            (Some(Cmd::AuthAck), State::Ready) => {
                debug!("ignoring duplicate AUTH_ACK");
                Ok((SessionEvent::None, None))
            }

            // Ready-state report echo is the application-level ack.
            (Some(Cmd::MetricsReport), State::Ready) => Ok((SessionEvent::ReportAcked, None)),

            (Some(Cmd::Heartbeat), State::Ready) => Ok((SessionEvent::None, None)),

            (Some(Cmd::ConfigPush), _) => Ok((SessionEvent::ConfigPushed(payload), None)),

            _ => Err(SessionError::UnexpectedCmd {
                cmd_id: header.cmd_id,
                state: self.state,
            }),
        }
    }

    /// Seals one queued uplink payload into an outbound frame.
    pub fn seal_report(&mut self, cmd_id: u16, payload: &[u8]) -> Result<Vec<u8>, SessionError> {
        if self.state != State::Ready {
            return Err(SessionError::NotReady);
        }
        let key = self.session_key.as_ref().ok_or(SessionError::NoSessionKey)?;
        let nonce = self.nonce.next()?;
        Ok(wire::encode_sealed(cmd_id, self.key_id, nonce, key, payload)?)
    }

    /// Tears the session down to Disconnected, destroying key material and
    /// the nonce counter.
    pub fn reset(&mut self) {
        if self.state != State::Disconnected {
            debug!(state = ?self.state, "session reset");
        }
        self.state = State::Disconnected;
        self.keypair = None;
        self.session_key = None;
        self.key_id = 0;
        self.nonce = NonceSeq::new();
    }

    fn build_auth_frame(
        &mut self,
        config: &DeviceConfig,
        identity: &DeviceIdentity,
    ) -> Result<Vec<u8>, SessionError> {
        let key = self.session_key.as_ref().ok_or(SessionError::NoSessionKey)?;
        let nonce = self.nonce.next()?;
        match config.token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => Ok(wire::encode_sealed(
                Cmd::AuthVerify.into(),
                self.key_id,
                nonce,
                key,
                token.as_bytes(),
            )?),
            None => Ok(wire::encode_sealed(
                Cmd::DeviceRegister.into(),
                self.key_id,
                nonce,
                key,
                &identity.registration_payload(),
            )?),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_token(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    match String::from_utf8(bytes.to_vec()) {
        Ok(token) => Some(token),
        Err(_) => {
            warn!("discarding non-UTF-8 token from AUTH_ACK");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::handshake::PUBLIC_KEY_LEN,
        wire::{encode_plain, encode_sealed, parse_frame, NONCE_LEN},
    };

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            model: "GW-1".into(),
            serial: "SN123456".into(),
            mac: "AA:BB:CC:DD:EE:FF".into(),
            hw_rev: "1.0".into(),
            fw_rev: "1.0".into(),
            device_class: "1".into(),
        }
    }

    fn unregistered_config() -> DeviceConfig {
        DeviceConfig {
            ssid: "lab".into(),
            pass: "secret".into(),
            srv_ip: "10.0.0.2".into(),
            srv_port: 9090,
            token: None,
        }
    }

    /// Drives a device session through the server half of the handshake and
    /// returns the negotiated key plus the assigned key id.
    fn complete_handshake(
        session: &mut Session,
        config: &DeviceConfig,
        key_id: u32,
    ) -> SessionKey {
        let init = session.start().expect("handshake frame");
        let init_parts = parse_frame(&init).expect("valid init");
        assert_eq!(init_parts.header.cmd_id, u16::from(Cmd::HandshakeInit));

        let server = Keypair::generate();
        let server_pub = server.public_bytes();
        let device_pub: [u8; PUBLIC_KEY_LEN] = init_parts.payload.try_into().unwrap();
        let shared = server.diffie_hellman(&device_pub).expect("server dh");

        let resp = encode_plain(Cmd::HandshakeResp.into(), key_id, [1u8; NONCE_LEN], &server_pub)
            .unwrap();
        let (event, reply) = session
            .handle_frame(&resp, config, &identity())
            .expect("handshake resp");
        assert_eq!(event, SessionEvent::None);
        assert!(reply.is_some(), "auth frame must follow the peer key");
        assert_eq!(session.state(), State::AuthSent);

        shared
    }

    fn auth_ack(key: &SessionKey, key_id: u32, payload: &[u8]) -> Vec<u8> {
        encode_sealed(Cmd::AuthAck.into(), key_id, [9u8; NONCE_LEN], key, payload).unwrap()
    }

    #[test]
    fn handshake_emits_one_plain_frame() {
        let mut session = Session::new();
        let frame = session.start().unwrap();

        let parts = parse_frame(&frame).unwrap();
        assert_eq!(parts.header.cmd_id, u16::from(Cmd::HandshakeInit));
        assert_eq!(parts.header.flags, 0);
        assert_eq!(parts.header.length as usize, PUBLIC_KEY_LEN);
        assert_eq!(session.state(), State::HandshakeSent);
    }

    #[test]
    fn scripted_sequence_reaches_ready() {
        let mut session = Session::new();
        let config = unregistered_config();
        let key = complete_handshake(&mut session, &config, 42);

        let mut token_payload = vec![AUTH_OK];
        token_payload.extend_from_slice(b"tok-42");
        let (event, reply) = session
            .handle_frame(&auth_ack(&key, 42, &token_payload), &config, &identity())
            .unwrap();

        assert_eq!(
            event,
            SessionEvent::Ready {
                token: Some("tok-42".into())
            }
        );
        assert!(reply.is_none());
        assert!(session.is_ready());
        assert_eq!(session.key_id(), 42);
    }

    #[test]
    fn unregistered_device_sends_registration_tuple() {
        let mut session = Session::new();
        let config = unregistered_config();

        let init = session.start().unwrap();
        let init_parts = parse_frame(&init).unwrap();
        let server = Keypair::generate();
        let server_public = server.public_bytes();
        let device_pub: [u8; PUBLIC_KEY_LEN] = init_parts.payload.try_into().unwrap();
        let shared = server.diffie_hellman(&device_pub).unwrap();

        let resp = encode_plain(Cmd::HandshakeResp.into(), 7, [2u8; NONCE_LEN], &server_public)
            .unwrap();
        let (_, reply) = session.handle_frame(&resp, &config, &identity()).unwrap();
        let reply = reply.unwrap();
        let reply_parts = parse_frame(&reply).unwrap();
        assert_eq!(reply_parts.header.cmd_id, u16::from(Cmd::DeviceRegister));
        let tuple = reply_parts.decrypt_payload(&shared).unwrap();
        assert_eq!(tuple.split(|&b| b == 0x1E).count(), 6);
    }

    #[test]
    fn registered_device_sends_token_verify() {
        let mut session = Session::new();
        let mut config = unregistered_config();
        config.token = Some("stored-token".into());

        let init = session.start().unwrap();
        let init_parts = parse_frame(&init).unwrap();
        let server = Keypair::generate();
        let server_public = server.public_bytes();
        let device_pub: [u8; PUBLIC_KEY_LEN] = init_parts.payload.try_into().unwrap();
        let shared = server.diffie_hellman(&device_pub).unwrap();

        let resp = encode_plain(Cmd::HandshakeResp.into(), 3, [3u8; NONCE_LEN], &server_public)
            .unwrap();
        let (_, reply) = session.handle_frame(&resp, &config, &identity()).unwrap();
        let reply = reply.unwrap();
        let reply_parts = parse_frame(&reply).unwrap();
        assert_eq!(reply_parts.header.cmd_id, u16::from(Cmd::AuthVerify));
        assert_eq!(
            reply_parts.decrypt_payload(&shared).unwrap(),
            b"stored-token"
        );
    }

    #[test]
    fn auth_reject_tears_the_session_down() {
        let mut session = Session::new();
        let config = unregistered_config();
        let key = complete_handshake(&mut session, &config, 5);

        let (event, reply) = session
            .handle_frame(&auth_ack(&key, 5, &[0x01]), &config, &identity())
            .unwrap();
        assert_eq!(event, SessionEvent::AuthRejected { status: 0x01 });
        assert!(reply.is_none());
        assert_eq!(session.state(), State::Disconnected);
        assert_eq!(session.key_id(), 0);
    }

    #[test]
    fn duplicate_auth_ack_is_ignored() {
        let mut session = Session::new();
        let config = unregistered_config();
        let key = complete_handshake(&mut session, &config, 8);

        session
            .handle_frame(&auth_ack(&key, 8, &[AUTH_OK]), &config, &identity())
            .unwrap();
        let (event, _) = session
            .handle_frame(&auth_ack(&key, 8, &[AUTH_OK]), &config, &identity())
            .unwrap();
        assert_eq!(event, SessionEvent::None);
        assert!(session.is_ready());
    }

    #[test]
    fn ready_metrics_report_counts_as_ack() {
        let mut session = Session::new();
        let config = unregistered_config();
        let key = complete_handshake(&mut session, &config, 11);
        session
            .handle_frame(&auth_ack(&key, 11, &[AUTH_OK]), &config, &identity())
            .unwrap();

        let echo =
            encode_sealed(Cmd::MetricsReport.into(), 11, [7u8; NONCE_LEN], &key, b"").unwrap();
        let (event, _) = session.handle_frame(&echo, &config, &identity()).unwrap();
        assert_eq!(event, SessionEvent::ReportAcked);
    }

    #[test]
    fn zero_peer_key_fails_key_agreement() {
        let mut session = Session::new();
        let config = unregistered_config();
        session.start().unwrap();

        let resp = encode_plain(
            Cmd::HandshakeResp.into(),
            1,
            [4u8; NONCE_LEN],
            &[0u8; PUBLIC_KEY_LEN],
        )
        .unwrap();
        let err = session.handle_frame(&resp, &config, &identity()).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handshake(HandshakeError::NonContributory)
        ));
    }

    #[test]
    fn sealed_report_nonces_are_strictly_increasing() {
        let mut session = Session::new();
        let config = unregistered_config();
        let key = complete_handshake(&mut session, &config, 9);
        session
            .handle_frame(&auth_ack(&key, 9, &[AUTH_OK]), &config, &identity())
            .unwrap();

        let mut previous = 0u64;
        for round in 0..5u8 {
            let frame = session.seal_report(Cmd::MetricsReport.into(), &[round]).unwrap();
            let parts = parse_frame(&frame).unwrap();
            let tail = u64::from_le_bytes(parts.header.nonce[4..].try_into().unwrap());
            assert!(tail > previous, "round {round}");
            previous = tail;

            assert_eq!(parts.decrypt_payload(&key).unwrap(), &[round]);
        }
    }

    #[test]
    fn seal_outside_ready_is_refused() {
        let mut session = Session::new();
        assert!(matches!(
            session.seal_report(Cmd::MetricsReport.into(), b"x"),
            Err(SessionError::NotReady)
        ));
    }

    #[test]
    fn unexpected_command_is_a_protocol_violation() {
        let mut session = Session::new();
        let config = unregistered_config();
        session.start().unwrap();

        let stray = encode_plain(Cmd::AuthAck.into(), 0, [5u8; NONCE_LEN], &[AUTH_OK]).unwrap();
        let err = session.handle_frame(&stray, &config, &identity()).unwrap_err();
        assert!(matches!(err, SessionError::UnexpectedCmd { .. }));
    }
}
