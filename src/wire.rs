// Goster wire format: fixed 32-byte header, payload, 16-byte trailer.
// Numan Thabit 2025

use crc::{Crc, CRC_16_MODBUS, CRC_32_ISO_HDLC};
use thiserror::Error;

use crate::crypto::aead::{self, AeadError, SessionKey};

/// Protocol magic, `"WY"` little-endian.
pub const GOSTER_MAGIC: u16 = 0x5759;

/// Current protocol version.
pub const GOSTER_VERSION: u8 = 0x01;

/// Length of the fixed header in bytes.
pub const HDR_LEN: usize = 32;

/// Length of the frame trailer (GCM tag, or CRC-32 plus zero padding).
pub const TRAILER_LEN: usize = 16;

/// Header prefix covered by the header CRC and used as AEAD associated data.
pub const AAD_LEN: usize = 28;

/// AES-GCM nonce length carried in the header.
pub const NONCE_LEN: usize = 12;

/// Hard cap on the declared payload length, checked before buffering.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Bit-flags carried in the header.
pub mod flags {
    /// Frame acknowledges a previous request.
    pub const ACK: u8 = 0x01;
    /// Payload is AES-GCM sealed; trailer carries the tag.
    pub const ENCRYPTED: u8 = 0x02;
    /// Reserved for payload compression.
    pub const COMPRESSED: u8 = 0x04;
}

/// Command identifiers understood by the gateway.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    HandshakeInit = 0x0001,
    HandshakeResp = 0x0002,
    AuthVerify = 0x0003,
    AuthAck = 0x0004,
    DeviceRegister = 0x0005,
    MetricsReport = 0x0101,
    LogReport = 0x0102,
    EventReport = 0x0103,
    Heartbeat = 0x0104,
    ConfigPush = 0x0201,
    TimeSync = 0x0204,
}

impl Cmd {
    /// Returns the enum variant for a raw command id when known.
    pub fn from_raw(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Cmd::HandshakeInit),
            0x0002 => Some(Cmd::HandshakeResp),
            0x0003 => Some(Cmd::AuthVerify),
            0x0004 => Some(Cmd::AuthAck),
            0x0005 => Some(Cmd::DeviceRegister),
            0x0101 => Some(Cmd::MetricsReport),
            0x0102 => Some(Cmd::LogReport),
            0x0103 => Some(Cmd::EventReport),
            0x0104 => Some(Cmd::Heartbeat),
            0x0201 => Some(Cmd::ConfigPush),
            0x0204 => Some(Cmd::TimeSync),
            _ => None,
        }
    }

    /// Returns `true` for uplink report commands the serial bridge forwards verbatim.
    pub fn is_uplink_report(value: u16) -> bool {
        matches!(
            Cmd::from_raw(value),
            Some(Cmd::MetricsReport) | Some(Cmd::LogReport) | Some(Cmd::EventReport)
        )
    }
}

impl From<Cmd> for u16 {
    fn from(cmd: Cmd) -> Self {
        cmd as u16
    }
}

/// Wire-level error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Magic bytes did not match [`GOSTER_MAGIC`].
    #[error("bad magic {0:#06x}")]
    BadMagic(u16),

    /// CRC-16/MODBUS over the 28-byte header prefix disagreed with the stored value.
    #[error("header crc mismatch: expected {expected:#06x}, got {actual:#06x}")]
    BadHeaderCrc { expected: u16, actual: u16 },

    /// CRC-32 over header and payload disagreed with the plaintext trailer.
    #[error("body crc mismatch: expected {expected:#010x}, got {actual:#010x}")]
    BadBodyCrc { expected: u32, actual: u32 },

    /// Outer buffer size disagrees with the declared payload length.
    #[error("length mismatch: header declares {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Buffer shorter than a complete header.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Declared payload length exceeds [`MAX_PAYLOAD_LEN`].
    #[error("declared payload length {0} exceeds limit")]
    PayloadTooLarge(usize),

    /// AEAD failure during seal or open.
    #[error("aead error: {0}")]
    Aead(#[from] AeadError),
}

/// Fixed header as carried on the wire. All integers little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GosterHdr {
    /// Protocol version.
    pub version: u8,
    /// Bit-flags, see [`flags`].
    pub flags: u8,
    /// Status code; zero on requests.
    pub status: u16,
    /// Command identifier.
    pub cmd_id: u16,
    /// Session identifier assigned by the server, zero before auth.
    pub key_id: u32,
    /// Payload byte count.
    pub length: u32,
    /// AES-GCM IV for sealed frames.
    pub nonce: [u8; NONCE_LEN],
}

impl GosterHdr {
    /// Creates a request header with zero status and no flags set.
    pub fn request(cmd_id: u16, key_id: u32, length: u32, nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            version: GOSTER_VERSION,
            flags: 0,
            status: 0,
            cmd_id,
            key_id,
            length,
            nonce,
        }
    }

    /// Returns `true` when the ENCRYPTED flag is set.
    pub fn is_encrypted(&self) -> bool {
        self.flags & flags::ENCRYPTED != 0
    }

    /// Serialises the 28-byte prefix the header CRC covers and the AEAD authenticates.
    pub fn aad(&self) -> [u8; AAD_LEN] {
        let mut buf = [0u8; AAD_LEN];
        buf[0..2].copy_from_slice(&GOSTER_MAGIC.to_le_bytes());
        buf[2] = self.version;
        buf[3] = self.flags;
        buf[4..6].copy_from_slice(&self.status.to_le_bytes());
        buf[6..8].copy_from_slice(&self.cmd_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.key_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..28].copy_from_slice(&self.nonce);
        buf
    }

    /// Encodes the header into a byte array, computing the header CRC.
    pub fn encode(&self) -> [u8; HDR_LEN] {
        let mut buf = [0u8; HDR_LEN];
        buf[..AAD_LEN].copy_from_slice(&self.aad());
        let crc = CRC16.checksum(&buf[..AAD_LEN]);
        buf[28..30].copy_from_slice(&crc.to_le_bytes());
        // bytes 30..32 are zero padding
        buf
    }

    /// Parses a header, validating magic and header CRC.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HDR_LEN {
            return Err(WireError::BufferTooShort {
                expected: HDR_LEN,
                actual: bytes.len(),
            });
        }

        let magic = u16::from_le_bytes(bytes[0..2].try_into().unwrap());
        if magic != GOSTER_MAGIC {
            return Err(WireError::BadMagic(magic));
        }

        let stored = u16::from_le_bytes(bytes[28..30].try_into().unwrap());
        let computed = CRC16.checksum(&bytes[..AAD_LEN]);
        if stored != computed {
            return Err(WireError::BadHeaderCrc {
                expected: stored,
                actual: computed,
            });
        }

        let length = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        if length as usize > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge(length as usize));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[16..28]);

        Ok(Self {
            version: bytes[2],
            flags: bytes[3],
            status: u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
            cmd_id: u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
            key_id: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            length,
            nonce,
        })
    }
}

/// Parsed frame components. The payload is ciphertext for sealed frames.
#[derive(Debug, Clone)]
pub struct FrameParts<'a> {
    /// Validated header.
    pub header: GosterHdr,
    /// Payload slice, `header.length` bytes.
    pub payload: &'a [u8],
    /// Trailing 16 bytes: GCM tag or CRC-32 plus padding.
    pub trailer: &'a [u8],
}

impl FrameParts<'_> {
    /// Opens the sealed payload using the provided session key.
    pub fn decrypt_payload(&self, key: &SessionKey) -> Result<Vec<u8>, WireError> {
        let aad = self.header.aad();
        let mut ciphertext = Vec::with_capacity(self.payload.len() + aead::TAG_LEN);
        ciphertext.extend_from_slice(self.payload);
        ciphertext.extend_from_slice(self.trailer);
        Ok(aead::open(key, &self.header.nonce, &aad, &ciphertext)?)
    }
}

/// Parses and validates a complete frame buffer.
///
/// Plaintext frames are checked against their CRC-32 trailer; sealed frames
/// authenticate later in [`FrameParts::decrypt_payload`].
pub fn parse_frame(bytes: &[u8]) -> Result<FrameParts<'_>, WireError> {
    let header = GosterHdr::parse(bytes)?;
    let declared = header.length as usize;
    let expected = HDR_LEN + declared + TRAILER_LEN;
    if bytes.len() != expected {
        return Err(WireError::LengthMismatch {
            declared,
            actual: bytes.len().saturating_sub(HDR_LEN + TRAILER_LEN),
        });
    }

    let payload = &bytes[HDR_LEN..HDR_LEN + declared];
    let trailer = &bytes[HDR_LEN + declared..];

    if !header.is_encrypted() {
        let stored = u32::from_le_bytes(trailer[0..4].try_into().unwrap());
        let computed = CRC32.checksum(&bytes[..HDR_LEN + declared]);
        // The 12 padding bytes after the CRC must be zero; a corrupted
        // trailer is a body-integrity failure either way.
        if stored != computed || trailer[4..].iter().any(|&b| b != 0) {
            return Err(WireError::BadBodyCrc {
                expected: stored,
                actual: computed,
            });
        }
    }

    Ok(FrameParts {
        header,
        payload,
        trailer,
    })
}

/// Encodes a plaintext frame: header, payload, CRC-32 trailer.
pub fn encode_plain(
    cmd_id: u16,
    key_id: u32,
    nonce: [u8; NONCE_LEN],
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let header = GosterHdr::request(cmd_id, key_id, payload.len() as u32, nonce);
    let mut buf = Vec::with_capacity(HDR_LEN + payload.len() + TRAILER_LEN);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);

    let crc = CRC32.checksum(&buf);
    let mut trailer = [0u8; TRAILER_LEN];
    trailer[0..4].copy_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&trailer);
    Ok(buf)
}

/// Encodes a sealed frame: header, ciphertext, GCM tag trailer.
///
/// The 28-byte header prefix is the associated data, so header tampering
/// fails authentication on the receiving side.
pub fn encode_sealed(
    cmd_id: u16,
    key_id: u32,
    nonce: [u8; NONCE_LEN],
    key: &SessionKey,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let mut header = GosterHdr::request(cmd_id, key_id, payload.len() as u32, nonce);
    header.flags |= flags::ENCRYPTED;

    let aad = header.aad();
    let sealed = aead::seal(key, &nonce, &aad, payload)?;

    let mut buf = Vec::with_capacity(HDR_LEN + sealed.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&sealed);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn crc32_check_vector() {
        assert_eq!(CRC32.checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn header_round_trip() {
        let hdr = GosterHdr::request(Cmd::HandshakeInit.into(), 0, 32, [0u8; NONCE_LEN]);
        let bytes = hdr.encode();
        let parsed = GosterHdr::parse(&bytes).unwrap();
        assert_eq!(hdr, parsed);
    }

    #[test]
    fn header_crc_is_stable_for_fixed_fields() {
        // Interop reference header: all-zero nonce, length 32.
        let hdr = GosterHdr::request(0x0001, 0, 32, [0u8; NONCE_LEN]);
        let first = hdr.encode();
        let second = hdr.encode();
        assert_eq!(first, second);
        let crc = u16::from_le_bytes(first[28..30].try_into().unwrap());
        assert_eq!(crc, CRC16.checksum(&first[..AAD_LEN]));
    }

    #[test]
    fn plain_frame_round_trip() {
        let payload = b"telemetry burst";
        let frame = encode_plain(Cmd::MetricsReport.into(), 7, [3u8; NONCE_LEN], payload).unwrap();
        assert_eq!(frame.len(), HDR_LEN + payload.len() + TRAILER_LEN);

        let parts = parse_frame(&frame).unwrap();
        assert_eq!(parts.header.cmd_id, u16::from(Cmd::MetricsReport));
        assert_eq!(parts.header.key_id, 7);
        assert_eq!(parts.payload, payload);
        assert_eq!(&parts.trailer[4..], &[0u8; 12]);
    }

    #[test]
    fn sealed_frame_round_trip() {
        let key = SessionKey::from_bytes([0x42; 32]);
        let payload = b"sealed telemetry";
        let frame =
            encode_sealed(Cmd::MetricsReport.into(), 9, [5u8; NONCE_LEN], &key, payload).unwrap();

        let parts = parse_frame(&frame).unwrap();
        assert!(parts.header.is_encrypted());
        let opened = parts.decrypt_payload(&key).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut frame = encode_plain(0x0001, 0, [0u8; NONCE_LEN], b"x").unwrap();
        frame[0] = 0xAA;
        assert!(matches!(parse_frame(&frame), Err(WireError::BadMagic(_))));
    }

    #[test]
    fn rejects_truncated_frame() {
        let frame = encode_plain(0x0001, 0, [0u8; NONCE_LEN], b"payload").unwrap();
        let err = parse_frame(&frame[..frame.len() - 1]).unwrap_err();
        assert!(matches!(err, WireError::LengthMismatch { .. }));
    }

    #[test]
    fn rejects_forged_length_field() {
        let mut frame = encode_plain(0x0001, 0, [0u8; NONCE_LEN], b"p").unwrap();
        frame[12..16].copy_from_slice(&(2 * 1024 * 1024u32).to_le_bytes());
        // The splice invalidates the header CRC, so a forged length cannot
        // ride an otherwise valid header.
        assert!(matches!(
            parse_frame(&frame),
            Err(WireError::BadHeaderCrc { .. })
        ));
    }

    proptest! {
        #[test]
        fn plain_round_trip_any_payload(payload in prop::collection::vec(any::<u8>(), 0..1024)) {
            let frame = encode_plain(Cmd::MetricsReport.into(), 1, [7u8; NONCE_LEN], &payload).unwrap();
            let parts = parse_frame(&frame).unwrap();
            prop_assert_eq!(parts.payload, &payload[..]);
        }

        #[test]
        fn single_bit_flip_is_rejected(
            payload in prop::collection::vec(any::<u8>(), 0..256),
            bit in any::<usize>(),
        ) {
            let frame = encode_plain(Cmd::MetricsReport.into(), 1, [7u8; NONCE_LEN], &payload).unwrap();
            let bit = bit % (frame.len() * 8);
            let mut corrupted = frame.clone();
            corrupted[bit / 8] ^= 1 << (bit % 8);

            let err = parse_frame(&corrupted).unwrap_err();
            let is_expected = matches!(
                err,
                WireError::BadMagic(_)
                    | WireError::BadHeaderCrc { .. }
                    | WireError::BadBodyCrc { .. }
                    | WireError::LengthMismatch { .. }
                    | WireError::PayloadTooLarge(_)
            );
            prop_assert!(is_expected, "unexpected error variant: {:?}", err);
        }
    }
}
