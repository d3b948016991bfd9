// Serial-side frame validator and COBS envelope codec.
// Numan Thabit 2025

use thiserror::Error;
use tracing::{debug, warn};

use crate::wire::{self, WireError, HDR_LEN, TRAILER_LEN};

/// Delimiter terminating every COBS-encoded serial packet.
pub const COBS_DELIMITER: u8 = 0x00;

/// Raw byte emitted on the serial line when no valid time is available.
pub const NOT_READY_BYTE: u8 = 0x52; // 'R'

/// Smallest valid decoded serial frame: header plus trailer, empty payload.
pub const MIN_SERIAL_FRAME: usize = HDR_LEN + TRAILER_LEN;

/// Cap on accumulated encoded bytes between delimiters.
pub const MAX_ENCODED_FRAME: usize = 2048;

/// COBS codec error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CobsError {
    /// A zero byte appeared inside an encoded region.
    #[error("unexpected zero byte inside encoded data")]
    UnexpectedZero,
    /// A block header pointed past the end of the input.
    #[error("encoded data ended mid-block")]
    Truncated,
}

/// Serial bridge error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SerialError {
    /// Decoded buffer smaller than header plus trailer.
    #[error("serial frame too short: {0} bytes")]
    FrameTooShort(usize),
    /// The local link carries plaintext only.
    #[error("encrypted frame on the serial link")]
    EncryptedFrame,
    /// COBS decode failure.
    #[error("cobs error: {0}")]
    Cobs(#[from] CobsError),
    /// Frame-level validation failure.
    #[error("frame error: {0}")]
    Wire(#[from] WireError),
}

/// Encodes `input` with COBS. The trailing delimiter is not included.
pub fn cobs_encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + 1 + input.len() / 254);
    let mut code_index = out.len();
    out.push(0);
    let mut code = 1u8;

    for &byte in input {
        if byte == 0 {
            out[code_index] = code;
            code_index = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(byte);
            code += 1;
            if code == 0xFF {
                out[code_index] = code;
                code_index = out.len();
                out.push(0);
                code = 1;
            }
        }
    }

    out[code_index] = code;
    out
}

/// Decodes a COBS region (delimiter already stripped). Empty input decodes
/// to an empty buffer, the wake sentinel.
pub fn cobs_decode(input: &[u8]) -> Result<Vec<u8>, CobsError> {
    let mut out = Vec::with_capacity(input.len());
    let mut index = 0;

    while index < input.len() {
        let code = input[index];
        if code == 0 {
            return Err(CobsError::UnexpectedZero);
        }
        index += 1;

        let block_end = index + (code as usize - 1);
        if block_end > input.len() {
            return Err(CobsError::Truncated);
        }
        out.extend_from_slice(&input[index..block_end]);
        index = block_end;

        if code < 0xFF && index < input.len() {
            out.push(0);
        }
    }

    Ok(out)
}

/// Wraps a wire frame in its COBS envelope with trailing delimiter.
pub fn encode_serial_frame(frame: &[u8]) -> Vec<u8> {
    let mut out = cobs_encode(frame);
    out.push(COBS_DELIMITER);
    out
}

/// Validates a single decoded serial frame and hands the payload upward.
///
/// The callback borrows the payload for the duration of the call only.
pub fn validate_frame<F>(decoded: &[u8], on_frame: F) -> Result<(), SerialError>
where
    F: FnOnce(u16, &[u8]),
{
    if decoded.len() < MIN_SERIAL_FRAME {
        return Err(SerialError::FrameTooShort(decoded.len()));
    }

    let parts = wire::parse_frame(decoded)?;
    if parts.header.is_encrypted() {
        return Err(SerialError::EncryptedFrame);
    }

    on_frame(parts.header.cmd_id, parts.payload);
    Ok(())
}

/// Per-chunk accounting returned by [`SerialBridge::push_bytes`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SerialProgress {
    /// Frames validated and delivered.
    pub frames: usize,
    /// Wake sentinels observed.
    pub wakes: usize,
    /// Regions dropped for decode or validation failures.
    pub rejected: usize,
}

/// Accumulates raw serial bytes and slices them at COBS delimiters.
#[derive(Debug)]
pub struct SerialBridge {
    acc: Vec<u8>,
    overflowed: bool,
}

impl SerialBridge {
    /// Creates an empty bridge.
    #[must_use]
    pub fn new() -> Self {
        Self {
            acc: Vec::with_capacity(256),
            overflowed: false,
        }
    }

    /// Feeds raw bytes from the sensor UART, invoking `on_frame` for every
    /// validated frame. Invalid regions are logged and skipped so one bad
    /// frame never stalls the stream.
    pub fn push_bytes<F>(&mut self, chunk: &[u8], mut on_frame: F) -> SerialProgress
    where
        F: FnMut(u16, &[u8]),
    {
        let mut progress = SerialProgress::default();

        for &byte in chunk {
            if byte != COBS_DELIMITER {
                if self.overflowed {
                    continue;
                }
                if self.acc.len() >= MAX_ENCODED_FRAME {
                    warn!(limit = MAX_ENCODED_FRAME, "serial region overflow, resyncing");
                    self.acc.clear();
                    self.overflowed = true;
                    progress.rejected += 1;
                    continue;
                }
                self.acc.push(byte);
                continue;
            }

            if self.overflowed {
                // Delimiter ends the oversized region; resume clean.
                self.overflowed = false;
                continue;
            }

            if self.acc.is_empty() {
                debug!("serial wake sentinel");
                progress.wakes += 1;
                continue;
            }

            let region = std::mem::take(&mut self.acc);
            match cobs_decode(&region) {
                Ok(decoded) if decoded.is_empty() => {
                    debug!("serial wake sentinel");
                    progress.wakes += 1;
                }
                Ok(decoded) => match validate_frame(&decoded, &mut on_frame) {
                    Ok(()) => progress.frames += 1,
                    Err(err) => {
                        warn!(%err, len = decoded.len(), "dropping invalid serial frame");
                        progress.rejected += 1;
                    }
                },
                Err(err) => {
                    warn!(%err, len = region.len(), "dropping undecodable serial region");
                    progress.rejected += 1;
                }
            }
        }

        progress
    }

    /// Bytes buffered while waiting for the next delimiter.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.acc.len()
    }
}

impl Default for SerialBridge {
    fn default() -> Self {
        Self::new()
    }
}
