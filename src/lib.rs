// Goster gateway public library surface.
// Numan Thabit 2025

pub mod config;

pub mod crypto;

pub mod wire;

pub mod serial;

pub mod report;

pub mod queue;

pub mod session;

pub mod gateway;

pub mod metrics;

pub mod runtime;

pub use config::{
    ConfigError, ConfigStore, DeviceConfig, DeviceIdentity, FileStore, MemoryStore,
    DEFAULT_SERVER_ADDR, DEFAULT_SERVER_PORT, RECORD_SEPARATOR,
};

pub use crypto::{
    aead::{self, AeadError, SessionKey, KEY_LEN, TAG_LEN},
    handshake::{HandshakeError, Keypair, PUBLIC_KEY_LEN},
    nonce::{NonceError, NonceSeq, NONCE_LEN as NONCE_SEQ_LEN, SALT_LEN},
};

pub use wire::{
    encode_plain, encode_sealed, flags, parse_frame, Cmd, FrameParts, GosterHdr, WireError,
    AAD_LEN, GOSTER_MAGIC, GOSTER_VERSION, HDR_LEN, MAX_PAYLOAD_LEN, NONCE_LEN, TRAILER_LEN,
};

pub use serial::{
    cobs_decode, cobs_encode, encode_serial_frame, validate_frame, CobsError, SerialBridge,
    SerialError, SerialProgress, COBS_DELIMITER, MIN_SERIAL_FRAME, NOT_READY_BYTE,
};

pub use report::{DataType, MetricReport, ReportError, MAX_REPORT_LEN, MAX_SAMPLES};

pub use queue::{TransmitQueue, QUEUE_CAPACITY};

pub use session::{Session, SessionError, SessionEvent, State, AUTH_OK};

pub use gateway::{
    Gateway, GatewayEvent, Link, SystemClock, TcpLink, TimeSource, CONNECT_BACKOFF,
    CONNECT_TIMEOUT, IDLE_CLOSE, LINK_DOWN_BACKOFF, SERIAL_HOLDOFF,
};

pub use metrics::{Metrics, MetricsError};

pub use runtime::{spawn_gateway, GatewayCommand, GatewayHandle, RuntimeConfig};
