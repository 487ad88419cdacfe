//! TLS 1.0 - 1.2 wire catalog: records, handshake messages, alerts,
//! ChangeCipherSpec and application data.

mod content;
mod handshake;
mod record;
mod types;

pub use content::{Alert, ApplicationData, ChangeCipherSpec, TlsMessage};
pub use handshake::{
    ClientHello, Extension, Finished, HandshakeBody, HandshakeMessage, RANDOM_LEN, ServerHello,
    extensions_block_len,
};
pub use record::{RawRecordHeader, Record, RecordComputations};
pub use types::{
    AlertDescription, AlertLevel, CbcParameters, CipherSuite, ContentType, ExtensionType,
    HandshakeType, ProtocolVersion, max_fragment_length_from_code,
};
