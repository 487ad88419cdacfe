//! Open-valued TLS registries.
//!
//! Registry values are newtypes over their wire integers rather than closed
//! enums: an unknown or deliberately invalid code point must survive decode
//! and be sendable, so every value of the underlying integer is legal.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! registry {
    (
        $(#[$meta:meta])*
        $name:ident($repr:ty) {
            $( $(#[$cmeta:meta])* $konst:ident = $value:expr, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $repr);

        impl $name {
            $( $(#[$cmeta])* pub const $konst: Self = Self($value); )*

            /// Registry name of a known value.
            #[must_use]
            pub fn name(self) -> Option<&'static str> {
                match self {
                    $( Self::$konst => Some(stringify!($konst)), )*
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.name() {
                    Some(name) => f.write_str(name),
                    None => write!(f, "{}({:#x})", stringify!($name), self.0),
                }
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }
    };
}

registry! {
    /// Record content type
    ContentType(u8) {
        /// change_cipher_spec(20)
        CHANGE_CIPHER_SPEC = 20,
        /// alert(21)
        ALERT = 21,
        /// handshake(22)
        HANDSHAKE = 22,
        /// application_data(23)
        APPLICATION_DATA = 23,
        /// heartbeat(24)
        HEARTBEAT = 24,
    }
}

registry! {
    /// Protocol version as carried in records and hellos
    ProtocolVersion(u16) {
        /// SSL 3.0
        SSL3_0 = 0x0300,
        /// TLS 1.0
        TLS1_0 = 0x0301,
        /// TLS 1.1
        TLS1_1 = 0x0302,
        /// TLS 1.2
        TLS1_2 = 0x0303,
        /// TLS 1.3
        TLS1_3 = 0x0304,
    }
}

impl ProtocolVersion {
    /// Returns true if CBC records carry an explicit per-record IV (TLS 1.1+).
    #[must_use]
    pub fn uses_explicit_iv(self) -> bool {
        self >= Self::TLS1_1
    }
}

registry! {
    /// Cipher suite code point
    CipherSuite(u16) {
        /// TLS_NULL_WITH_NULL_NULL
        TLS_NULL_WITH_NULL_NULL = 0x0000,
        /// TLS_RSA_WITH_3DES_EDE_CBC_SHA
        TLS_RSA_WITH_3DES_EDE_CBC_SHA = 0x000A,
        /// TLS_RSA_WITH_AES_128_CBC_SHA
        TLS_RSA_WITH_AES_128_CBC_SHA = 0x002F,
        /// TLS_RSA_WITH_AES_256_CBC_SHA
        TLS_RSA_WITH_AES_256_CBC_SHA = 0x0035,
        /// TLS_RSA_WITH_AES_128_CBC_SHA256
        TLS_RSA_WITH_AES_128_CBC_SHA256 = 0x003C,
        /// TLS_RSA_WITH_AES_256_CBC_SHA256
        TLS_RSA_WITH_AES_256_CBC_SHA256 = 0x003D,
        /// TLS_RSA_WITH_AES_128_GCM_SHA256
        TLS_RSA_WITH_AES_128_GCM_SHA256 = 0x009C,
        /// TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA
        TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA = 0xC013,
        /// TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA384
        TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA384 = 0xC028,
        /// TLS_EMPTY_RENEGOTIATION_INFO_SCSV
        TLS_EMPTY_RENEGOTIATION_INFO_SCSV = 0x00FF,
    }
}

/// Block cipher layout of a CBC cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CbcParameters {
    /// Cipher block size in bytes
    pub block_size: usize,
    /// MAC output length in bytes
    pub mac_len: usize,
    /// Encryption key length in bytes
    pub key_len: usize,
}

impl CipherSuite {
    /// Block and MAC sizes for CBC suites, `None` for every other suite.
    #[must_use]
    pub fn cbc_parameters(self) -> Option<CbcParameters> {
        let (block_size, mac_len, key_len) = match self {
            Self::TLS_RSA_WITH_3DES_EDE_CBC_SHA => (8, 20, 24),
            Self::TLS_RSA_WITH_AES_128_CBC_SHA | Self::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA => {
                (16, 20, 16)
            },
            Self::TLS_RSA_WITH_AES_256_CBC_SHA => (16, 20, 32),
            Self::TLS_RSA_WITH_AES_128_CBC_SHA256 => (16, 32, 16),
            Self::TLS_RSA_WITH_AES_256_CBC_SHA256 => (16, 32, 32),
            Self::TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA384 => (16, 48, 32),
            _ => return None,
        };
        Some(CbcParameters { block_size, mac_len, key_len })
    }
}

registry! {
    /// Handshake message type
    HandshakeType(u8) {
        /// hello_request(0)
        HELLO_REQUEST = 0,
        /// client_hello(1)
        CLIENT_HELLO = 1,
        /// server_hello(2)
        SERVER_HELLO = 2,
        /// new_session_ticket(4)
        NEW_SESSION_TICKET = 4,
        /// certificate(11)
        CERTIFICATE = 11,
        /// server_key_exchange(12)
        SERVER_KEY_EXCHANGE = 12,
        /// certificate_request(13)
        CERTIFICATE_REQUEST = 13,
        /// server_hello_done(14)
        SERVER_HELLO_DONE = 14,
        /// certificate_verify(15)
        CERTIFICATE_VERIFY = 15,
        /// client_key_exchange(16)
        CLIENT_KEY_EXCHANGE = 16,
        /// finished(20)
        FINISHED = 20,
    }
}

registry! {
    /// Hello extension type
    ExtensionType(u16) {
        /// server_name(0)
        SERVER_NAME = 0,
        /// max_fragment_length(1)
        MAX_FRAGMENT_LENGTH = 1,
        /// supported_groups(10)
        SUPPORTED_GROUPS = 10,
        /// ec_point_formats(11)
        EC_POINT_FORMATS = 11,
        /// signature_algorithms(13)
        SIGNATURE_ALGORITHMS = 13,
        /// encrypt_then_mac(22)
        ENCRYPT_THEN_MAC = 22,
        /// extended_master_secret(23)
        EXTENDED_MASTER_SECRET = 23,
        /// renegotiation_info(65281)
        RENEGOTIATION_INFO = 0xFF01,
    }
}

registry! {
    /// Alert level
    AlertLevel(u8) {
        /// warning(1)
        WARNING = 1,
        /// fatal(2)
        FATAL = 2,
    }
}

registry! {
    /// Alert description
    AlertDescription(u8) {
        /// close_notify(0)
        CLOSE_NOTIFY = 0,
        /// unexpected_message(10)
        UNEXPECTED_MESSAGE = 10,
        /// bad_record_mac(20)
        BAD_RECORD_MAC = 20,
        /// decryption_failed(21)
        DECRYPTION_FAILED = 21,
        /// record_overflow(22)
        RECORD_OVERFLOW = 22,
        /// handshake_failure(40)
        HANDSHAKE_FAILURE = 40,
        /// illegal_parameter(47)
        ILLEGAL_PARAMETER = 47,
        /// decode_error(50)
        DECODE_ERROR = 50,
        /// decrypt_error(51)
        DECRYPT_ERROR = 51,
        /// protocol_version(70)
        PROTOCOL_VERSION = 70,
        /// internal_error(80)
        INTERNAL_ERROR = 80,
    }
}

/// Maximum fragment length negotiated by the RFC 6066 extension code.
///
/// Codes outside 1..=4 are not defined.
#[must_use]
pub fn max_fragment_length_from_code(code: u8) -> Option<usize> {
    match code {
        1 => Some(1 << 9),
        2 => Some(1 << 10),
        3 => Some(1 << 11),
        4 => Some(1 << 12),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_values_are_representable() {
        let ct = ContentType(99);
        assert_eq!(ct.name(), None);
        assert_eq!(ct.to_string(), "ContentType(0x63)");
        assert_eq!(ContentType::HANDSHAKE.to_string(), "HANDSHAKE");
    }

    #[test]
    fn cbc_parameters_only_for_cbc_suites() {
        let aes = CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA.cbc_parameters().unwrap();
        assert_eq!((aes.block_size, aes.mac_len), (16, 20));

        let des = CipherSuite::TLS_RSA_WITH_3DES_EDE_CBC_SHA.cbc_parameters().unwrap();
        assert_eq!(des.block_size, 8);

        assert_eq!(CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256.cbc_parameters(), None);
    }

    #[test]
    fn explicit_iv_from_tls_1_1() {
        assert!(!ProtocolVersion::TLS1_0.uses_explicit_iv());
        assert!(ProtocolVersion::TLS1_1.uses_explicit_iv());
        assert!(ProtocolVersion::TLS1_2.uses_explicit_iv());
    }
}
