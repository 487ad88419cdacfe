//! Handshake message framing and the hello bodies.
//!
//! ```text
//! +----------------+------------------+------------------------+
//! | msg_type (u8)  | length (u24be)   | body (length bytes)    |
//! +----------------+------------------+------------------------+
//! ```
//!
//! Every length prefix inside the bodies is its own overridable field. The
//! extensions block of a hello is only written when its length resolves, so
//! leaving `extensions_length` unset produces an extension-less hello.

use bytes::{BufMut, Bytes};

use crate::{
    codec::{Reader, fit_u16, owned, put_u24},
    errors::{ProtocolError, Result},
    tls::{CipherSuite, ExtensionType, HandshakeType, ProtocolVersion},
    value::Overridable,
};

/// Length of the hello random
pub const RANDOM_LEN: usize = 32;

/// A hello extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extension {
    /// Extension code point
    pub extension_type: Overridable<ExtensionType>,
    /// Declared data length
    pub length: Overridable<u16>,
    /// Extension data
    pub data: Overridable<Bytes>,
}

impl Extension {
    /// Creates an extension whose length is left to compute-defaults.
    pub fn new(extension_type: ExtensionType, data: impl Into<Bytes>) -> Self {
        Self {
            extension_type: Overridable::computed(extension_type),
            length: Overridable::Unset,
            data: Overridable::computed(data.into()),
        }
    }

    /// Fills the length from the data.
    ///
    /// # Errors
    ///
    /// Fails if the data is unset or longer than a 16-bit length can carry.
    pub fn compute_length(&mut self) -> Result<()> {
        let len = self.data.resolve("extension.data")?.len();
        self.length.set_computed(fit_u16("extension.length", len)?);
        Ok(())
    }

    fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        dst.put_u16(self.extension_type.value("extension.type")?.0);
        dst.put_u16(self.length.value("extension.length")?);
        dst.put_slice(self.data.resolve("extension.data")?);
        Ok(())
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let extension_type = ExtensionType(reader.u16("extension.type")?);
        let (length, data) = reader.vec_u16("extension.data")?;
        Ok(Self {
            extension_type: Overridable::computed(extension_type),
            length: Overridable::computed(length),
            data: Overridable::computed(owned(data)),
        })
    }
}

/// Computes the block length of a list of extensions.
///
/// Every extension's own length must already resolve.
pub fn extensions_block_len(extensions: &[Extension]) -> Result<usize> {
    extensions.iter().try_fold(0usize, |acc, ext| {
        Ok(acc + 4 + ext.data.resolve("extension.data")?.len())
    })
}

fn encode_extensions(
    length: &Overridable<u16>,
    extensions: &[Extension],
    dst: &mut impl BufMut,
) -> Result<()> {
    if let Some(length) = length.get() {
        dst.put_u16(*length);
        for ext in extensions {
            ext.encode(dst)?;
        }
    }
    Ok(())
}

fn decode_extensions(reader: &mut Reader<'_>) -> Result<(Overridable<u16>, Vec<Extension>)> {
    if reader.is_empty() {
        return Ok((Overridable::Unset, Vec::new()));
    }

    let start = reader.position();
    let (length, block) = reader.vec_u16("extensions")?;
    let mut block = Reader::new(block);
    let mut extensions = Vec::new();
    while !block.is_empty() {
        let ext = Extension::decode(&mut block).map_err(|e| e.offset(start + 2))?;
        extensions.push(ext);
    }

    if !reader.is_empty() {
        return Err(ProtocolError::parse(
            format!("{} trailing bytes after extensions", reader.remaining()),
            reader.position(),
        ));
    }
    Ok((Overridable::computed(length), extensions))
}

/// ClientHello body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    /// Highest version the client offers
    pub version: Overridable<ProtocolVersion>,
    /// Client random (32 bytes when well-formed)
    pub random: Overridable<Bytes>,
    /// Declared session id length
    pub session_id_length: Overridable<u8>,
    /// Session id
    pub session_id: Overridable<Bytes>,
    /// Declared cipher suite list length in bytes
    pub cipher_suites_length: Overridable<u16>,
    /// Offered cipher suites
    pub cipher_suites: Overridable<Vec<CipherSuite>>,
    /// Declared compression method list length
    pub compression_methods_length: Overridable<u8>,
    /// Offered compression methods
    pub compression_methods: Overridable<Bytes>,
    /// Declared extensions block length; the block is omitted when unset
    pub extensions_length: Overridable<u16>,
    /// Extensions in wire order
    pub extensions: Vec<Extension>,
}

impl ClientHello {
    fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        dst.put_u16(self.version.value("client_hello.version")?.0);
        dst.put_slice(self.random.resolve("client_hello.random")?);
        dst.put_u8(self.session_id_length.value("client_hello.session_id_length")?);
        dst.put_slice(self.session_id.resolve("client_hello.session_id")?);
        dst.put_u16(self.cipher_suites_length.value("client_hello.cipher_suites_length")?);
        for suite in self.cipher_suites.resolve("client_hello.cipher_suites")? {
            dst.put_u16(suite.0);
        }
        dst.put_u8(
            self.compression_methods_length.value("client_hello.compression_methods_length")?,
        );
        dst.put_slice(self.compression_methods.resolve("client_hello.compression_methods")?);
        encode_extensions(&self.extensions_length, &self.extensions, dst)
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let version = ProtocolVersion(reader.u16("client_hello.version")?);
        let random = owned(reader.bytes(RANDOM_LEN, "client_hello.random")?);
        let (session_id_length, session_id) = reader.vec_u8("client_hello.session_id")?;

        let suites_at = reader.position();
        let (cipher_suites_length, suites) = reader.vec_u16("client_hello.cipher_suites")?;
        if suites.len() % 2 != 0 {
            return Err(ProtocolError::parse("odd cipher suite list length", suites_at));
        }
        let cipher_suites =
            suites.chunks_exact(2).map(|c| CipherSuite(u16::from_be_bytes([c[0], c[1]]))).collect();

        let (compression_methods_length, compression_methods) =
            reader.vec_u8("client_hello.compression_methods")?;
        let (extensions_length, extensions) = decode_extensions(reader)?;

        Ok(Self {
            version: Overridable::computed(version),
            random: Overridable::computed(random),
            session_id_length: Overridable::computed(session_id_length),
            session_id: Overridable::computed(owned(session_id)),
            cipher_suites_length: Overridable::computed(cipher_suites_length),
            cipher_suites: Overridable::computed(cipher_suites),
            compression_methods_length: Overridable::computed(compression_methods_length),
            compression_methods: Overridable::computed(owned(compression_methods)),
            extensions_length,
            extensions,
        })
    }

    /// Looks up an extension by type.
    #[must_use]
    pub fn extension(&self, extension_type: ExtensionType) -> Option<&Extension> {
        find_extension(&self.extensions, extension_type)
    }
}

/// ServerHello body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerHello {
    /// Version selected by the server
    pub version: Overridable<ProtocolVersion>,
    /// Server random
    pub random: Overridable<Bytes>,
    /// Declared session id length
    pub session_id_length: Overridable<u8>,
    /// Session id
    pub session_id: Overridable<Bytes>,
    /// Selected cipher suite
    pub cipher_suite: Overridable<CipherSuite>,
    /// Selected compression method
    pub compression_method: Overridable<u8>,
    /// Declared extensions block length; the block is omitted when unset
    pub extensions_length: Overridable<u16>,
    /// Extensions in wire order
    pub extensions: Vec<Extension>,
}

impl ServerHello {
    fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        dst.put_u16(self.version.value("server_hello.version")?.0);
        dst.put_slice(self.random.resolve("server_hello.random")?);
        dst.put_u8(self.session_id_length.value("server_hello.session_id_length")?);
        dst.put_slice(self.session_id.resolve("server_hello.session_id")?);
        dst.put_u16(self.cipher_suite.value("server_hello.cipher_suite")?.0);
        dst.put_u8(self.compression_method.value("server_hello.compression_method")?);
        encode_extensions(&self.extensions_length, &self.extensions, dst)
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let version = ProtocolVersion(reader.u16("server_hello.version")?);
        let random = owned(reader.bytes(RANDOM_LEN, "server_hello.random")?);
        let (session_id_length, session_id) = reader.vec_u8("server_hello.session_id")?;
        let cipher_suite = CipherSuite(reader.u16("server_hello.cipher_suite")?);
        let compression_method = reader.u8("server_hello.compression_method")?;
        let (extensions_length, extensions) = decode_extensions(reader)?;

        Ok(Self {
            version: Overridable::computed(version),
            random: Overridable::computed(random),
            session_id_length: Overridable::computed(session_id_length),
            session_id: Overridable::computed(owned(session_id)),
            cipher_suite: Overridable::computed(cipher_suite),
            compression_method: Overridable::computed(compression_method),
            extensions_length,
            extensions,
        })
    }

    /// Looks up an extension by type.
    #[must_use]
    pub fn extension(&self, extension_type: ExtensionType) -> Option<&Extension> {
        find_extension(&self.extensions, extension_type)
    }
}

fn find_extension(extensions: &[Extension], extension_type: ExtensionType) -> Option<&Extension> {
    extensions.iter().find(|ext| ext.extension_type.get() == Some(&extension_type))
}

/// Finished body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Finished {
    /// PRF output over the handshake transcript
    pub verify_data: Overridable<Bytes>,
}

/// Body of a handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeBody {
    /// client_hello
    ClientHello(ClientHello),
    /// server_hello
    ServerHello(ServerHello),
    /// server_hello_done (empty body)
    ServerHelloDone,
    /// finished
    Finished(Finished),
    /// Any other message type, carried verbatim
    Opaque(Overridable<Bytes>),
}

impl HandshakeBody {
    /// Message type a body of this shape is normally sent as.
    #[must_use]
    pub fn default_type(&self) -> Option<HandshakeType> {
        match self {
            Self::ClientHello(_) => Some(HandshakeType::CLIENT_HELLO),
            Self::ServerHello(_) => Some(HandshakeType::SERVER_HELLO),
            Self::ServerHelloDone => Some(HandshakeType::SERVER_HELLO_DONE),
            Self::Finished(_) => Some(HandshakeType::FINISHED),
            Self::Opaque(_) => None,
        }
    }

    /// Writes the body without the message header.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        match self {
            Self::ClientHello(hello) => hello.encode(dst),
            Self::ServerHello(hello) => hello.encode(dst),
            Self::ServerHelloDone => Ok(()),
            Self::Finished(finished) => {
                dst.put_slice(finished.verify_data.resolve("finished.verify_data")?);
                Ok(())
            },
            Self::Opaque(body) => {
                dst.put_slice(body.resolve("handshake.body")?);
                Ok(())
            },
        }
    }

    /// Decodes a body of `handshake_type` spanning all of `body`.
    pub fn decode(handshake_type: HandshakeType, body: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(body);
        match handshake_type {
            HandshakeType::CLIENT_HELLO => Ok(Self::ClientHello(ClientHello::decode(&mut reader)?)),
            HandshakeType::SERVER_HELLO => Ok(Self::ServerHello(ServerHello::decode(&mut reader)?)),
            HandshakeType::SERVER_HELLO_DONE if body.is_empty() => Ok(Self::ServerHelloDone),
            HandshakeType::FINISHED => Ok(Self::Finished(Finished {
                verify_data: Overridable::computed(owned(body)),
            })),
            _ => Ok(Self::Opaque(Overridable::computed(owned(body)))),
        }
    }
}

/// A handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    /// Message type
    pub handshake_type: Overridable<HandshakeType>,
    /// Declared body length (24 bits on the wire)
    pub length: Overridable<u32>,
    /// Message body
    pub body: HandshakeBody,
}

impl HandshakeMessage {
    /// Size of the message header
    pub const HEADER_SIZE: usize = 4;

    /// Wraps a body, computing the type from its shape when known.
    pub fn new(body: HandshakeBody) -> Self {
        let mut handshake_type = Overridable::Unset;
        if let Some(default) = body.default_type() {
            handshake_type.set_computed(default);
        }
        Self { handshake_type, length: Overridable::Unset, body }
    }

    /// Creates a message with an arbitrary type and verbatim body.
    pub fn opaque(handshake_type: HandshakeType, body: impl Into<Bytes>) -> Self {
        Self {
            handshake_type: Overridable::computed(handshake_type),
            length: Overridable::Unset,
            body: HandshakeBody::Opaque(Overridable::computed(body.into())),
        }
    }

    /// Writes header and body.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        dst.put_u8(self.handshake_type.value("handshake.type")?.0);
        put_u24(dst, "handshake.length", self.length.value("handshake.length")?)?;
        self.body.encode(dst)
    }

    /// Decodes one handshake message from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Incomplete`] while the message is not fully
    /// buffered, and [`ProtocolError::Parse`] if its body is malformed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut reader = Reader::new(bytes);
        if bytes.len() < Self::HEADER_SIZE {
            return Err(ProtocolError::Incomplete { needed: Self::HEADER_SIZE - bytes.len() });
        }
        let handshake_type = HandshakeType(reader.u8("handshake.type")?);
        let length = reader.u24("handshake.length")?;

        let body_len = length as usize;
        if reader.remaining() < body_len {
            return Err(ProtocolError::Incomplete { needed: body_len - reader.remaining() });
        }
        let body = HandshakeBody::decode(handshake_type, reader.bytes(body_len, "handshake.body")?)
            .map_err(|e| e.offset(Self::HEADER_SIZE))?;

        let message = Self {
            handshake_type: Overridable::computed(handshake_type),
            length: Overridable::computed(length),
            body,
        };
        Ok((message, Self::HEADER_SIZE + body_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ServerHello: TLS 1.2, random 0x11.., empty session id,
    /// AES128-SHA, null compression, one renegotiation_info extension
    const SERVER_HELLO: &str = concat!(
        "0200002d",
        "0303",
        "1111111111111111111111111111111111111111111111111111111111111111",
        "00",
        "002f",
        "00",
        "0005",
        "ff01000100",
    );

    #[test]
    fn server_hello_round_trips() {
        let bytes = hex::decode(SERVER_HELLO).unwrap();
        let (message, used) = HandshakeMessage::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());

        let HandshakeBody::ServerHello(hello) = &message.body else {
            panic!("expected server hello, got {:?}", message.body);
        };
        assert_eq!(hello.cipher_suite.get(), Some(&CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA));
        assert!(hello.extension(ExtensionType::RENEGOTIATION_INFO).is_some());

        let mut out = Vec::new();
        message.encode(&mut out).unwrap();
        assert_eq!(hex::encode(out), SERVER_HELLO);
    }

    #[test]
    fn truncated_message_is_incomplete() {
        let bytes = hex::decode(SERVER_HELLO).unwrap();
        assert_eq!(
            HandshakeMessage::decode(&bytes[..10]),
            Err(ProtocolError::Incomplete { needed: 45 - 6 })
        );
        assert_eq!(
            HandshakeMessage::decode(&bytes[..2]),
            Err(ProtocolError::Incomplete { needed: 2 })
        );
    }

    #[test]
    fn overrunning_extension_length_is_parse_error() {
        let mut bytes = hex::decode(SERVER_HELLO).unwrap();
        // renegotiation_info claims 0x10 bytes of data inside a 5-byte block
        let at = bytes.len() - 2;
        bytes[at] = 0x10;
        assert!(matches!(HandshakeMessage::decode(&bytes), Err(ProtocolError::Parse { .. })));
    }

    #[test]
    fn unknown_type_is_carried_opaquely() {
        let bytes = hex::decode("630000020102").unwrap();
        let (message, used) = HandshakeMessage::decode(&bytes).unwrap();
        assert_eq!(used, 6);
        assert_eq!(message.handshake_type.get(), Some(&HandshakeType(0x63)));
        assert!(matches!(message.body, HandshakeBody::Opaque(_)));
    }

    #[test]
    fn hello_without_extensions_length_omits_block() {
        let hello = ClientHello {
            version: Overridable::computed(ProtocolVersion::TLS1_2),
            random: Overridable::computed(Bytes::from(vec![0u8; RANDOM_LEN])),
            session_id_length: Overridable::computed(0),
            session_id: Overridable::computed(Bytes::new()),
            cipher_suites_length: Overridable::computed(2),
            cipher_suites: Overridable::computed(vec![CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA]),
            compression_methods_length: Overridable::computed(1),
            compression_methods: Overridable::computed(Bytes::from_static(&[0])),
            extensions_length: Overridable::Unset,
            extensions: vec![Extension::new(ExtensionType::SERVER_NAME, Bytes::new())],
        };
        let mut out = Vec::new();
        HandshakeBody::ClientHello(hello).encode(&mut out).unwrap();
        assert_eq!(out.len(), 2 + RANDOM_LEN + 1 + 2 + 2 + 1 + 1);
    }
}
