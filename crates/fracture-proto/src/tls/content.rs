//! Record content other than handshake messages, and the [`TlsMessage`]
//! sum type dispatching on content type.

use bytes::{BufMut, Bytes};

use crate::{
    codec::owned,
    errors::{ProtocolError, Result},
    tls::{AlertDescription, AlertLevel, ContentType, HandshakeMessage},
    value::Overridable,
};

/// Alert message (two bytes).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alert {
    /// Alert level
    pub level: Overridable<AlertLevel>,
    /// Alert description
    pub description: Overridable<AlertDescription>,
}

impl Alert {
    /// Creates an alert with the given level and description.
    pub fn new(level: AlertLevel, description: AlertDescription) -> Self {
        Self {
            level: Overridable::computed(level),
            description: Overridable::computed(description),
        }
    }
}

/// ChangeCipherSpec message (one byte, normally `1`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeCipherSpec {
    /// Message value
    pub value: Overridable<u8>,
}

/// Application data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationData {
    /// Payload
    pub data: Overridable<Bytes>,
}

impl ApplicationData {
    /// Wraps a payload.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: Overridable::computed(data.into()) }
    }
}

/// Any message carried in TLS records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMessage {
    /// Handshake message
    Handshake(HandshakeMessage),
    /// Alert
    Alert(Alert),
    /// ChangeCipherSpec
    ChangeCipherSpec(ChangeCipherSpec),
    /// Application data
    ApplicationData(ApplicationData),
}

impl TlsMessage {
    /// Record content type that carries this message.
    #[must_use]
    pub fn content_type(&self) -> ContentType {
        match self {
            Self::Handshake(_) => ContentType::HANDSHAKE,
            Self::Alert(_) => ContentType::ALERT,
            Self::ChangeCipherSpec(_) => ContentType::CHANGE_CIPHER_SPEC,
            Self::ApplicationData(_) => ContentType::APPLICATION_DATA,
        }
    }

    /// Writes the message.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        match self {
            Self::Handshake(message) => message.encode(dst),
            Self::Alert(alert) => {
                dst.put_u8(alert.level.value("alert.level")?.0);
                dst.put_u8(alert.description.value("alert.description")?.0);
                Ok(())
            },
            Self::ChangeCipherSpec(ccs) => {
                dst.put_u8(ccs.value.value("change_cipher_spec.value")?);
                Ok(())
            },
            Self::ApplicationData(app) => {
                dst.put_slice(app.data.resolve("application_data.data")?);
                Ok(())
            },
        }
    }

    /// Decodes one message of `content_type` from the front of `bytes`.
    ///
    /// Application data consumes everything it is given. Handshake messages,
    /// alerts and ChangeCipherSpec report [`ProtocolError::Incomplete`] until
    /// fully buffered, since they may be split across records.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Parse`] for content types with no message
    /// definition.
    pub fn decode(content_type: ContentType, bytes: &[u8]) -> Result<(Self, usize)> {
        match content_type {
            ContentType::HANDSHAKE => {
                HandshakeMessage::decode(bytes).map(|(m, n)| (Self::Handshake(m), n))
            },
            ContentType::ALERT => {
                if bytes.len() < 2 {
                    return Err(ProtocolError::Incomplete { needed: 2 - bytes.len() });
                }
                let alert = Alert::new(AlertLevel(bytes[0]), AlertDescription(bytes[1]));
                Ok((Self::Alert(alert), 2))
            },
            ContentType::CHANGE_CIPHER_SPEC => {
                let Some(&value) = bytes.first() else {
                    return Err(ProtocolError::Incomplete { needed: 1 });
                };
                let ccs = ChangeCipherSpec { value: Overridable::computed(value) };
                Ok((Self::ChangeCipherSpec(ccs), 1))
            },
            ContentType::APPLICATION_DATA => {
                Ok((Self::ApplicationData(ApplicationData::new(owned(bytes))), bytes.len()))
            },
            other => Err(ProtocolError::parse(format!("no message definition for {other}"), 0)),
        }
    }
}

impl From<HandshakeMessage> for TlsMessage {
    fn from(message: HandshakeMessage) -> Self {
        Self::Handshake(message)
    }
}

impl From<Alert> for TlsMessage {
    fn from(alert: Alert) -> Self {
        Self::Alert(alert)
    }
}

impl From<ChangeCipherSpec> for TlsMessage {
    fn from(ccs: ChangeCipherSpec) -> Self {
        Self::ChangeCipherSpec(ccs)
    }
}

impl From<ApplicationData> for TlsMessage {
    fn from(app: ApplicationData) -> Self {
        Self::ApplicationData(app)
    }
}
