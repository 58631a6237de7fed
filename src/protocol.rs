//! Wire grammar: `[varString document][varUint type][payload]`.

use bytes::Bytes;

use crate::awareness::{Awareness, ClientId};
use crate::codec::{Decoder, Encoder, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0,
    Awareness = 1,
    Auth = 2,
    QueryAwareness = 3,
    SyncReply = 4,
    Stateless = 5,
    BroadcastStateless = 6,
    Close = 7,
    SyncStatus = 8,
}

impl TryFrom<u64> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Sync,
            1 => Self::Awareness,
            2 => Self::Auth,
            3 => Self::QueryAwareness,
            4 => Self::SyncReply,
            5 => Self::Stateless,
            6 => Self::BroadcastStateless,
            7 => Self::Close,
            8 => Self::SyncStatus,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// Sub-type carried by `Sync` and `SyncReply` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncType {
    Step1 = 0,
    Step2 = 1,
    Update = 2,
}

impl TryFrom<u64> for SyncType {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Step1),
            1 => Ok(Self::Step2),
            2 => Ok(Self::Update),
            other => Err(ProtocolError::UnknownSyncType(other)),
        }
    }
}

/// Sub-type carried by `Auth` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthType {
    Token = 0,
    PermissionDenied = 1,
    Authenticated = 2,
}

impl TryFrom<u64> for AuthType {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Token),
            1 => Ok(Self::PermissionDenied),
            2 => Ok(Self::Authenticated),
            other => Err(ProtocolError::UnknownAuthType(other)),
        }
    }
}

/// Access scope announced in the `Authenticated` reply.
pub fn scope(read_only: bool) -> &'static str {
    if read_only { "readonly" } else { "read-write" }
}

/// A decoded message header with a cursor positioned at the payload.
#[derive(Debug, Clone)]
pub struct IncomingMessage<'a> {
    document_name: &'a str,
    raw_type: u64,
    decoder: Decoder<'a>,
}

impl<'a> IncomingMessage<'a> {
    pub fn decode(data: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut decoder = Decoder::new(data);
        let document_name = decoder.read_var_string()?;
        let raw_type = decoder.read_var_uint()?;
        Ok(Self { document_name, raw_type, decoder })
    }

    pub fn document_name(&self) -> &'a str {
        self.document_name
    }

    pub fn raw_type(&self) -> u64 {
        self.raw_type
    }

    pub fn message_type(&self) -> Result<MessageType, ProtocolError> {
        MessageType::try_from(self.raw_type)
    }

    pub fn read_var_uint(&mut self) -> Result<u64, ProtocolError> {
        self.decoder.read_var_uint()
    }

    pub fn read_var_string(&mut self) -> Result<&'a str, ProtocolError> {
        self.decoder.read_var_string()
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        self.decoder.read_var_bytes()
    }

    /// Reads the `Token` auth sub-message.
    pub fn read_token(&mut self) -> Result<&'a str, ProtocolError> {
        match AuthType::try_from(self.read_var_uint()?)? {
            AuthType::Token => self.read_var_string(),
            other => Err(ProtocolError::UnknownAuthType(other as u64)),
        }
    }
}

/// Builder for outgoing messages. Each constructor writes the document name first.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    encoder: Encoder,
    header_len: usize,
    category: &'static str,
}

impl OutgoingMessage {
    pub fn new(document_name: &str) -> Self {
        let mut encoder = Encoder::new();
        encoder.write_var_string(document_name);
        let header_len = encoder.len();
        Self { encoder, header_len, category: "Empty" }
    }

    pub fn category(&self) -> &'static str {
        self.category
    }

    /// True once anything was written after the type tag.
    pub fn has_payload(&self) -> bool {
        self.encoder.len() > self.header_len + 1
    }

    pub fn len(&self) -> usize {
        self.encoder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoder.is_empty()
    }

    fn tag(mut self, message_type: MessageType) -> Self {
        self.encoder.write_var_uint(message_type as u64);
        self
    }

    pub fn sync(self) -> Self {
        self.tag(MessageType::Sync)
    }

    pub fn sync_reply(self) -> Self {
        self.tag(MessageType::SyncReply)
    }

    pub fn sync_step1(mut self, state_vector: &[u8]) -> Self {
        self.category = "SyncStep1";
        self.encoder.write_var_uint(SyncType::Step1 as u64);
        self.encoder.write_var_bytes(state_vector);
        self
    }

    pub fn sync_step2(mut self, update: &[u8]) -> Self {
        self.category = "SyncStep2";
        self.encoder.write_var_uint(SyncType::Step2 as u64);
        self.encoder.write_var_bytes(update);
        self
    }

    pub fn update(mut self, update: &[u8]) -> Self {
        self.category = "Update";
        self.encoder.write_var_uint(SyncType::Update as u64);
        self.encoder.write_var_bytes(update);
        self
    }

    /// Full `Sync + Update` message.
    pub fn sync_update(self, update: &[u8]) -> Self {
        self.sync().update(update)
    }

    /// Awareness message for `clients`, or for every known client when `None`.
    pub fn awareness_update(mut self, awareness: &Awareness, clients: Option<&[ClientId]>) -> Self {
        let update = match clients {
            Some(ids) => awareness.encode_update(ids),
            None => awareness.encode_update(&awareness.client_ids()),
        };
        self = self.tag(MessageType::Awareness);
        self.category = "Update";
        self.encoder.write_var_bytes(&update);
        self
    }

    /// Raw awareness payload (already encoded by a presence registry).
    pub fn awareness(mut self, update: &[u8]) -> Self {
        self = self.tag(MessageType::Awareness);
        self.category = "Update";
        self.encoder.write_var_bytes(update);
        self
    }

    pub fn query_awareness(mut self) -> Self {
        self = self.tag(MessageType::QueryAwareness);
        self.category = "QueryAwareness";
        self
    }

    /// Client-side token message.
    pub fn token(mut self, token: &str) -> Self {
        self = self.tag(MessageType::Auth);
        self.category = "Token";
        self.encoder.write_var_uint(AuthType::Token as u64);
        self.encoder.write_var_string(token);
        self
    }

    pub fn authenticated(mut self, read_only: bool) -> Self {
        self = self.tag(MessageType::Auth);
        self.category = "Authenticated";
        self.encoder.write_var_uint(AuthType::Authenticated as u64);
        self.encoder.write_var_string(scope(read_only));
        self
    }

    pub fn permission_denied(mut self, reason: &str) -> Self {
        self = self.tag(MessageType::Auth);
        self.category = "PermissionDenied";
        self.encoder.write_var_uint(AuthType::PermissionDenied as u64);
        self.encoder.write_var_string(reason);
        self
    }

    pub fn stateless(mut self, payload: &str) -> Self {
        self = self.tag(MessageType::Stateless);
        self.category = "Stateless";
        self.encoder.write_var_string(payload);
        self
    }

    pub fn broadcast_stateless(mut self, payload: &str) -> Self {
        self = self.tag(MessageType::BroadcastStateless);
        self.category = "BroadcastStateless";
        self.encoder.write_var_string(payload);
        self
    }

    pub fn sync_status(mut self, applied: bool) -> Self {
        self = self.tag(MessageType::SyncStatus);
        self.category = "SyncStatus";
        self.encoder.write_var_uint(u64::from(applied));
        self
    }

    pub fn close(mut self) -> Self {
        self = self.tag(MessageType::Close);
        self.category = "Close";
        self
    }

    pub fn into_bytes(self) -> Bytes {
        self.encoder.into_bytes()
    }
}
