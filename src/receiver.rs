//! Server-side dispatch of one decoded message against a document.
//!
//! Replies go to the reply collector when one is supplied (headless use), otherwise to
//! the originating session. Anything that needs hooks is returned as an [`Effect`] for
//! the document actor to finish.

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::awareness::AwarenessChange;
use crate::codec::ProtocolError;
use crate::document::Document;
use crate::error::Result;
use crate::protocol::{IncomingMessage, MessageType, OutgoingMessage, SyncType};
use crate::replica::Origin;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Effect {
    None,
    /// The replica accepted an update.
    Changed { update: Vec<u8> },
    Awareness(AwarenessChange),
    Stateless(String),
    BroadcastStateless(String),
    /// The peer asked to close its session.
    Close,
}

pub(crate) fn apply(
    document: &mut Document,
    message: &mut IncomingMessage<'_>,
    socket_id: Option<&str>,
    mut reply: Option<&mut Vec<Bytes>>,
    now: Instant,
) -> Result<Effect> {
    let message_type = message.message_type()?;
    trace!(document = %document.name(), socket = socket_id, direction = "in", category = ?message_type);

    match message_type {
        MessageType::Sync | MessageType::SyncReply => {
            let response = OutgoingMessage::new(document.name()).sync();
            let (response, effect) = read_sync(document, message, message_type, socket_id, reply.as_deref_mut(), response)?;
            if response.has_payload() {
                deliver(document, response, socket_id, reply);
            }
            Ok(effect)
        }
        MessageType::Awareness => {
            let update = message.read_var_bytes()?;
            let change = document.apply_awareness_update(update, socket_id, now)?;
            Ok(Effect::Awareness(change))
        }
        MessageType::QueryAwareness => {
            let snapshot = OutgoingMessage::new(document.name()).awareness_update(document.awareness(), None);
            deliver(document, snapshot, socket_id, reply);
            Ok(Effect::None)
        }
        MessageType::Stateless => {
            let payload = message.read_var_string()?;
            Ok(match socket_id {
                Some(_) => Effect::Stateless(payload.to_owned()),
                None => Effect::None,
            })
        }
        MessageType::BroadcastStateless => Ok(Effect::BroadcastStateless(message.read_var_string()?.to_owned())),
        MessageType::Close => Ok(Effect::Close),
        MessageType::Auth | MessageType::SyncStatus => Err(ProtocolError::Unhandled(message.raw_type()).into()),
    }
}

fn deliver(document: &mut Document, message: OutgoingMessage, socket_id: Option<&str>, reply: Option<&mut Vec<Bytes>>) {
    match (reply, socket_id) {
        (Some(reply), _) => {
            trace!(document = %document.name(), direction = "out", category = message.category(), "reply");
            reply.push(message.into_bytes());
        }
        (None, Some(socket_id)) => {
            document.send(socket_id, message);
        }
        (None, None) => {}
    }
}

fn read_sync(
    document: &mut Document,
    message: &mut IncomingMessage<'_>,
    message_type: MessageType,
    socket_id: Option<&str>,
    reply: Option<&mut Vec<Bytes>>,
    response: OutgoingMessage,
) -> Result<(OutgoingMessage, Effect)> {
    match SyncType::try_from(message.read_var_uint()?)? {
        SyncType::Step1 => {
            let state_vector = message.read_var_bytes()?;
            let diff = document.replica().diff_update(state_vector)?;
            let response = response.sync_step2(&diff);

            // ask for the peer's state before answering with ours
            let own = document.replica().encode_state_vector();
            match (reply, socket_id) {
                (Some(reply), _) if message_type == MessageType::Sync => {
                    let request = OutgoingMessage::new(document.name()).sync_reply().sync_step1(&own);
                    trace!(document = %document.name(), direction = "out", category = request.category(), "reply");
                    reply.push(request.into_bytes());
                }
                (_, Some(socket_id)) => {
                    let request = OutgoingMessage::new(document.name()).sync().sync_step1(&own);
                    document.send(socket_id, request);
                }
                _ => {}
            }
            Ok((response, Effect::None))
        }
        SyncType::Step2 | SyncType::Update => {
            let update = message.read_var_bytes()?;
            Ok((response, read_update(document, update, socket_id)))
        }
    }
}

fn read_update(document: &mut Document, update: &[u8], socket_id: Option<&str>) -> Effect {
    let read_only = socket_id.and_then(|id| document.connection(id)).is_some_and(|c| c.read_only);

    if read_only {
        let contained = document.replica().snapshot_contains_update(update).unwrap_or(false);
        if let Some(socket_id) = socket_id {
            let status = OutgoingMessage::new(document.name()).sync_status(contained);
            document.send(socket_id, status);
        }
        return Effect::None;
    }

    let origin = socket_id.map_or(Origin::Local, Origin::Session);
    let (applied, effect) = match document.apply_update(update, origin) {
        Ok(true) => (true, Effect::Changed { update: update.to_vec() }),
        Ok(false) => (true, Effect::None),
        Err(e) => {
            warn!(document = %document.name(), socket = socket_id, "rejected update: {e}");
            (false, Effect::None)
        }
    };
    if let Some(socket_id) = socket_id {
        let status = OutgoingMessage::new(document.name()).sync_status(applied);
        document.send(socket_id, status);
    }
    effect
}
