mod root;
mod document;
mod client;
pub(crate) mod messages;

pub(crate) use root::{Root, RootArgs};
pub(crate) use document::{DocActor, SERVER_SOCKET_ID};
pub(crate) use messages::*;
