//! Registry of calls and messages shared by every peer.
//!
//! Calls and messages are registered per direction. A *client* call is made
//! by the client and answered by the server; a *server* call goes the other
//! way. The registry is built once, then frozen behind an `Arc` and handed to
//! each [`Peer`](crate::Peer).

use crate::descriptor::{Call, CallHandler, Message, MessageHandler};
use crate::error::RegistryError;
use peerwire_protocol::{Advert, Type, MAX_SAFE_INTEGER};
use std::collections::HashMap;
use std::sync::Arc;

/// Which end of the connection a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_server(&self) -> bool {
        matches!(self, Side::Server)
    }
}

/// Common accessors used by [`Table`].
pub trait Descriptor {
    fn id(&self) -> u64;
    fn name(&self) -> &str;
    fn hash(&self) -> &bytes::Bytes;
}

impl Descriptor for Call {
    fn id(&self) -> u64 {
        Call::id(self)
    }

    fn name(&self) -> &str {
        Call::name(self)
    }

    fn hash(&self) -> &bytes::Bytes {
        Call::hash(self)
    }
}

impl Descriptor for Message {
    fn id(&self) -> u64 {
        Message::id(self)
    }

    fn name(&self) -> &str {
        Message::name(self)
    }

    fn hash(&self) -> &bytes::Bytes {
        Message::hash(self)
    }
}

/// Descriptors indexed by id and by name.
#[derive(Debug)]
pub struct Table<T> {
    by_id: HashMap<u64, Arc<T>>,
    by_name: HashMap<String, Arc<T>>,
    list: Vec<Arc<T>>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            list: Vec::new(),
        }
    }
}

impl<T: Descriptor> Table<T> {
    fn insert(&mut self, item: T) -> Result<(), RegistryError> {
        let id = item.id();
        if id == 0 || id > MAX_SAFE_INTEGER {
            return Err(RegistryError::InvalidId {
                id,
                name: item.name().to_string(),
            });
        }
        if self.by_id.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        if self.by_name.contains_key(item.name()) {
            return Err(RegistryError::DuplicateName(item.name().to_string()));
        }

        let item = Arc::new(item);
        self.by_id.insert(id, Arc::clone(&item));
        self.by_name.insert(item.name().to_string(), Arc::clone(&item));
        self.list.push(item);
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<&Arc<T>> {
        self.by_id.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<T>> {
        self.by_name.get(name)
    }

    /// Descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Id and hash of every descriptor, as listed in a handshake.
    pub fn adverts(&self) -> Vec<Advert> {
        self.list
            .iter()
            .map(|d| Advert {
                id: d.id(),
                hash: d.hash().clone(),
            })
            .collect()
    }
}

/// All calls and messages known to an application.
#[derive(Debug, Default)]
pub struct Registry {
    client_calls: Table<Call>,
    server_calls: Table<Call>,
    client_messages: Table<Message>,
    server_messages: Table<Message>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call made by clients and answered by servers.
    pub fn add_client_call(
        &mut self,
        id: u64,
        name: impl Into<String>,
        input: Option<Type>,
        output: Option<Type>,
        handler: Option<CallHandler>,
    ) -> Result<(), RegistryError> {
        self.client_calls
            .insert(Call::new(id, name, input, output, handler))
    }

    /// Registers a call made by servers and answered by clients.
    pub fn add_server_call(
        &mut self,
        id: u64,
        name: impl Into<String>,
        input: Option<Type>,
        output: Option<Type>,
        handler: Option<CallHandler>,
    ) -> Result<(), RegistryError> {
        self.server_calls
            .insert(Call::new(id, name, input, output, handler))
    }

    /// Registers a message sent by clients to servers.
    pub fn add_client_message(
        &mut self,
        id: u64,
        name: impl Into<String>,
        input: Option<Type>,
        handler: Option<MessageHandler>,
    ) -> Result<(), RegistryError> {
        self.client_messages
            .insert(Message::new(id, name, input, handler))
    }

    /// Registers a message sent by servers to clients.
    pub fn add_server_message(
        &mut self,
        id: u64,
        name: impl Into<String>,
        input: Option<Type>,
        handler: Option<MessageHandler>,
    ) -> Result<(), RegistryError> {
        self.server_messages
            .insert(Message::new(id, name, input, handler))
    }

    /// Calls `side` makes.
    pub fn local_calls(&self, side: Side) -> &Table<Call> {
        match side {
            Side::Client => &self.client_calls,
            Side::Server => &self.server_calls,
        }
    }

    /// Calls `side` answers.
    pub fn remote_calls(&self, side: Side) -> &Table<Call> {
        match side {
            Side::Client => &self.server_calls,
            Side::Server => &self.client_calls,
        }
    }

    /// Messages `side` sends.
    pub fn local_messages(&self, side: Side) -> &Table<Message> {
        match side {
            Side::Client => &self.client_messages,
            Side::Server => &self.server_messages,
        }
    }

    /// Messages `side` receives.
    pub fn remote_messages(&self, side: Side) -> &Table<Message> {
        match side {
            Side::Client => &self.server_messages,
            Side::Server => &self.client_messages,
        }
    }
}
