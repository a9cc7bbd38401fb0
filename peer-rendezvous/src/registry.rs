//! Shared directory of connected clients.
//!
//! Every operation takes the registry lock for its full duration and never
//! awaits while holding it. The rendezvous broker uses the `*_request`
//! operations as the locked steps around its unlocked wait for a reply.

use std::{
    net::SocketAddr,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tracing::debug;

use crate::{command::Visibility, dispatcher::ClientHandle, rendezvous::RendezvousRequest};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{0} is not available")]
    UnknownClient(String),
    #[error("{0} is busy with another connection request")]
    TargetBusy(String),
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: String,
    pub handle: ClientHandle,
    pub address: SocketAddr,
    pub visibility: Visibility,
    pending: Option<PendingMarker>,
}

impl ClientRecord {
    /// Requester id of the connection request currently awaiting this client's answer.
    pub fn pending_requester(&self) -> Option<&str> {
        self.pending.as_ref().map(|marker| marker.requester.as_str())
    }
}

#[derive(Debug, Clone)]
struct PendingMarker {
    ticket: u64,
    requester: String,
}

#[derive(Debug, Default)]
pub struct Registry {
    clients: Mutex<Vec<ClientRecord>>,
    next_ticket: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a client, suffixing `_1`, `_2`, ... onto the id until it is unique.
    pub fn register(
        &self,
        requested_id: &str,
        handle: ClientHandle,
        address: SocketAddr,
        visibility: Visibility,
    ) -> String {
        let mut clients = self.lock();
        let id = unique_id(requested_id, &clients);
        debug!(requested_id, id, %address, %visibility, "registering client");
        clients.push(ClientRecord {
            id: id.clone(),
            handle,
            address,
            visibility,
            pending: None,
        });
        id
    }

    pub fn unregister(&self, id: &str) -> Option<ClientRecord> {
        let mut clients = self.lock();
        let index = clients.iter().position(|client| client.id == id)?;
        Some(clients.remove(index))
    }

    pub fn set_visibility(&self, id: &str, visibility: Visibility) -> Result<(), RegistryError> {
        let mut clients = self.lock();
        let client = find_mut(&mut clients, id)?;
        client.visibility = visibility;
        Ok(())
    }

    pub fn list_public(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|client| client.visibility == Visibility::Public)
            .map(|client| client.id.clone())
            .collect()
    }

    pub fn lookup(&self, id: &str) -> Result<ClientRecord, RegistryError> {
        let clients = self.lock();
        clients
            .iter()
            .find(|client| client.id == id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownClient(id.to_string()))
    }

    /// Handles of every registered client, in registration order.
    pub fn handles(&self) -> Vec<ClientHandle> {
        self.lock().iter().map(|client| client.handle.clone()).collect()
    }

    /// Marks `target` as solicited by `requester`.
    ///
    /// Fails with [`RegistryError::TargetBusy`] instead of queueing when the
    /// target already has a pending request.
    pub fn begin_request(
        &self,
        requester: &str,
        target: &str,
    ) -> Result<(RendezvousRequest, ClientHandle), RegistryError> {
        let mut clients = self.lock();
        let record = find_mut(&mut clients, target)?;
        if record.pending.is_some() {
            return Err(RegistryError::TargetBusy(target.to_string()));
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        record.pending = Some(PendingMarker {
            ticket,
            requester: requester.to_string(),
        });

        let request = RendezvousRequest::new(ticket, requester, target);
        Ok((request, record.handle.clone()))
    }

    /// Applies an accepted request: both parties turn private and the marker clears.
    ///
    /// Returns `(requester address, target address)`. Nothing changes beyond the
    /// cleared marker if either party already left.
    pub fn accept_request(
        &self,
        request: &RendezvousRequest,
    ) -> Result<(SocketAddr, SocketAddr), RegistryError> {
        let mut clients = self.lock();
        clear_marker(&mut clients, request);

        let requester = position(&clients, &request.requester)?;
        let target = position(&clients, &request.target)?;

        clients[requester].visibility = Visibility::Private;
        clients[target].visibility = Visibility::Private;
        Ok((clients[requester].address, clients[target].address))
    }

    /// Clears the target's marker if it still belongs to `request`.
    pub fn finish_request(&self, request: &RendezvousRequest) {
        let mut clients = self.lock();
        clear_marker(&mut clients, request);
    }

    /// Drops every pending marker that `id` placed as a requester or is the target of.
    pub fn release_requests(&self, id: &str) {
        let mut clients = self.lock();
        for client in clients.iter_mut() {
            if client.id == id || client.pending_requester() == Some(id) {
                if let Some(marker) = client.pending.take() {
                    debug!(target_id = %client.id, requester = %marker.requester, "releasing pending request");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ClientRecord>> {
        // A panic elsewhere must not wedge every other connection.
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unique_id(requested_id: &str, clients: &[ClientRecord]) -> String {
    let taken = |candidate: &str| clients.iter().any(|client| client.id == candidate);
    if !taken(requested_id) {
        return requested_id.to_string();
    }

    let mut suffix = 1u64;
    loop {
        let candidate = format!("{requested_id}_{suffix}");
        if !taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

fn position(clients: &[ClientRecord], id: &str) -> Result<usize, RegistryError> {
    clients
        .iter()
        .position(|client| client.id == id)
        .ok_or_else(|| RegistryError::UnknownClient(id.to_string()))
}

fn find_mut<'a>(
    clients: &'a mut [ClientRecord],
    id: &str,
) -> Result<&'a mut ClientRecord, RegistryError> {
    clients
        .iter_mut()
        .find(|client| client.id == id)
        .ok_or_else(|| RegistryError::UnknownClient(id.to_string()))
}

fn clear_marker(clients: &mut [ClientRecord], request: &RendezvousRequest) {
    if let Ok(target) = find_mut(clients, &request.target) {
        if target.pending.as_ref().map(|marker| marker.ticket) == Some(request.ticket) {
            target.pending = None;
        }
    }
}
