use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::ProtocolConfig;
use crate::directory::{PeerDirectory, PeerRecord};
use crate::messaging::message::{GroupKind, Message, MessageBody, MessageKind, RejectReason, UserRecord, BROADCAST_GROUP_ID, NO_GROUP_ID, PUBLIC_GROUP_ID, SERVER_ID};
use crate::messaging::reliable_session::{AckOutcome, InboundVerdict, ReliableSession, TimerOutcome};
use crate::messaging::transport::{send_message, Transport};
use crate::server::id_pool::IdPool;
use crate::util::random::Random;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ClientPhase {
    /// The client does not count as connected before it confirmed the ConnectionAccept
    AwaitingAcceptAck,
    Connected,
}

#[derive(Debug, Clone)]
struct PendingInvitation {
    inviter: u8,
    group_id: u8,
    kind: GroupKind,
    /// part of a group creation rather than an invitation into an existing group
    creation: bool,
    deadline: Instant,
}

struct ConnectedClient {
    session: ReliableSession,
    group_kind: GroupKind,
    phase: ClientPhase,
    invitation: Option<PendingInvitation>,
}

#[derive(Debug)]
struct PendingCreation {
    initiator: u8,
    kind: GroupKind,
    /// invitees that did not answer yet
    outstanding: usize,
    /// at least one invitee accepted, and the group exists
    finalized: bool,
}

/// The server's protocol logic: connection handshake, relaying of centralized group traffic,
///  group creation and invitations, and membership propagation.
///
/// All state is owned by the controller and mutated from a single event loop (see
///  [crate::server::server_driver::run_server]), so no locking is involved. Handlers get the
///  current time passed in, and timers are deadlines polled through [ServerController::next_deadline].
pub struct ServerController {
    config: Arc<ProtocolConfig>,
    transport: Arc<dyn Transport>,
    client_ids: IdPool,
    group_ids: IdPool,
    directory: PeerDirectory,
    clients: FxHashMap<u8, ConnectedClient>,
    creations: FxHashMap<u8, PendingCreation>,
}

impl ServerController {
    pub fn new(config: Arc<ProtocolConfig>, transport: Arc<dyn Transport>, random: &mut dyn Random) -> ServerController {
        ServerController {
            config,
            transport,
            client_ids: IdPool::new("client ids", 1..=u8::MAX, random),
            group_ids: IdPool::new("group ids", PUBLIC_GROUP_ID + 1..=u8::MAX, random),
            directory: PeerDirectory::new(),
            clients: FxHashMap::default(),
            creations: FxHashMap::default(),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn group_of(&self, client_id: u8) -> Option<(u8, GroupKind)> {
        let group_id = self.directory.find(client_id)?.group_id;
        let kind = self.clients.get(&client_id)?.group_kind;
        Some((group_id, kind))
    }

    pub fn find_client(&self, username: &str) -> Option<u8> {
        self.directory.find_by_username(username)
            .map(|p| p.id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.clients.values()
            .flat_map(|c| [c.session.deadline(), c.invitation.as_ref().map(|i| i.deadline)])
            .flatten()
            .min()
    }

    pub async fn on_datagram(&mut self, buf: &[u8], from: SocketAddr, now: Instant) {
        let msg = match Message::decode(buf) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(?from, "dropping undecodable datagram: {}", e);
                return;
            }
        };
        trace!(?from, ?msg, "received message");

        if msg.kind() == MessageKind::ConnectionRequest && !msg.is_ack() {
            self.on_connection_request(msg, from, now).await;
            return;
        }

        let client_id = msg.source_id;
        let client = match self.clients.get_mut(&client_id) {
            Some(client) if client.session.peer_addr() == from => client,
            _ => {
                if msg.kind() == MessageKind::DisconnectionRequest && !msg.is_ack() {
                    debug!(?from, client_id, "disconnection request from unknown client - acknowledging anyway");
                    send_message(self.transport.as_ref(), from, &msg.ack_for(SERVER_ID)).await;
                }
                else {
                    debug!(?from, client_id, kind = ?msg.kind(), "message from unknown client - discarding");
                }
                return;
            }
        };

        if msg.is_ack() {
            let outcome = client.session.on_ack(msg.sequence, msg.kind(), now);
            self.on_completion(client_id, outcome, now).await;
            return;
        }

        let verdict = client.session.on_inbound(msg.sequence);
        send_message(self.transport.as_ref(), from, &msg.ack_for(SERVER_ID)).await;
        if verdict == InboundVerdict::Duplicate {
            return;
        }

        if client.phase == ClientPhase::AwaitingAcceptAck {
            // the client only sends other messages after it received its ConnectionAccept
            let outcome = client.session.complete_implicitly(MessageKind::ConnectionAccept, now);
            self.on_completion(client_id, outcome, now).await;
        }

        match msg.body {
            MessageBody::UserListRequest => self.on_user_list_request(client_id, now).await,
            MessageBody::DataMessage { text } => self.on_data_message(client_id, text, now).await,
            MessageBody::GroupCreationRequest { kind, client_ids } => self.on_group_creation_request(client_id, kind, client_ids, now).await,
            MessageBody::GroupInvitationRequest { client_id: target, .. } => self.on_group_invitation_request(client_id, target, now).await,
            MessageBody::GroupInvitationAccept { group_id, .. } => self.on_group_invitation_accept(client_id, group_id, now).await,
            MessageBody::GroupInvitationReject { group_id, .. } => self.on_group_invitation_reject(client_id, group_id, now).await,
            MessageBody::GroupDisjointRequest => self.on_group_disjoint_request(client_id, now).await,
            MessageBody::DisconnectionRequest => {
                info!(client_id, "client disconnected");
                self.remove_client(client_id, now).await;
            }
            other => {
                debug!(client_id, kind = ?other.kind(), "message kind is not expected by the server - ignoring");
            }
        }
    }

    pub async fn on_timer(&mut self, now: Instant) {
        let mut client_ids = self.clients.keys().copied().collect::<Vec<_>>();
        client_ids.sort();

        for client_id in client_ids {
            let Some(client) = self.clients.get_mut(&client_id) else {
                continue;
            };

            match client.session.on_timer(now) {
                TimerOutcome::Nothing => {}
                TimerOutcome::Retransmit(msg) => {
                    send_message(self.transport.as_ref(), client.session.peer_addr(), &msg).await;
                }
                TimerOutcome::Exhausted => {
                    info!(client_id, "client is unreachable - removing it");
                    self.remove_client(client_id, now).await;
                    continue;
                }
            }

            let expired = client.invitation.as_ref()
                .is_some_and(|i| i.deadline <= now);
            if let Some(invitation) = expired.then(|| client.invitation.take()).flatten() {
                debug!(client_id, group_id = invitation.group_id, "invitation timed out");
                self.on_invitation_declined(client_id, invitation, now).await;
            }
        }
    }

    async fn on_completion(&mut self, client_id: u8, outcome: AckOutcome, now: Instant) {
        let AckOutcome::Completed { acked, next } = outcome else {
            return;
        };
        if let Some(next) = next {
            self.send_to_client(client_id, &next).await;
        }

        if acked.kind() == MessageKind::ConnectionAccept {
            self.on_accept_acknowledged(client_id, now).await;
        }
    }

    async fn on_connection_request(&mut self, msg: Message, from: SocketAddr, now: Instant) {
        let MessageBody::ConnectionRequest { username } = &msg.body else {
            return;
        };
        let SocketAddr::V4(addr) = from else {
            warn!(?from, "connection request over IPv6 cannot be represented on the wire - dropping");
            return;
        };

        if let Some(existing) = self.clients.iter()
            .find(|(_, c)| c.session.peer_addr() == from)
            .map(|(id, _)| *id)
        {
            if self.directory.find(existing).map(|p| &p.username) == Some(username) {
                debug!(?from, username, "repeated connection request - the ConnectionAccept is retransmitted anyway");
            }
            else {
                warn!(?from, username, "connection request from an address that has a session for a different user - ignoring");
            }
            return;
        }

        let reject_reason = if self.client_ids.is_exhausted() {
            Some(RejectReason::ServerFull)
        }
        else if username.is_empty() || self.directory.find_by_username(username).is_some() {
            Some(RejectReason::UsernameTaken)
        }
        else {
            None
        };
        if let Some(reason) = reject_reason {
            info!(?from, username, ?reason, "rejecting connection request");
            let reject = Message {
                sequence: msg.sequence,
                source_id: SERVER_ID,
                group_id: NO_GROUP_ID,
                body: MessageBody::ConnectionReject { reason },
            };
            send_message(self.transport.as_ref(), from, &reject).await;
            return;
        }

        let Some(client_id) = self.client_ids.acquire() else {
            return;
        };
        info!(?from, username, client_id, "accepting connection");

        self.directory.upsert(PeerRecord {
            id: client_id,
            username: username.clone(),
            group_id: PUBLIC_GROUP_ID,
            addr,
        });
        self.clients.insert(client_id, ConnectedClient {
            session: ReliableSession::new(from, &self.config)
                .with_last_received(msg.sequence),
            group_kind: GroupKind::Centralized,
            phase: ClientPhase::AwaitingAcceptAck,
            invitation: None,
        });

        self.send_reliably(client_id, Message::new(SERVER_ID, PUBLIC_GROUP_ID, MessageBody::ConnectionAccept { client_id }), now).await;
    }

    async fn on_accept_acknowledged(&mut self, client_id: u8, now: Instant) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        if client.phase == ClientPhase::Connected {
            return;
        }
        client.phase = ClientPhase::Connected;
        debug!(client_id, "connection confirmed - announcing new client");
        self.broadcast_update(&[client_id], now).await;
    }

    async fn on_user_list_request(&mut self, client_id: u8, now: Instant) {
        let users = self.connected_records();
        debug!(client_id, num_users = users.len(), "sending user list");
        self.send_reliably(client_id, Message::new(SERVER_ID, BROADCAST_GROUP_ID, MessageBody::UserListResponse { users }), now).await;
    }

    async fn on_data_message(&mut self, sender: u8, text: String, now: Instant) {
        let Some((group_id, kind)) = self.group_of(sender) else {
            return;
        };
        if kind.is_decentralized() {
            debug!(sender, group_id, "data message from a decentralized group is not relayed");
            return;
        }

        let recipients = self.connected_members_of(group_id)
            .into_iter()
            .filter(|id| *id != sender)
            .collect::<Vec<_>>();
        trace!(sender, group_id, ?recipients, "relaying data message");
        for recipient in recipients {
            let relayed = Message::new(sender, group_id, MessageBody::DataMessage { text: text.clone() });
            self.send_reliably(recipient, relayed, now).await;
        }
    }

    async fn on_group_creation_request(&mut self, initiator: u8, kind: GroupKind, client_ids: Vec<u8>, now: Instant) {
        let initiator_is_idle = self.group_of(initiator).map(|(g, _)| g) == Some(PUBLIC_GROUP_ID)
            && !self.is_busy(initiator)
            && !self.creations.values().any(|c| c.initiator == initiator && !c.finalized);
        if !initiator_is_idle {
            debug!(initiator, "initiator cannot create a group in its current state - rejecting");
            self.send_reliably(initiator, Message::new(SERVER_ID, NO_GROUP_ID, MessageBody::GroupCreationReject), now).await;
            return;
        }

        let mut targets = Vec::new();
        for target in client_ids {
            if target != initiator && !targets.contains(&target) && self.is_invitable(target) {
                targets.push(target);
            }
            else {
                debug!(initiator, target, "skipping invalid group creation target");
            }
        }

        let group_id = if targets.is_empty() { None } else { self.group_ids.acquire() };
        let Some(group_id) = group_id else {
            info!(initiator, "no group created: no valid invitees or no free group id");
            self.send_reliably(initiator, Message::new(SERVER_ID, NO_GROUP_ID, MessageBody::GroupCreationReject), now).await;
            return;
        };

        info!(initiator, group_id, ?kind, ?targets, "starting group creation");
        self.creations.insert(group_id, PendingCreation {
            initiator,
            kind,
            outstanding: targets.len(),
            finalized: false,
        });
        for target in targets {
            self.invite(initiator, target, group_id, kind, true, now).await;
        }
    }

    async fn on_group_invitation_request(&mut self, inviter: u8, target: u8, now: Instant) {
        let Some((group_id, kind)) = self.group_of(inviter) else {
            return;
        };
        if group_id == PUBLIC_GROUP_ID {
            debug!(inviter, "invitation from the public group - ignoring");
            return;
        }

        let target_is_valid = target != inviter
            && self.is_invitable(target)
            && self.group_of(target).map(|(g, _)| g) != Some(group_id);
        if !target_is_valid {
            debug!(inviter, target, "invitation target is busy or invalid - rejecting");
            let reject = Message::new(target, group_id, MessageBody::GroupInvitationReject { kind, group_id });
            self.send_reliably(inviter, reject, now).await;
            return;
        }

        info!(inviter, target, group_id, "inviting client into existing group");
        self.invite(inviter, target, group_id, kind, false, now).await;
    }

    async fn invite(&mut self, inviter: u8, target: u8, group_id: u8, kind: GroupKind, creation: bool, now: Instant) {
        let Some(client) = self.clients.get_mut(&target) else {
            return;
        };
        client.invitation = Some(PendingInvitation {
            inviter,
            group_id,
            kind,
            creation,
            deadline: now + self.config.invitation_timeout,
        });

        let request = Message::new(inviter, group_id, MessageBody::GroupInvitationRequest { kind, group_id, client_id: target });
        self.send_reliably(target, request, now).await;
    }

    /// Removes the invitee's pending invitation if it is the one being answered. An answer for
    ///  an older invitation must leave a newer one untouched.
    fn take_invitation(&mut self, invitee: u8, group_id: u8) -> Option<PendingInvitation> {
        let client = self.clients.get_mut(&invitee)?;
        if client.invitation.as_ref()?.group_id != group_id {
            return None;
        }
        client.invitation.take()
    }

    async fn on_group_invitation_accept(&mut self, invitee: u8, answered_group_id: u8, now: Instant) {
        let Some(invitation) = self.take_invitation(invitee, answered_group_id) else {
            debug!(invitee, group_id = answered_group_id, "accept for an unknown invitation - dissolving");
            self.send_reliably(invitee, Message::new(SERVER_ID, NO_GROUP_ID, MessageBody::GroupDissolution), now).await;
            return;
        };
        let group_id = invitation.group_id;

        if invitation.creation {
            if let Some(creation) = self.creations.get_mut(&group_id) {
                creation.outstanding = creation.outstanding.saturating_sub(1);
                if !creation.finalized {
                    creation.finalized = true;
                    let initiator = creation.initiator;
                    let kind = creation.kind;
                    self.finalize_creation(initiator, invitee, group_id, kind, now).await;
                    self.forget_creation_if_answered(group_id);
                    return;
                }
                self.forget_creation_if_answered(group_id);
            }
        }

        if self.connected_members_of(group_id).is_empty() {
            debug!(invitee, group_id, "accepted invitation into a group that no longer exists - dissolving");
            self.send_reliably(invitee, Message::new(SERVER_ID, group_id, MessageBody::GroupDissolution), now).await;
            self.release_group_if_unused(group_id);
            return;
        }

        info!(invitee, group_id, "client joined group");
        self.move_to_group(invitee, group_id, invitation.kind, now).await;
    }

    async fn finalize_creation(&mut self, initiator: u8, invitee: u8, group_id: u8, kind: GroupKind, now: Instant) {
        info!(initiator, invitee, group_id, ?kind, "group created");

        let old_groups = [initiator, invitee].map(|id| self.set_group(id, group_id, kind));
        self.send_reliably(initiator, Message::new(SERVER_ID, group_id, MessageBody::GroupCreationAccept { kind, group_id }), now).await;
        self.broadcast_update(&[initiator, invitee], now).await;

        for old_group in old_groups.into_iter().flatten() {
            self.collapse_if_too_small(old_group, now).await;
        }
    }

    async fn on_group_invitation_reject(&mut self, invitee: u8, answered_group_id: u8, now: Instant) {
        let Some(invitation) = self.take_invitation(invitee, answered_group_id) else {
            debug!(invitee, group_id = answered_group_id, "reject for an unknown invitation - ignoring");
            return;
        };
        self.on_invitation_declined(invitee, invitation, now).await;
    }

    /// explicit reject, timeout or the invitee's departure
    async fn on_invitation_declined(&mut self, invitee: u8, invitation: PendingInvitation, now: Instant) {
        let PendingInvitation { inviter, group_id, kind, creation, .. } = invitation;
        debug!(invitee, inviter, group_id, "invitation declined");

        if self.clients.contains_key(&inviter) {
            let reject = Message::new(invitee, group_id, MessageBody::GroupInvitationReject { kind, group_id });
            self.send_reliably(inviter, reject, now).await;
        }

        if creation {
            if let Some(pending) = self.creations.get_mut(&group_id) {
                pending.outstanding = pending.outstanding.saturating_sub(1);
                if pending.outstanding == 0 && !pending.finalized {
                    info!(initiator = pending.initiator, group_id, "all invitees declined - group creation failed");
                    let initiator = pending.initiator;
                    self.creations.remove(&group_id);
                    self.send_reliably(initiator, Message::new(SERVER_ID, NO_GROUP_ID, MessageBody::GroupCreationReject), now).await;
                }
                else {
                    self.forget_creation_if_answered(group_id);
                }
            }
        }
        self.release_group_if_unused(group_id);
    }

    async fn on_group_disjoint_request(&mut self, client_id: u8, now: Instant) {
        let Some((old_group, _)) = self.group_of(client_id) else {
            return;
        };
        if old_group == PUBLIC_GROUP_ID {
            debug!(client_id, "disjoint request from the public group - ignoring");
            return;
        }

        info!(client_id, old_group, "client left group");
        self.move_to_group(client_id, PUBLIC_GROUP_ID, GroupKind::Centralized, now).await;
    }

    /// moves a client, announces the move and checks whether the group it left is still viable
    async fn move_to_group(&mut self, client_id: u8, group_id: u8, kind: GroupKind, now: Instant) {
        let old_group = self.set_group(client_id, group_id, kind);
        self.broadcast_update(&[client_id], now).await;
        if let Some(old_group) = old_group {
            self.collapse_if_too_small(old_group, now).await;
        }
    }

    /// returns the previous group if it changed
    fn set_group(&mut self, client_id: u8, group_id: u8, kind: GroupKind) -> Option<u8> {
        let old_group = self.directory.find(client_id)?.group_id;
        self.directory.set_group(client_id, group_id);
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.group_kind = kind;
        }
        (old_group != group_id).then_some(old_group)
    }

    /// A group needs at least two members: a single remaining member is sent back to the public group
    async fn collapse_if_too_small(&mut self, group_id: u8, now: Instant) {
        if group_id == PUBLIC_GROUP_ID {
            return;
        }

        let members = self.directory.members_of(group_id)
            .iter()
            .map(|p| p.id)
            .collect::<Vec<_>>();
        if let &[remaining] = members.as_slice() {
            info!(group_id, remaining, "group dissolved");
            self.send_reliably(remaining, Message::new(SERVER_ID, group_id, MessageBody::GroupDissolution), now).await;
            self.set_group(remaining, PUBLIC_GROUP_ID, GroupKind::Centralized);
            self.broadcast_update(&[remaining], now).await;
        }
        self.release_group_if_unused(group_id);
    }

    fn forget_creation_if_answered(&mut self, group_id: u8) {
        if let Some(creation) = self.creations.get(&group_id) {
            if creation.finalized && creation.outstanding == 0 {
                self.creations.remove(&group_id);
            }
        }
    }

    fn release_group_if_unused(&mut self, group_id: u8) {
        if group_id == PUBLIC_GROUP_ID || group_id == NO_GROUP_ID {
            return;
        }
        let in_use = !self.directory.members_of(group_id).is_empty()
            || self.creations.contains_key(&group_id)
            || self.clients.values().any(|c| c.invitation.as_ref().map(|i| i.group_id) == Some(group_id));
        if !in_use {
            debug!(group_id, "releasing group id");
            self.group_ids.release(group_id);
        }
    }

    async fn remove_client(&mut self, client_id: u8, now: Instant) {
        let Some(client) = self.clients.remove(&client_id) else {
            return;
        };
        let record = self.directory.remove(client_id);
        self.client_ids.release(client_id);

        if client.phase == ClientPhase::AwaitingAcceptAck {
            debug!(client_id, "client left before its connection was confirmed - nobody to notify");
            return;
        }

        if let Some(invitation) = client.invitation {
            self.on_invitation_declined(client_id, invitation, now).await;
        }

        let abandoned = self.creations.iter()
            .filter(|(_, c)| c.initiator == client_id)
            .map(|(group_id, _)| *group_id)
            .collect::<Vec<_>>();
        for group_id in abandoned {
            debug!(client_id, group_id, "initiator left - abandoning group creation");
            self.creations.remove(&group_id);
            self.release_group_if_unused(group_id);
        }

        if let Some(record) = record {
            self.collapse_if_too_small(record.group_id, now).await;
        }

        for recipient in self.connected_ids() {
            let update = Message::new(SERVER_ID, BROADCAST_GROUP_ID, MessageBody::UpdateDisconnection { client_id });
            self.send_reliably(recipient, update, now).await;
        }
    }

    /// Sends the current records of the given clients to all other connected clients. A client
    ///  is never told about itself.
    async fn broadcast_update(&mut self, changed: &[u8], now: Instant) {
        let records = changed.iter()
            .filter_map(|id| self.directory.find(*id))
            .map(UserRecord::from)
            .collect::<Vec<_>>();

        for recipient in self.connected_ids() {
            let users = records.iter()
                .filter(|r| r.client_id != recipient)
                .cloned()
                .collect::<Vec<_>>();
            if users.is_empty() {
                continue;
            }
            self.send_reliably(recipient, Message::new(SERVER_ID, BROADCAST_GROUP_ID, MessageBody::UpdateList { users }), now).await;
        }
    }

    fn is_busy(&self, client_id: u8) -> bool {
        self.clients.get(&client_id)
            .map(|c| c.invitation.is_some())
            .unwrap_or(false)
    }

    fn is_invitable(&self, client_id: u8) -> bool {
        match self.clients.get(&client_id) {
            Some(client) => client.phase == ClientPhase::Connected
                && client.invitation.is_none()
                && !self.creations.values().any(|c| c.initiator == client_id && !c.finalized),
            None => false,
        }
    }

    fn connected_ids(&self) -> Vec<u8> {
        let mut result = self.clients.iter()
            .filter(|(_, c)| c.phase == ClientPhase::Connected)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    fn connected_members_of(&self, group_id: u8) -> Vec<u8> {
        self.directory.members_of(group_id)
            .into_iter()
            .map(|p| p.id)
            .filter(|id| self.clients.get(id).map(|c| c.phase) == Some(ClientPhase::Connected))
            .collect()
    }

    fn connected_records(&self) -> Vec<UserRecord> {
        self.directory.all()
            .into_iter()
            .filter(|p| self.clients.get(&p.id).map(|c| c.phase) == Some(ClientPhase::Connected))
            .map(UserRecord::from)
            .collect()
    }

    async fn send_reliably(&mut self, client_id: u8, msg: Message, now: Instant) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            debug!(client_id, kind = ?msg.kind(), "no session for client - not sending");
            return;
        };
        if let Some(msg) = client.session.send(msg, now) {
            send_message(self.transport.as_ref(), client.session.peer_addr(), &msg).await;
        }
    }

    async fn send_to_client(&self, client_id: u8, msg: &Message) {
        if let Some(client) = self.clients.get(&client_id) {
            send_message(self.transport.as_ref(), client.session.peer_addr(), msg).await;
        }
    }
}
