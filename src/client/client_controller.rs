use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::client::client_events::{ClientEvent, ClientEventNotifier};
use crate::client::command::{parse_answer, UserError, UserInput};
use crate::config::ProtocolConfig;
use crate::directory::{PeerDirectory, PeerRecord, UpsertOutcome};
use crate::messaging::message::{normalize_username, GroupKind, Message, MessageBody, MessageKind, UserRecord, MAX_TEXT_LEN, NO_GROUP_ID, PUBLIC_GROUP_ID, SERVER_ID};
use crate::messaging::reliable_session::{AckOutcome, InboundVerdict, ReliableSession, SessionState, TimerOutcome};
use crate::messaging::transport::{send_message, Transport};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientState {
    PendingConnection,
    Normal,
    WaitingGroupCreation,
    PendingInvitation,
    PendingDisconnection,
    Disconnected,
}

#[derive(Debug, Clone)]
struct ReceivedInvitation {
    inviter: u8,
    group_id: u8,
    kind: GroupKind,
    deadline: Instant,
}

/// Drives one user's side of the protocol: the connection handshake, group operations, and
///  routing chat messages either through the server or (in a decentralized group) directly to
///  the other members.
///
/// Like the server, the controller owns all of its state and is driven by a single event loop
///  ([crate::client::client_driver::run_client]).
pub struct ClientController {
    config: Arc<ProtocolConfig>,
    transport: Arc<dyn Transport>,
    server_addr: SocketAddr,
    notifier: Arc<ClientEventNotifier>,

    state: ClientState,
    username: Option<String>,
    client_id: Option<u8>,
    group_id: u8,
    group_kind: GroupKind,
    directory: PeerDirectory,

    server_session: ReliableSession,
    peer_sessions: FxHashMap<u8, ReliableSession>,
    invitation: Option<ReceivedInvitation>,
}

impl ClientController {
    pub fn new(config: Arc<ProtocolConfig>, transport: Arc<dyn Transport>, server_addr: SocketAddr, notifier: Arc<ClientEventNotifier>) -> ClientController {
        let server_session = ReliableSession::new(server_addr, &config);
        ClientController {
            config,
            transport,
            server_addr,
            notifier,
            state: ClientState::PendingConnection,
            username: None,
            client_id: None,
            group_id: PUBLIC_GROUP_ID,
            group_kind: GroupKind::Centralized,
            directory: PeerDirectory::new(),
            server_session,
            peer_sessions: FxHashMap::default(),
            invitation: None,
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn notifier(&self) -> Arc<ClientEventNotifier> {
        self.notifier.clone()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn client_id(&self) -> Option<u8> {
        self.client_id
    }

    pub fn group(&self) -> (u8, GroupKind) {
        (self.group_id, self.group_kind)
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn has_peer_session(&self, peer_id: u8) -> bool {
        self.peer_sessions.contains_key(&peer_id)
    }

    pub fn is_finished(&self) -> bool {
        self.state == ClientState::Disconnected
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.peer_sessions.values()
            .map(|s| s.deadline())
            .chain([self.server_session.deadline(), self.invitation.as_ref().map(|i| i.deadline)])
            .flatten()
            .min()
    }

    /// Handles a line of user input. What a line means depends on the state: a username while
    ///  connecting, an answer while an invitation is pending, a chat message or command otherwise.
    pub async fn on_user_input(&mut self, line: &str, now: Instant) -> Result<(), UserError> {
        match self.state {
            ClientState::PendingConnection if !line.starts_with('/') => return self.connect(line, now).await,
            ClientState::PendingInvitation if !line.starts_with('/') => {
                return if parse_answer(line)? {
                    self.accept_invitation(now).await
                }
                else {
                    self.reject_invitation(now).await
                };
            }
            _ => {}
        }

        let input = UserInput::parse(line)?;
        if self.state == ClientState::PendingInvitation && !matches!(input, UserInput::Exit | UserInput::List | UserInput::Help) {
            return Err(UserError::InvalidAnswer);
        }

        match input {
            UserInput::Chat(text) => self.send_chat(&text, now).await,
            UserInput::CreateGroup { kind, usernames } => self.request_group_creation(kind, &usernames, now).await,
            UserInput::InviteGroup { usernames } => self.request_invite(&usernames, now).await,
            UserInput::Disjoint => self.disjoint(now).await,
            UserInput::Exit => self.disconnect(now).await,
            UserInput::List => {
                let peers = self.directory.all().into_iter().cloned().collect();
                self.notifier.send_event(ClientEvent::PeerList { peers });
                Ok(())
            }
            UserInput::Help => {
                self.notifier.send_event(ClientEvent::Help);
                Ok(())
            }
        }
    }

    pub async fn connect(&mut self, username: &str, now: Instant) -> Result<(), UserError> {
        if self.state != ClientState::PendingConnection {
            return Err(UserError::NotAllowed("already connected"));
        }
        if self.server_session.state() == SessionState::AwaitingAck {
            return Err(UserError::NotAllowed("waiting for the server to answer"));
        }
        let username = normalize_username(username);
        if username.is_empty() {
            return Err(UserError::MissingArguments("username"));
        }

        info!(username, server = ?self.server_addr, "connecting");
        self.username = Some(username.clone());
        self.send_to_server(MessageBody::ConnectionRequest { username }, now).await;
        Ok(())
    }

    pub async fn send_chat(&mut self, text: &str, now: Instant) -> Result<(), UserError> {
        if !matches!(self.state, ClientState::Normal | ClientState::WaitingGroupCreation) {
            return Err(UserError::NotAllowed("not connected"));
        }
        if text.len() > MAX_TEXT_LEN {
            return Err(UserError::MessageTooLong);
        }
        if text.is_empty() {
            return Ok(());
        }

        if self.group_kind.is_decentralized() {
            let mut peer_ids = self.peer_sessions.keys().copied().collect::<Vec<_>>();
            peer_ids.sort();
            for peer_id in peer_ids {
                self.send_to_peer(peer_id, MessageBody::DataMessage { text: text.to_string() }, now).await;
            }
        }
        else {
            self.send_to_server(MessageBody::DataMessage { text: text.to_string() }, now).await;
        }
        Ok(())
    }

    /// Usernames that are not in the local directory are dropped
    pub async fn request_group_creation(&mut self, kind: GroupKind, usernames: &[String], now: Instant) -> Result<(), UserError> {
        if self.state != ClientState::Normal || self.group_id != PUBLIC_GROUP_ID {
            return Err(UserError::NotAllowed("groups can only be created from the public group"));
        }

        let client_ids = self.resolve_usernames(usernames);
        debug!(?kind, ?client_ids, "requesting group creation");
        self.state = ClientState::WaitingGroupCreation;
        self.send_to_server(MessageBody::GroupCreationRequest { kind, client_ids }, now).await;
        Ok(())
    }

    pub async fn request_invite(&mut self, usernames: &[String], now: Instant) -> Result<(), UserError> {
        if self.state != ClientState::Normal || self.group_id == PUBLIC_GROUP_ID {
            return Err(UserError::NotAllowed("invitations can only be sent from within a group"));
        }

        for client_id in self.resolve_usernames(usernames) {
            let body = MessageBody::GroupInvitationRequest { kind: self.group_kind, group_id: self.group_id, client_id };
            self.send_to_server(body, now).await;
        }
        Ok(())
    }

    pub async fn accept_invitation(&mut self, now: Instant) -> Result<(), UserError> {
        let invitation = self.take_invitation()?;
        info!(group_id = invitation.group_id, kind = ?invitation.kind, "accepting invitation");

        self.send_to_server(MessageBody::GroupInvitationAccept { kind: invitation.kind, group_id: invitation.group_id }, now).await;
        self.enter_group(invitation.group_id, invitation.kind);
        Ok(())
    }

    pub async fn reject_invitation(&mut self, now: Instant) -> Result<(), UserError> {
        let invitation = self.take_invitation()?;
        debug!(group_id = invitation.group_id, "rejecting invitation");

        self.send_to_server(MessageBody::GroupInvitationReject { kind: invitation.kind, group_id: invitation.group_id }, now).await;
        Ok(())
    }

    fn take_invitation(&mut self) -> Result<ReceivedInvitation, UserError> {
        if self.state != ClientState::PendingInvitation {
            return Err(UserError::NotAllowed("there is no pending invitation"));
        }
        self.state = ClientState::Normal;
        self.invitation.take()
            .ok_or(UserError::NotAllowed("there is no pending invitation"))
    }

    pub async fn disjoint(&mut self, now: Instant) -> Result<(), UserError> {
        if self.state != ClientState::Normal || self.group_id == PUBLIC_GROUP_ID {
            return Err(UserError::NotAllowed("already in the public group"));
        }

        info!(group_id = self.group_id, "leaving group");
        self.send_to_server(MessageBody::GroupDisjointRequest, now).await;
        self.enter_group(PUBLIC_GROUP_ID, GroupKind::Centralized);
        Ok(())
    }

    pub async fn disconnect(&mut self, now: Instant) -> Result<(), UserError> {
        match self.state {
            ClientState::PendingDisconnection | ClientState::Disconnected => {
                return Err(UserError::NotAllowed("already disconnecting"));
            }
            ClientState::PendingConnection if self.client_id.is_none() => {
                self.state = ClientState::Disconnected;
                self.notifier.send_event(ClientEvent::Disconnected);
                return Ok(());
            }
            _ => {}
        }

        info!("disconnecting");
        self.state = ClientState::PendingDisconnection;
        self.invitation = None;
        self.peer_sessions.clear();
        self.send_to_server(MessageBody::DisconnectionRequest, now).await;
        Ok(())
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

        if self.state == ClientState::Disconnected {
            debug!(?from, "disconnected - ignoring message");
            return;
        }

        if from == self.server_addr {
            self.on_server_message(msg, now).await;
        }
        else {
            self.on_peer_message(msg, from, now).await;
        }
    }

    async fn on_server_message(&mut self, msg: Message, now: Instant) {
        if msg.is_ack() {
            let outcome = self.server_session.on_ack(msg.sequence, msg.kind(), now);
            self.on_server_completion(outcome).await;
            return;
        }

        match &msg.body {
            MessageBody::ConnectionAccept { .. } => {
                let outcome = self.server_session.complete_implicitly(MessageKind::ConnectionRequest, now);
                self.on_server_completion(outcome).await;
            }
            MessageBody::ConnectionReject { reason } => {
                // a reject is not acknowledged, and it is not a session message
                let outcome = self.server_session.complete_implicitly(MessageKind::ConnectionRequest, now);
                if matches!(outcome, AckOutcome::Completed { .. }) && self.state == ClientState::PendingConnection {
                    info!(?reason, "connection rejected");
                    self.username = None;
                    self.notifier.send_event(ClientEvent::ConnectionRejected { reason: *reason });
                }
                self.on_server_completion(outcome).await;
                return;
            }
            MessageBody::UserListResponse { .. } => {
                let outcome = self.server_session.complete_implicitly(MessageKind::UserListRequest, now);
                self.on_server_completion(outcome).await;
            }
            _ => {}
        }

        // the ACK for a ConnectionAccept already carries the new id, so the server can match it
        let own_id = match msg.body {
            MessageBody::ConnectionAccept { client_id } if self.client_id.is_none() => client_id,
            _ => self.own_id(),
        };
        let verdict = self.server_session.on_inbound(msg.sequence);
        send_message(self.transport.as_ref(), self.server_addr, &msg.ack_for(own_id)).await;
        if verdict == InboundVerdict::Duplicate {
            return;
        }

        let source_id = msg.source_id;
        match msg.body {
            MessageBody::ConnectionAccept { client_id } => self.on_connection_accept(client_id, now).await,
            MessageBody::UserListResponse { users } => self.on_user_list(users),
            MessageBody::DataMessage { text } => {
                if msg.group_id == self.group_id && !self.group_kind.is_decentralized() {
                    self.on_chat(source_id, text);
                }
                else {
                    debug!(group_id = msg.group_id, "relayed chat message for a different group - ignoring");
                }
            }
            MessageBody::GroupCreationAccept { kind, group_id } => {
                if self.state == ClientState::WaitingGroupCreation {
                    info!(group_id, ?kind, "group created");
                    self.state = ClientState::Normal;
                    self.enter_group(group_id, kind);
                }
            }
            MessageBody::GroupCreationReject => {
                if self.state == ClientState::WaitingGroupCreation {
                    info!("group creation rejected");
                    self.state = ClientState::Normal;
                    self.notifier.send_event(ClientEvent::GroupCreationRejected);
                }
            }
            MessageBody::GroupInvitationRequest { kind, group_id, .. } => self.on_invitation(source_id, kind, group_id, now).await,
            MessageBody::GroupInvitationReject { .. } => {
                let username = self.username_of(source_id);
                self.notifier.send_event(ClientEvent::InvitationRejectedBy { username });
            }
            MessageBody::GroupDissolution => {
                if self.group_id != PUBLIC_GROUP_ID {
                    info!(group_id = self.group_id, "group dissolved");
                    self.enter_group(PUBLIC_GROUP_ID, GroupKind::Centralized);
                    self.notifier.send_event(ClientEvent::GroupDissolved);
                }
            }
            MessageBody::UpdateList { users } => {
                for user in users {
                    self.on_update(&user);
                }
            }
            MessageBody::UpdateDisconnection { client_id } => self.on_peer_disconnected(client_id),
            other => debug!(kind = ?other.kind(), "unexpected message from server - ignoring"),
        }
    }

    async fn on_server_completion(&mut self, outcome: AckOutcome) {
        let AckOutcome::Completed { acked, next } = outcome else {
            return;
        };
        if let Some(next) = next {
            send_message(self.transport.as_ref(), self.server_addr, &next).await;
        }

        if acked.kind() == MessageKind::DisconnectionRequest {
            info!("disconnected");
            self.finish(ClientEvent::Disconnected);
        }
    }

    async fn on_connection_accept(&mut self, client_id: u8, now: Instant) {
        if self.state != ClientState::PendingConnection {
            debug!(client_id, "connection accept in state {:?} - ignoring", self.state);
            return;
        }
        info!(client_id, "connected");
        self.client_id = Some(client_id);
        self.state = ClientState::Normal;
        self.group_id = PUBLIC_GROUP_ID;
        self.group_kind = GroupKind::Centralized;
        self.notifier.send_event(ClientEvent::Connected { client_id });

        self.send_to_server(MessageBody::UserListRequest, now).await;
    }

    fn on_user_list(&mut self, users: Vec<UserRecord>) {
        debug!(num_users = users.len(), "received user list");
        self.directory = PeerDirectory::new();
        for user in &users {
            self.directory.upsert(PeerRecord::from(user));
        }
    }

    fn on_chat(&mut self, source_id: u8, text: String) {
        let from = self.username_of(source_id);
        self.notifier.send_event(ClientEvent::ChatReceived { from, text });
    }

    async fn on_invitation(&mut self, inviter: u8, kind: GroupKind, group_id: u8, now: Instant) {
        if self.state != ClientState::Normal {
            debug!(inviter, group_id, "busy - rejecting invitation in state {:?}", self.state);
            self.send_to_server(MessageBody::GroupInvitationReject { kind, group_id }, now).await;
            return;
        }

        info!(inviter, group_id, ?kind, "received invitation");
        self.state = ClientState::PendingInvitation;
        self.invitation = Some(ReceivedInvitation {
            inviter,
            group_id,
            kind,
            deadline: now + self.config.invitation_timeout,
        });
        let inviter = self.username_of(inviter);
        self.notifier.send_event(ClientEvent::InvitationReceived { inviter, group_id, kind });
    }

    fn on_update(&mut self, user: &UserRecord) {
        if Some(user.client_id) == self.client_id {
            self.directory.upsert(PeerRecord::from(user));
            return;
        }

        let outcome = self.directory.upsert(PeerRecord::from(user));
        let old_group = match outcome {
            UpsertOutcome::Unchanged => return,
            UpsertOutcome::Inserted => None,
            UpsertOutcome::GroupChanged { old_group_id } => Some(old_group_id),
        };
        trace!(peer = user.client_id, ?old_group, new_group = user.group_id, "peer changed group");

        if user.group_id == self.group_id {
            if self.group_kind.is_decentralized() {
                self.peer_sessions.insert(user.client_id, ReliableSession::new(SocketAddr::V4(user.addr), &self.config));
            }
            self.notifier.send_event(ClientEvent::PeerJoinedGroup { username: user.username.clone() });
        }
        else if old_group == Some(self.group_id) {
            self.peer_sessions.remove(&user.client_id);
            self.notifier.send_event(ClientEvent::PeerLeftGroup { username: user.username.clone() });
        }
    }

    fn on_peer_disconnected(&mut self, peer_id: u8) {
        let Some(record) = self.directory.remove(peer_id) else {
            return;
        };
        debug!(peer = peer_id, username = record.username, "peer disconnected");
        self.peer_sessions.remove(&peer_id);
        if record.group_id == self.group_id && self.group_id != PUBLIC_GROUP_ID {
            self.notifier.send_event(ClientEvent::PeerLeftGroup { username: record.username });
        }
    }

    async fn on_peer_message(&mut self, msg: Message, from: SocketAddr, now: Instant) {
        let peer_id = msg.source_id;
        if !self.peer_sessions.contains_key(&peer_id) && self.is_group_mate(peer_id, from) && !msg.is_ack() {
            debug!(peer = peer_id, "first message from group member - creating session");
            self.peer_sessions.insert(peer_id, ReliableSession::new(from, &self.config));
        }
        let Some(session) = self.peer_sessions.get_mut(&peer_id).filter(|s| s.peer_addr() == from) else {
            debug!(?from, peer = peer_id, "message from unknown peer - discarding");
            return;
        };

        if msg.is_ack() {
            if let AckOutcome::Completed { next: Some(next), .. } = session.on_ack(msg.sequence, msg.kind(), now) {
                send_message(self.transport.as_ref(), from, &next).await;
            }
            return;
        }

        let MessageBody::DataMessage { text } = msg.body.clone() else {
            debug!(peer = peer_id, kind = ?msg.kind(), "only data messages are exchanged between peers - discarding");
            return;
        };

        let verdict = session.on_inbound(msg.sequence);
        send_message(self.transport.as_ref(), from, &msg.ack_for(self.own_id())).await;
        if verdict == InboundVerdict::Fresh {
            self.on_chat(peer_id, text);
        }
    }

    fn is_group_mate(&self, peer_id: u8, addr: SocketAddr) -> bool {
        self.group_kind.is_decentralized()
            && self.directory.find(peer_id)
                .map(|p| p.group_id == self.group_id && SocketAddr::V4(p.addr) == addr)
                .unwrap_or(false)
    }

    pub async fn on_timer(&mut self, now: Instant) {
        match self.server_session.on_timer(now) {
            TimerOutcome::Nothing => {}
            TimerOutcome::Retransmit(msg) => send_message(self.transport.as_ref(), self.server_addr, &msg).await,
            TimerOutcome::Exhausted => {
                if self.state == ClientState::PendingDisconnection {
                    info!("no answer to disconnection request - disconnecting anyway");
                    self.finish(ClientEvent::Disconnected);
                }
                else {
                    warn!("server is unreachable");
                    self.finish(ClientEvent::ServerUnreachable);
                }
                return;
            }
        }

        let mut peer_ids = self.peer_sessions.keys().copied().collect::<Vec<_>>();
        peer_ids.sort();
        for peer_id in peer_ids {
            let Some(session) = self.peer_sessions.get_mut(&peer_id) else {
                continue;
            };
            match session.on_timer(now) {
                TimerOutcome::Nothing => {}
                TimerOutcome::Retransmit(msg) => send_message(self.transport.as_ref(), session.peer_addr(), &msg).await,
                TimerOutcome::Exhausted => {
                    warn!(peer = peer_id, "peer is unreachable");
                    self.peer_sessions.remove(&peer_id);
                    let username = self.username_of(peer_id);
                    self.notifier.send_event(ClientEvent::PeerUnreachable { username });
                }
            }
        }

        let expired = self.invitation.as_ref()
            .is_some_and(|i| i.deadline <= now);
        if let Some(invitation) = expired.then(|| self.invitation.take()).flatten() {
            info!(group_id = invitation.group_id, inviter = invitation.inviter, "invitation expired");
            self.state = ClientState::Normal;
            self.send_to_server(MessageBody::GroupInvitationReject { kind: invitation.kind, group_id: invitation.group_id }, now).await;
            self.notifier.send_event(ClientEvent::InvitationExpired);
        }
    }

    /// Switches the local view to a group: sessions towards members of the previous group are
    ///  dropped, and in a decentralized group there is a session to every known member
    fn enter_group(&mut self, group_id: u8, kind: GroupKind) {
        self.peer_sessions.clear();
        self.group_id = group_id;
        self.group_kind = kind;
        if let Some(own_id) = self.client_id {
            self.directory.set_group(own_id, group_id);
        }

        if kind.is_decentralized() && group_id != PUBLIC_GROUP_ID {
            for member in self.directory.members_of(group_id) {
                if Some(member.id) != self.client_id {
                    self.peer_sessions.insert(member.id, ReliableSession::new(SocketAddr::V4(member.addr), &self.config));
                }
            }
        }
        self.notifier.send_event(ClientEvent::GroupChanged { group_id, kind });
    }

    fn finish(&mut self, event: ClientEvent) {
        self.state = ClientState::Disconnected;
        self.invitation = None;
        self.peer_sessions.clear();
        self.notifier.send_event(event);
    }

    fn resolve_usernames(&self, usernames: &[String]) -> Vec<u8> {
        let mut result = Vec::new();
        for username in usernames {
            match self.directory.find_by_username(&normalize_username(username)) {
                Some(peer) if Some(peer.id) != self.client_id => {
                    if !result.contains(&peer.id) {
                        result.push(peer.id);
                    }
                }
                _ => debug!(username, "unknown username - skipping"),
            }
        }
        result
    }

    fn username_of(&self, id: u8) -> String {
        match self.directory.find(id) {
            Some(peer) => peer.username.clone(),
            None => format!("#{}", id),
        }
    }

    fn own_id(&self) -> u8 {
        self.client_id.unwrap_or(SERVER_ID)
    }

    fn group_for_outgoing(&self) -> u8 {
        if self.client_id.is_some() { self.group_id } else { NO_GROUP_ID }
    }

    async fn send_to_server(&mut self, body: MessageBody, now: Instant) {
        let msg = Message::new(self.own_id(), self.group_for_outgoing(), body);
        if let Some(msg) = self.server_session.send(msg, now) {
            send_message(self.transport.as_ref(), self.server_addr, &msg).await;
        }
    }

    async fn send_to_peer(&mut self, peer_id: u8, body: MessageBody, now: Instant) {
        let msg = Message::new(self.own_id(), self.group_id, body);
        let Some(session) = self.peer_sessions.get_mut(&peer_id) else {
            return;
        };
        if let Some(msg) = session.send(msg, now) {
            send_message(self.transport.as_ref(), session.peer_addr(), &msg).await;
        }
    }
}
