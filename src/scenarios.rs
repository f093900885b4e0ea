//! End-to-end runs of a server and several clients over a simulated network, with virtual time

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::client::client_controller::{ClientController, ClientState};
use crate::client::client_events::{ClientEvent, ClientEventNotifier};
use crate::config::ProtocolConfig;
use crate::messaging::message::{GroupKind, Message, MessageBody, MessageKind, RejectReason, PUBLIC_GROUP_ID};
use crate::messaging::reliable_session::{AckOutcome, InboundVerdict, ReliableSession, SessionState, TimerOutcome};
use crate::messaging::transport::{send_message, LossyTransport, Transport};
use crate::server::server_controller::ServerController;
use crate::test_util::simulated_network::SimulatedNetwork;
use crate::util::random::RngRandom;

const INTERVAL: Duration = Duration::from_millis(500);

fn node_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn transport(network: &Arc<SimulatedNetwork>, addr: SocketAddr, loss_rate_percent: u8, seed: u64) -> Arc<dyn Transport> {
    let endpoint: Arc<dyn Transport> = network.endpoint(addr);
    if loss_rate_percent == 0 {
        return endpoint;
    }
    Arc::new(LossyTransport::new(endpoint, loss_rate_percent, Box::new(RngRandom::seeded(seed))))
}

struct TestClient {
    addr: SocketAddr,
    controller: ClientController,
    events: broadcast::Receiver<ClientEvent>,
}

struct Scenario {
    config: Arc<ProtocolConfig>,
    network: Arc<SimulatedNetwork>,
    loss_rate_percent: u8,
    server_addr: SocketAddr,
    server: ServerController,
    clients: Vec<TestClient>,
    /// datagrams from or to these addresses are lost
    offline: FxHashSet<SocketAddr>,
    now: Instant,
    /// every datagram that was delivered: sender, recipient, message
    log: Vec<(SocketAddr, SocketAddr, Message)>,
}

impl Scenario {
    fn new() -> Scenario {
        Scenario::with_loss(0)
    }

    fn with_loss(loss_rate_percent: u8) -> Scenario {
        let config = Arc::new(ProtocolConfig::default());
        let network = SimulatedNetwork::new();
        let server_addr = node_addr(1313);
        let server = ServerController::new(
            config.clone(),
            transport(&network, server_addr, loss_rate_percent, 1313),
            &mut RngRandom::seeded(17),
        );

        Scenario {
            config,
            network,
            loss_rate_percent,
            server_addr,
            server,
            clients: Vec::new(),
            offline: Default::default(),
            now: Instant::now(),
            log: Vec::new(),
        }
    }

    async fn connect(&mut self, username: &str) -> usize {
        let idx = self.clients.len();
        let addr = node_addr(6000 + idx as u16);
        let notifier = Arc::new(ClientEventNotifier::new());
        let events = notifier.subscribe();
        let controller = ClientController::new(
            self.config.clone(),
            transport(&self.network, addr, self.loss_rate_percent, idx as u64),
            self.server_addr,
            notifier,
        );
        self.clients.push(TestClient { addr, controller, events });

        self.input(idx, username).await;
        idx
    }

    fn client(&self, idx: usize) -> &ClientController {
        &self.clients[idx].controller
    }

    fn addr(&self, idx: usize) -> SocketAddr {
        self.clients[idx].addr
    }

    fn id(&self, idx: usize) -> u8 {
        self.client(idx).client_id()
            .expect("client is connected")
    }

    fn events(&mut self, idx: usize) -> Vec<ClientEvent> {
        let mut result = Vec::new();
        while let Ok(event) = self.clients[idx].events.try_recv() {
            result.push(event);
        }
        result
    }

    fn clear_events(&mut self) {
        for idx in 0..self.clients.len() {
            self.events(idx);
        }
    }

    /// user input without delivering the resulting traffic
    async fn type_line(&mut self, idx: usize, line: &str) {
        let now = self.now;
        self.clients[idx].controller.on_user_input(line, now).await
            .expect("valid user input");
    }

    async fn input(&mut self, idx: usize, line: &str) {
        self.type_line(idx, line).await;
        self.deliver_all().await;
    }

    async fn deliver_all(&mut self) {
        self.deliver_all_losing(|_, _| false).await;
    }

    /// delivers datagrams until the network is quiet, including everything sent in response
    async fn deliver_all_losing(&mut self, mut lose: impl FnMut(SocketAddr, &Message) -> bool) {
        let now = self.now;
        while let Some(datagram) = self.network.next_datagram().await {
            let Ok(msg) = Message::decode(&datagram.buf) else {
                continue;
            };
            if self.offline.contains(&datagram.from) || self.offline.contains(&datagram.to) || lose(datagram.to, &msg) {
                continue;
            }
            self.log.push((datagram.from, datagram.to, msg));

            if datagram.to == self.server_addr {
                self.server.on_datagram(&datagram.buf, datagram.from, now).await;
            }
            else if let Some(client) = self.clients.iter_mut().find(|c| c.addr == datagram.to) {
                client.controller.on_datagram(&datagram.buf, datagram.from, now).await;
            }
        }
    }

    async fn advance(&mut self, duration: Duration) {
        self.now += duration;
        let now = self.now;
        self.server.on_timer(now).await;
        for client in &mut self.clients {
            if !self.offline.contains(&client.addr) {
                client.controller.on_timer(now).await;
            }
        }
        self.deliver_all().await;
    }

    /// lets retransmissions run their course
    async fn settle(&mut self) {
        for _ in 0..40 {
            self.advance(INTERVAL).await;
        }
    }

    /// number of (non-ACK) messages of a kind since a position in the log
    fn num_sent_since(&self, mark: usize, from: SocketAddr, to: SocketAddr, kind: MessageKind) -> usize {
        self.log[mark..].iter()
            .filter(|(f, t, m)| *f == from && *t == to && !m.is_ack() && m.kind() == kind)
            .count()
    }

    fn num_sent(&self, from: SocketAddr, to: SocketAddr, kind: MessageKind) -> usize {
        self.num_sent_since(0, from, to, kind)
    }

    /// the creator invites the others, and they all accept
    async fn form_group(&mut self, kind: GroupKind, creator: usize, invitees: &[usize]) -> u8 {
        let usernames = invitees.iter()
            .filter_map(|idx| self.client(*idx).username().map(|s| s.to_string()))
            .collect::<Vec<_>>();
        let kind_arg = if kind.is_decentralized() { 1 } else { 0 };
        self.input(creator, &format!("/create_group {} {}", kind_arg, usernames.join(" "))).await;
        for invitee in invitees {
            assert_eq!(self.client(*invitee).state(), ClientState::PendingInvitation);
            self.input(*invitee, "yes").await;
        }

        let (group_id, actual_kind) = self.client(creator).group();
        assert_ne!(group_id, PUBLIC_GROUP_ID);
        assert_eq!(actual_kind, kind);
        self.clear_events();
        group_id
    }
}

#[tokio::test]
async fn test_connect_announces_new_client() {
    let mut s = Scenario::new();
    let bob = s.connect("bob").await;
    let alice = s.connect("alice").await;

    let alice_id = s.id(alice);
    assert_eq!(s.events(alice), vec![ClientEvent::Connected { client_id: alice_id }]);
    assert_eq!(s.client(alice).state(), ClientState::Normal);
    assert_eq!(s.client(alice).directory().len(), 2);
    assert_eq!(s.server.find_client("alice"), Some(alice_id));
    assert_eq!(s.server.num_clients(), 2);

    let announced = s.client(bob).directory().find(alice_id).cloned()
        .map(|p| (p.username, p.group_id, SocketAddr::V4(p.addr)));
    assert_eq!(announced, Some(("alice".to_string(), PUBLIC_GROUP_ID, s.addr(alice))));
    assert!(s.events(bob).contains(&ClientEvent::PeerJoinedGroup { username: "alice".to_string() }));
    assert_eq!(s.num_sent(s.server_addr, s.addr(bob), MessageKind::UpdateList), 1);
    assert_eq!(s.num_sent(s.server_addr, s.addr(alice), MessageKind::UpdateList), 0);
}

#[tokio::test]
async fn test_username_taken() {
    let mut s = Scenario::new();
    s.connect("alice").await;
    let other = s.connect("alice").await;

    assert_eq!(s.events(other), vec![ClientEvent::ConnectionRejected { reason: RejectReason::UsernameTaken }]);
    assert_eq!(s.client(other).state(), ClientState::PendingConnection);
    assert_eq!(s.server.num_clients(), 1);

    s.input(other, "alicia").await;
    assert_eq!(s.client(other).state(), ClientState::Normal);
    assert_eq!(s.client(other).username(), Some("alicia"));
    assert_eq!(s.server.num_clients(), 2);
}

#[tokio::test]
async fn test_centralized_group() {
    let mut s = Scenario::new();
    let alice = s.connect("alice").await;
    let bob = s.connect("bob").await;
    let carol = s.connect("carol").await;
    s.clear_events();

    s.input(alice, "/create_group 0 bob").await;
    let bob_events = s.events(bob);
    assert!(matches!(&bob_events[..], [ClientEvent::InvitationReceived { inviter, kind: GroupKind::Centralized, .. }] if inviter == "alice"));
    assert_eq!(s.client(alice).state(), ClientState::WaitingGroupCreation);

    s.input(bob, "yes").await;
    let (group_id, kind) = s.client(alice).group();
    assert_ne!(group_id, PUBLIC_GROUP_ID);
    assert_eq!(kind, GroupKind::Centralized);
    assert_eq!(s.client(alice).state(), ClientState::Normal);
    assert_eq!(s.client(bob).group(), (group_id, GroupKind::Centralized));
    assert_eq!(s.server.group_of(s.id(alice)), Some((group_id, GroupKind::Centralized)));
    assert_eq!(s.server.group_of(s.id(bob)), Some((group_id, GroupKind::Centralized)));

    // everybody's directory reflects the new group
    let members = s.client(carol).directory().members_of(group_id)
        .iter()
        .map(|p| p.username.clone())
        .collect::<Vec<_>>();
    assert_eq!(members.len(), 2);
    assert!(members.contains(&"alice".to_string()) && members.contains(&"bob".to_string()));
    s.clear_events();

    let mark = s.log.len();
    s.input(alice, "hi group").await;
    assert_eq!(s.events(bob), vec![ClientEvent::ChatReceived { from: "alice".to_string(), text: "hi group".to_string() }]);
    assert!(s.events(carol).is_empty());
    assert_eq!(s.num_sent_since(mark, s.addr(alice), s.server_addr, MessageKind::DataMessage), 1);
    assert_eq!(s.num_sent_since(mark, s.server_addr, s.addr(bob), MessageKind::DataMessage), 1);
    assert_eq!(s.num_sent_since(mark, s.server_addr, s.addr(carol), MessageKind::DataMessage), 0);
}

#[tokio::test]
async fn test_decentralized_group_chats_directly() {
    let mut s = Scenario::new();
    let alice = s.connect("alice").await;
    let bob = s.connect("bob").await;
    let carol = s.connect("carol").await;
    let group_id = s.form_group(GroupKind::Decentralized, alice, &[bob, carol]).await;

    for idx in [alice, bob, carol] {
        assert_eq!(s.client(idx).group(), (group_id, GroupKind::Decentralized));
        for other in [alice, bob, carol] {
            if other != idx {
                assert!(s.client(idx).has_peer_session(s.id(other)), "{} has no session to {}", idx, other);
            }
        }
    }

    let mark = s.log.len();
    s.input(alice, "p2p").await;
    let expected = ClientEvent::ChatReceived { from: "alice".to_string(), text: "p2p".to_string() };
    assert_eq!(s.events(bob), vec![expected.clone()]);
    assert_eq!(s.events(carol), vec![expected]);

    assert_eq!(s.num_sent_since(mark, s.addr(alice), s.addr(bob), MessageKind::DataMessage), 1);
    assert_eq!(s.num_sent_since(mark, s.addr(alice), s.addr(carol), MessageKind::DataMessage), 1);
    assert!(s.log[mark..].iter().all(|(from, to, _)| *from != s.server_addr && *to != s.server_addr));
}

#[tokio::test]
async fn test_lost_ack_does_not_duplicate_chat() {
    let mut s = Scenario::new();
    let alice = s.connect("alice").await;
    let bob = s.connect("bob").await;
    s.clear_events();

    let server_addr = s.server_addr;
    let bob_id = s.id(bob);
    let mut lost = false;
    s.type_line(alice, "once").await;
    s.deliver_all_losing(|to, msg| {
        let is_bobs_ack = to == server_addr && msg.is_ack() && msg.source_id == bob_id;
        if is_bobs_ack && !lost {
            lost = true;
            return true;
        }
        false
    }).await;
    assert!(lost);

    s.advance(INTERVAL).await;
    assert_eq!(s.num_sent(s.server_addr, s.addr(bob), MessageKind::DataMessage), 2);
    assert_eq!(s.events(bob), vec![ClientEvent::ChatReceived { from: "alice".to_string(), text: "once".to_string() }]);

    // the retransmission was acknowledged
    s.advance(INTERVAL).await;
    assert_eq!(s.num_sent(s.server_addr, s.addr(bob), MessageKind::DataMessage), 2);
}

#[tokio::test]
async fn test_unreachable_client_is_removed() {
    let mut s = Scenario::new();
    let alice = s.connect("alice").await;
    let bob = s.connect("bob").await;
    let carol = s.connect("carol").await;
    let bob_id = s.id(bob);
    s.offline.insert(s.addr(bob));

    s.input(alice, "anyone?").await;
    for _ in 0..5 {
        s.advance(INTERVAL).await;
        assert_eq!(s.server.num_clients(), 3);
    }
    s.advance(INTERVAL).await;
    assert_eq!(s.server.num_clients(), 2);
    assert_eq!(s.server.find_client("bob"), None);

    for _ in 0..10 {
        s.advance(INTERVAL).await;
    }
    assert_eq!(s.num_sent(s.server_addr, s.addr(alice), MessageKind::UpdateDisconnection), 1);
    assert_eq!(s.num_sent(s.server_addr, s.addr(carol), MessageKind::UpdateDisconnection), 1);
    assert_eq!(s.client(alice).directory().find(bob_id), None);
    assert_eq!(s.client(carol).directory().find(bob_id), None);
}

#[tokio::test]
async fn test_disjoint_dissolves_group_of_two() {
    let mut s = Scenario::new();
    let alice = s.connect("alice").await;
    let bob = s.connect("bob").await;
    s.form_group(GroupKind::Centralized, alice, &[bob]).await;

    s.input(bob, "/disjoint").await;
    assert_eq!(s.client(bob).group(), (PUBLIC_GROUP_ID, GroupKind::Centralized));
    assert_eq!(s.client(alice).group(), (PUBLIC_GROUP_ID, GroupKind::Centralized));
    assert!(s.events(alice).contains(&ClientEvent::GroupDissolved));
    assert!(!s.events(bob).contains(&ClientEvent::GroupDissolved));
    assert_eq!(s.server.group_of(s.id(alice)), Some((PUBLIC_GROUP_ID, GroupKind::Centralized)));

    // both see each other back in the public group
    let bob_id = s.id(bob);
    let alice_id = s.id(alice);
    assert_eq!(s.client(alice).directory().find(bob_id).map(|p| p.group_id), Some(PUBLIC_GROUP_ID));
    assert_eq!(s.client(bob).directory().find(alice_id).map(|p| p.group_id), Some(PUBLIC_GROUP_ID));
}

#[tokio::test]
async fn test_disconnect_dissolves_group_of_two() {
    let mut s = Scenario::new();
    let alice = s.connect("alice").await;
    let bob = s.connect("bob").await;
    s.form_group(GroupKind::Decentralized, alice, &[bob]).await;
    let bob_id = s.id(bob);
    assert!(s.client(alice).has_peer_session(bob_id));

    s.input(bob, "/exit").await;
    assert!(s.client(bob).is_finished());
    assert_eq!(s.events(bob), vec![ClientEvent::Disconnected]);

    assert_eq!(s.client(alice).group(), (PUBLIC_GROUP_ID, GroupKind::Centralized));
    assert!(!s.client(alice).has_peer_session(bob_id));
    assert!(s.events(alice).contains(&ClientEvent::GroupDissolved));
    assert_eq!(s.client(alice).directory().find(bob_id), None);
    assert_eq!(s.server.num_clients(), 1);
}

#[tokio::test]
async fn test_invitation_times_out() {
    let mut s = Scenario::new();
    let alice = s.connect("alice").await;
    let bob = s.connect("bob").await;
    s.clear_events();

    s.input(alice, "/create_group 0 bob").await;
    s.advance(Duration::from_secs(15)).await;

    assert_eq!(s.events(alice), vec![
        ClientEvent::InvitationRejectedBy { username: "bob".to_string() },
        ClientEvent::GroupCreationRejected,
    ]);
    assert!(s.events(bob).contains(&ClientEvent::InvitationExpired));
    assert_eq!(s.client(alice).state(), ClientState::Normal);
    assert_eq!(s.client(bob).state(), ClientState::Normal);
    assert_eq!(s.client(alice).group().0, PUBLIC_GROUP_ID);

    // nothing is left over from the failed attempt
    s.form_group(GroupKind::Centralized, alice, &[bob]).await;
    assert_eq!(s.client(alice).group(), s.client(bob).group());
}

#[tokio::test]
async fn test_protocol_over_lossy_network() {
    let mut s = Scenario::with_loss(10);
    let alice = s.connect("alice").await;
    s.settle().await;
    let bob = s.connect("bob").await;
    s.settle().await;
    assert_eq!(s.client(alice).state(), ClientState::Normal);
    assert_eq!(s.client(bob).state(), ClientState::Normal);
    assert_eq!(s.server.num_clients(), 2);
    s.clear_events();

    s.input(alice, "through the noise").await;
    s.settle().await;
    assert_eq!(s.events(bob), vec![ClientEvent::ChatReceived { from: "alice".to_string(), text: "through the noise".to_string() }]);
}

#[tokio::test]
async fn test_reliable_session_over_lossy_network() {
    let config = ProtocolConfig::default();
    let network = SimulatedNetwork::new();
    let sender_addr = node_addr(1);
    let receiver_addr = node_addr(2);
    // loss is simulated on the sending side only
    let sender_transport = LossyTransport::new(network.endpoint(sender_addr), 50, Box::new(RngRandom::seeded(1)));
    let receiver_transport = network.endpoint(receiver_addr);

    let num_trials = 200;
    let mut num_successful = 0;
    for trial in 0..num_trials {
        let mut now = Instant::now();
        let mut sender = ReliableSession::new(receiver_addr, &config);
        let mut receiver = ReliableSession::new(sender_addr, &config);
        let mut num_received = 0;
        let mut acknowledged = false;

        let msg = Message::new(1, PUBLIC_GROUP_ID, MessageBody::DataMessage { text: format!("trial {}", trial) });
        if let Some(msg) = sender.send(msg, now) {
            send_message(&sender_transport, receiver_addr, &msg).await;
        }

        while sender.state() == SessionState::AwaitingAck {
            while let Some(datagram) = network.next_datagram().await {
                let msg = Message::decode(&datagram.buf).unwrap();
                if datagram.to == receiver_addr {
                    if receiver.on_inbound(msg.sequence) == InboundVerdict::Fresh {
                        num_received += 1;
                    }
                    send_message(receiver_transport.as_ref(), sender_addr, &msg.ack_for(2)).await;
                }
                else if matches!(sender.on_ack(msg.sequence, msg.kind(), now), AckOutcome::Completed { .. }) {
                    acknowledged = true;
                }
            }

            now += config.retransmit_interval;
            if let TimerOutcome::Retransmit(msg) = sender.on_timer(now) {
                send_message(&sender_transport, receiver_addr, &msg).await;
            }
        }

        assert!(num_received <= 1);
        if num_received == 1 && acknowledged {
            num_successful += 1;
        }
    }

    // six transmissions at 50% loss get through about 98% of the time
    assert!(num_successful >= 190, "only {} of {} messages were delivered and acknowledged", num_successful, num_trials);
}
