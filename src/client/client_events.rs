use std::fmt::{Display, Formatter};

use tokio::sync::broadcast;
use tracing::trace;

use crate::client::command::UserError;
use crate::directory::PeerRecord;
use crate::messaging::message::{GroupKind, RejectReason, PUBLIC_GROUP_ID};

/// Everything the client reports to its user
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientEvent {
    Connected { client_id: u8 },
    ConnectionRejected { reason: RejectReason },
    ServerUnreachable,
    Disconnected,
    ChatReceived { from: String, text: String },
    GroupChanged { group_id: u8, kind: GroupKind },
    PeerJoinedGroup { username: String },
    PeerLeftGroup { username: String },
    GroupDissolved,
    InvitationReceived { inviter: String, group_id: u8, kind: GroupKind },
    InvitationExpired,
    InvitationRejectedBy { username: String },
    GroupCreationRejected,
    PeerUnreachable { username: String },
    PeerList { peers: Vec<PeerRecord> },
    Help,
    InputRejected { error: UserError },
}

fn kind_name(kind: GroupKind) -> &'static str {
    match kind {
        GroupKind::Centralized => "centralized",
        GroupKind::Decentralized => "decentralized",
    }
}

impl Display for ClientEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientEvent::Connected { client_id } => write!(f, "connected as client #{}", client_id),
            ClientEvent::ConnectionRejected { reason: RejectReason::ServerFull } => write!(f, "connection rejected: the server is full, try again later"),
            ClientEvent::ConnectionRejected { reason: RejectReason::UsernameTaken } => write!(f, "connection rejected: username is taken, pick another one"),
            ClientEvent::ServerUnreachable => write!(f, "the server is unreachable"),
            ClientEvent::Disconnected => write!(f, "disconnected"),
            ClientEvent::ChatReceived { from, text } => write!(f, "{}: {}", from, text),
            ClientEvent::GroupChanged { group_id, .. } if *group_id == PUBLIC_GROUP_ID => write!(f, "back in the public group"),
            ClientEvent::GroupChanged { group_id, kind } => write!(f, "now in {} group {}", kind_name(*kind), group_id),
            ClientEvent::PeerJoinedGroup { username } => write!(f, "{} joined the group", username),
            ClientEvent::PeerLeftGroup { username } => write!(f, "{} left the group", username),
            ClientEvent::GroupDissolved => write!(f, "the group was dissolved, back in the public group"),
            ClientEvent::InvitationReceived { inviter, group_id, kind } => {
                write!(f, "{} invites you to {} group {} - accept? (yes/no)", inviter, kind_name(*kind), group_id)
            }
            ClientEvent::InvitationExpired => write!(f, "the invitation expired"),
            ClientEvent::InvitationRejectedBy { username } => write!(f, "invitation rejected by {}", username),
            ClientEvent::GroupCreationRejected => write!(f, "the group could not be created"),
            ClientEvent::PeerUnreachable { username } => write!(f, "{} is unreachable", username),
            ClientEvent::PeerList { peers } => {
                write!(f, "{} user(s) online:", peers.len())?;
                for peer in peers {
                    write!(f, "\n  {:<8} #{:<3} group {:<3} {}", peer.username, peer.id, peer.group_id, peer.addr)?;
                }
                Ok(())
            }
            ClientEvent::Help => write!(f, "\
commands:
  <text>                               send a chat message to the current group
  /create_group <0|1> <usernames...>   create a group (0 = centralized, 1 = decentralized)
  /invite_group <usernames...>         invite users into the current group
  /disjoint                            leave the current group
  /list                                list known users
  /exit                                disconnect and quit
  /help                                show this text"),
            ClientEvent::InputRejected { error } => write!(f, "{}", error),
        }
    }
}

pub struct ClientEventNotifier {
    sender: broadcast::Sender<ClientEvent>,
}
impl ClientEventNotifier {
    pub fn new() -> ClientEventNotifier {
        let (sender, _) = broadcast::channel(128);

        ClientEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ClientEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for ClientEventNotifier {
    fn default() -> Self {
        ClientEventNotifier::new()
    }
}
