use std::fmt::{Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Every datagram starts with this fixed envelope (all numbers big-endian):
///
/// ```ascii
/// 0: kind (5 bits) | reserved (1 bit) | sequence (1 bit) | ack (1 bit)
/// 1: source id (u8)
/// 2: group id (u8)
/// 3: payload length (u16), i.e. the number of bytes following the envelope
/// ```
pub const ENVELOPE_LEN: usize = 5;

pub const SERVER_ID: u8 = 0x00;
pub const NO_GROUP_ID: u8 = 0x00;
pub const PUBLIC_GROUP_ID: u8 = 0x01;
/// group id used by the server for membership notifications that are not scoped to a group
pub const BROADCAST_GROUP_ID: u8 = 0xff;

pub const USERNAME_LEN: usize = 8;
/// client id, group id, username, four IPv4 octets, port
pub const USER_RECORD_LEN: usize = 2 + USERNAME_LEN + 4 + 2;
/// upper bound for chat text accepted from the user; the wire format could carry more
pub const MAX_TEXT_LEN: usize = 1024;

#[derive(Debug, thiserror::Error, Clone, Copy, Eq, PartialEq)]
pub enum FormatError {
    #[error("datagram is truncated")]
    Truncated,
    #[error("malformed datagram: {0}")]
    Malformed(&'static str),
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    ConnectionRequest = 0x00,
    ConnectionAccept = 0x01,
    ConnectionReject = 0x02,
    UserListRequest = 0x03,
    UserListResponse = 0x04,
    DataMessage = 0x05,
    GroupCreationRequest = 0x06,
    GroupCreationAccept = 0x07,
    GroupCreationReject = 0x08,
    GroupInvitationRequest = 0x09,
    GroupInvitationAccept = 0x0A,
    GroupInvitationReject = 0x0B,
    GroupDisjointRequest = 0x0C,
    GroupDissolution = 0x0D,
    UpdateList = 0x0E,
    UpdateDisconnection = 0x0F,
    DisconnectionRequest = 0x10,
}

/// Encoded in the top bit of a flag byte
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum GroupKind {
    #[default]
    Centralized,
    Decentralized,
}
impl GroupKind {
    fn from_flag_byte(b: u8) -> GroupKind {
        if b & 0x80 == 0 {
            GroupKind::Centralized
        }
        else {
            GroupKind::Decentralized
        }
    }

    fn flag_byte(self) -> u8 {
        match self {
            GroupKind::Centralized => 0x00,
            GroupKind::Decentralized => 0x80,
        }
    }

    pub fn is_decentralized(self) -> bool {
        self == GroupKind::Decentralized
    }
}

/// Encoded in the top bit of a flag byte
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RejectReason {
    ServerFull,
    UsernameTaken,
}
impl RejectReason {
    fn from_flag_byte(b: u8) -> RejectReason {
        if b & 0x80 == 0 {
            RejectReason::ServerFull
        }
        else {
            RejectReason::UsernameTaken
        }
    }

    fn flag_byte(self) -> u8 {
        match self {
            RejectReason::ServerFull => 0x00,
            RejectReason::UsernameTaken => 0x80,
        }
    }
}

/// The one-bit sequence number of stop-and-wait ARQ
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum Sequence {
    #[default]
    Zero,
    One,
}
impl Sequence {
    pub fn flipped(self) -> Sequence {
        match self {
            Sequence::Zero => Sequence::One,
            Sequence::One => Sequence::Zero,
        }
    }

    fn bit(self) -> u8 {
        match self {
            Sequence::Zero => 0,
            Sequence::One => 1,
        }
    }

    fn from_bit(bit: u8) -> Sequence {
        if bit & 1 == 0 { Sequence::Zero } else { Sequence::One }
    }
}

/// Cuts a string to at most `max_len` bytes without splitting a UTF-8 character
pub fn truncate_utf8(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Usernames travel as fixed 8-byte fields: longer names are cut, trailing blanks do not survive
pub fn normalize_username(raw: &str) -> String {
    truncate_utf8(raw.trim(), USERNAME_LEN)
        .trim_end()
        .to_string()
}

#[derive(Clone, Eq, PartialEq)]
pub struct UserRecord {
    pub client_id: u8,
    pub group_id: u8,
    pub username: String,
    pub addr: SocketAddrV4,
}
impl Debug for UserRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}#{}@{} in {}]", self.username, self.client_id, self.addr, self.group_id)
    }
}
impl UserRecord {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.client_id);
        buf.put_u8(self.group_id);
        ser_username(&self.username, buf);
        buf.put_slice(&self.addr.ip().octets());
        buf.put_u16(self.addr.port());
    }

    fn deser(buf: &mut &[u8]) -> Result<UserRecord, FormatError> {
        if buf.remaining() < USER_RECORD_LEN {
            return Err(FormatError::Truncated);
        }
        let client_id = buf.get_u8();
        let group_id = buf.get_u8();
        let username = deser_username(buf)?;
        let ip = Ipv4Addr::new(buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8());
        let port = buf.get_u16();
        Ok(UserRecord {
            client_id,
            group_id,
            username,
            addr: SocketAddrV4::new(ip, port),
        })
    }
}

fn ser_username(username: &str, buf: &mut impl BufMut) {
    let raw = truncate_utf8(username, USERNAME_LEN).as_bytes();
    buf.put_slice(raw);
    buf.put_bytes(b' ', USERNAME_LEN - raw.len());
}

fn deser_username(buf: &mut &[u8]) -> Result<String, FormatError> {
    if buf.remaining() < USERNAME_LEN {
        return Err(FormatError::Truncated);
    }
    let raw = &buf[..USERNAME_LEN];
    let trimmed_len = raw.iter()
        .rposition(|b| *b != b' ' && *b != 0)
        .map(|pos| pos + 1)
        .unwrap_or(0);
    let username = std::str::from_utf8(&raw[..trimmed_len])
        .map_err(|_| FormatError::Malformed("username is not valid UTF-8"))?
        .to_string();
    buf.advance(USERNAME_LEN);
    Ok(username)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MessageBody {
    ConnectionRequest { username: String },
    ConnectionAccept { client_id: u8 },
    ConnectionReject { reason: RejectReason },
    UserListRequest,
    UserListResponse { users: Vec<UserRecord> },
    DataMessage { text: String },
    GroupCreationRequest { kind: GroupKind, client_ids: Vec<u8> },
    GroupCreationAccept { kind: GroupKind, group_id: u8 },
    GroupCreationReject,
    GroupInvitationRequest { kind: GroupKind, group_id: u8, client_id: u8 },
    GroupInvitationAccept { kind: GroupKind, group_id: u8 },
    GroupInvitationReject { kind: GroupKind, group_id: u8 },
    GroupDisjointRequest,
    GroupDissolution,
    UpdateList { users: Vec<UserRecord> },
    UpdateDisconnection { client_id: u8 },
    DisconnectionRequest,
    /// The envelope's kind field names the acknowledged message kind, its sequence is echoed
    Ack { acked: MessageKind },
}

impl MessageBody {
    /// for an ACK, this is the kind of the acknowledged message
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::ConnectionRequest { .. } => MessageKind::ConnectionRequest,
            MessageBody::ConnectionAccept { .. } => MessageKind::ConnectionAccept,
            MessageBody::ConnectionReject { .. } => MessageKind::ConnectionReject,
            MessageBody::UserListRequest => MessageKind::UserListRequest,
            MessageBody::UserListResponse { .. } => MessageKind::UserListResponse,
            MessageBody::DataMessage { .. } => MessageKind::DataMessage,
            MessageBody::GroupCreationRequest { .. } => MessageKind::GroupCreationRequest,
            MessageBody::GroupCreationAccept { .. } => MessageKind::GroupCreationAccept,
            MessageBody::GroupCreationReject => MessageKind::GroupCreationReject,
            MessageBody::GroupInvitationRequest { .. } => MessageKind::GroupInvitationRequest,
            MessageBody::GroupInvitationAccept { .. } => MessageKind::GroupInvitationAccept,
            MessageBody::GroupInvitationReject { .. } => MessageKind::GroupInvitationReject,
            MessageBody::GroupDisjointRequest => MessageKind::GroupDisjointRequest,
            MessageBody::GroupDissolution => MessageKind::GroupDissolution,
            MessageBody::UpdateList { .. } => MessageKind::UpdateList,
            MessageBody::UpdateDisconnection { .. } => MessageKind::UpdateDisconnection,
            MessageBody::DisconnectionRequest => MessageKind::DisconnectionRequest,
            MessageBody::Ack { acked } => *acked,
        }
    }

    fn wire_text(text: &str) -> &str {
        truncate_utf8(text, u16::MAX as usize - 2)
    }

    fn wire_client_ids(client_ids: &[u8]) -> &[u8] {
        &client_ids[..client_ids.len().min(u16::MAX as usize - 1)]
    }

    fn payload_len(&self) -> usize {
        match self {
            MessageBody::ConnectionRequest { .. } => USERNAME_LEN,
            MessageBody::ConnectionAccept { .. } => 1,
            MessageBody::ConnectionReject { .. } => 1,
            MessageBody::UserListResponse { users } |
            MessageBody::UpdateList { users } => users.len() * USER_RECORD_LEN,
            MessageBody::DataMessage { text } => 2 + Self::wire_text(text).len(),
            MessageBody::GroupCreationRequest { client_ids, .. } => 1 + Self::wire_client_ids(client_ids).len(),
            MessageBody::GroupCreationAccept { .. } => 2,
            MessageBody::GroupInvitationRequest { .. } => 3,
            MessageBody::GroupInvitationAccept { .. } => 2,
            MessageBody::GroupInvitationReject { .. } => 2,
            MessageBody::UpdateDisconnection { .. } => 1,
            MessageBody::UserListRequest |
            MessageBody::GroupCreationReject |
            MessageBody::GroupDisjointRequest |
            MessageBody::GroupDissolution |
            MessageBody::DisconnectionRequest |
            MessageBody::Ack { .. } => 0,
        }
    }

    fn ser(&self, buf: &mut impl BufMut) {
        match self {
            MessageBody::ConnectionRequest { username } => ser_username(username, buf),
            MessageBody::ConnectionAccept { client_id } => buf.put_u8(*client_id),
            MessageBody::ConnectionReject { reason } => buf.put_u8(reason.flag_byte()),
            MessageBody::UserListResponse { users } |
            MessageBody::UpdateList { users } => {
                for user in users {
                    user.ser(buf);
                }
            }
            MessageBody::DataMessage { text } => {
                let text = Self::wire_text(text);
                buf.put_u16(text.len() as u16);
                buf.put_slice(text.as_bytes());
            }
            MessageBody::GroupCreationRequest { kind, client_ids } => {
                buf.put_u8(kind.flag_byte());
                buf.put_slice(Self::wire_client_ids(client_ids));
            }
            MessageBody::GroupCreationAccept { kind, group_id } |
            MessageBody::GroupInvitationAccept { kind, group_id } |
            MessageBody::GroupInvitationReject { kind, group_id } => {
                buf.put_u8(kind.flag_byte());
                buf.put_u8(*group_id);
            }
            MessageBody::GroupInvitationRequest { kind, group_id, client_id } => {
                buf.put_u8(kind.flag_byte());
                buf.put_u8(*group_id);
                buf.put_u8(*client_id);
            }
            MessageBody::UpdateDisconnection { client_id } => buf.put_u8(*client_id),
            MessageBody::UserListRequest |
            MessageBody::GroupCreationReject |
            MessageBody::GroupDisjointRequest |
            MessageBody::GroupDissolution |
            MessageBody::DisconnectionRequest |
            MessageBody::Ack { .. } => {}
        }
    }

    fn deser(kind: MessageKind, mut buf: &[u8]) -> Result<MessageBody, FormatError> {
        let body = match kind {
            MessageKind::ConnectionRequest => {
                expect_len(buf, USERNAME_LEN)?;
                MessageBody::ConnectionRequest { username: deser_username(&mut buf)? }
            }
            MessageKind::ConnectionAccept => {
                expect_len(buf, 1)?;
                MessageBody::ConnectionAccept { client_id: buf.get_u8() }
            }
            MessageKind::ConnectionReject => {
                expect_len(buf, 1)?;
                MessageBody::ConnectionReject { reason: RejectReason::from_flag_byte(buf.get_u8()) }
            }
            MessageKind::UserListRequest => {
                expect_len(buf, 0)?;
                MessageBody::UserListRequest
            }
            MessageKind::UserListResponse => MessageBody::UserListResponse { users: deser_user_records(buf)? },
            MessageKind::DataMessage => {
                if buf.remaining() < 2 {
                    return Err(FormatError::Malformed("data message without data length"));
                }
                let data_length = usize::from(buf.get_u16());
                if data_length != buf.remaining() {
                    return Err(FormatError::Malformed("data length does not match payload"));
                }
                let text = std::str::from_utf8(buf)
                    .map_err(|_| FormatError::Malformed("text is not valid UTF-8"))?
                    .to_string();
                MessageBody::DataMessage { text }
            }
            MessageKind::GroupCreationRequest => {
                if buf.is_empty() {
                    return Err(FormatError::Malformed("group creation request without group kind"));
                }
                let kind = GroupKind::from_flag_byte(buf.get_u8());
                MessageBody::GroupCreationRequest { kind, client_ids: buf.to_vec() }
            }
            MessageKind::GroupCreationAccept => {
                expect_len(buf, 2)?;
                MessageBody::GroupCreationAccept { kind: GroupKind::from_flag_byte(buf.get_u8()), group_id: buf.get_u8() }
            }
            MessageKind::GroupCreationReject => {
                expect_len(buf, 0)?;
                MessageBody::GroupCreationReject
            }
            MessageKind::GroupInvitationRequest => {
                expect_len(buf, 3)?;
                MessageBody::GroupInvitationRequest {
                    kind: GroupKind::from_flag_byte(buf.get_u8()),
                    group_id: buf.get_u8(),
                    client_id: buf.get_u8(),
                }
            }
            MessageKind::GroupInvitationAccept => {
                expect_len(buf, 2)?;
                MessageBody::GroupInvitationAccept { kind: GroupKind::from_flag_byte(buf.get_u8()), group_id: buf.get_u8() }
            }
            MessageKind::GroupInvitationReject => {
                expect_len(buf, 2)?;
                MessageBody::GroupInvitationReject { kind: GroupKind::from_flag_byte(buf.get_u8()), group_id: buf.get_u8() }
            }
            MessageKind::GroupDisjointRequest => {
                expect_len(buf, 0)?;
                MessageBody::GroupDisjointRequest
            }
            MessageKind::GroupDissolution => {
                expect_len(buf, 0)?;
                MessageBody::GroupDissolution
            }
            MessageKind::UpdateList => MessageBody::UpdateList { users: deser_user_records(buf)? },
            MessageKind::UpdateDisconnection => {
                expect_len(buf, 1)?;
                MessageBody::UpdateDisconnection { client_id: buf.get_u8() }
            }
            MessageKind::DisconnectionRequest => {
                expect_len(buf, 0)?;
                MessageBody::DisconnectionRequest
            }
        };
        Ok(body)
    }
}

fn expect_len(buf: &[u8], expected: usize) -> Result<(), FormatError> {
    if buf.len() != expected {
        return Err(FormatError::Malformed("payload length does not match message kind"));
    }
    Ok(())
}

fn deser_user_records(mut buf: &[u8]) -> Result<Vec<UserRecord>, FormatError> {
    if buf.len() % USER_RECORD_LEN != 0 {
        return Err(FormatError::Malformed("user list is not a sequence of complete records"));
    }
    let mut result = Vec::with_capacity(buf.len() / USER_RECORD_LEN);
    while buf.has_remaining() {
        result.push(UserRecord::deser(&mut buf)?);
    }
    Ok(result)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub sequence: Sequence,
    pub source_id: u8,
    pub group_id: u8,
    pub body: MessageBody,
}

impl Message {
    /// The sequence is assigned by the reliable session when the message is actually sent
    pub fn new(source_id: u8, group_id: u8, body: MessageBody) -> Message {
        Message {
            sequence: Sequence::Zero,
            source_id,
            group_id,
            body,
        }
    }

    pub fn ack_for(&self, own_id: u8) -> Message {
        Message {
            sequence: self.sequence,
            source_id: own_id,
            group_id: NO_GROUP_ID,
            body: MessageBody::Ack { acked: self.kind() },
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn is_ack(&self) -> bool {
        matches!(self.body, MessageBody::Ack { .. })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(ENVELOPE_LEN + self.body.payload_len());
        self.ser(&mut buf);
        buf
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let ack_bit = if self.is_ack() { 1 } else { 0 };
        buf.put_u8((u8::from(self.kind()) << 3) | (self.sequence.bit() << 1) | ack_bit);
        buf.put_u8(self.source_id);
        buf.put_u8(self.group_id);
        buf.put_u16(self.body.payload_len() as u16);
        self.body.ser(buf);
    }

    pub fn decode(buf: &[u8]) -> Result<Message, FormatError> {
        if buf.len() < ENVELOPE_LEN {
            return Err(FormatError::Truncated);
        }
        let (mut envelope, payload) = buf.split_at(ENVELOPE_LEN);

        let first = envelope.get_u8();
        let source_id = envelope.get_u8();
        let group_id = envelope.get_u8();
        let payload_len = usize::from(envelope.get_u16());

        if payload.len() < payload_len {
            return Err(FormatError::Truncated);
        }
        if payload.len() > payload_len {
            return Err(FormatError::Malformed("datagram is longer than its payload length"));
        }

        let raw_kind = first >> 3;
        let kind = MessageKind::try_from(raw_kind)
            .map_err(|_| FormatError::UnknownKind(raw_kind))?;

        let body = if first & 1 == 1 {
            if !payload.is_empty() {
                return Err(FormatError::Malformed("acknowledgement with payload"));
            }
            MessageBody::Ack { acked: kind }
        }
        else {
            MessageBody::deser(kind, payload)?
        };

        Ok(Message {
            sequence: Sequence::from_bit(first >> 1),
            source_id,
            group_id,
            body,
        })
    }
}
