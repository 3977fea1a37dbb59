use bytes::{Buf, BufMut, BytesMut};
use std::convert::TryFrom;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::DhtError;
use crate::id::NodeId;
use crate::node::contact::NodeContact;
use crate::{ID_LENGTH, MAX_LIST_LENGTH, PROTOCOL_VERSION};

/// Fixed header: `version:1, source_id:20, source_port:2, type:1`.
const HEADER_LENGTH: usize = 1 + ID_LENGTH + 2 + 1;

/// Wire size of one serialized contact: `id:20, ip:4, port:2`.
const CONTACT_LENGTH: usize = ID_LENGTH + 4 + 2;

/// Wire size of one serialized peer endpoint: `ip:4, port:2`.
const PEER_LENGTH: usize = 4 + 2;

/// The four RPC message kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcKind {
    Ping = 0,
    FindNode = 1,
    FindPeers = 2,
    AnnouncePeer = 3,
}

impl TryFrom<u8> for RpcKind {
    type Error = DhtError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RpcKind::Ping),
            1 => Ok(RpcKind::FindNode),
            2 => Ok(RpcKind::FindPeers),
            3 => Ok(RpcKind::AnnouncePeer),
            _ => Err(DhtError::UnknownRpcType(value)),
        }
    }
}

/// Whether a packet travels as a query or as the reply to one.
///
/// The DHT performs one write-then-read exchange per request, so the
/// direction is always known from context and is not carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketDirection {
    Query,
    Response,
}

/// A resolved contact as it appears inside `FIND_NODE`/`FIND_PEERS` replies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactInfo {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

impl ContactInfo {
    /// Converts a routing-table contact for transmission. Bootstrap stubs
    /// without a resolved ID cannot be serialized and yield `None`.
    pub fn from_contact(contact: &NodeContact) -> Option<ContactInfo> {
        contact.id.map(|id| ContactInfo {
            id,
            addr: contact.addr,
        })
    }
}

/// One DHT wire message, query or response.
///
/// Which of the optional payload fields are present is fully determined by
/// the RPC kind and the direction; absent fields are omitted on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct DhtPacket {
    pub source_id: NodeId,
    pub source_port: u16,
    pub kind: RpcKind,
    pub target: Option<NodeId>,
    pub service_port: Option<u16>,
    pub contacts: Vec<ContactInfo>,
    pub peers: Vec<SocketAddrV4>,
}

impl DhtPacket {
    /// Constructs a packet with no payload fields set.
    pub fn new(source_id: NodeId, source_port: u16, kind: RpcKind) -> Self {
        DhtPacket {
            source_id,
            source_port,
            kind,
            target: None,
            service_port: None,
            contacts: Vec::new(),
            peers: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: NodeId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_service_port(mut self, port: u16) -> Self {
        self.service_port = Some(port);
        self
    }

    pub fn with_contacts(mut self, contacts: Vec<ContactInfo>) -> Self {
        self.contacts = contacts;
        self
    }

    pub fn with_peers(mut self, peers: Vec<SocketAddrV4>) -> Self {
        self.peers = peers;
        self
    }

    /// Serializes the packet for the given direction.
    pub fn encode(&self, direction: PacketDirection) -> Result<Vec<u8>, DhtError> {
        let mut buf = BytesMut::with_capacity(HEADER_LENGTH);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_slice(&self.source_id.0);
        buf.put_u16_le(self.source_port);
        buf.put_u8(self.kind as u8);

        match self.kind {
            RpcKind::Ping => {}
            RpcKind::FindNode => {
                self.put_target(&mut buf)?;
                if direction == PacketDirection::Response {
                    put_contacts(&mut buf, &self.contacts)?;
                }
            }
            RpcKind::FindPeers => {
                self.put_target(&mut buf)?;
                if direction == PacketDirection::Response {
                    put_contacts(&mut buf, &self.contacts)?;
                    put_peers(&mut buf, &self.peers)?;
                }
            }
            RpcKind::AnnouncePeer => {
                self.put_target(&mut buf)?;
                match self.service_port {
                    Some(port) => buf.put_u16_le(port),
                    None => return Err(DhtError::MissingField("service_port")),
                }
                if direction == PacketDirection::Response {
                    put_peers(&mut buf, &self.peers)?;
                }
            }
        }
        Ok(buf.to_vec())
    }

    fn put_target(&self, buf: &mut BytesMut) -> Result<(), DhtError> {
        match self.target {
            Some(ref target) => {
                buf.put_slice(&target.0);
                Ok(())
            }
            None => Err(DhtError::MissingField("target")),
        }
    }

    /// Reads exactly one packet of the given direction from `reader`.
    ///
    /// An unrecognized version or type is a decode error that is fatal to the
    /// connection the packet arrived on, but to nothing else.
    pub fn read_from(
        reader: &mut dyn Read,
        direction: PacketDirection,
    ) -> Result<DhtPacket, DhtError> {
        let mut header = [0u8; HEADER_LENGTH];
        reader.read_exact(&mut header)?;
        let mut buf = &header[..];

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(DhtError::UnsupportedVersion(version));
        }
        let source_id = get_id(&mut buf);
        let source_port = buf.get_u16_le();
        let kind = RpcKind::try_from(buf.get_u8())?;

        let mut packet = DhtPacket::new(source_id, source_port, kind);
        match kind {
            RpcKind::Ping => {}
            RpcKind::FindNode => {
                packet.target = Some(read_id(reader)?);
                if direction == PacketDirection::Response {
                    packet.contacts = read_contacts(reader)?;
                }
            }
            RpcKind::FindPeers => {
                packet.target = Some(read_id(reader)?);
                if direction == PacketDirection::Response {
                    packet.contacts = read_contacts(reader)?;
                    packet.peers = read_peers(reader)?;
                }
            }
            RpcKind::AnnouncePeer => {
                packet.target = Some(read_id(reader)?);
                let mut port = [0u8; 2];
                reader.read_exact(&mut port)?;
                packet.service_port = Some(u16::from_le_bytes(port));
                if direction == PacketDirection::Response {
                    packet.peers = read_peers(reader)?;
                }
            }
        }
        Ok(packet)
    }

    /// Serializes the packet and writes it to `writer`.
    pub fn write_to(
        &self,
        writer: &mut dyn Write,
        direction: PacketDirection,
    ) -> Result<(), DhtError> {
        let encoded = self.encode(direction)?;
        writer.write_all(&encoded)?;
        Ok(())
    }
}

fn put_contacts(buf: &mut BytesMut, contacts: &[ContactInfo]) -> Result<(), DhtError> {
    if contacts.len() > MAX_LIST_LENGTH {
        return Err(DhtError::ListTooLong(contacts.len()));
    }
    buf.put_u8(contacts.len() as u8);
    for contact in contacts {
        buf.put_slice(&contact.id.0);
        buf.put_slice(&contact.addr.ip().octets());
        buf.put_u16_le(contact.addr.port());
    }
    Ok(())
}

fn put_peers(buf: &mut BytesMut, peers: &[SocketAddrV4]) -> Result<(), DhtError> {
    if peers.len() > MAX_LIST_LENGTH {
        return Err(DhtError::ListTooLong(peers.len()));
    }
    buf.put_u8(peers.len() as u8);
    for peer in peers {
        buf.put_slice(&peer.ip().octets());
        buf.put_u16_le(peer.port());
    }
    Ok(())
}

fn get_id(buf: &mut &[u8]) -> NodeId {
    let mut id = [0u8; ID_LENGTH];
    buf.copy_to_slice(&mut id);
    NodeId::new(id)
}

fn get_addr(buf: &mut &[u8]) -> SocketAddrV4 {
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    let port = buf.get_u16_le();
    SocketAddrV4::new(Ipv4Addr::from(octets), port)
}

fn read_id(reader: &mut dyn Read) -> Result<NodeId, DhtError> {
    let mut id = [0u8; ID_LENGTH];
    reader.read_exact(&mut id)?;
    Ok(NodeId::new(id))
}

fn read_contacts(reader: &mut dyn Read) -> Result<Vec<ContactInfo>, DhtError> {
    let mut count = [0u8; 1];
    reader.read_exact(&mut count)?;
    let mut raw = vec![0u8; count[0] as usize * CONTACT_LENGTH];
    reader.read_exact(&mut raw)?;

    let mut buf = &raw[..];
    let mut contacts = Vec::with_capacity(count[0] as usize);
    for _ in 0..count[0] {
        let id = get_id(&mut buf);
        let addr = get_addr(&mut buf);
        contacts.push(ContactInfo { id, addr });
    }
    Ok(contacts)
}

fn read_peers(reader: &mut dyn Read) -> Result<Vec<SocketAddrV4>, DhtError> {
    let mut count = [0u8; 1];
    reader.read_exact(&mut count)?;
    let mut raw = vec![0u8; count[0] as usize * PEER_LENGTH];
    reader.read_exact(&mut raw)?;

    let mut buf = &raw[..];
    let mut peers = Vec::with_capacity(count[0] as usize);
    for _ in 0..count[0] {
        peers.push(get_addr(&mut buf));
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::{ContactInfo, DhtPacket, PacketDirection, RpcKind};
    use crate::error::DhtError;
    use crate::id::NodeId;
    use std::io::Cursor;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port)
    }

    fn round_trip(packet: &DhtPacket, direction: PacketDirection) -> DhtPacket {
        let encoded = packet.encode(direction).unwrap();
        DhtPacket::read_from(&mut Cursor::new(encoded), direction).unwrap()
    }

    fn contacts(n: usize) -> Vec<ContactInfo> {
        (0..n)
            .map(|i| ContactInfo {
                id: NodeId::rand(),
                addr: addr(6000 + i as u16),
            })
            .collect()
    }

    #[test]
    fn test_ping_round_trip() {
        let query = DhtPacket::new(NodeId::rand(), 4000, RpcKind::Ping);
        assert_eq!(round_trip(&query, PacketDirection::Query), query);

        let response = DhtPacket::new(NodeId::rand(), 4001, RpcKind::Ping);
        assert_eq!(round_trip(&response, PacketDirection::Response), response);
    }

    #[test]
    fn test_find_node_round_trip() {
        let query = DhtPacket::new(NodeId::rand(), 4000, RpcKind::FindNode)
            .with_target(NodeId::rand());
        assert_eq!(round_trip(&query, PacketDirection::Query), query);

        let response = DhtPacket::new(NodeId::rand(), 4001, RpcKind::FindNode)
            .with_target(NodeId::rand())
            .with_contacts(contacts(8));
        assert_eq!(round_trip(&response, PacketDirection::Response), response);
    }

    #[test]
    fn test_find_peers_round_trip() {
        let query = DhtPacket::new(NodeId::rand(), 4000, RpcKind::FindPeers)
            .with_target(NodeId::rand());
        assert_eq!(round_trip(&query, PacketDirection::Query), query);

        let response = DhtPacket::new(NodeId::rand(), 4001, RpcKind::FindPeers)
            .with_target(NodeId::rand())
            .with_contacts(contacts(3))
            .with_peers(vec![addr(7000), addr(7001)]);
        assert_eq!(round_trip(&response, PacketDirection::Response), response);
    }

    #[test]
    fn test_announce_peer_round_trip() {
        let query = DhtPacket::new(NodeId::rand(), 4000, RpcKind::AnnouncePeer)
            .with_target(NodeId::rand())
            .with_service_port(1234);
        assert_eq!(round_trip(&query, PacketDirection::Query), query);

        let response = DhtPacket::new(NodeId::rand(), 4001, RpcKind::AnnouncePeer)
            .with_target(NodeId::rand())
            .with_service_port(1234)
            .with_peers(vec![addr(7000)]);
        assert_eq!(round_trip(&response, PacketDirection::Response), response);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let query = DhtPacket::new(NodeId::rand(), 4000, RpcKind::Ping);
        let mut encoded = query.encode(PacketDirection::Query).unwrap();
        encoded[0] = 99;
        match DhtPacket::read_from(&mut Cursor::new(encoded), PacketDirection::Query) {
            Err(DhtError::UnsupportedVersion(99)) => {}
            other => panic!("expected version error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_type() {
        let query = DhtPacket::new(NodeId::rand(), 4000, RpcKind::Ping);
        let mut encoded = query.encode(PacketDirection::Query).unwrap();
        let type_offset = encoded.len() - 1;
        encoded[type_offset] = 42;
        match DhtPacket::read_from(&mut Cursor::new(encoded), PacketDirection::Query) {
            Err(DhtError::UnknownRpcType(42)) => {}
            other => panic!("expected type error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_truncated_packet() {
        let query = DhtPacket::new(NodeId::rand(), 4000, RpcKind::FindNode)
            .with_target(NodeId::rand());
        let encoded = query.encode(PacketDirection::Query).unwrap();
        let truncated = &encoded[..encoded.len() - 5];
        assert!(
            DhtPacket::read_from(&mut Cursor::new(truncated.to_vec()), PacketDirection::Query)
                .is_err()
        );
    }

    #[test]
    fn test_rejects_oversized_list() {
        let response = DhtPacket::new(NodeId::rand(), 4000, RpcKind::FindNode)
            .with_target(NodeId::rand())
            .with_contacts(contacts(256));
        match response.encode(PacketDirection::Response) {
            Err(DhtError::ListTooLong(256)) => {}
            other => panic!("expected list error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_field_is_an_encode_error() {
        let query = DhtPacket::new(NodeId::rand(), 4000, RpcKind::AnnouncePeer)
            .with_target(NodeId::rand());
        assert!(query.encode(PacketDirection::Query).is_err());
    }
}
