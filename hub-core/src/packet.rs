use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HubError;
use crate::header::{self, EnvelopeHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::message::{
    Acknowledgement, Command, Connect, ConnectResponse, Event, ForwardingPacket, Frame, PeerId,
};

/// Largest envelope accepted in a single UDP datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// One typed message. Exactly one [`Payload`] variant is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Unique per packet; acknowledgements and response matching refer to it.
    pub id: Uuid,
    /// Sender as stamped by the sending side's session layer. Informational
    /// only: receivers use the transport-level peer id for anything that matters.
    pub from: PeerId,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Connect(Connect),
    ConnectResponse(ConnectResponse),
    Command(Command),
    Event(Event),
    Acknowledgement(Acknowledgement),
    Frame(Frame),
    Forwarding(ForwardingPacket),
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Connect(_) => "Connect",
            Payload::ConnectResponse(_) => "ConnectResponse",
            Payload::Command(_) => "Command",
            Payload::Event(_) => "Event",
            Payload::Acknowledgement(_) => "Acknowledgement",
            Payload::Frame(_) => "Frame",
            Payload::Forwarding(_) => "ForwardingPacket",
        }
    }
}

macro_rules! payload_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for Payload {
                fn from(value: $ty) -> Self {
                    Payload::$variant(value)
                }
            }
        )*
    };
}

payload_from!(
    Connect(Connect),
    ConnectResponse(ConnectResponse),
    Command(Command),
    Event(Event),
    Acknowledgement(Acknowledgement),
    Frame(Frame),
    Forwarding(ForwardingPacket),
);

/// A failed decode, paired with how many bytes the reader must discard
/// so it does not trip over the same input again.
#[derive(Debug)]
pub struct DecodeFailure {
    pub consumed: usize,
    pub error: HubError,
}

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes discarded)", self.error, self.consumed)
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_PAYLOAD_SIZE as u64)
}

impl Packet {
    /// Wrap `payload` in a packet with a fresh id and no sender.
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: PeerId::NIL,
            payload: payload.into(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(Command::heartbeat())
    }

    pub fn with_from(mut self, from: PeerId) -> Self {
        self.from = from;
        self
    }

    /// Serialized packet without the envelope header.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, HubError> {
        wire_options()
            .serialize(self)
            .map_err(|e| HubError::Encoding(e.to_string()))
    }

    pub fn from_payload_bytes(bytes: &[u8]) -> Result<Self, HubError> {
        wire_options()
            .deserialize(bytes)
            .map_err(|e| HubError::Decode(e.to_string()))
    }

    /// Encode into a complete envelope: header followed by payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, HubError> {
        let payload = self.payload_bytes()?;
        let header = EnvelopeHeader::for_payload(&payload)?;

        let mut envelope = Vec::with_capacity(header.total_size());
        envelope.extend_from_slice(&header.to_bytes());
        envelope.extend_from_slice(&payload);
        Ok(envelope)
    }

    /// Decode the envelope at the start of `bytes`.
    ///
    /// Returns the packet and the number of bytes it occupied. On failure
    /// the [`DecodeFailure`] says how much to discard: the whole envelope
    /// when its size is known, one header's worth when it is not, and
    /// nothing when `bytes` is merely incomplete.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), DecodeFailure> {
        let header = EnvelopeHeader::from_bytes(bytes).map_err(|error| DecodeFailure {
            consumed: HEADER_SIZE.min(bytes.len()),
            error,
        })?;

        let total = header.total_size();
        if bytes.len() < total {
            return Err(DecodeFailure {
                consumed: 0,
                error: HubError::Truncated {
                    expected: total,
                    actual: bytes.len(),
                },
            });
        }

        let payload = &bytes[HEADER_SIZE..total];
        if !header.verify(payload) {
            return Err(DecodeFailure {
                consumed: total,
                error: HubError::ChecksumMismatch,
            });
        }

        Self::from_payload_bytes(payload)
            .map(|packet| (packet, total))
            .map_err(|error| DecodeFailure {
                consumed: total,
                error,
            })
    }

    /// Decode a datagram that must hold exactly one envelope.
    pub fn from_datagram(bytes: &[u8]) -> Result<Self, HubError> {
        if !header::looks_like_header(bytes) {
            return Err(HubError::InvalidMagic);
        }
        Self::decode(bytes)
            .map(|(packet, _)| packet)
            .map_err(|failure| failure.error)
    }

    /// One-line description for diagnostics.
    pub fn summary(&self) -> String {
        let detail = match &self.payload {
            Payload::Connect(connect) => format!("{} {:?}", connect.client_type, connect.name),
            Payload::ConnectResponse(response) => {
                format!("{:?}", response.response.response_type)
            }
            Payload::Command(command) => command.command_type.to_string(),
            Payload::Event(event) => {
                let user = event.user();
                format!("{} from ({} : {})", event.kind(), user.id, user.name)
            }
            Payload::Acknowledgement(ack) => ack.packet_id.to_string(),
            Payload::Frame(frame) => frame.data.len().to_string(),
            Payload::Forwarding(forwarding) => {
                let inner = forwarding
                    .packet()
                    .map(|p| p.payload.name())
                    .unwrap_or("undecodable");
                format!("{inner} -> {} peers", forwarding.destinations.len())
            }
        };
        format!("({}) ({detail})", self.payload.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClientType, CommandType, Response, User};
    use crate::state::State;

    fn sample_packets() -> Vec<Packet> {
        let user = User::new(PeerId::new(), "alice");
        let mut state = State::default();
        state.add_user(user.clone());

        let inner = Packet::new(Command {
            command_type: CommandType::Custom("ping".into()),
        });

        vec![
            Packet::new(Connect {
                client_type: ClientType::User,
                name: "alice".into(),
                password: String::new(),
                user_id: "0".into(),
                client_version: 7,
            }),
            Packet::new(ConnectResponse {
                response: Response::success("ok"),
                self_user: Some(user.clone()),
                state: Some(state),
                server_version: 7,
            }),
            Packet::heartbeat(),
            Packet::new(Event::UserLeft(user)).with_from(PeerId::new()),
            Packet::new(Acknowledgement {
                packet_id: Uuid::new_v4(),
            }),
            Packet::new(Frame {
                timestamp: 1_700_000_000_000,
                file_id: "cam-0".into(),
                compressed: false,
                data: vec![0xFF, 0xD8, 0xFF, 0xE0],
            }),
            Packet::new(ForwardingPacket::new(&inner, vec![PeerId::new(), PeerId::new()]).unwrap()),
        ]
    }

    #[test]
    fn decode_inverts_encode() {
        for packet in sample_packets() {
            let bytes = packet.to_bytes().unwrap();
            let (decoded, consumed) = Packet::decode(&bytes).unwrap();
            assert_eq!(decoded, packet);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn encode_is_deterministic() {
        let packet = Packet::heartbeat();
        assert_eq!(packet.to_bytes().unwrap(), packet.to_bytes().unwrap());
    }

    #[test]
    fn decode_ignores_trailing_bytes_after_envelope() {
        let packet = Packet::heartbeat();
        let mut bytes = packet.to_bytes().unwrap();
        let len = bytes.len();
        bytes.extend_from_slice(b"next envelope");
        let (decoded, consumed) = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(consumed, len);
    }

    #[test]
    fn corrupted_payload_consumes_whole_envelope() {
        let mut bytes = Packet::heartbeat().to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let failure = Packet::decode(&bytes).unwrap_err();
        assert!(matches!(failure.error, HubError::ChecksumMismatch));
        assert_eq!(failure.consumed, bytes.len());
    }

    #[test]
    fn undeserializable_payload_consumes_whole_envelope() {
        let junk = [0xEEu8; 9];
        let header = EnvelopeHeader::for_payload(&junk).unwrap();
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&junk);

        let failure = Packet::decode(&bytes).unwrap_err();
        assert!(matches!(failure.error, HubError::Decode(_)));
        assert_eq!(failure.consumed, bytes.len());
    }

    #[test]
    fn bad_header_consumes_header_size() {
        let bytes = [0u8; 32];
        let failure = Packet::decode(&bytes).unwrap_err();
        assert!(matches!(failure.error, HubError::InvalidMagic));
        assert_eq!(failure.consumed, HEADER_SIZE);
    }

    #[test]
    fn truncated_envelope_consumes_nothing() {
        let bytes = Packet::heartbeat().to_bytes().unwrap();
        let failure = Packet::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(failure.error, HubError::Truncated { .. }));
        assert_eq!(failure.consumed, 0);
    }

    #[test]
    fn datagram_requires_header() {
        assert!(Packet::from_datagram(b"short").is_err());
        let packet = Packet::heartbeat();
        let decoded = Packet::from_datagram(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn summary_names_variant_and_detail() {
        assert_eq!(Packet::heartbeat().summary(), "(Command) (Heartbeat)");

        let inner = Packet::heartbeat();
        let fwd = Packet::new(ForwardingPacket::new(&inner, vec![PeerId::new()]).unwrap());
        assert_eq!(fwd.summary(), "(ForwardingPacket) (Command -> 1 peers)");

        let frame = Packet::new(Frame {
            timestamp: 0,
            file_id: String::new(),
            compressed: false,
            data: vec![1, 2, 3],
        });
        assert_eq!(frame.summary(), "(Frame) (3)");
    }
}
