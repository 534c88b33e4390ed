//! CoinShuffle wire messages.
//!
//! Hand-maintained prost definitions mirroring the protocol's
//! `message.proto`. Kept as checked-in Rust so the crate builds without a
//! protoc toolchain; field tags are part of the wire contract and must not
//! be renumbered.

use std::collections::HashMap;

/// Top-level envelope: every frame on the wire decodes to one of these.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packets {
    #[prost(message, repeated, tag = "1")]
    pub packet: Vec<Signed>,
}

/// A packet plus an opaque signature. The server never verifies signatures;
/// registration packets carry none.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Signed {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<Packet>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub signature: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packet {
    /// Server-assigned session id; must match on every post-registration packet.
    #[prost(bytes = "vec", tag = "1")]
    pub session: Vec<u8>,
    /// Player number within the pool.
    #[prost(uint32, tag = "2")]
    pub number: u32,
    #[prost(message, optional, tag = "3")]
    pub from_key: Option<VerificationKey>,
    #[prost(message, optional, tag = "4")]
    pub to_key: Option<VerificationKey>,
    #[prost(enumeration = "Phase", tag = "5")]
    pub phase: i32,
    #[prost(message, optional, tag = "6")]
    pub message: Option<Message>,
    #[prost(message, optional, tag = "7")]
    pub registration: Option<Registration>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Registration {
    #[prost(uint64, tag = "1")]
    pub amount: u64,
    #[prost(enumeration = "ShuffleType", tag = "2")]
    pub r#type: i32,
    #[prost(uint64, tag = "3")]
    pub version: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerificationKey {
    #[prost(string, tag = "1")]
    pub key: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncryptionKey {
    #[prost(string, tag = "1")]
    pub key: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DecryptionKey {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub public: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Address {
    #[prost(string, tag = "1")]
    pub address: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hash {
    #[prost(bytes = "vec", tag = "1")]
    pub hash: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Signature {
    #[prost(bytes = "vec", tag = "1")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Transaction {
    #[prost(bytes = "vec", tag = "1")]
    pub transaction: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Invalid {
    #[prost(bytes = "vec", tag = "1")]
    pub invalid: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Inputs {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(string, repeated, tag = "2")]
    pub coins: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Signatures {
    #[prost(string, tag = "1")]
    pub utxo: String,
    #[prost(message, optional, tag = "2")]
    pub signature: Option<Signature>,
}

/// Protocol payload relayed among players. Only `blame` is interpreted by
/// the server; everything else passes through opaquely.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(message, optional, tag = "1")]
    pub address: Option<Address>,
    #[prost(message, optional, tag = "2")]
    pub key: Option<EncryptionKey>,
    #[prost(message, optional, tag = "3")]
    pub hash: Option<Hash>,
    #[prost(message, repeated, tag = "4")]
    pub signatures: Vec<Signatures>,
    #[prost(string, tag = "5")]
    pub str: String,
    #[prost(message, optional, tag = "6")]
    pub blame: Option<Blame>,
    #[prost(map = "string, message", tag = "7")]
    pub inputs: HashMap<String, Inputs>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Blame {
    #[prost(enumeration = "Reason", tag = "1")]
    pub reason: i32,
    #[prost(message, optional, tag = "2")]
    pub accused: Option<VerificationKey>,
    #[prost(message, optional, tag = "3")]
    pub key: Option<DecryptionKey>,
    #[prost(message, optional, tag = "4")]
    pub transaction: Option<Transaction>,
    #[prost(message, optional, tag = "5")]
    pub invalid: Option<Invalid>,
    #[prost(message, optional, tag = "6")]
    pub packets: Option<Packets>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Phase {
    None = 0,
    Announcement = 1,
    Shuffle = 2,
    Broadcast = 3,
    EquivocationCheck = 4,
    Signing = 5,
    VerificationAndSubmission = 6,
    Blame = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Reason {
    Insufficientfunds = 0,
    Doublespend = 1,
    Equivocationfailure = 2,
    Shufflefailure = 3,
    Shuffleandequivocationfailure = 4,
    Invalidsignature = 5,
    Missingoutput = 6,
    Liar = 7,
    Invalidformat = 8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ShuffleType {
    Default = 0,
    Dust = 1,
}

impl ShuffleType {
    /// Name used in the stats payload.
    pub fn label(self) -> &'static str {
        match self {
            ShuffleType::Default => "DEFAULT",
            ShuffleType::Dust => "DUST",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn registration_roundtrip() {
        let packet = Packet {
            from_key: Some(VerificationKey { key: "abc".into() }),
            registration: Some(Registration {
                amount: 100_000_000,
                r#type: ShuffleType::Default as i32,
                version: 999,
            }),
            ..Default::default()
        };

        let buf = packet.encode_to_vec();
        let decoded = Packet::decode(&buf[..]).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.registration.unwrap().amount, 100_000_000);
    }

    #[test]
    fn blame_roundtrip() {
        let envelope = Packets {
            packet: vec![Signed {
                packet: Some(Packet {
                    session: b"session".to_vec(),
                    number: 3,
                    from_key: Some(VerificationKey { key: "blamer".into() }),
                    message: Some(Message {
                        blame: Some(Blame {
                            reason: Reason::Liar as i32,
                            accused: Some(VerificationKey { key: "cheat".into() }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                signature: Some(vec![0u8; 64]),
            }],
        };

        let buf = envelope.encode_to_vec();
        let decoded = Packets::decode(&buf[..]).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn unset_signature_decodes_as_none() {
        let signed = Signed {
            packet: Some(Packet::default()),
            signature: None,
        };
        let decoded = Signed::decode(&signed.encode_to_vec()[..]).unwrap();
        assert!(decoded.signature.is_none());
    }

    #[test]
    fn unknown_enum_values_are_preserved() {
        // Clients may speak a newer protocol revision; the raw i32 survives.
        let packet = Packet {
            phase: 42,
            ..Default::default()
        };
        let decoded = Packet::decode(&packet.encode_to_vec()[..]).unwrap();
        assert_eq!(decoded.phase, 42);
    }
}
