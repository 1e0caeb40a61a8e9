//! STUN wire codec per RFC 3489, extended with the XOR-MAPPED-ADDRESS
//! attribute (type 0x8020). Only the IPv4 address family is carried;
//! the servers this application talks to predate anything else.

use rand::RngCore;
use std::net::Ipv4Addr;
use thiserror::Error as ThisError;

pub const HEADER_SIZE: usize = 20;

const MAPPED_ADDRESS: u16 = 0x0001;
const RESPONSE_ADDRESS: u16 = 0x0002;
const CHANGE_REQUEST: u16 = 0x0003;
const SOURCE_ADDRESS: u16 = 0x0004;
const CHANGED_ADDRESS: u16 = 0x0005;
const USERNAME: u16 = 0x0006;
const PASSWORD: u16 = 0x0007;
const MESSAGE_INTEGRITY: u16 = 0x0008;
const ERROR_CODE: u16 = 0x0009;
const UNKNOWN_ATTRIBUTES: u16 = 0x000A;
const REFLECTED_FROM: u16 = 0x000B;
const XOR_MAPPED_ADDRESS: u16 = 0x8020;

const CHANGE_IP_FLAG: u32 = 0x0000_0004;
const CHANGE_PORT_FLAG: u32 = 0x0000_0002;

const ADDRESS_FAMILY_IPV4: u8 = 0x01;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum StunCodecError {
    #[error("datagram shorter than the STUN header")]
    TooShort,
    #[error("unknown message type {0:#06x}")]
    UnknownMessageType(u16),
    #[error("attribute {0:#06x} is truncated")]
    TruncatedAttribute(u16),
    #[error("unsupported address family {0:#04x}")]
    UnsupportedFamily(u8),
    #[error("message length field disagrees with the datagram")]
    LengthMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    BindingRequest,
    BindingResponse,
    BindingErrorResponse,
    SharedSecretRequest,
    SharedSecretResponse,
    SharedSecretErrorResponse,
}

impl MessageKind {
    fn as_u16(self) -> u16 {
        match self {
            MessageKind::BindingRequest => 0x0001,
            MessageKind::BindingResponse => 0x0101,
            MessageKind::BindingErrorResponse => 0x0111,
            MessageKind::SharedSecretRequest => 0x0002,
            MessageKind::SharedSecretResponse => 0x0102,
            MessageKind::SharedSecretErrorResponse => 0x0112,
        }
    }

    fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0001 => MessageKind::BindingRequest,
            0x0101 => MessageKind::BindingResponse,
            0x0111 => MessageKind::BindingErrorResponse,
            0x0002 => MessageKind::SharedSecretRequest,
            0x0102 => MessageKind::SharedSecretResponse,
            0x0112 => MessageKind::SharedSecretErrorResponse,
            _ => return None,
        })
    }
}

/// A transport address carried by the address-shaped attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressValue {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl AddressValue {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    MappedAddress(AddressValue),
    ResponseAddress(AddressValue),
    ChangeRequest { change_ip: bool, change_port: bool },
    SourceAddress(AddressValue),
    ChangedAddress(AddressValue),
    Username(Vec<u8>),
    Password(Vec<u8>),
    MessageIntegrity([u8; 20]),
    ErrorCode { code: u16, reason: String },
    UnknownAttributes(Vec<u16>),
    ReflectedFrom(AddressValue),
    /// The mapped address XORed with the leading transaction id bytes,
    /// so that rewriting routers cannot recognize and translate it.
    XorMappedAddress(AddressValue),
    /// An attribute this implementation does not interpret, kept
    /// verbatim.
    Other { attribute_type: u16, value: Vec<u8> },
}

impl Attribute {
    fn attribute_type(&self) -> u16 {
        match self {
            Attribute::MappedAddress(_) => MAPPED_ADDRESS,
            Attribute::ResponseAddress(_) => RESPONSE_ADDRESS,
            Attribute::ChangeRequest { .. } => CHANGE_REQUEST,
            Attribute::SourceAddress(_) => SOURCE_ADDRESS,
            Attribute::ChangedAddress(_) => CHANGED_ADDRESS,
            Attribute::Username(_) => USERNAME,
            Attribute::Password(_) => PASSWORD,
            Attribute::MessageIntegrity(_) => MESSAGE_INTEGRITY,
            Attribute::ErrorCode { .. } => ERROR_CODE,
            Attribute::UnknownAttributes(_) => UNKNOWN_ATTRIBUTES,
            Attribute::ReflectedFrom(_) => REFLECTED_FROM,
            Attribute::XorMappedAddress(_) => XOR_MAPPED_ADDRESS,
            Attribute::Other { attribute_type, .. } => *attribute_type,
        }
    }

    fn encode_value(&self, transaction_id: &[u8; 16]) -> Vec<u8> {
        match self {
            Attribute::MappedAddress(value)
            | Attribute::ResponseAddress(value)
            | Attribute::SourceAddress(value)
            | Attribute::ChangedAddress(value)
            | Attribute::ReflectedFrom(value) => encode_address(value),
            Attribute::XorMappedAddress(value) => {
                encode_address(&xor_address(value, transaction_id))
            }
            Attribute::ChangeRequest {
                change_ip,
                change_port,
            } => {
                let mut flags = 0;
                if *change_ip {
                    flags |= CHANGE_IP_FLAG;
                }
                if *change_port {
                    flags |= CHANGE_PORT_FLAG;
                }
                flags.to_be_bytes().to_vec()
            }
            Attribute::Username(bytes) | Attribute::Password(bytes) => bytes.clone(),
            Attribute::MessageIntegrity(hmac) => hmac.to_vec(),
            Attribute::ErrorCode { code, reason } => {
                let mut out = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
                out.extend_from_slice(reason.as_bytes());
                out
            }
            Attribute::UnknownAttributes(types) => {
                let mut out = Vec::with_capacity(types.len() * 2 + 2);
                for attribute_type in types {
                    out.extend_from_slice(&attribute_type.to_be_bytes());
                }
                // An odd count repeats the last type to keep the value
                // aligned.
                if types.len() % 2 == 1 {
                    out.extend_from_slice(&types[types.len() - 1].to_be_bytes());
                }
                out
            }
            Attribute::Other { value, .. } => value.clone(),
        }
    }

    fn decode(
        attribute_type: u16,
        value: &[u8],
        transaction_id: &[u8; 16],
    ) -> Result<Self, StunCodecError> {
        Ok(match attribute_type {
            MAPPED_ADDRESS => Attribute::MappedAddress(decode_address(attribute_type, value)?),
            RESPONSE_ADDRESS => Attribute::ResponseAddress(decode_address(attribute_type, value)?),
            SOURCE_ADDRESS => Attribute::SourceAddress(decode_address(attribute_type, value)?),
            CHANGED_ADDRESS => Attribute::ChangedAddress(decode_address(attribute_type, value)?),
            REFLECTED_FROM => Attribute::ReflectedFrom(decode_address(attribute_type, value)?),
            XOR_MAPPED_ADDRESS => {
                let xored = decode_address(attribute_type, value)?;
                Attribute::XorMappedAddress(xor_address(&xored, transaction_id))
            }
            CHANGE_REQUEST => {
                if value.len() < 4 {
                    return Err(StunCodecError::TruncatedAttribute(attribute_type));
                }
                let flags = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                Attribute::ChangeRequest {
                    change_ip: flags & CHANGE_IP_FLAG != 0,
                    change_port: flags & CHANGE_PORT_FLAG != 0,
                }
            }
            USERNAME => Attribute::Username(value.to_vec()),
            PASSWORD => Attribute::Password(value.to_vec()),
            MESSAGE_INTEGRITY => {
                let hmac: [u8; 20] = value
                    .try_into()
                    .map_err(|_| StunCodecError::TruncatedAttribute(attribute_type))?;
                Attribute::MessageIntegrity(hmac)
            }
            ERROR_CODE => {
                if value.len() < 4 {
                    return Err(StunCodecError::TruncatedAttribute(attribute_type));
                }
                let code = value[2] as u16 * 100 + value[3] as u16;
                let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                Attribute::ErrorCode { code, reason }
            }
            UNKNOWN_ATTRIBUTES => {
                if value.len() % 2 != 0 {
                    return Err(StunCodecError::TruncatedAttribute(attribute_type));
                }
                let types = value
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Attribute::UnknownAttributes(types)
            }
            _ => Attribute::Other {
                attribute_type,
                value: value.to_vec(),
            },
        })
    }
}

fn encode_address(value: &AddressValue) -> Vec<u8> {
    let mut out = vec![0, ADDRESS_FAMILY_IPV4];
    out.extend_from_slice(&value.port.to_be_bytes());
    out.extend_from_slice(&value.address.octets());
    out
}

fn decode_address(attribute_type: u16, value: &[u8]) -> Result<AddressValue, StunCodecError> {
    if value.len() < 8 {
        return Err(StunCodecError::TruncatedAttribute(attribute_type));
    }
    if value[1] != ADDRESS_FAMILY_IPV4 {
        return Err(StunCodecError::UnsupportedFamily(value[1]));
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let address = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
    Ok(AddressValue { address, port })
}

/// XOR is its own inverse, so the same transform encodes and decodes.
fn xor_address(value: &AddressValue, transaction_id: &[u8; 16]) -> AddressValue {
    let port = value.port ^ u16::from_be_bytes([transaction_id[0], transaction_id[1]]);
    let mask = [
        transaction_id[0],
        transaction_id[1],
        transaction_id[2],
        transaction_id[3],
    ];
    let octets = value.address.octets();
    let address = Ipv4Addr::new(
        octets[0] ^ mask[0],
        octets[1] ^ mask[1],
        octets[2] ^ mask[2],
        octets[3] ^ mask[3],
    );
    AddressValue { address, port }
}

/// One STUN message: kind, 128-bit transaction id, and attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub kind: MessageKind,
    pub transaction_id: [u8; 16],
    pub attributes: Vec<Attribute>,
}

impl StunMessage {
    /// Creates a message with a fresh random transaction id.
    pub fn new(kind: MessageKind) -> Self {
        let mut transaction_id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        Self {
            kind,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn with_transaction_id(kind: MessageKind, transaction_id: [u8; 16]) -> Self {
        Self {
            kind,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn mapped_address(&self) -> Option<AddressValue> {
        self.attributes.iter().find_map(|attribute| match attribute {
            Attribute::MappedAddress(value) => Some(*value),
            _ => None,
        })
    }

    /// The peer-visible mapping, preferring the XOR form when present.
    pub fn external_address(&self) -> Option<AddressValue> {
        self.xor_mapped_address().or_else(|| self.mapped_address())
    }

    pub fn xor_mapped_address(&self) -> Option<AddressValue> {
        self.attributes.iter().find_map(|attribute| match attribute {
            Attribute::XorMappedAddress(value) => Some(*value),
            _ => None,
        })
    }

    pub fn changed_address(&self) -> Option<AddressValue> {
        self.attributes.iter().find_map(|attribute| match attribute {
            Attribute::ChangedAddress(value) => Some(*value),
            _ => None,
        })
    }

    pub fn source_address(&self) -> Option<AddressValue> {
        self.attributes.iter().find_map(|attribute| match attribute {
            Attribute::SourceAddress(value) => Some(*value),
            _ => None,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for attribute in &self.attributes {
            let value = attribute.encode_value(&self.transaction_id);
            body.extend_from_slice(&attribute.attribute_type().to_be_bytes());
            body.extend_from_slice(&(value.len() as u16).to_be_bytes());
            body.extend_from_slice(&value);
        }
        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(&self.kind.as_u16().to_be_bytes());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.transaction_id);
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, StunCodecError> {
        if datagram.len() < HEADER_SIZE {
            return Err(StunCodecError::TooShort);
        }
        let raw_kind = u16::from_be_bytes([datagram[0], datagram[1]]);
        let kind =
            MessageKind::from_u16(raw_kind).ok_or(StunCodecError::UnknownMessageType(raw_kind))?;
        let length = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
        if datagram.len() != HEADER_SIZE + length {
            return Err(StunCodecError::LengthMismatch);
        }
        let mut transaction_id = [0u8; 16];
        transaction_id.copy_from_slice(&datagram[4..20]);

        let mut attributes = Vec::new();
        let mut rest = &datagram[HEADER_SIZE..];
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(StunCodecError::TooShort);
            }
            let attribute_type = u16::from_be_bytes([rest[0], rest[1]]);
            let value_len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            if rest.len() < 4 + value_len {
                return Err(StunCodecError::TruncatedAttribute(attribute_type));
            }
            attributes.push(Attribute::decode(
                attribute_type,
                &rest[4..4 + value_len],
                &transaction_id,
            )?);
            rest = &rest[4 + value_len..];
        }

        Ok(Self {
            kind,
            transaction_id,
            attributes,
        })
    }
}
