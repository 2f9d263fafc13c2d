//! Chat service descriptor
//!
//! Static definition of the attributes a host serves and a guest addresses. Both
//! roles use these constants to reach the same logical wire points; nothing is
//! negotiated at runtime.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::RadioError;

// ----------------------------------------------------------------------------
// Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// nearchat service UUID, used as the advertisement filter
pub const CHAT_SERVICE_UUID: Uuid = Uuid::from_u128(0x8C3A0001_4F1B_4D2C_9E57_3B0F6A21C7D4);

/// Read-only attribute holding the socket channel port
pub const SOCKET_PORT_UUID: Uuid = Uuid::from_u128(0x8C3A0002_4F1B_4D2C_9E57_3B0F6A21C7D4);

/// Attribute guests write reactions into
pub const REACTIONS_INBOX_UUID: Uuid = Uuid::from_u128(0x8C3A0003_4F1B_4D2C_9E57_3B0F6A21C7D4);

/// Attribute holding the host's latest reaction, readable and notifying
pub const REACTIONS_OUTBOX_UUID: Uuid = Uuid::from_u128(0x8C3A0004_4F1B_4D2C_9E57_3B0F6A21C7D4);

/// Presentation format code for a UTF-8 string value
pub const FORMAT_UTF8: u8 = 0x19;

// ----------------------------------------------------------------------------
// Attribute Flags
// ----------------------------------------------------------------------------

/// Operations a characteristic supports on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Properties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

/// Access permissions enforced by the serving stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    pub readable: bool,
    pub writeable: bool,
    /// Link must be encrypted before the value is accessed
    pub encryption_required: bool,
}

/// Human-readable format annotation attached to a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationFormat {
    pub format: u8,
    pub description: &'static str,
}

/// Static definition of one characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicSpec {
    pub uuid: Uuid,
    pub name: &'static str,
    pub properties: Properties,
    pub permissions: Permissions,
    pub format: Option<PresentationFormat>,
}

/// Static definition of the chat service
#[derive(Debug, Clone, Copy)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub characteristics: &'static [CharacteristicSpec],
}

impl ServiceDescriptor {
    /// Look up a characteristic spec by UUID
    pub fn characteristic(&self, uuid: Uuid) -> Option<&'static CharacteristicSpec> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }

    /// UUIDs of every characteristic in declaration order
    pub fn characteristic_uuids(&self) -> Vec<Uuid> {
        self.characteristics.iter().map(|c| c.uuid).collect()
    }
}

const CHAT_CHARACTERISTICS: [CharacteristicSpec; 3] = [
    CharacteristicSpec {
        uuid: SOCKET_PORT_UUID,
        name: "socket-port",
        properties: Properties {
            read: true,
            write: false,
            write_without_response: false,
            notify: false,
        },
        permissions: Permissions {
            readable: true,
            writeable: false,
            encryption_required: true,
        },
        format: None,
    },
    CharacteristicSpec {
        uuid: REACTIONS_INBOX_UUID,
        name: "reactions-inbox",
        properties: Properties {
            read: false,
            write: true,
            write_without_response: true,
            notify: false,
        },
        permissions: Permissions {
            readable: false,
            writeable: true,
            encryption_required: false,
        },
        format: Some(PresentationFormat {
            format: FORMAT_UTF8,
            description: "Incoming reaction",
        }),
    },
    CharacteristicSpec {
        uuid: REACTIONS_OUTBOX_UUID,
        name: "reactions-outbox",
        properties: Properties {
            read: true,
            write: false,
            write_without_response: false,
            notify: true,
        },
        permissions: Permissions {
            readable: true,
            writeable: false,
            encryption_required: false,
        },
        format: Some(PresentationFormat {
            format: FORMAT_UTF8,
            description: "Outgoing reaction",
        }),
    },
];

/// The chat service, shared by both roles
pub const CHAT_SERVICE: ServiceDescriptor = ServiceDescriptor {
    uuid: CHAT_SERVICE_UUID,
    characteristics: &CHAT_CHARACTERISTICS,
};

// ----------------------------------------------------------------------------
// Socket Port
// ----------------------------------------------------------------------------

/// Protocol/service multiplexer identifying an L2CAP-style socket channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Psm(pub u16);

impl Psm {
    /// Encoded length of the `SocketPort` attribute value
    pub const ENCODED_LEN: usize = 2;

    /// Encode as the `SocketPort` attribute value (little-endian)
    pub fn encode(&self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }

    /// Decode a `SocketPort` attribute value
    pub fn decode(value: &[u8]) -> Result<Self, RadioError> {
        let bytes: [u8; Self::ENCODED_LEN] = value.try_into().map_err(|_| {
            RadioError::Platform(format!(
                "socket port value must be {} bytes, got {}",
                Self::ENCODED_LEN,
                value.len()
            ))
        })?;
        Ok(Self(u16::from_le_bytes(bytes)))
    }
}

impl std::fmt::Display for Psm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Runtime Service Instance
// ----------------------------------------------------------------------------

/// One characteristic as published, with its static value if it has one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDefinition {
    pub spec: &'static CharacteristicSpec,
    /// Value served directly by the stack; `None` means reads go to the host
    pub value: Option<Vec<u8>>,
}

/// Service as published for one advertise cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicDefinition>,
}

impl ServiceDefinition {
    /// Instantiate the chat service with the socket port baked into `SocketPort`
    pub fn with_socket_port(port: Psm) -> Self {
        let characteristics = CHAT_SERVICE
            .characteristics
            .iter()
            .map(|spec| CharacteristicDefinition {
                spec,
                value: (spec.uuid == SOCKET_PORT_UUID).then(|| port.encode()),
            })
            .collect();

        Self {
            uuid: CHAT_SERVICE.uuid,
            characteristics,
        }
    }

    /// Find a published characteristic
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicDefinition> {
        self.characteristics.iter().find(|c| c.spec.uuid == uuid)
    }

    /// Socket port baked into this definition
    pub fn socket_port(&self) -> Option<Psm> {
        self.characteristic(SOCKET_PORT_UUID)
            .and_then(|c| c.value.as_deref())
            .and_then(|v| Psm::decode(v).ok())
    }
}

/// Advertisement payload a host emits while broadcasting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub local_name: String,
    pub service_uuids: Vec<Uuid>,
}

impl Advertisement {
    /// Advertisement for the chat service under the given chat name
    pub fn for_chat(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            service_uuids: vec![CHAT_SERVICE_UUID],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_declares_three_attributes() {
        assert_eq!(CHAT_SERVICE.characteristics.len(), 3);

        let port = CHAT_SERVICE.characteristic(SOCKET_PORT_UUID).unwrap();
        assert!(port.properties.read);
        assert!(!port.properties.notify);
        assert!(port.permissions.encryption_required);
        assert!(port.format.is_none());

        let inbox = CHAT_SERVICE.characteristic(REACTIONS_INBOX_UUID).unwrap();
        assert!(inbox.properties.write && inbox.properties.write_without_response);
        assert!(!inbox.permissions.encryption_required);
        assert_eq!(inbox.format.unwrap().format, FORMAT_UTF8);

        let outbox = CHAT_SERVICE.characteristic(REACTIONS_OUTBOX_UUID).unwrap();
        assert!(outbox.properties.read && outbox.properties.notify);
        assert!(!outbox.properties.write);

        assert!(CHAT_SERVICE.characteristic(CHAT_SERVICE_UUID).is_none());
    }

    #[test]
    fn test_psm_codec() {
        let psm = Psm(0x0081);
        assert_eq!(psm.encode(), vec![0x81, 0x00]);
        assert_eq!(Psm::decode(&[0x81, 0x00]).unwrap(), psm);
        assert!(Psm::decode(&[0x81]).is_err());
        assert!(Psm::decode(&[0x81, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_service_definition_bakes_port() {
        let def = ServiceDefinition::with_socket_port(Psm(0x00C3));
        assert_eq!(def.uuid, CHAT_SERVICE_UUID);
        assert_eq!(def.socket_port(), Some(Psm(0x00C3)));
        assert!(def.characteristic(REACTIONS_OUTBOX_UUID).unwrap().value.is_none());
        assert!(def.characteristic(REACTIONS_INBOX_UUID).unwrap().value.is_none());
    }

    #[test]
    fn test_advertisement_carries_service_uuid() {
        let adv = Advertisement::for_chat("Lunch table");
        assert_eq!(adv.local_name, "Lunch table");
        assert_eq!(adv.service_uuids, vec![CHAT_SERVICE_UUID]);
    }
}
