//! Record types, modes, encodings and fault codes.

use std::fmt;

/// Protocol version written in the `Version` record (major, minor).
pub const VERSION: (u8, u8) = (1, 0);

/// Namespace prefix of fault strings sent in `Fault` records.
pub const FAULT_NAMESPACE: &str = "http://schemas.microsoft.com/ws/2006/05/framing/faults/";

/// Leading byte of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    Version = 0x00,
    Mode = 0x01,
    Via = 0x02,
    KnownEncoding = 0x03,
    ExtensibleEncoding = 0x04,
    UnsizedEnvelope = 0x05,
    SizedEnvelope = 0x06,
    End = 0x07,
    Fault = 0x08,
    UpgradeRequest = 0x09,
    UpgradeResponse = 0x0A,
    PreambleAck = 0x0B,
    PreambleEnd = 0x0C,
}

impl RecordType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::Version,
            0x01 => Self::Mode,
            0x02 => Self::Via,
            0x03 => Self::KnownEncoding,
            0x04 => Self::ExtensibleEncoding,
            0x05 => Self::UnsizedEnvelope,
            0x06 => Self::SizedEnvelope,
            0x07 => Self::End,
            0x08 => Self::Fault,
            0x09 => Self::UpgradeRequest,
            0x0A => Self::UpgradeResponse,
            0x0B => Self::PreambleAck,
            0x0C => Self::PreambleEnd,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Version => "Version",
            Self::Mode => "Mode",
            Self::Via => "Via",
            Self::KnownEncoding => "KnownEncoding",
            Self::ExtensibleEncoding => "ExtensibleEncoding",
            Self::UnsizedEnvelope => "UnsizedEnvelope",
            Self::SizedEnvelope => "SizedEnvelope",
            Self::End => "End",
            Self::Fault => "Fault",
            Self::UpgradeRequest => "UpgradeRequest",
            Self::UpgradeResponse => "UpgradeResponse",
            Self::PreambleAck => "PreambleAck",
            Self::PreambleEnd => "PreambleEnd",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Session mode announced in the `Mode` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Mode {
    SingletonUnsized = 0x01,
    Duplex = 0x02,
    Simplex = 0x03,
    SingletonSized = 0x04,
}

impl Mode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::SingletonUnsized,
            0x02 => Self::Duplex,
            0x03 => Self::Simplex,
            0x04 => Self::SingletonSized,
            _ => return None,
        })
    }
}

/// Pre-assigned message encodings for the `KnownEncoding` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum KnownEncoding {
    Soap11Utf8 = 0x00,
    Soap11Utf16 = 0x01,
    Soap11Utf16Ffe = 0x02,
    Soap12Utf8 = 0x03,
    Soap12Utf16 = 0x04,
    Soap12Utf16Ffe = 0x05,
    Mtom = 0x06,
    Binary = 0x07,
    BinarySession = 0x08,
}

impl KnownEncoding {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::Soap11Utf8,
            0x01 => Self::Soap11Utf16,
            0x02 => Self::Soap11Utf16Ffe,
            0x03 => Self::Soap12Utf8,
            0x04 => Self::Soap12Utf16,
            0x05 => Self::Soap12Utf16Ffe,
            0x06 => Self::Mtom,
            0x07 => Self::Binary,
            0x08 => Self::BinarySession,
            _ => return None,
        })
    }
}

/// Which quota-limited field a size check applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaField {
    Via,
    ContentType,
    Fault,
    UpgradeContentType,
    Envelope,
}

impl fmt::Display for QuotaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QuotaField::Via => "via",
            QuotaField::ContentType => "content type",
            QuotaField::Fault => "fault string",
            QuotaField::UpgradeContentType => "upgrade content type",
            QuotaField::Envelope => "envelope",
        })
    }
}

/// Size limits applied while decoding and encoding records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Quotas {
    /// Maximum encoded length of a `Via` URI. Default: 2048.
    pub max_via: u32,
    /// Maximum encoded length of an extensible content type. Default: 256.
    pub max_content_type: u32,
    /// Maximum encoded length of a fault string. Default: 256.
    pub max_fault: u32,
    /// Maximum encoded length of an upgrade content type. Default: 256.
    pub max_upgrade_content_type: u32,
    /// Maximum size of a single received envelope. Default: 64 KiB.
    pub max_envelope: u32,
}

impl Quotas {
    pub fn limit(&self, field: QuotaField) -> u32 {
        match field {
            QuotaField::Via => self.max_via,
            QuotaField::ContentType => self.max_content_type,
            QuotaField::Fault => self.max_fault,
            QuotaField::UpgradeContentType => self.max_upgrade_content_type,
            QuotaField::Envelope => self.max_envelope,
        }
    }
}

impl Default for Quotas {
    fn default() -> Self {
        Self {
            max_via: 2048,
            max_content_type: 256,
            max_fault: 256,
            max_upgrade_content_type: 256,
            max_envelope: 64 * 1024,
        }
    }
}

/// Fault reported by the peer in a `Fault` record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FaultCode {
    EndpointNotFound,
    ContentTypeInvalid,
    ServiceActivationFailed,
    MaxMessageSizeExceeded,
    ServerTooBusy,
    UnsupportedMode,
    UnsupportedVersion,
    ConnectionDispatchFailed,
    EndpointUnavailable,
    EndpointPaused,
    UpgradeInvalid,
    /// Any fault string outside the well-known set, kept verbatim.
    Other(String),
}

impl FaultCode {
    /// Classify a fault string by its final path segment.
    pub fn parse(fault: &str) -> Self {
        let code = fault.rsplit('/').next().unwrap_or(fault);
        match code {
            "EndpointNotFound" => Self::EndpointNotFound,
            "ContentTypeInvalid" => Self::ContentTypeInvalid,
            "ServiceActivationFailed" => Self::ServiceActivationFailed,
            "MaxMessageSizeExceededFault" => Self::MaxMessageSizeExceeded,
            "ServerTooBusy" => Self::ServerTooBusy,
            "UnsupportedMode" => Self::UnsupportedMode,
            "UnsupportedVersion" => Self::UnsupportedVersion,
            "ConnectionDispatchFailed" => Self::ConnectionDispatchFailed,
            "EndpointUnavailable" => Self::EndpointUnavailable,
            "EndpointPaused" => Self::EndpointPaused,
            "UpgradeInvalid" => Self::UpgradeInvalid,
            _ => Self::Other(fault.to_string()),
        }
    }

    /// The fault string as sent on the wire.
    pub fn to_fault_string(&self) -> String {
        let code = match self {
            Self::EndpointNotFound => "EndpointNotFound",
            Self::ContentTypeInvalid => "ContentTypeInvalid",
            Self::ServiceActivationFailed => "ServiceActivationFailed",
            Self::MaxMessageSizeExceeded => "MaxMessageSizeExceededFault",
            Self::ServerTooBusy => "ServerTooBusy",
            Self::UnsupportedMode => "UnsupportedMode",
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::ConnectionDispatchFailed => "ConnectionDispatchFailed",
            Self::EndpointUnavailable => "EndpointUnavailable",
            Self::EndpointPaused => "EndpointPaused",
            Self::UpgradeInvalid => "UpgradeInvalid",
            Self::Other(raw) => return raw.clone(),
        };
        format!("{FAULT_NAMESPACE}{code}")
    }

    /// Faults a caller may reasonably retry against the same endpoint.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServerTooBusy | Self::EndpointUnavailable | Self::EndpointPaused
        )
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(raw) => write!(f, "unrecognized fault '{raw}'"),
            known => {
                let full = known.to_fault_string();
                f.write_str(full.rsplit('/').next().unwrap_or(&full))
            }
        }
    }
}
