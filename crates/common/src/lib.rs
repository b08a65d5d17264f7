pub mod config;
pub mod error;
pub mod types;

pub use config::{
    ApiConfig, AppConfig, ConfigError, DeviceConfig, NetworkConfig, ProviderKind, ProxyConfig,
    RotationConfig, ToggleCommandConfig, TunnelConfig, TunnelEgress,
};
pub use error::ProxyError;
pub use types::{RadioKind, TargetAddr, TrafficCounters, TrafficSnapshot};

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

pub const DEVICE_ID_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid device id length: expected {expected}, got {actual}")]
    InvalidDeviceId { expected: usize, actual: usize },
    #[error("invalid device id: {0}")]
    InvalidDeviceIdFormat(String),
    #[error("invalid target address: {0}")]
    InvalidTarget(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// Binary identifier the tunnel presents in its AUTH frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    pub fn from_bytes(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DomainError> {
        if bytes.len() != DEVICE_ID_LEN {
            return Err(DomainError::InvalidDeviceId {
                expected: DEVICE_ID_LEN,
                actual: bytes.len(),
            });
        }

        let mut array = [0u8; DEVICE_ID_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    /// Fresh random identifier, used when a config file is first written.
    pub fn generate() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Accepts the hyphenated UUID form as well as 32 plain hex digits.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        let uuid = Uuid::parse_str(s.trim())
            .map_err(|err| DomainError::InvalidDeviceIdFormat(err.to_string()))?;
        Ok(Self(*uuid.as_bytes()))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.to_hex())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl From<[u8; DEVICE_ID_LEN]> for DeviceId {
    fn from(value: [u8; DEVICE_ID_LEN]) -> Self {
        Self::from_bytes(value)
    }
}

impl TryFrom<&[u8]> for DeviceId {
    type Error = DomainError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_slice(value)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.to_string()
    }
}

impl FromStr for DeviceId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_rejects_wrong_length() {
        let err = DeviceId::try_from(&[1u8; 32][..]).unwrap_err();
        assert!(matches!(err, DomainError::InvalidDeviceId { .. }));
    }

    #[test]
    fn device_id_parses_hyphenated_uuid() {
        let id = DeviceId::parse("123e4567-e89b-12d3-a456-426614174000").unwrap();
        assert_eq!(id.as_bytes()[0], 0x12);
        assert_eq!(id.as_bytes()[15], 0x00);
        assert_eq!(id.to_string(), "123e4567-e89b-12d3-a456-426614174000");
    }

    #[test]
    fn device_id_parses_plain_hex() {
        let id: DeviceId = "123e4567e89b12d3a456426614174000".parse().unwrap();
        assert_eq!(id.to_hex(), "123e4567e89b12d3a456426614174000");
    }

    #[test]
    fn device_id_rejects_garbage() {
        let err = DeviceId::parse("not-a-device").unwrap_err();
        assert!(matches!(err, DomainError::InvalidDeviceIdFormat(_)));
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(DeviceId::generate(), DeviceId::generate());
    }
}
