//! Peer addressing and identity.

use crate::error::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bluetooth device address, normalised to upper-case `XX:XX:XX:XX:XX:XX`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BtAddress([u8; 6]);

impl BtAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for BtAddress {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || LinkError::InvalidAddress(s.to_string());

        let mut octets = [0u8; 6];
        let mut parts = s.trim().split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for BtAddress {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BtAddress> for String {
    fn from(value: BtAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for BtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// A peer as the link layer knows it
///
/// The device identifier is only learned from an identity announcement, so a
/// peer reached by address alone has none yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub address: BtAddress,
    pub device_id: Option<String>,
}

impl PeerIdentity {
    pub fn from_address(address: BtAddress) -> Self {
        Self {
            address,
            device_id: None,
        }
    }

    pub fn new(address: BtAddress, device_id: impl Into<String>) -> Self {
        Self {
            address,
            device_id: Some(device_id.into()),
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device_id {
            Some(id) => write!(f, "{id}@{}", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}
