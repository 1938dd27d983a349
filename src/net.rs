//! Network model shared by every component: cluster node and device
//! identifiers, mastership roles, and the device/link inventory records
//! that topology snapshots are built from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// A fresh random identifier, used when the configuration names none.
    pub fn random() -> Self {
        NodeId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a managed device. The unit of ownership.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role a node holds for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MastershipRole {
    Master,
    Standby,
    None,
}

impl fmt::Display for MastershipRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MastershipRole::Master => "MASTER",
            MastershipRole::Standby => "STANDBY",
            MastershipRole::None => "NONE",
        };
        f.write_str(s)
    }
}

/// A port on a device, written `device/port`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConnectPoint {
    pub device: DeviceId,
    pub port: u32,
}

impl ConnectPoint {
    pub fn new(device: DeviceId, port: u32) -> Self {
        Self { device, port }
    }
}

impl fmt::Display for ConnectPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.port)
    }
}

impl FromStr for ConnectPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Device ids may contain '/', the port is whatever follows the last one.
        let (device, port) = s
            .rsplit_once('/')
            .ok_or_else(|| format!("connect point '{s}' is not of the form device/port"))?;
        if device.is_empty() {
            return Err(format!("connect point '{s}' has an empty device id"));
        }
        let port = port
            .parse::<u32>()
            .map_err(|e| format!("connect point '{s}' has a bad port: {e}"))?;
        Ok(ConnectPoint::new(DeviceId::new(device), port))
    }
}

impl TryFrom<String> for ConnectPoint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConnectPoint> for String {
    fn from(cp: ConnectPoint) -> Self {
        cp.to_string()
    }
}

/// Inventory record for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    /// Whether the device is currently reachable.
    pub available: bool,
}

impl Device {
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            available: true,
        }
    }
}

/// Inventory record for a unidirectional infrastructure link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    pub src: ConnectPoint,
    pub dst: ConnectPoint,
}

impl Link {
    pub fn new(src: ConnectPoint, dst: ConnectPoint) -> Self {
        Self { src, dst }
    }

    pub fn key(&self) -> LinkKey {
        LinkKey {
            src: self.src.clone(),
            dst: self.dst.clone(),
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Identity of a link: its two endpoints.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkKey {
    pub src: ConnectPoint,
    pub dst: ConnectPoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_point_parse() {
        let cp: ConnectPoint = "of:0001/3".parse().unwrap();
        assert_eq!(cp.device, DeviceId::new("of:0001"));
        assert_eq!(cp.port, 3);
        assert_eq!(cp.to_string(), "of:0001/3");
    }

    #[test]
    fn test_connect_point_parse_uses_last_separator() {
        let cp: ConnectPoint = "rack/1/leaf/7".parse().unwrap();
        assert_eq!(cp.device.as_str(), "rack/1/leaf");
        assert_eq!(cp.port, 7);
    }

    #[test]
    fn test_connect_point_parse_errors() {
        assert!("of:0001".parse::<ConnectPoint>().is_err());
        assert!("/3".parse::<ConnectPoint>().is_err());
        assert!("of:0001/x".parse::<ConnectPoint>().is_err());
    }

    #[test]
    fn test_ids_order_and_display() {
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        assert!(a < b);
        assert_eq!(a.to_string(), "a");
        assert_ne!(NodeId::random(), NodeId::random());
    }
}
