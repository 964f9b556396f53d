//! Device identity and selection policies

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Runtime-assigned device identity, stable for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// Device class flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DeviceType: u32 {
        /// Host processor exposed as a device
        const CPU = 0x01;
        /// GPU-class device
        const GPU = 0x02;
        /// Other accelerator (FPGA, NPU, ...)
        const ACCELERATOR = 0x04;
    }
}

impl Default for DeviceType {
    fn default() -> Self {
        Self::GPU
    }
}

/// How matching root devices are turned into discovered devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partitioning {
    /// Root devices as-is
    #[default]
    Root,
    /// NUMA sub-devices of each root; unpartitionable roots contribute none
    Numa,
}

impl Partitioning {
    /// Short name used in logs and reports
    pub fn name(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Numa => "numa",
        }
    }
}

/// Device selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelector {
    /// Device classes accepted; a root matches if it shares any flag
    pub device_type: DeviceType,
    /// Root devices or their NUMA sub-devices
    pub partition: Partitioning,
}

impl DeviceSelector {
    /// All GPU-class root devices
    pub fn gpus() -> Self {
        Self {
            device_type: DeviceType::GPU,
            partition: Partitioning::Root,
        }
    }

    /// All NUMA sub-devices of GPU-class root devices
    pub fn gpu_numa_domains() -> Self {
        Self {
            device_type: DeviceType::GPU,
            partition: Partitioning::Numa,
        }
    }

    /// Whether a root device of `device_type` is accepted
    pub fn accepts(&self, device_type: DeviceType) -> bool {
        self.device_type.intersects(device_type)
    }
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self::gpus()
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .device_type
            .iter_names()
            .map(|(name, _)| name)
            .collect();
        let types = if names.is_empty() {
            "none".to_string()
        } else {
            names.join("|").to_lowercase()
        };
        write!(f, "{}/{}", types, self.partition.name())
    }
}

/// One discovered accelerator execution unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Runtime identity
    pub id: DeviceId,
    /// Unique device UUID
    pub uuid: Uuid,
    /// Human-readable name
    pub name: String,
    /// Device class
    pub device_type: DeviceType,
    /// Root device this sub-device was partitioned from
    pub parent: Option<DeviceId>,
    /// NUMA domain index within the parent
    pub numa_domain: Option<u32>,
}

impl Device {
    /// Whether this device is a partition of another device
    pub fn is_sub_device(&self) -> bool {
        self.parent.is_some()
    }

    /// Root device identity (itself for roots)
    pub fn root(&self) -> DeviceId {
        self.parent.unwrap_or(self.id)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_default() {
        let ty = DeviceType::default();
        assert!(ty.contains(DeviceType::GPU));
        assert!(!ty.contains(DeviceType::CPU));
    }

    #[test]
    fn test_selector_accepts() {
        let selector = DeviceSelector::gpus();
        assert!(selector.accepts(DeviceType::GPU));
        assert!(selector.accepts(DeviceType::GPU | DeviceType::ACCELERATOR));
        assert!(!selector.accepts(DeviceType::CPU));

        let any = DeviceSelector {
            device_type: DeviceType::all(),
            partition: Partitioning::Root,
        };
        assert!(any.accepts(DeviceType::CPU));
    }

    #[test]
    fn test_selector_display() {
        assert_eq!(DeviceSelector::gpus().to_string(), "gpu/root");
        assert_eq!(DeviceSelector::gpu_numa_domains().to_string(), "gpu/numa");

        let selector = DeviceSelector {
            device_type: DeviceType::CPU | DeviceType::GPU,
            partition: Partitioning::Root,
        };
        assert_eq!(selector.to_string(), "cpu|gpu/root");

        let selector = DeviceSelector {
            device_type: DeviceType::empty(),
            partition: Partitioning::Numa,
        };
        assert_eq!(selector.to_string(), "none/numa");
    }

    #[test]
    fn test_device_root() {
        let root = Device {
            id: DeviceId(0),
            uuid: Uuid::new_v4(),
            name: "GPU 0".to_string(),
            device_type: DeviceType::GPU,
            parent: None,
            numa_domain: None,
        };
        assert!(!root.is_sub_device());
        assert_eq!(root.root(), DeviceId(0));

        let sub = Device {
            id: DeviceId(4),
            parent: Some(DeviceId(0)),
            numa_domain: Some(1),
            name: "GPU 0.1".to_string(),
            ..root.clone()
        };
        assert!(sub.is_sub_device());
        assert_eq!(sub.root(), DeviceId(0));
        assert_eq!(sub.to_string(), "[4] GPU 0.1");
    }
}
