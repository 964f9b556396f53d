//! Device discovery and peer-access probing

use crate::device::{Device, DeviceId, DeviceSelector};
use crate::error::{ProbeError, ProbeResult};
use crate::runtime::DeviceRuntime;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, instrument};

/// Discover the devices matching `selector`, in runtime order
///
/// Fails with [`ProbeError::NoDevicesFound`] when nothing matches.
#[instrument(skip(runtime, selector), fields(runtime = runtime.name(), selector = %selector))]
pub fn discover(runtime: &dyn DeviceRuntime, selector: &DeviceSelector) -> ProbeResult<Vec<Device>> {
    let devices = runtime.enumerate_devices(selector)?;
    if devices.is_empty() {
        return Err(ProbeError::NoDevicesFound {
            selector: selector.to_string(),
        });
    }

    info!(count = devices.len(), "discovered devices");
    for device in &devices {
        debug!(device = %device, uuid = %device.uuid, "device");
    }
    Ok(devices)
}

/// Query peer access for every ordered pair of `devices`
///
/// A failed query counts as no access. A device always reaches its own
/// memory, whatever the runtime reports.
pub fn probe_peer_access(runtime: &dyn DeviceRuntime, devices: &[Device]) -> PeerAccessMatrix {
    let mut access = vec![vec![false; devices.len()]; devices.len()];
    for (i, device) in devices.iter().enumerate() {
        for (j, peer) in devices.iter().enumerate() {
            access[i][j] = i == j
                || runtime
                    .can_access_peer(device, peer)
                    .unwrap_or_else(|err| {
                        debug!(device = %device.id, peer = %peer.id, error = %err, "peer query failed");
                        false
                    });
        }
    }

    PeerAccessMatrix {
        ids: devices.iter().map(|device| device.id).collect(),
        access,
    }
}

/// Directed peer-access relation over discovered devices
///
/// Row `i`, column `j` is whether device `i` can access memory resident on
/// device `j`. Indices follow discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MatrixRows")]
pub struct PeerAccessMatrix {
    ids: Vec<DeviceId>,
    access: Vec<Vec<bool>>,
}

/// Unchecked serialized form of [`PeerAccessMatrix`]
#[derive(Deserialize)]
struct MatrixRows {
    ids: Vec<DeviceId>,
    access: Vec<Vec<bool>>,
}

impl TryFrom<MatrixRows> for PeerAccessMatrix {
    type Error = String;

    fn try_from(rows: MatrixRows) -> Result<Self, Self::Error> {
        let n = rows.ids.len();
        if rows.access.len() != n || rows.access.iter().any(|row| row.len() != n) {
            return Err(format!("peer access rows must form a {n}x{n} grid"));
        }
        Ok(Self {
            ids: rows.ids,
            access: rows.access,
        })
    }
}

impl PeerAccessMatrix {
    /// Number of devices
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check for an empty matrix
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Access from discovery index `i` to discovery index `j`
    pub fn get(&self, i: usize, j: usize) -> Option<bool> {
        self.access.get(i)?.get(j).copied()
    }

    /// Whether `issuer` can access memory resident on `owner`
    ///
    /// Devices outside the matrix have no access.
    pub fn can_access(&self, issuer: DeviceId, owner: DeviceId) -> bool {
        let (Some(i), Some(j)) = (self.index_of(issuer), self.index_of(owner)) else {
            return false;
        };
        self.get(i, j).unwrap_or(false)
    }

    /// Discovery index of `id`
    pub fn index_of(&self, id: DeviceId) -> Option<usize> {
        self.ids.iter().position(|&known| known == id)
    }

    /// Device ids in row order
    pub fn device_ids(&self) -> &[DeviceId] {
        &self.ids
    }

    /// Rows of the relation
    pub fn rows(&self) -> &[Vec<bool>] {
        &self.access
    }

    /// Whether access is the same in both directions for every pair
    pub fn is_symmetric(&self) -> bool {
        (0..self.len()).all(|i| (0..i).all(|j| self.get(i, j) == self.get(j, i)))
    }
}

impl fmt::Display for PeerAccessMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} devices", self.len())?;
        writeln!(f, "X = device can access peer")?;
        writeln!(f, "O = device cannot access peer")?;
        for row in &self.access {
            let line: String = row.iter().map(|&ok| if ok { 'X' } else { 'O' }).collect();
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// Discovered devices with their peer relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Devices in discovery order
    pub devices: Vec<Device>,
    /// Peer access between them
    pub peers: PeerAccessMatrix,
}

impl Topology {
    /// Discover devices and probe every pair
    pub fn probe(runtime: &dyn DeviceRuntime, selector: &DeviceSelector) -> ProbeResult<Self> {
        let devices = discover(runtime, selector)?;
        let peers = probe_peer_access(runtime, &devices);
        if !peers.is_symmetric() {
            debug!("peer access is asymmetric");
        }
        Ok(Self { devices, peers })
    }

    /// Device at discovery index `index`
    ///
    /// An index past the discovered devices is a configuration error, not
    /// a device id.
    pub fn device(&self, index: usize) -> ProbeResult<&Device> {
        self.devices
            .get(index)
            .ok_or_else(|| ProbeError::InvalidConfig {
                message: format!(
                    "device index {index} outside the {} discovered devices",
                    self.devices.len()
                ),
            })
    }
}
