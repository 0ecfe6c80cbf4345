//! Sysfs walk that reconstructs accelerator topology from PCI metadata.
//!
//! Each board exposes a management physical function and a user physical
//! function on the same bus/device prefix. The scan runs in two passes: the
//! first classifies every accelerator function by prefix, the second builds a
//! [`Device`] for each user function and resolves its management node by
//! prefix lookup.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ControlNodes;
use super::Device;
use crate::error::DiscoveryError;

pub const SYSFS_DEVICES: &str = "/sys/bus/pci/devices";
pub const MGMT_NODE_PREFIX: &str = "/dev/xclmgmt";
pub const USER_NODE_DIR: &str = "/dev/dri";
pub const DMA_NODE_DIR: &str = "/dev/xfpga";

const DMA_ENTRY_PREFIX: &str = "dma.qdma.u";
const DRM_DIR: &str = "drm";
const RENDER_PREFIX: &str = "renderD";
const ROM_PREFIX: &str = "rom";
const XMC_PREFIX: &str = "xmc.u.";
const SHELL_VERSION_FILE: &str = "VBNV";
const TIMESTAMP_FILE: &str = "timestamp";
const INSTANCE_FILE: &str = "instance";
const MGMT_MARKER: &str = "mgmt_pf";
const USER_MARKER: &str = "user_pf";
const VENDOR_FILE: &str = "vendor";
const DEVICE_FILE: &str = "device";
const SERIAL_FILE: &str = "serial_num";

/// Xilinx, Advantech, AWS and Arista vendor ids.
pub const KNOWN_VENDORS: [&str; 4] = ["0x10ee", "0x13fe", "0x1d0f", "0x3475"];

/// Where to look for PCI metadata and which device node paths to derive.
#[derive(Debug, Clone)]
pub struct SysfsLayout {
    pub devices_root: PathBuf,
    pub mgmt_node_prefix: String,
    pub user_node_dir: PathBuf,
    pub dma_node_dir: PathBuf,
}

impl Default for SysfsLayout {
    fn default() -> Self {
        Self {
            devices_root: PathBuf::from(SYSFS_DEVICES),
            mgmt_node_prefix: MGMT_NODE_PREFIX.to_string(),
            user_node_dir: PathBuf::from(USER_NODE_DIR),
            dma_node_dir: PathBuf::from(DMA_NODE_DIR),
        }
    }
}

impl SysfsLayout {
    /// Layout rooted at a custom devices directory with the default `/dev` paths.
    pub fn with_devices_root(devices_root: impl Into<PathBuf>) -> Self {
        Self {
            devices_root: devices_root.into(),
            ..Self::default()
        }
    }
}

/// Bounded wait for the `rom` metadata directory of a user function.
///
/// The firmware metadata shows up some time after the PCI function itself, so
/// the scan polls for it instead of failing straight away.
#[derive(Debug, Clone, Copy)]
pub struct RomWaitPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// Extra wait once the directory appears, letting it populate.
    pub settle_delay: Duration,
}

impl Default for RomWaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_attempts: 36,
            settle_delay: Duration::from_secs(20),
        }
    }
}

impl RomWaitPolicy {
    /// Call `check` after each poll interval until it yields a value, at most
    /// `max_attempts` times. A hit is returned after the settle delay.
    pub fn retry<T>(&self, mut check: impl FnMut() -> Option<T>) -> Option<T> {
        for attempt in 1..=self.max_attempts {
            thread::sleep(self.poll_interval);
            if let Some(found) = check() {
                thread::sleep(self.settle_delay);
                return Some(found);
            }
            debug!(attempt, "rom metadata not available yet");
        }
        None
    }

    /// Policy without any sleeping.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            poll_interval: Duration::ZERO,
            max_attempts,
            settle_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct UserFunction {
    address: String,
    prefix: String,
}

/// Enumerates accelerator devices from sysfs.
#[derive(Debug, Clone, Default)]
pub struct SysfsScanner {
    layout: SysfsLayout,
    rom_wait: RomWaitPolicy,
}

impl SysfsScanner {
    pub fn new(layout: SysfsLayout, rom_wait: RomWaitPolicy) -> Self {
        Self { layout, rom_wait }
    }

    pub fn layout(&self) -> &SysfsLayout {
        &self.layout
    }

    /// Return every accelerator user function on the host, in scan order.
    ///
    /// Any unreadable required metadata aborts the whole scan.
    #[tracing::instrument(skip(self), fields(root = %self.layout.devices_root.display()))]
    pub fn scan(&self) -> Result<Vec<Device>, Report<DiscoveryError>> {
        let root = &self.layout.devices_root;
        let entries = sorted_entries(root)?;

        let mut user_functions = Vec::new();
        let mut mgmt_nodes: HashMap<String, String> = HashMap::new();

        for address in entries {
            let function_dir = root.join(&address);
            let vendor = read_trimmed(&function_dir.join(VENDOR_FILE))?;
            if !is_known_vendor(&vendor) {
                continue;
            }

            let prefix = bus_prefix(&address).to_string();
            if marker_exists(&function_dir.join(USER_MARKER)) {
                user_functions.push(UserFunction { address, prefix });
            } else if marker_exists(&function_dir.join(MGMT_MARKER)) {
                let instance = read_trimmed(&function_dir.join(INSTANCE_FILE))?;
                debug!(address = %address, instance = %instance, "found management function");
                mgmt_nodes.insert(
                    prefix,
                    format!("{}{}", self.layout.mgmt_node_prefix, instance),
                );
            }
        }

        let mut devices = Vec::with_capacity(user_functions.len());
        for function in user_functions {
            let mgmt = mgmt_nodes
                .get(&function.prefix)
                .cloned()
                .unwrap_or_default();
            let device = self.read_user_function(&function.address, devices.len(), mgmt)?;
            info!(
                index = %device.index,
                address = %device.bus_address,
                user = %device.nodes.user,
                mgmt = %device.nodes.mgmt,
                "found device"
            );
            devices.push(device);
        }

        Ok(devices)
    }

    fn read_user_function(
        &self,
        address: &str,
        position: usize,
        mgmt: String,
    ) -> Result<Device, Report<DiscoveryError>> {
        let function_dir = self.layout.devices_root.join(address);

        let rom_dir = match self.wait_for_rom(&function_dir, address)? {
            Some(rom) => function_dir.join(rom),
            None => function_dir.clone(),
        };
        let shell_version = read_trimmed(&rom_dir.join(SHELL_VERSION_FILE))?;
        let timestamp = read_trimmed(&rom_dir.join(TIMESTAMP_FILE))?;
        let device_id = read_trimmed(&function_dir.join(DEVICE_FILE))?;

        let serial_path = match first_entry_with_prefix(&function_dir, XMC_PREFIX)? {
            Some(xmc) => function_dir.join(xmc).join(SERIAL_FILE),
            None => function_dir.join(SERIAL_FILE),
        };
        let serial_number = read_trimmed(&serial_path).unwrap_or_default();

        let render = first_entry_with_prefix(&function_dir.join(DRM_DIR), RENDER_PREFIX)?
            .ok_or_else(|| {
                Report::new(DiscoveryError::MissingUserNode {
                    address: address.to_string(),
                })
            })?;
        let user = self.layout.user_node_dir.join(render).display().to_string();

        let dma = match first_entry_with_prefix(&function_dir, DMA_ENTRY_PREFIX)? {
            Some(_) => {
                let instance = instance_id(address)?;
                self.layout
                    .dma_node_dir
                    .join(format!("{DMA_ENTRY_PREFIX}{instance}.0"))
                    .display()
                    .to_string()
            }
            None => String::new(),
        };

        Ok(Device {
            index: position.to_string(),
            device_id,
            serial_number,
            bus_address: address.to_string(),
            shell_version,
            timestamp,
            nodes: ControlNodes { user, mgmt, dma },
        })
    }

    fn wait_for_rom(
        &self,
        function_dir: &Path,
        address: &str,
    ) -> Result<Option<String>, Report<DiscoveryError>> {
        let rom = first_entry_with_prefix(function_dir, ROM_PREFIX)?;
        if rom.is_some() {
            return Ok(rom);
        }

        let rom = self.rom_wait.retry(|| {
            first_entry_with_prefix(function_dir, ROM_PREFIX).unwrap_or_else(|e| {
                debug!(address, "rom lookup failed: {e:?}");
                None
            })
        });
        if rom.is_none() {
            warn!(address, attempts = self.rom_wait.max_attempts, "rom metadata never appeared");
        }
        Ok(rom)
    }
}

/// Numeric instance id the QDMA driver derives from a bus address.
pub fn instance_id(address: &str) -> Result<u64, Report<DiscoveryError>> {
    let invalid = || DiscoveryError::InvalidBusAddress {
        address: address.to_string(),
    };

    let mut parts = address.splitn(3, ':');
    let (Some(domain), Some(bus), Some(dev_fn)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Report::new(invalid()));
    };
    let (dev, function) = dev_fn
        .split_once('.')
        .ok_or_else(|| Report::new(invalid()))?;

    let domain = u16::from_str_radix(domain, 16).change_context_lazy(invalid)?;
    let bus = u8::from_str_radix(bus, 16).change_context_lazy(invalid)?;
    let dev = u8::from_str_radix(dev, 16).change_context_lazy(invalid)?;
    let function = u8::from_str_radix(function, 16).change_context_lazy(invalid)?;

    Ok(u64::from(domain) * 65536 + u64::from(bus) * 256 + u64::from(dev) * 8 + u64::from(function))
}

fn is_known_vendor(vendor: &str) -> bool {
    KNOWN_VENDORS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(vendor))
}

/// Bus address without its trailing function number.
fn bus_prefix(address: &str) -> &str {
    address
        .rsplit_once('.')
        .map_or(address, |(prefix, _)| prefix)
}

fn marker_exists(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(_) => true,
        Err(e) => e.kind() != io::ErrorKind::NotFound,
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<String>, Report<DiscoveryError>> {
    let read_dir_error = || DiscoveryError::ReadDir {
        path: dir.to_path_buf(),
    };
    let mut names = fs::read_dir(dir)
        .change_context_lazy(read_dir_error)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<Result<Vec<_>, _>>()
        .change_context_lazy(read_dir_error)?;
    names.sort();
    Ok(names)
}

fn first_entry_with_prefix(
    dir: &Path,
    prefix: &str,
) -> Result<Option<String>, Report<DiscoveryError>> {
    Ok(sorted_entries(dir)?
        .into_iter()
        .find(|name| name.starts_with(prefix)))
}

fn read_trimmed(path: &Path) -> Result<String, Report<DiscoveryError>> {
    let content = fs::read_to_string(path).change_context_lazy(|| DiscoveryError::ReadFile {
        path: path.to_path_buf(),
    })?;
    Ok(content.trim_matches('\n').to_string())
}
