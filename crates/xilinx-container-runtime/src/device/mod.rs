//! Accelerator device model, sysfs discovery and selection.

pub mod discovery;
pub mod node;
pub mod selector;

use std::collections::HashMap;

pub use discovery::RomWaitPolicy;
pub use discovery::SysfsLayout;
pub use discovery::SysfsScanner;
pub use node::DeviceNumbers;
pub use node::StatDeviceNumbers;
pub use selector::VisibilityRequest;

/// Device files that make up one accelerator endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlNodes {
    /// User function render node, e.g. `/dev/dri/renderD128`
    pub user: String,
    /// Management function node, e.g. `/dev/xclmgmt15616`; empty when unpaired
    pub mgmt: String,
    /// QDMA streaming node; empty when the shell has no QDMA engine. Listed
    /// only, never mounted.
    pub dma: String,
}

impl ControlNodes {
    /// Non-empty nodes bind-mounted into a container: user, then management.
    pub fn mounted(&self) -> impl Iterator<Item = &str> {
        [self.user.as_str(), self.mgmt.as_str()]
            .into_iter()
            .filter(|node| !node.trim().is_empty())
    }
}

/// One user-function accelerator endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    /// Position among user functions in the current scan
    pub index: String,
    /// Vendor device id, e.g. `0x5001`
    pub device_id: String,
    /// Board serial number; empty when the card has no XMC
    pub serial_number: String,
    /// Domain:bus:device.function of the user function
    pub bus_address: String,
    /// Shell (VBNV) version string
    pub shell_version: String,
    /// Shell timestamp
    pub timestamp: String,
    pub nodes: ControlNodes,
}

/// Devices sharing one physical board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    pub index: usize,
    pub devices: Vec<Device>,
}

/// Group devices into cards by serial number, keeping first-seen order.
///
/// Devices without a serial number each form their own card.
pub fn group_cards(devices: &[Device]) -> Vec<Card> {
    let mut cards: Vec<Card> = Vec::new();
    let mut by_serial: HashMap<&str, usize> = HashMap::new();

    for device in devices {
        let serial = device.serial_number.trim();
        if serial.is_empty() {
            cards.push(Card {
                index: cards.len(),
                devices: vec![device.clone()],
            });
            continue;
        }

        let index = *by_serial.entry(serial).or_insert_with(|| {
            cards.push(Card {
                index: cards.len(),
                devices: Vec::new(),
            });
            cards.len() - 1
        });
        cards[index].devices.push(device.clone());
    }

    cards
}
