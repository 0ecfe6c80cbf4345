//! `lsdevice` and `lscard` tables.

use std::io::Write;

use error_stack::Report;
use error_stack::ResultExt;

use crate::device::Card;
use crate::device::Device;
use crate::error::ShimError;

pub fn write_devices(out: &mut impl Write, devices: &[Device]) -> Result<(), Report<ShimError>> {
    writeln!(
        out,
        "DeviceNum\tSerialNum\tDeviceBDF\tUserPF\t\t\tMgmtPF\t\t\tShellVersion"
    )
    .change_context(ShimError::List)?;
    for device in devices {
        writeln!(
            out,
            "{:<16}{:<16}{:<16}{:<24}{:<24}{}",
            device.index,
            device.serial_number,
            device.bus_address,
            device.nodes.user,
            device.nodes.mgmt,
            device.shell_version
        )
        .change_context(ShimError::List)?;
    }
    Ok(())
}

/// One row per device; serial number and shell come from the card's first device.
pub fn write_cards(out: &mut impl Write, cards: &[Card]) -> Result<(), Report<ShimError>> {
    writeln!(
        out,
        "CardNum\t\tSerialNum\tDeviceBDF\tUserPF\t\t\tMgmtPF\t\t\tShellVersion"
    )
    .change_context(ShimError::List)?;
    for card in cards {
        let Some(first) = card.devices.first() else {
            continue;
        };
        for device in &card.devices {
            writeln!(
                out,
                "{:<16}{:<16}{:<16}{:<24}{:<24}{}",
                card.index,
                first.serial_number,
                device.bus_address,
                device.nodes.user,
                device.nodes.mgmt,
                first.shell_version
            )
            .change_context(ShimError::List)?;
        }
    }
    Ok(())
}
