//! Resolves `XILINX_VISIBLE_DEVICES` / `XILINX_VISIBLE_CARDS` expressions.

use std::collections::HashSet;

use error_stack::bail;
use error_stack::Report;

use super::group_cards;
use super::Device;
use crate::environment::VISIBLE_CARDS;
use crate::error::SelectorError;

/// Which devices a container asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibilityRequest {
    AllDevices,
    AllCards,
    /// Tokens matched against index, device id or serial number
    DeviceSet { ids: Vec<String> },
    /// Card positions in discovery order
    CardSet { nums: Vec<usize> },
}

impl VisibilityRequest {
    /// Build a request from the two selector variables.
    ///
    /// A device expression takes precedence and the card expression is then
    /// ignored entirely. Returns `None` when neither is set.
    pub fn from_env(
        visible_devices: Option<&str>,
        visible_cards: Option<&str>,
    ) -> Result<Option<Self>, Report<SelectorError>> {
        let visible_devices = visible_devices.filter(|v| !v.is_empty());
        let visible_cards = visible_cards.filter(|v| !v.is_empty());

        if let Some(expr) = visible_devices {
            return Ok(Some(Self::parse_devices(expr)));
        }
        match visible_cards {
            Some(expr) => Self::parse_cards(expr).map(Some),
            None => Ok(None),
        }
    }

    pub fn parse_devices(expr: &str) -> Self {
        if expr.eq_ignore_ascii_case("all") {
            return Self::AllDevices;
        }
        Self::DeviceSet {
            ids: expr.split(',').map(str::to_string).collect(),
        }
    }

    pub fn parse_cards(expr: &str) -> Result<Self, Report<SelectorError>> {
        if expr.eq_ignore_ascii_case("all") {
            return Ok(Self::AllCards);
        }
        let nums = expr
            .split(',')
            .map(|token| {
                token.parse::<usize>().map_err(|_| {
                    Report::new(SelectorError::InvalidCardToken {
                        env: VISIBLE_CARDS,
                        token: token.to_string(),
                    })
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::CardSet { nums })
    }

    /// Resolve against a discovered device list.
    ///
    /// The result keeps first-seen order and holds each bus address once.
    pub fn resolve(&self, all: &[Device]) -> Result<Vec<Device>, Report<SelectorError>> {
        let selected = match self {
            Self::AllDevices | Self::AllCards => all.to_vec(),
            Self::DeviceSet { ids } => match_tokens(all, ids),
            Self::CardSet { nums } => {
                let cards = group_cards(all);
                let mut selected = Vec::new();
                for &num in nums {
                    let Some(card) = cards.get(num) else {
                        bail!(SelectorError::CardNotFound {
                            index: num,
                            count: cards.len(),
                        });
                    };
                    selected.extend(card.devices.iter().cloned());
                }
                selected
            }
        };

        Ok(dedup(selected))
    }
}

fn match_tokens(all: &[Device], ids: &[String]) -> Vec<Device> {
    ids.iter()
        .flat_map(|token| all.iter().filter(move |device| matches_token(device, token)))
        .cloned()
        .collect()
}

fn dedup(devices: Vec<Device>) -> Vec<Device> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|device| seen.insert(device.bus_address.clone()))
        .collect()
}

fn matches_token(device: &Device, token: &str) -> bool {
    !token.is_empty()
        && (token == device.index || token == device.device_id || token == device.serial_number)
}

/// Devices selected by a comma separated device expression.
pub fn select_by_devices(all: &[Device], expr: &str) -> Vec<Device> {
    match VisibilityRequest::parse_devices(expr) {
        VisibilityRequest::DeviceSet { ids } => dedup(match_tokens(all, &ids)),
        _ => all.to_vec(),
    }
}

/// Devices selected by a comma separated card expression.
pub fn select_by_cards(all: &[Device], expr: &str) -> Result<Vec<Device>, Report<SelectorError>> {
    VisibilityRequest::parse_cards(expr)?.resolve(all)
}
