//! Shared small value types used across the forwarder and dialogue layers.

use serde::{Deserialize, Serialize};

/// Carrier-detect / connection status, shared by [`crate::forwarder::Forwarder`]'s
/// CD monitor and [`crate::dialogue::DialogueState`]'s `connection` memory key.
///
/// Numeric order mirrors the original Python source's
/// `CARRIER_DETECT_UNDEFINED/YES/NO = 0/1/2` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierDetect {
    Undefined = 0,
    Yes = 1,
    No = 2,
}

impl CarrierDetect {
    pub fn status_message(self) -> &'static str {
        match self {
            CarrierDetect::Undefined => "Connection status undefined",
            CarrierDetect::Yes => "Device is connected.",
            CarrierDetect::No => "Device is not connected.",
        }
    }
}

/// How a Forwarder obtains carrier-detect for its session gating.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SerialOptions {
    /// Real modem: read the CD line directly.
    #[default]
    None,
    /// No modem: CD is forced `Yes` permanently.
    Direct,
    /// CD is synthesized from a [`crate::dialogue::DialogueState`] rather
    /// than read from the UART. Accepts both the `serde(rename_all =
    /// "camelCase")` spelling and spec.md §6's literal `"simulateCD"`, the
    /// `--serial-options` CLI spelling `FromStr` below also accepts.
    #[serde(alias = "simulateCD")]
    SimulateCd,
}

impl std::str::FromStr for SerialOptions {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(SerialOptions::None),
            "direct" => Ok(SerialOptions::Direct),
            "simulateCD" | "simulate_cd" | "simulatecd" => Ok(SerialOptions::SimulateCd),
            other => Err(format!("unknown serial option {other:?}")),
        }
    }
}
