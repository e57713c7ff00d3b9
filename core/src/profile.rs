//! Device profiles — static link parameters per supported hardware family.
//!
//! A profile is looked up once, from the negotiated service identifier, at
//! session setup and never changes afterward. The wire format (fragment
//! size, terminator bytes) is entirely determined by the active profile.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Nordic UART Service (NUS) identifiers.
pub const NUS_SERVICE_UUID: u128 = 0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E;
pub const NUS_WRITE_UUID: u128 = 0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E;
pub const NUS_NOTIFY_UUID: u128 = 0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E;

/// HM-10 / HM-11 style modules expose a single serial characteristic.
pub const HM10_SERVICE_UUID: u128 = 0x0000FFE0_0000_1000_8000_00805F9B34FB;
pub const HM10_SERIAL_UUID: u128 = 0x0000FFE1_0000_1000_8000_00805F9B34FB;

/// Microchip (BM70/RN4870) Transparent UART identifiers.
pub const MCHP_SERVICE_UUID: u128 = 0x49535343_FE7D_4AE5_8FA9_9FAFD205E455;
pub const MCHP_WRITE_UUID: u128 = 0x49535343_8841_43F4_A8D4_ECBE34729BB3;
pub const MCHP_NOTIFY_UUID: u128 = 0x49535343_1E4D_4BD9_BA61_23C647249616;

/// Default ATT payload for peripherals that never negotiate a larger MTU.
pub const DEFAULT_FRAGMENT_SIZE: usize = 20;

/// Errors for profile table handling.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Profile has an empty terminator")]
    EmptyTerminator,
    #[error("Profile has a zero fragment size")]
    ZeroFragmentSize,
    #[error("Duplicate profile for service {0}")]
    DuplicateService(Uuid),
    #[error("Profile table parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Immutable link parameters for one hardware family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Human-readable family name, for logs only.
    pub family: String,
    /// GATT service identifier this profile is keyed by.
    pub service: Uuid,
    /// Characteristic notifications are received on.
    pub read_characteristic: Uuid,
    /// Characteristic outbound fragments are written to.
    pub write_characteristic: Uuid,
    /// Byte sequence closing every command and every complete response.
    pub terminator: Vec<u8>,
    /// Upper bound on a single outbound write.
    pub max_fragment_size: usize,
}

impl DeviceProfile {
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.terminator.is_empty() {
            return Err(ProfileError::EmptyTerminator);
        }
        if self.max_fragment_size == 0 {
            return Err(ProfileError::ZeroFragmentSize);
        }
        Ok(())
    }
}

/// Lookup table of supported profiles, keyed by service identifier.
///
/// Not a process-wide singleton: each session manager is handed its own
/// table at construction, so tests can run managers with disjoint tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileTable {
    profiles: Vec<DeviceProfile>,
}

impl ProfileTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table pre-populated with the common UART-over-GATT families.
    pub fn builtin() -> Self {
        let profiles = vec![
            DeviceProfile {
                family: "nordic-uart".to_string(),
                service: Uuid::from_u128(NUS_SERVICE_UUID),
                read_characteristic: Uuid::from_u128(NUS_NOTIFY_UUID),
                write_characteristic: Uuid::from_u128(NUS_WRITE_UUID),
                terminator: b"\r\n".to_vec(),
                max_fragment_size: DEFAULT_FRAGMENT_SIZE,
            },
            DeviceProfile {
                family: "hm10-serial".to_string(),
                service: Uuid::from_u128(HM10_SERVICE_UUID),
                read_characteristic: Uuid::from_u128(HM10_SERIAL_UUID),
                write_characteristic: Uuid::from_u128(HM10_SERIAL_UUID),
                terminator: b"\r\n".to_vec(),
                max_fragment_size: DEFAULT_FRAGMENT_SIZE,
            },
            DeviceProfile {
                family: "microchip-transparent-uart".to_string(),
                service: Uuid::from_u128(MCHP_SERVICE_UUID),
                read_characteristic: Uuid::from_u128(MCHP_NOTIFY_UUID),
                write_characteristic: Uuid::from_u128(MCHP_WRITE_UUID),
                terminator: b"\r\n".to_vec(),
                max_fragment_size: DEFAULT_FRAGMENT_SIZE,
            },
        ];
        Self { profiles }
    }

    /// Add a profile, rejecting duplicates and invalid parameters.
    pub fn add(&mut self, profile: DeviceProfile) -> Result<(), ProfileError> {
        profile.validate()?;
        if self.find_by_service(profile.service).is_some() {
            return Err(ProfileError::DuplicateService(profile.service));
        }
        self.profiles.push(profile);
        Ok(())
    }

    /// Look up the profile for a negotiated service identifier.
    pub fn find_by_service(&self, service: Uuid) -> Option<&DeviceProfile> {
        self.profiles.iter().find(|p| p.service == service)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceProfile> {
        self.profiles.iter()
    }

    /// Parse a table from a JSON document, validating every entry.
    pub fn from_json(json: &str) -> Result<Self, ProfileError> {
        let table: ProfileTable = serde_json::from_str(json)?;
        let mut out = Self::new();
        for profile in table.profiles {
            out.add(profile)?;
        }
        Ok(out)
    }

    /// Serialize the table to pretty JSON.
    pub fn to_json(&self) -> Result<String, ProfileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
