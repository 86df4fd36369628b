//! Device Registry types
//!
//! Descriptors are snapshots taken at enumeration time and never cached:
//! indices are only meaningful against the list they came from.

use serde::{Deserialize, Serialize};

use crate::error::{DeviceDirection, EngineError, Result};

/// One audio device as seen by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub name: String,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    #[serde(default)]
    pub is_default_input: bool,
    #[serde(default)]
    pub is_default_output: bool,
}

impl DeviceDescriptor {
    pub fn supports(&self, direction: DeviceDirection) -> bool {
        match direction {
            DeviceDirection::Input => self.max_input_channels > 0,
            DeviceDirection::Output => self.max_output_channels > 0,
        }
    }
}

/// Check requested indices against an enumeration
///
/// `None` means "host default" and always passes here; the backend reports
/// a missing default when it tries to open it.
///
/// # Errors
/// * `DeviceNotFound` - index outside the list
/// * `DeviceCapability` - device lacks channels in the requested direction
pub fn validate_selection(
    devices: &[DeviceDescriptor],
    input: Option<usize>,
    output: Option<usize>,
) -> Result<()> {
    let check = |index: Option<usize>, direction: DeviceDirection| -> Result<()> {
        let Some(index) = index else {
            return Ok(());
        };
        let device = devices
            .iter()
            .find(|d| d.index == index)
            .ok_or(EngineError::DeviceNotFound { index, direction })?;
        if !device.supports(direction) {
            return Err(EngineError::DeviceCapability { index, direction });
        }
        Ok(())
    };

    check(input, DeviceDirection::Input)?;
    check(output, DeviceDirection::Output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices() -> Vec<DeviceDescriptor> {
        vec![
            DeviceDescriptor {
                index: 0,
                name: "Mic".to_string(),
                max_input_channels: 1,
                max_output_channels: 0,
                is_default_input: true,
                is_default_output: false,
            },
            DeviceDescriptor {
                index: 1,
                name: "Speakers".to_string(),
                max_input_channels: 0,
                max_output_channels: 2,
                is_default_input: false,
                is_default_output: true,
            },
        ]
    }

    #[test]
    fn test_valid_selection() {
        assert!(validate_selection(&devices(), Some(0), Some(1)).is_ok());
        assert!(validate_selection(&devices(), None, None).is_ok());
    }

    #[test]
    fn test_unknown_index() {
        let result = validate_selection(&devices(), Some(7), Some(1));
        assert!(matches!(
            result,
            Err(EngineError::DeviceNotFound {
                index: 7,
                direction: DeviceDirection::Input
            })
        ));
    }

    #[test]
    fn test_wrong_direction() {
        let result = validate_selection(&devices(), Some(0), Some(0));
        assert!(matches!(
            result,
            Err(EngineError::DeviceCapability {
                index: 0,
                direction: DeviceDirection::Output
            })
        ));
    }

    #[test]
    fn test_descriptor_json_fields() {
        let json = serde_json::to_value(&devices()[1]).unwrap();
        assert_eq!(json["max_output_channels"], 2);
        assert_eq!(json["name"], "Speakers");
    }
}
