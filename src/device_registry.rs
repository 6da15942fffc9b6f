use thiserror::Error;

/// A controller device and the production lines it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("entry '{0}' must look like DEVICE=LINE1,LINE2")]
    MalformedEntry(String),
    #[error("device '{0}' is listed more than once")]
    DuplicateDevice(String),
    #[error("registry has no devices")]
    Empty,
}

/// Static device→lines table, fixed once the service starts.
///
/// Insertion order is kept so listings come back the way they were configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self {
            devices: vec![
                Device {
                    id: "CMAS001".to_string(),
                    lines: vec!["A1".to_string(), "A2".to_string()],
                },
                Device {
                    id: "CMAS002".to_string(),
                    lines: vec!["B1".to_string(), "B2".to_string()],
                },
            ],
        }
    }
}

impl DeviceRegistry {
    pub fn new(devices: Vec<Device>) -> Result<Self, RegistryError> {
        if devices.is_empty() {
            return Err(RegistryError::Empty);
        }
        for (i, device) in devices.iter().enumerate() {
            if devices[..i].iter().any(|d| d.id == device.id) {
                return Err(RegistryError::DuplicateDevice(device.id.clone()));
            }
        }
        Ok(Self { devices })
    }

    /// Parses `CMAS001=A1,A2;CMAS002=B1,B2`.
    pub fn parse(spec: &str) -> Result<Self, RegistryError> {
        let mut devices = Vec::new();
        for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (id, lines) = entry
                .split_once('=')
                .ok_or_else(|| RegistryError::MalformedEntry(entry.to_string()))?;
            let id = id.trim();
            let lines: Vec<String> = lines
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            if id.is_empty() || lines.is_empty() {
                return Err(RegistryError::MalformedEntry(entry.to_string()));
            }
            devices.push(Device {
                id: id.to_string(),
                lines,
            });
        }
        Self::new(devices)
    }

    pub fn lines_of(&self, device_id: &str) -> Option<&[String]> {
        self.devices
            .iter()
            .find(|d| d.id == device_id)
            .map(|d| d.lines.as_slice())
    }

    pub fn device_ids(&self) -> Vec<&str> {
        self.devices.iter().map(|d| d.id.as_str()).collect()
    }

    /// Every registered line, device by device.
    pub fn all_lines(&self) -> Vec<&str> {
        self.devices
            .iter()
            .flat_map(|d| d.lines.iter().map(String::as_str))
            .collect()
    }

    pub fn is_registered_line(&self, line: &str) -> bool {
        self.devices
            .iter()
            .any(|d| d.lines.iter().any(|l| l == line))
    }
}
