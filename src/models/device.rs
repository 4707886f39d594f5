use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: Option<String>,
    pub hostname: Option<String>,
    pub name: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl DeviceDescriptor {
    pub fn device_id(&self) -> Option<String> {
        self.id
            .clone()
            .or_else(|| self.hostname.clone())
            .or_else(|| self.name.clone())
            .filter(|s| !s.is_empty())
    }
}
