use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTMessage {
    pub tid: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<DHTArguments>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<DHTResponse>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DHTError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl DHTMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<DHTMessage, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
/// Union of every query's arguments, unused ones are omitted on the wire.
pub struct DHTArguments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTResponse {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<DHTPeer>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<DHTPeer>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTPeer {
    pub ip_address: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTError {
    pub code: i32,
    pub message: String,
}
