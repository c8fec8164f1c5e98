use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{CommitRecord, ConnectionId};

pub const PONG: &str = "pong";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub connection_id: ConnectionId,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub action_result: Value,
    pub mutations: Vec<CommitRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConnectionResponse {
    pub connection_id: ConnectionId,
}
