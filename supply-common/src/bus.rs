use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ResourceSpec;

// -----------------------------------------------------------------------------
// Channels
// -----------------------------------------------------------------------------

pub const CHANNEL_SUPPLY_COMMANDS: &str = "supply_commands";

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    #[serde(rename = "CMD:SUBMIT_TICKET")]
    SubmitTicket,
    #[serde(rename = "CMD:APPROVE_TICKET")]
    ApproveTicket,
    #[serde(rename = "CMD:START_ORDER")]
    StartOrder,
    #[serde(rename = "CMD:PAUSE_ORDER")]
    PauseOrder,
    #[serde(rename = "CMD:TERMINATE_ORDER")]
    TerminateOrder,
    #[serde(rename = "CMD:MODIFY_ORDER")]
    ModifyOrder,
    #[serde(rename = "CMD:MANUAL_MATCH")]
    ManualMatch,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::SubmitTicket => "CMD:SUBMIT_TICKET",
            CommandType::ApproveTicket => "CMD:APPROVE_TICKET",
            CommandType::StartOrder => "CMD:START_ORDER",
            CommandType::PauseOrder => "CMD:PAUSE_ORDER",
            CommandType::TerminateOrder => "CMD:TERMINATE_ORDER",
            CommandType::ModifyOrder => "CMD:MODIFY_ORDER",
            CommandType::ManualMatch => "CMD:MANUAL_MATCH",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommandEnvelope {
    pub command_id: Uuid,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub issued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub source: String,
}

impl CommandEnvelope {
    pub fn new(command_type: CommandType, payload: serde_json::Value, source: &str) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            command_type,
            issued_at: Utc::now(),
            payload,
            source: source.to_string(),
        }
    }

    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// -----------------------------------------------------------------------------
// Payloads
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TicketCommand {
    pub order_id: u64,
    #[serde(default)]
    pub itsm_ticket_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApproveTicket {
    pub order_id: u64,
    pub approved: bool,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OrderCommand {
    pub suborder_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TerminateOrder {
    pub suborder_id: String,
    #[serde(default)]
    pub graceful: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModifyOrder {
    pub suborder_id: String,
    #[serde(default)]
    pub total: Option<u32>,
    #[serde(default)]
    pub spec: Option<ResourceSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ManualMatch {
    pub suborder_id: String,
    pub asset_ids: Vec<String>,
    #[serde(default)]
    pub operator: String,
}
