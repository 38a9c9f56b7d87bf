//! Control commands - `{"command": ..., "parameters": {...}}` payloads of
//! CONTROL messages addressed to the coordinator

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{FleetError, Result};

/// Command names the coordinator executes
pub const KNOWN_COMMANDS: [&str; 4] = ["start_agent", "stop_agent", "restart_agent", "broadcast"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "parameters", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Build and start a worker of a registered type
    StartAgent {
        agent_type: String,
        agent_id: String,
        #[serde(default)]
        config: HashMap<String, Value>,
    },
    StopAgent {
        agent_id: String,
    },
    RestartAgent {
        agent_id: String,
    },
    /// Fan a message out to the fleet, or only to agents of `agent_types`
    Broadcast {
        message_type: String,
        content: Value,
        #[serde(default)]
        agent_types: Option<Vec<String>>,
    },
}

impl ControlCommand {
    /// Decode a CONTROL payload. Unknown names are `UnknownCommand`, known
    /// names with bad parameters are `Validation`.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let name = payload
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| FleetError::Validation("control payload has no command".into()))?;
        if !KNOWN_COMMANDS.contains(&name) {
            return Err(FleetError::UnknownCommand(name.to_string()));
        }

        // Commands may be sent without a parameters object
        let mut normalized = payload.clone();
        if let Some(object) = normalized.as_object_mut() {
            object
                .entry("parameters")
                .or_insert_with(|| Value::Object(Default::default()));
        }

        serde_json::from_value(normalized)
            .map_err(|e| FleetError::Validation(format!("bad parameters for {name}: {e}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::StartAgent { .. } => "start_agent",
            ControlCommand::StopAgent { .. } => "stop_agent",
            ControlCommand::RestartAgent { .. } => "restart_agent",
            ControlCommand::Broadcast { .. } => "broadcast",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_start_agent() {
        let cmd = ControlCommand::from_payload(&json!({
            "command": "start_agent",
            "parameters": {"agent_type": "predictor", "agent_id": "p1", "config": {"max_errors": 5}}
        }))
        .unwrap();

        match cmd {
            ControlCommand::StartAgent { agent_type, agent_id, config } => {
                assert_eq!(agent_type, "predictor");
                assert_eq!(agent_id, "p1");
                assert_eq!(config["max_errors"], 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_decode_broadcast_without_filter() {
        let cmd = ControlCommand::from_payload(&json!({
            "command": "broadcast",
            "parameters": {"message_type": "risk_alert", "content": {"halt": true}}
        }))
        .unwrap();
        assert_eq!(cmd.name(), "broadcast");
        assert!(matches!(cmd, ControlCommand::Broadcast { agent_types: None, .. }));
    }

    #[test]
    fn test_unknown_and_malformed_commands() {
        let err = ControlCommand::from_payload(&json!({"command": "self_destruct"})).unwrap_err();
        assert!(matches!(err, FleetError::UnknownCommand(name) if name == "self_destruct"));

        let err = ControlCommand::from_payload(&json!({"command": "stop_agent"})).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));

        let err = ControlCommand::from_payload(&json!({"parameters": {}})).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(ControlCommand::StopAgent { agent_id: "a1".into() }).unwrap();
        assert_eq!(value, json!({"command": "stop_agent", "parameters": {"agent_id": "a1"}}));
    }
}
