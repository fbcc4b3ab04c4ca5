//! Automation rule definitions as exposed by a location's rule catalog.
//!
//! Rule action trees arrive as loosely shaped JSON where every node is an
//! object keyed by its kind: `{"command": {...}}`, `{"if": {...}}`,
//! `{"every": {...}}`. Decoding never fails on a bad node. Anything that is
//! not recognized, or is recognized but malformed, becomes the `Unknown`
//! variant carrying the key and the reason so the extractor can skip it and
//! log why.
//!
//! The serialized form of every node type decodes back to the same value, so
//! cached catalogs can be written out and read again.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a rule in the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    #[default]
    #[serde(alias = "Enabled", alias = "ENABLED")]
    Enabled,
    #[serde(alias = "Disabled", alias = "DISABLED")]
    Disabled,
    #[serde(alias = "Deleted", alias = "DELETED")]
    Deleted,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Enabled => "enabled",
            RuleStatus::Disabled => "disabled",
            RuleStatus::Deleted => "deleted",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RuleStatus::Enabled)
    }
}

/// A rule definition. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
}

impl AutomationRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: RuleStatus::Enabled,
            actions: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: RuleStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_action(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }
}

// ============================================================================
// Action nodes
// ============================================================================

/// One command sent to a device component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    #[serde(default = "default_component")]
    pub component: String,
    pub capability: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Value>,
}

fn default_component() -> String {
    "main".to_string()
}

impl DeviceCommand {
    pub fn new(capability: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            component: default_component(),
            capability: capability.into(),
            command: command.into(),
            arguments: Vec::new(),
        }
    }
}

/// Command node: the listed devices receive the listed commands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandAction {
    pub devices: Vec<String>,
    pub commands: Vec<DeviceCommand>,
}

/// Conditional node: evaluate `condition`, run `then` or `otherwise`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IfAction {
    pub condition: Condition,
    pub then: Vec<RuleAction>,
    #[serde(rename = "else")]
    pub otherwise: Vec<RuleAction>,
}

/// When a scheduled node fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Fixed time of day, "HH:MM"
    Specific { time: String },
    /// Fixed interval
    Interval { seconds: u64 },
    Unspecified,
}

impl Schedule {
    pub fn describe(&self) -> String {
        match self {
            Schedule::Specific { time } => format!("daily at {}", time),
            Schedule::Interval { seconds } => format!("every {}s", seconds),
            Schedule::Unspecified => "on a schedule".to_string(),
        }
    }
}

/// Scheduled node: run `actions` whenever `schedule` fires.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EveryAction {
    pub schedule: Schedule,
    pub actions: Vec<RuleAction>,
}

/// Closed set of action node shapes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Command(CommandAction),
    If(Box<IfAction>),
    Every(EveryAction),
    Unknown { kind: String, reason: String },
}

impl RuleAction {
    pub fn command(devices: &[&str], capability: &str, command: &str) -> Self {
        RuleAction::Command(CommandAction {
            devices: devices.iter().map(|d| d.to_string()).collect(),
            commands: vec![DeviceCommand::new(capability, command)],
        })
    }

    pub fn if_then(condition: Condition, then: Vec<RuleAction>, otherwise: Vec<RuleAction>) -> Self {
        RuleAction::If(Box::new(IfAction {
            condition,
            then,
            otherwise,
        }))
    }

    pub fn every(schedule: Schedule, actions: Vec<RuleAction>) -> Self {
        RuleAction::Every(EveryAction { schedule, actions })
    }

    /// Decode one node. Never fails.
    pub fn from_value(value: &Value) -> Self {
        let (kind, body) = match node_entry(value) {
            Ok(entry) => entry,
            Err(reason) => {
                return RuleAction::Unknown {
                    kind: String::new(),
                    reason,
                }
            }
        };

        let decoded = match kind {
            "command" => decode_command(body),
            "if" => decode_if(body),
            "every" => decode_every(body),
            "unknown" => {
                decode_unknown(body).map(|(kind, reason)| RuleAction::Unknown { kind, reason })
            }
            _ => Err("unrecognized action kind".to_string()),
        };

        decoded.unwrap_or_else(|reason| RuleAction::Unknown {
            kind: kind.to_string(),
            reason,
        })
    }
}

impl<'de> Deserialize<'de> for RuleAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(RuleAction::from_value(&value))
    }
}

fn decode_command(body: &Value) -> Result<RuleAction, String> {
    let obj = as_object(body, "command")?;
    let devices = string_list(obj.get("devices"), "devices")?;
    if devices.is_empty() {
        return Err("command targets no devices".to_string());
    }
    let commands = match obj.get("commands") {
        None => Vec::new(),
        Some(raw) => serde_json::from_value::<Vec<DeviceCommand>>(raw.clone())
            .map_err(|e| format!("bad commands: {}", e))?,
    };
    Ok(RuleAction::Command(CommandAction { devices, commands }))
}

fn decode_if(body: &Value) -> Result<RuleAction, String> {
    let obj = as_object(body, "if")?;
    let then = action_list(obj.get("then"));
    let otherwise = action_list(obj.get("else"));

    let condition = match obj.get("condition") {
        Some(explicit) => Condition::from_value(explicit),
        None => {
            // Inline form: the condition is the remaining key of the object.
            let mut inline = Map::new();
            for (key, value) in obj {
                if key != "then" && key != "else" {
                    inline.insert(key.clone(), value.clone());
                }
            }
            Condition::from_value(&Value::Object(inline))
        }
    };

    Ok(RuleAction::if_then(condition, then, otherwise))
}

fn decode_every(body: &Value) -> Result<RuleAction, String> {
    let obj = as_object(body, "every")?;
    let actions = action_list(obj.get("actions"));

    // Catalog nodes carry the schedule inline; the serialized form nests it.
    let schedule = decode_schedule(obj.get("schedule").unwrap_or(body))?;
    Ok(RuleAction::every(schedule, actions))
}

fn decode_schedule(value: &Value) -> Result<Schedule, String> {
    let schedule = if let Some(specific) = value.get("specific") {
        let time = specific
            .get("time")
            .or_else(|| specific.get("reference"))
            .and_then(Value::as_str)
            .ok_or_else(|| "specific schedule without time".to_string())?;
        Schedule::Specific {
            time: time.to_string(),
        }
    } else if let Some(interval) = value.get("interval") {
        let seconds = interval
            .get("seconds")
            .and_then(Value::as_u64)
            .or_else(|| interval.get("minutes").and_then(Value::as_u64).map(|m| m * 60))
            .ok_or_else(|| "interval schedule without duration".to_string())?;
        Schedule::Interval { seconds }
    } else {
        Schedule::Unspecified
    };
    Ok(schedule)
}

fn action_list(value: Option<&Value>) -> Vec<RuleAction> {
    match value {
        Some(Value::Array(items)) => items.iter().map(RuleAction::from_value).collect(),
        Some(single @ Value::Object(_)) => vec![RuleAction::from_value(single)],
        Some(other) => vec![RuleAction::Unknown {
            kind: String::new(),
            reason: format!("expected action list, got {}", type_name(other)),
        }],
        None => Vec::new(),
    }
}

// ============================================================================
// Conditions and operands
// ============================================================================

/// Device attribute reference inside a condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceOperand {
    pub devices: Vec<String>,
    pub component: String,
    pub capability: String,
    pub attribute: String,
}

/// Value a condition compares.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Device(DeviceOperand),
    Location { attribute: String },
    Time { reference: String },
    Literal(Value),
    Unknown { kind: String, reason: String },
}

impl Operand {
    pub fn device(device_id: &str, capability: &str, attribute: &str) -> Self {
        Operand::Device(DeviceOperand {
            devices: vec![device_id.to_string()],
            component: default_component(),
            capability: capability.to_string(),
            attribute: attribute.to_string(),
        })
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal(value.into())
    }

    pub fn from_value(value: &Value) -> Self {
        let (kind, body) = match node_entry(value) {
            Ok(entry) => entry,
            Err(reason) => {
                return Operand::Unknown {
                    kind: String::new(),
                    reason,
                }
            }
        };

        let decoded = match kind {
            "device" => decode_device_operand(body),
            "location" => Ok(Operand::Location {
                attribute: body
                    .get("attribute")
                    .and_then(Value::as_str)
                    .unwrap_or("mode")
                    .to_string(),
            }),
            "time" => Ok(Operand::Time {
                reference: body
                    .get("reference")
                    .and_then(Value::as_str)
                    .unwrap_or("Now")
                    .to_string(),
            }),
            "string" | "integer" | "decimal" | "boolean" | "literal" => {
                Ok(Operand::Literal(body.clone()))
            }
            "unknown" => {
                decode_unknown(body).map(|(kind, reason)| Operand::Unknown { kind, reason })
            }
            _ => Err("unrecognized operand kind".to_string()),
        };

        decoded.unwrap_or_else(|reason| Operand::Unknown {
            kind: kind.to_string(),
            reason,
        })
    }
}

fn decode_device_operand(body: &Value) -> Result<Operand, String> {
    let obj = as_object(body, "device")?;
    let mut devices = string_list(obj.get("devices"), "devices")?;
    if let Some(single) = obj.get("deviceId").and_then(Value::as_str) {
        devices.push(single.to_string());
    }
    if devices.is_empty() {
        return Err("device operand names no devices".to_string());
    }
    let field = |name: &str, fallback: &str| {
        obj.get(name)
            .and_then(Value::as_str)
            .unwrap_or(fallback)
            .to_string()
    };
    Ok(Operand::Device(DeviceOperand {
        devices,
        component: field("component", "main"),
        capability: field("capability", ""),
        attribute: field("attribute", ""),
    }))
}

/// Closed set of condition node shapes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Equals { left: Operand, right: Operand },
    GreaterThan { left: Operand, right: Operand },
    LessThan { left: Operand, right: Operand },
    Between { value: Operand, start: Operand, end: Operand },
    Changes { operand: Operand },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Unknown { kind: String, reason: String },
}

impl Condition {
    pub fn equals(left: Operand, right: Operand) -> Self {
        Condition::Equals { left, right }
    }

    /// Decode one condition node. Never fails.
    pub fn from_value(value: &Value) -> Self {
        let (kind, body) = match node_entry(value) {
            Ok(entry) => entry,
            Err(reason) => {
                return Condition::Unknown {
                    kind: String::new(),
                    reason,
                }
            }
        };

        let decoded = match kind {
            "equals" => binary(body).map(|(left, right)| Condition::Equals { left, right }),
            "greater_than" | "greaterThan" | "greater_than_or_equals" | "greaterThanOrEquals" => {
                binary(body).map(|(left, right)| Condition::GreaterThan { left, right })
            }
            "less_than" | "lessThan" | "less_than_or_equals" | "lessThanOrEquals" => {
                binary(body).map(|(left, right)| Condition::LessThan { left, right })
            }
            "between" => as_object(body, "between").map(|obj| Condition::Between {
                value: operand_field(obj, "value"),
                start: operand_field(obj, "start"),
                end: operand_field(obj, "end"),
            }),
            "changes" => {
                let operand = match body.get("operand") {
                    Some(inner) => Operand::from_value(inner),
                    None => Operand::from_value(body),
                };
                Ok(Condition::Changes { operand })
            }
            "and" => condition_list(body).map(Condition::And),
            "or" => condition_list(body).map(Condition::Or),
            "not" => Ok(Condition::Not(Box::new(Condition::from_value(body)))),
            "unknown" => {
                decode_unknown(body).map(|(kind, reason)| Condition::Unknown { kind, reason })
            }
            _ => Err("unrecognized condition kind".to_string()),
        };

        decoded.unwrap_or_else(|reason| Condition::Unknown {
            kind: kind.to_string(),
            reason,
        })
    }
}

fn binary(body: &Value) -> Result<(Operand, Operand), String> {
    let obj = as_object(body, "comparison")?;
    Ok((operand_field(obj, "left"), operand_field(obj, "right")))
}

fn operand_field(obj: &Map<String, Value>, field: &str) -> Operand {
    match obj.get(field) {
        Some(value) => Operand::from_value(value),
        None => Operand::Unknown {
            kind: field.to_string(),
            reason: "missing operand".to_string(),
        },
    }
}

fn condition_list(body: &Value) -> Result<Vec<Condition>, String> {
    match body {
        Value::Array(items) => Ok(items.iter().map(Condition::from_value).collect()),
        other => Err(format!("expected condition list, got {}", type_name(other))),
    }
}

// ============================================================================
// JSON helpers
// ============================================================================

/// Split a keyed node into (kind, body).
fn node_entry(value: &Value) -> Result<(&str, &Value), String> {
    let obj = value
        .as_object()
        .ok_or_else(|| format!("node is {}, not an object", type_name(value)))?;
    obj.iter()
        .next()
        .map(|(key, body)| (key.as_str(), body))
        .ok_or_else(|| "empty node".to_string())
}

/// (kind, reason) of a node this crate wrote out as `Unknown`
fn decode_unknown(body: &Value) -> Result<(String, String), String> {
    let obj = as_object(body, "unknown")?;
    let text = |field: &str| {
        obj.get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Ok((text("kind"), text("reason")))
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, String> {
    value
        .as_object()
        .ok_or_else(|| format!("{} body is {}, not an object", what, type_name(value)))
}

fn string_list(value: Option<&Value>, field: &str) -> Result<Vec<String>, String> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| format!("{} contains a non-string entry", field))
            })
            .collect(),
        Some(other) => Err(format!("{} is {}, not a list", field, type_name(other))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
