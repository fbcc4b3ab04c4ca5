//! Rule Reference Extractor
//!
//! Walks one rule's action tree and returns every device it references,
//! tagged by role. Command nodes contribute `Controlled` references, device
//! operands inside conditions contribute `Trigger` references, and both
//! branches of a conditional are visited. Nodes that cannot be interpreted
//! are skipped and reported as `RuleError::MalformedRule`; they never stop
//! the rest of the tree from being indexed.

use culprit_shared::{
    AutomationRule, Condition, MatchRole, Operand, RuleAction, RuleError,
};
use std::collections::BTreeMap;
use tracing::warn;

/// How one rule references one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceReference {
    pub role: MatchRole,
    /// Controlled from inside a scheduled node
    pub scheduled: bool,
}

/// Output of extracting one rule.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub references: BTreeMap<String, DeviceReference>,
    pub skipped: Vec<RuleError>,
}

impl Extraction {
    pub fn role_of(&self, device_id: &str) -> Option<MatchRole> {
        self.references.get(device_id).map(|r| r.role)
    }

    fn add(&mut self, device_id: &str, role: MatchRole, scheduled: bool) {
        self.references
            .entry(device_id.to_string())
            .and_modify(|existing| {
                existing.role = existing.role.merge(role);
                existing.scheduled |= scheduled;
            })
            .or_insert(DeviceReference { role, scheduled });
    }
}

/// Extract the devices a rule references. Pure apart from logging.
pub fn extract_references(rule: &AutomationRule) -> Extraction {
    let mut walker = Walker {
        rule_id: &rule.id,
        out: Extraction::default(),
    };
    walker.actions(&rule.actions, "actions", false);

    for skipped in &walker.out.skipped {
        warn!("Skipping node: {}", skipped);
    }
    walker.out
}

struct Walker<'a> {
    rule_id: &'a str,
    out: Extraction,
}

impl Walker<'_> {
    fn malformed(&mut self, path: &str, reason: String) {
        self.out.skipped.push(RuleError::MalformedRule {
            rule_id: self.rule_id.to_string(),
            path: path.to_string(),
            reason,
        });
    }

    fn actions(&mut self, actions: &[RuleAction], path: &str, scheduled: bool) {
        for (i, action) in actions.iter().enumerate() {
            self.action(action, &format!("{}[{}]", path, i), scheduled);
        }
    }

    fn action(&mut self, action: &RuleAction, path: &str, scheduled: bool) {
        match action {
            RuleAction::Command(cmd) => {
                for device_id in &cmd.devices {
                    if device_id.trim().is_empty() {
                        self.malformed(path, "command targets a blank device id".to_string());
                        continue;
                    }
                    self.out.add(device_id, MatchRole::Controlled, scheduled);
                }
            }
            RuleAction::If(node) => {
                self.condition(&node.condition, &format!("{}.if", path));
                self.actions(&node.then, &format!("{}.then", path), scheduled);
                self.actions(&node.otherwise, &format!("{}.else", path), scheduled);
            }
            RuleAction::Every(every) => {
                self.actions(&every.actions, &format!("{}.every", path), true);
            }
            RuleAction::Unknown { kind, reason } => {
                self.malformed(path, unknown_reason("action", kind, reason));
            }
        }
    }

    fn condition(&mut self, condition: &Condition, path: &str) {
        match condition {
            Condition::Equals { left, right }
            | Condition::GreaterThan { left, right }
            | Condition::LessThan { left, right } => {
                self.operand(left, &format!("{}.left", path));
                self.operand(right, &format!("{}.right", path));
            }
            Condition::Between { value, start, end } => {
                self.operand(value, &format!("{}.value", path));
                self.operand(start, &format!("{}.start", path));
                self.operand(end, &format!("{}.end", path));
            }
            Condition::Changes { operand } => {
                self.operand(operand, &format!("{}.changes", path));
            }
            Condition::And(items) | Condition::Or(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.condition(item, &format!("{}[{}]", path, i));
                }
            }
            Condition::Not(inner) => self.condition(inner, &format!("{}.not", path)),
            Condition::Unknown { kind, reason } => {
                self.malformed(path, unknown_reason("condition", kind, reason));
            }
        }
    }

    fn operand(&mut self, operand: &Operand, path: &str) {
        match operand {
            Operand::Device(device) => {
                for device_id in &device.devices {
                    if device_id.trim().is_empty() {
                        self.malformed(path, "device operand with a blank device id".to_string());
                        continue;
                    }
                    self.out.add(device_id, MatchRole::Trigger, false);
                }
            }
            Operand::Location { .. } | Operand::Time { .. } | Operand::Literal(_) => {}
            Operand::Unknown { kind, reason } => {
                self.malformed(path, unknown_reason("operand", kind, reason));
            }
        }
    }
}

fn unknown_reason(what: &str, kind: &str, reason: &str) -> String {
    if kind.is_empty() {
        format!("{}: {}", what, reason)
    } else {
        format!("{} '{}': {}", what, kind, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use culprit_shared::Schedule;
    use serde_json::json;

    fn motion_light_rule() -> AutomationRule {
        AutomationRule::new("r1", "Motion light").with_action(RuleAction::if_then(
            Condition::equals(
                Operand::device("M1", "motionSensor", "motion"),
                Operand::literal("active"),
            ),
            vec![RuleAction::command(&["L1"], "switch", "on")],
            vec![RuleAction::command(&["L1", "L2"], "switch", "off")],
        ))
    }

    #[test]
    fn test_command_is_controlled() {
        let rule = AutomationRule::new("r1", "Lights on")
            .with_action(RuleAction::command(&["D1"], "switch", "on"));
        let extraction = extract_references(&rule);
        assert_eq!(extraction.role_of("D1"), Some(MatchRole::Controlled));
        assert!(extraction.skipped.is_empty());
    }

    #[test]
    fn test_condition_operand_is_trigger_and_both_branches_walked() {
        let extraction = extract_references(&motion_light_rule());
        assert_eq!(extraction.role_of("M1"), Some(MatchRole::Trigger));
        assert_eq!(extraction.role_of("L1"), Some(MatchRole::Controlled));
        assert_eq!(extraction.role_of("L2"), Some(MatchRole::Controlled));
    }

    #[test]
    fn test_device_in_both_roles() {
        let rule = AutomationRule::new("r2", "Toggle back").with_action(RuleAction::if_then(
            Condition::equals(
                Operand::device("D1", "switch", "switch"),
                Operand::literal("on"),
            ),
            vec![RuleAction::command(&["D1"], "switch", "off")],
            vec![],
        ));
        let extraction = extract_references(&rule);
        assert_eq!(extraction.role_of("D1"), Some(MatchRole::Both));
    }

    #[test]
    fn test_scheduled_nodes_mark_references() {
        let rule = AutomationRule::new("r3", "Nightly").with_action(RuleAction::every(
            Schedule::Specific {
                time: "22:00".to_string(),
            },
            vec![RuleAction::command(&["D9"], "switch", "off")],
        ));
        let extraction = extract_references(&rule);
        let reference = extraction.references["D9"];
        assert_eq!(reference.role, MatchRole::Controlled);
        assert!(reference.scheduled);
    }

    #[test]
    fn test_nested_logic_conditions() {
        let rule: AutomationRule = serde_json::from_value(json!({
            "id": "r4",
            "name": "Nested",
            "actions": [{
                "if": {
                    "and": [
                        {"equals": {
                            "left": {"device": {"devices": ["A"], "capability": "contactSensor", "attribute": "contact"}},
                            "right": {"string": "open"}
                        }},
                        {"not": {"changes": {"operand": {"device": {"devices": ["B"], "capability": "switch", "attribute": "switch"}}}}}
                    ],
                    "then": [{"command": {"devices": ["C"]}}]
                }
            }]
        }))
        .unwrap();
        let extraction = extract_references(&rule);
        assert_eq!(extraction.role_of("A"), Some(MatchRole::Trigger));
        assert_eq!(extraction.role_of("B"), Some(MatchRole::Trigger));
        assert_eq!(extraction.role_of("C"), Some(MatchRole::Controlled));
    }

    #[test]
    fn test_malformed_nodes_skipped_not_fatal() {
        let rule: AutomationRule = serde_json::from_value(json!({
            "id": "r5",
            "name": "Half broken",
            "actions": [
                {"command": {"devices": "D1"}},
                {"teleport": {"devices": ["X"]}},
                {"command": {"devices": ["D2"]}}
            ]
        }))
        .unwrap();
        let extraction = extract_references(&rule);
        assert_eq!(extraction.skipped.len(), 2);
        assert_eq!(extraction.role_of("D2"), Some(MatchRole::Controlled));
        assert_eq!(extraction.role_of("X"), None);

        let RuleError::MalformedRule { rule_id, path, .. } = &extraction.skipped[0];
        assert_eq!(rule_id, "r5");
        assert_eq!(path, "actions[0]");
    }
}
