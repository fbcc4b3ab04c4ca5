//! Catalog Decoding Tests
//!
//! Whole catalogs as the platform returns them: mixed node shapes, nested
//! logic, and nodes this crate does not understand.

use culprit_shared::{
    AutomationRule, Condition, Operand, RuleAction, RuleStatus, Schedule,
};
use serde_json::json;

fn catalog() -> Vec<AutomationRule> {
    serde_json::from_value(json!([
        {
            "id": "r-1",
            "name": "Motion hallway",
            "status": "ENABLED",
            "actions": [{
                "if": {
                    "and": [
                        {"equals": {
                            "left": {"device": {"devices": ["M1"], "capability": "motionSensor", "attribute": "motion"}},
                            "right": {"string": "active"}
                        }},
                        {"between": {
                            "value": {"time": {"reference": "Now"}},
                            "start": {"time": {"reference": "Sunset"}},
                            "end": {"time": {"reference": "Sunrise"}}
                        }}
                    ],
                    "then": [{"command": {"devices": ["L1"], "commands": [{"capability": "switch", "command": "on"}]}}],
                    "else": [{"command": {"devices": ["L1"], "commands": [{"capability": "switch", "command": "off"}]}}]
                }
            }]
        },
        {
            "id": "r-2",
            "name": "Heater guard",
            "status": "Disabled",
            "actions": [{
                "if": {
                    "condition": {"greaterThan": {
                        "left": {"device": {"deviceId": "T1", "capability": "temperatureMeasurement", "attribute": "temperature"}},
                        "right": {"integer": 24}
                    }},
                    "then": [{"command": {"devices": ["H1"], "commands": [{"capability": "switch", "command": "off"}]}}]
                }
            }]
        },
        {
            "id": "r-3",
            "name": "Every 15 minutes",
            "actions": [
                {"every": {"interval": {"minutes": 15}, "actions": [{"command": {"devices": ["P1"]}}]}},
                {"sleep": {"duration": {"value": 5}}}
            ]
        }
    ]))
    .unwrap()
}

#[test]
fn test_catalog_decodes_every_rule() {
    let rules = catalog();
    assert_eq!(rules.len(), 3);
    assert_eq!(rules[0].status, RuleStatus::Enabled);
    assert_eq!(rules[1].status, RuleStatus::Disabled);
    // status absent defaults to enabled
    assert_eq!(rules[2].status, RuleStatus::Enabled);
}

#[test]
fn test_nested_logic_preserved() {
    let rules = catalog();
    let RuleAction::If(node) = &rules[0].actions[0] else {
        panic!("expected if node");
    };
    let Condition::And(parts) = &node.condition else {
        panic!("expected and condition, got {:?}", node.condition);
    };
    assert_eq!(parts.len(), 2);
    assert!(matches!(parts[1], Condition::Between { .. }));
    assert_eq!(node.then.len(), 1);
    assert_eq!(node.otherwise.len(), 1);
}

#[test]
fn test_single_device_id_operand() {
    let rules = catalog();
    let RuleAction::If(node) = &rules[1].actions[0] else {
        panic!("expected if node");
    };
    let Condition::GreaterThan { left, right } = &node.condition else {
        panic!("expected greater_than, got {:?}", node.condition);
    };
    match left {
        Operand::Device(device) => assert_eq!(device.devices, vec!["T1"]),
        other => panic!("expected device operand, got {:?}", other),
    }
    assert_eq!(right, &Operand::Literal(json!(24)));
}

#[test]
fn test_interval_and_unknown_nodes() {
    let rules = catalog();
    let RuleAction::Every(every) = &rules[2].actions[0] else {
        panic!("expected every node");
    };
    assert_eq!(every.schedule, Schedule::Interval { seconds: 900 });
    assert_eq!(every.schedule.describe(), "every 900s");

    match &rules[2].actions[1] {
        RuleAction::Unknown { kind, .. } => assert_eq!(kind, "sleep"),
        other => panic!("expected unknown node, got {:?}", other),
    }
}

#[test]
fn test_serialized_rule_decodes_back() {
    for rule in catalog() {
        let encoded = serde_json::to_value(&rule).unwrap();
        let decoded: AutomationRule = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, rule, "rule {} changed after re-encoding", rule.id);
    }
}

#[test]
fn test_serialized_catalog_keeps_schedule() {
    let encoded = serde_json::to_value(catalog()).unwrap();
    let decoded: Vec<AutomationRule> = serde_json::from_value(encoded).unwrap();
    let RuleAction::Every(every) = &decoded[2].actions[0] else {
        panic!("expected every node");
    };
    assert_eq!(every.schedule, Schedule::Interval { seconds: 900 });
    assert!(matches!(
        &decoded[2].actions[1],
        RuleAction::Unknown { kind, .. } if kind == "sleep"
    ));
}
