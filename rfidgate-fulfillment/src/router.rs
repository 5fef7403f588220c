//! Antenna rule router.
//!
//! Rules are looked up in two tiers: the reading device's own table, then the
//! `"any"` table. A device rule for an antenna shadows the `"any"` rule for
//! the same antenna even when its flag for the requested action is off.

use rfidgate_core::normalize::normalize_device_key;
use rfidgate_core::{AntennaRule, RuleAction};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const ANY_DEVICE: &str = "any";

/// Antenna chosen for an action, with the rule that chose it when one did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub antenna: u8,
    pub rule: Option<AntennaRule>,
}

impl Route {
    /// Whether the matched rule also asks for a delivery note.
    pub fn creates_delivery_note(&self) -> bool {
        self.rule
            .as_ref()
            .is_some_and(|r| r.allows(RuleAction::CreateDeliveryNote))
    }
}

/// Snapshot of all antenna rules, keyed by normalized device.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    by_device: HashMap<String, BTreeMap<u8, AntennaRule>>,
}

impl RuleTable {
    /// Build from stored rules. Antenna 0 rules are ignored.
    pub fn new(rules: impl IntoIterator<Item = AntennaRule>) -> Self {
        let mut by_device: HashMap<String, BTreeMap<u8, AntennaRule>> = HashMap::new();
        for rule in rules.into_iter().filter(|r| r.antenna_id > 0) {
            let device = normalize_device_key(&rule.device);
            by_device
                .entry(device.clone())
                .or_default()
                .insert(rule.antenna_id, AntennaRule { device, ..rule });
        }
        Self { by_device }
    }

    pub fn is_empty(&self) -> bool {
        self.by_device.values().all(|t| t.is_empty())
    }

    fn tier(&self, device_key: &str) -> Option<&BTreeMap<u8, AntennaRule>> {
        self.by_device.get(device_key)
    }

    /// Rule for one antenna: the device's own, else the `"any"` one.
    pub fn lookup(&self, device_key: &str, antenna: u8) -> Option<&AntennaRule> {
        self.tier(device_key)
            .and_then(|t| t.get(&antenna))
            .or_else(|| self.tier(ANY_DEVICE).and_then(|t| t.get(&antenna)))
    }

    /// First observed antenna, ascending, whose rule enables `action`.
    pub fn resolve(
        &self,
        device_key: &str,
        observed: &BTreeSet<u8>,
        action: RuleAction,
    ) -> Option<Route> {
        observed.iter().find_map(|&antenna| {
            self.lookup(device_key, antenna)
                .filter(|rule| rule.allows(action))
                .map(|rule| Route {
                    antenna,
                    rule: Some(rule.clone()),
                })
        })
    }

    /// Whether any stock rule exists for the device or the `"any"` tier.
    pub fn has_stock_rules(&self, device_key: &str) -> bool {
        [device_key, ANY_DEVICE].iter().any(|key| {
            self.tier(key)
                .is_some_and(|t| t.values().any(|r| r.submit_stock))
        })
    }

    /// Antenna that consumes a tag, if any.
    ///
    /// A matching `submit_stock` rule wins. When stock rules exist but none
    /// matched, nothing is consumed. Without stock rules the tag's declared
    /// antenna is used if it saw the tag; otherwise strict mode consumes
    /// nothing and lenient mode takes the lowest observed antenna.
    pub fn stock_route(
        &self,
        device_key: &str,
        observed: &BTreeSet<u8>,
        declared: u8,
        strict: bool,
    ) -> Option<Route> {
        if let Some(route) = self.resolve(device_key, observed, RuleAction::SubmitStock) {
            return Some(route);
        }
        if self.has_stock_rules(device_key) {
            return None;
        }
        let fallback = |antenna: u8| Route {
            antenna,
            rule: None,
        };
        if declared > 0 && observed.contains(&declared) {
            return Some(fallback(declared));
        }
        if strict && declared > 0 && !observed.is_empty() {
            return None;
        }
        observed.iter().next().copied().map(fallback)
    }
}
