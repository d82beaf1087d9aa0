//! Event bus emulation.
//!
//! Named buses carry rules; a rule has either an event pattern or a
//! schedule expression, plus a set of targets. `put-events` matches every
//! enabled rule on the bus and schedules each target's handler as an
//! independent task. Scheduled rules fire through the schedule runner.

pub mod pattern;
pub mod schedule;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};

use nimbus_core::{EmulatorError, Provider, ProviderStatus, LOCAL_ACCOUNT_ID, LOCAL_REGION};

use crate::EventHandler;
use self::pattern::match_event;
use self::schedule::{ScheduleRunner, ScheduledRule};

/// One rule target.
#[derive(Debug, Clone)]
pub struct BusTarget {
    pub id: String,
    pub arn: String,
}

#[derive(Clone)]
struct Rule {
    name: String,
    bus_name: String,
    pattern: Option<Value>,
    schedule: Option<String>,
    enabled: bool,
    targets: Vec<BusTarget>,
}

/// Provider owning the default bus and any declared custom buses.
pub struct EventBusProvider {
    name: String,
    buses: Mutex<Vec<String>>,
    rules: Arc<Mutex<HashMap<String, Rule>>>,
    target_handlers: Arc<DashMap<String, EventHandler>>,
    scheduler: ScheduleRunner,
    status: Mutex<ProviderStatus>,
}

impl Default for EventBusProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBusProvider {
    pub fn new() -> Self {
        Self {
            name: "event-bus".to_string(),
            buses: Mutex::new(vec!["default".to_string()]),
            rules: Arc::new(Mutex::new(HashMap::new())),
            target_handlers: Arc::new(DashMap::new()),
            scheduler: ScheduleRunner::new(),
            status: Mutex::new(ProviderStatus::Stopped),
        }
    }

    pub fn create_bus(&self, bus_name: impl Into<String>) -> Result<String, EmulatorError> {
        let bus_name = bus_name.into();
        let mut buses = self.buses.lock().expect("buses lock");
        if buses.contains(&bus_name) {
            return Err(EmulatorError::Conflict(format!(
                "bus already exists: {bus_name}"
            )));
        }
        buses.push(bus_name.clone());
        Ok(bus_arn(&bus_name))
    }

    pub fn list_buses(&self) -> Vec<(String, String)> {
        self.buses
            .lock()
            .expect("buses lock")
            .iter()
            .map(|b| (b.clone(), bus_arn(b)))
            .collect()
    }

    /// Create or replace a rule. Exactly one of pattern / schedule must be
    /// given.
    pub fn put_rule(
        &self,
        rule_name: &str,
        bus_name: Option<&str>,
        event_pattern: Option<Value>,
        schedule_expression: Option<String>,
    ) -> Result<String, EmulatorError> {
        if event_pattern.is_none() && schedule_expression.is_none() {
            return Err(EmulatorError::Validation(format!(
                "rule {rule_name} needs an event pattern or a schedule expression"
            )));
        }
        let bus_name = bus_name.unwrap_or("default").to_string();
        if !self.buses.lock().expect("buses lock").contains(&bus_name) {
            return Err(EmulatorError::NotFound(format!("no such bus: {bus_name}")));
        }
        if let Some(expression) = &schedule_expression {
            // Reject malformed expressions at rule creation.
            schedule::next_fire_delay(expression)?;
        }

        let rule = Rule {
            name: rule_name.to_string(),
            bus_name,
            pattern: event_pattern,
            schedule: schedule_expression,
            enabled: true,
            targets: Vec::new(),
        };
        let started = self.status.lock().expect("status lock").is_running();
        if started {
            self.start_schedule_if_needed(&rule)?;
        }
        self.rules
            .lock()
            .expect("rules lock")
            .insert(rule_name.to_string(), rule);
        Ok(rule_arn(rule_name))
    }

    pub fn put_targets(
        &self,
        rule_name: &str,
        targets: Vec<BusTarget>,
    ) -> Result<(), EmulatorError> {
        let mut rules = self.rules.lock().expect("rules lock");
        let rule = rules
            .get_mut(rule_name)
            .ok_or_else(|| EmulatorError::NotFound(format!("no such rule: {rule_name}")))?;
        for target in targets {
            rule.targets.retain(|t| t.id != target.id);
            rule.targets.push(target);
        }
        Ok(())
    }

    pub fn delete_rule(&self, rule_name: &str) -> Result<(), EmulatorError> {
        let removed = self.rules.lock().expect("rules lock").remove(rule_name);
        if removed.is_none() {
            return Err(EmulatorError::NotFound(format!("no such rule: {rule_name}")));
        }
        Ok(())
    }

    pub fn list_rules(&self, bus_name: &str) -> Vec<(String, Option<Value>, Option<String>, bool)> {
        let rules = self.rules.lock().expect("rules lock");
        let mut out: Vec<_> = rules
            .values()
            .filter(|r| r.bus_name == bus_name)
            .map(|r| (r.name.clone(), r.pattern.clone(), r.schedule.clone(), r.enabled))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Bind the handler invoked for a target ARN.
    pub fn register_target_handler(&self, arn: impl Into<String>, handler: EventHandler) {
        self.target_handlers.insert(arn.into(), handler);
    }

    /// Publish events; returns one `{EventId}` entry per input.
    pub fn put_events(&self, entries: Vec<Value>) -> Result<Vec<Value>, EmulatorError> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let bus_name = entry
                .get("EventBusName")
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_string();
            let detail = match entry.get("Detail") {
                Some(Value::String(s)) => {
                    serde_json::from_str(s).unwrap_or(Value::String(s.clone()))
                }
                Some(other) => other.clone(),
                None => json!({}),
            };
            let event_id = uuid::Uuid::new_v4().to_string();
            let event = json!({
                "version": "0",
                "id": event_id,
                "source": entry.get("Source").cloned().unwrap_or(Value::Null),
                "detail-type": entry.get("DetailType").cloned().unwrap_or(Value::Null),
                "account": LOCAL_ACCOUNT_ID,
                "region": LOCAL_REGION,
                "time": chrono::Utc::now().to_rfc3339(),
                "detail": detail,
            });
            self.dispatch(&bus_name, &event);
            results.push(json!({"EventId": event_id}));
        }
        Ok(results)
    }

    /// Match every enabled pattern rule on the bus; dispatch order across
    /// rules is unspecified.
    fn dispatch(&self, bus_name: &str, event: &Value) {
        let rules = self.rules.lock().expect("rules lock");
        for rule in rules.values() {
            if rule.bus_name != bus_name || !rule.enabled {
                continue;
            }
            let Some(pattern) = &rule.pattern else {
                continue;
            };
            if !match_event(pattern, event) {
                continue;
            }
            for target in &rule.targets {
                let Some(handler) = self.target_handlers.get(&target.arn) else {
                    tracing::warn!(rule = %rule.name, arn = %target.arn, "no handler for target");
                    continue;
                };
                let handler = handler.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    handler(event).await;
                });
            }
        }
    }

    fn start_schedule_if_needed(&self, rule: &Rule) -> Result<(), EmulatorError> {
        let Some(expression) = &rule.schedule else {
            return Ok(());
        };
        let callback = scheduled_fire_callback(
            rule.name.clone(),
            self.rules.clone(),
            self.target_handlers.clone(),
        );
        self.scheduler.start(vec![ScheduledRule {
            rule_name: rule.name.clone(),
            expression: expression.clone(),
            callback,
            enabled: rule.enabled,
        }])
    }
}

/// Fire callback for a scheduled rule. Targets and handlers are looked up
/// at fire time so later `put-targets` calls take effect.
fn scheduled_fire_callback(
    rule_name: String,
    rules: Arc<Mutex<HashMap<String, Rule>>>,
    handlers: Arc<DashMap<String, EventHandler>>,
) -> Arc<dyn Fn() -> crate::HandlerFuture + Send + Sync> {
    Arc::new(move || {
        let event = json!({
            "version": "0",
            "id": uuid::Uuid::new_v4().to_string(),
            "detail-type": "Scheduled Event",
            "source": "aws.events",
            "account": LOCAL_ACCOUNT_ID,
            "region": LOCAL_REGION,
            "time": chrono::Utc::now().to_rfc3339(),
            "resources": [rule_arn(&rule_name)],
            "detail": {},
        });
        let targets: Vec<BusTarget> = rules
            .lock()
            .expect("rules lock")
            .get(&rule_name)
            .filter(|r| r.enabled)
            .map(|r| r.targets.clone())
            .unwrap_or_default();
        let pending: Vec<(EventHandler, Value)> = targets
            .iter()
            .filter_map(|t| handlers.get(&t.arn).map(|h| (h.clone(), event.clone())))
            .collect();
        Box::pin(async move {
            for (handler, event) in pending {
                handler(event).await;
            }
        })
    })
}

fn bus_arn(bus_name: &str) -> String {
    format!("arn:aws:events:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:event-bus/{bus_name}")
}

fn rule_arn(rule_name: &str) -> String {
    format!("arn:aws:events:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:rule/{rule_name}")
}

#[async_trait]
impl Provider for EventBusProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), EmulatorError> {
        if self.status.lock().expect("status lock").is_running() {
            return Ok(());
        }
        let scheduled: Vec<Rule> = {
            let rules = self.rules.lock().expect("rules lock");
            rules.values().filter(|r| r.schedule.is_some()).cloned().collect()
        };
        for rule in &scheduled {
            self.start_schedule_if_needed(rule)?;
        }
        *self.status.lock().expect("status lock") = ProviderStatus::Running;
        Ok(())
    }

    async fn stop(&self) -> Result<(), EmulatorError> {
        self.scheduler.stop().await;
        *self.status.lock().expect("status lock") = ProviderStatus::Stopped;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.status.lock().expect("status lock").is_running()
    }

    fn supports_reset(&self) -> bool {
        true
    }

    async fn reset(&self) -> Result<(), EmulatorError> {
        self.rules.lock().expect("rules lock").clear();
        self.target_handlers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_handler() -> (Arc<AtomicUsize>, EventHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_for_handler = count.clone();
        let handler: EventHandler = Arc::new(move |_| {
            let count = count_for_handler.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        });
        (count, handler)
    }

    #[tokio::test]
    async fn fanout_respects_rule_patterns() {
        let bus = EventBusProvider::new();
        bus.start().await.unwrap();

        let (a_count, a_handler) = counting_handler();
        let (b_count, b_handler) = counting_handler();
        bus.register_target_handler("arn:fn:a", a_handler);
        bus.register_target_handler("arn:fn:b", b_handler);

        bus.put_rule("r1", None, Some(json!({"source": ["orders"]})), None)
            .unwrap();
        bus.put_targets(
            "r1",
            vec![BusTarget {
                id: "1".into(),
                arn: "arn:fn:a".into(),
            }],
        )
        .unwrap();

        bus.put_rule(
            "r2",
            None,
            Some(json!({"source": ["orders"], "detail": {"amount": [{"numeric": [">=", 100]}]}})),
            None,
        )
        .unwrap();
        bus.put_targets(
            "r2",
            vec![BusTarget {
                id: "1".into(),
                arn: "arn:fn:b".into(),
            }],
        )
        .unwrap();

        bus.put_events(vec![json!({"Source": "orders", "Detail": {"amount": 50}})])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);

        bus.put_events(vec![json!({"Source": "orders", "Detail": {"amount": 250}})])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a_count.load(Ordering::SeqCst), 2);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stringified_detail_is_parsed() {
        let bus = EventBusProvider::new();
        bus.start().await.unwrap();
        let (count, handler) = counting_handler();
        bus.register_target_handler("arn:fn", handler);
        bus.put_rule("r", None, Some(json!({"detail": {"ok": [true]}})), None)
            .unwrap();
        bus.put_targets(
            "r",
            vec![BusTarget {
                id: "1".into(),
                arn: "arn:fn".into(),
            }],
        )
        .unwrap();

        bus.put_events(vec![json!({"Source": "s", "Detail": "{\"ok\": true}"})])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rule_validation_and_missing_rule_errors() {
        let bus = EventBusProvider::new();
        assert!(bus.put_rule("r", None, None, None).is_err());
        assert!(bus.put_rule("r", Some("ghost-bus"), Some(json!({})), None).is_err());
        assert!(bus
            .put_rule("r", None, None, Some("rate(1 potato)".into()))
            .is_err());
        assert!(bus.put_targets("ghost", Vec::new()).is_err());
        assert!(bus.delete_rule("ghost").is_err());
    }

    #[tokio::test]
    async fn custom_buses_isolate_events() {
        let bus = EventBusProvider::new();
        bus.start().await.unwrap();
        bus.create_bus("audit").unwrap();
        let (count, handler) = counting_handler();
        bus.register_target_handler("arn:fn", handler);
        bus.put_rule("r", Some("audit"), Some(json!({"source": ["s"]})), None)
            .unwrap();
        bus.put_targets(
            "r",
            vec![BusTarget {
                id: "1".into(),
                arn: "arn:fn".into(),
            }],
        )
        .unwrap();

        // Default-bus event does not reach the audit-bus rule.
        bus.put_events(vec![json!({"Source": "s"})]).unwrap();
        bus.put_events(vec![json!({"Source": "s", "EventBusName": "audit"})])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
