//! Scheduled rule execution.
//!
//! Rules carry either a `rate(N unit)` expression (fixed interval) or a
//! six-field `cron(...)` expression. Each enabled rule gets its own task
//! that sleeps until the next fire time, runs the callback, and repeats
//! until the runner is stopped.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use nimbus_core::EmulatorError;

use crate::{EventHandler, HandlerFuture};

/// Never sleep less than this, to avoid busy loops on degenerate schedules.
const MIN_DELAY: Duration = Duration::from_millis(100);

/// One scheduled rule bound to its callback.
#[derive(Clone)]
pub struct ScheduledRule {
    pub rule_name: String,
    pub expression: String,
    pub callback: Arc<dyn Fn() -> HandlerFuture + Send + Sync>,
    pub enabled: bool,
}

impl ScheduledRule {
    /// Bind an event handler to a rule; scheduled fires pass the given
    /// synthetic event.
    pub fn from_handler(
        rule_name: impl Into<String>,
        expression: impl Into<String>,
        handler: EventHandler,
        event: serde_json::Value,
    ) -> Self {
        Self {
            rule_name: rule_name.into(),
            expression: expression.into(),
            callback: Arc::new(move || handler(event.clone())),
            enabled: true,
        }
    }
}

/// Parse `rate(N unit)` into its interval.
pub fn parse_rate_expression(expression: &str) -> Result<Duration, EmulatorError> {
    let inner = extract_inner(expression, "rate")?;
    let parts: Vec<&str> = inner.split_whitespace().collect();
    if parts.len() != 2 {
        return Err(EmulatorError::Validation(format!(
            "invalid rate expression: {expression}"
        )));
    }
    let value: u64 = parts[0].parse().map_err(|_| {
        EmulatorError::Validation(format!("invalid rate value in: {expression}"))
    })?;
    let seconds = match parts[1].trim_end_matches('s') {
        "minute" => 60,
        "hour" => 3600,
        "day" => 86400,
        other => {
            return Err(EmulatorError::Validation(format!(
                "unknown rate unit {other} in: {expression}"
            )))
        }
    };
    Ok(Duration::from_secs(value * seconds))
}

/// Convert a six-field `cron(minutes hours dom month dow year)` expression
/// into a parsed schedule. The scheduler library expects a leading seconds
/// field and has no use for `?`.
pub fn parse_cron_expression(expression: &str) -> Result<Schedule, EmulatorError> {
    let inner = extract_inner(expression, "cron")?;
    let fields: Vec<&str> = inner.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(EmulatorError::Validation(format!(
            "expected 6 fields in cron expression, got {}: {expression}",
            fields.len()
        )));
    }
    let converted = format!("0 {}", fields.join(" ")).replace('?', "*");
    Schedule::from_str(&converted).map_err(|err| {
        EmulatorError::Validation(format!("invalid cron expression {expression}: {err}"))
    })
}

/// Delay until the next fire time of a schedule expression.
pub fn next_fire_delay(expression: &str) -> Result<Duration, EmulatorError> {
    let delay = if expression.starts_with("rate(") {
        parse_rate_expression(expression)?
    } else if expression.starts_with("cron(") {
        let schedule = parse_cron_expression(expression)?;
        let next = schedule.upcoming(Utc).next().ok_or_else(|| {
            EmulatorError::Validation(format!("cron expression never fires: {expression}"))
        })?;
        (next - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    } else {
        return Err(EmulatorError::Validation(format!(
            "unsupported schedule expression: {expression}"
        )));
    };
    Ok(delay.max(MIN_DELAY))
}

fn extract_inner<'a>(expression: &'a str, prefix: &str) -> Result<&'a str, EmulatorError> {
    let trimmed = expression.trim();
    let without_prefix = trimmed
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'));
    without_prefix.ok_or_else(|| {
        EmulatorError::Validation(format!("expected {prefix}(...), got: {expression}"))
    })
}

/// Owns one background task per enabled rule.
pub struct ScheduleRunner {
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ScheduleRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleRunner {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start a task per enabled rule. Rules with unparsable expressions are
    /// rejected up front rather than failing silently in the loop.
    pub fn start(&self, rules: Vec<ScheduledRule>) -> Result<(), EmulatorError> {
        for rule in &rules {
            if rule.enabled {
                next_fire_delay(&rule.expression)?;
            }
        }
        let mut tasks = self.tasks.lock().expect("tasks lock");
        for rule in rules.into_iter().filter(|r| r.enabled) {
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(run_schedule(rule, cancel)));
        }
        Ok(())
    }

    /// Cancel every task and wait for them to wind down.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().expect("tasks lock");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn run_schedule(rule: ScheduledRule, cancel: CancellationToken) {
    loop {
        let delay = match next_fire_delay(&rule.expression) {
            Ok(delay) => delay,
            Err(err) => {
                tracing::error!(rule = %rule.rule_name, error = %err, "schedule stopped");
                return;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        tracing::debug!(rule = %rule.rule_name, "scheduled rule firing");
        (rule.callback)().await;
    }
}
