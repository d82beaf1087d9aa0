//! Workflow engine provider.
//!
//! Holds the registered state machines and their executions. Standard
//! executions run as spawned tasks and return an execution identifier
//! immediately; express executions block the caller and return the final
//! output. Executions live in memory only and do not survive a restart.

pub mod choice;
pub mod definition;
pub mod interpreter;
pub mod paths;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use nimbus_core::{
    EmulatorError, Provider, ProviderStatus, LOCAL_ACCOUNT_ID, LOCAL_REGION,
};

use self::definition::StateMachineDef;
use self::interpreter::{Execution, ExecutionStatus, Interpreter, TaskResolver};

/// Standard workflows return immediately; express workflows block the
/// caller until completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowType {
    Standard,
    Express,
}

struct Machine {
    arn: String,
    workflow_type: WorkflowType,
    def: Arc<StateMachineDef>,
    definition_json: Value,
}

struct ExecutionHandle {
    record: Arc<Mutex<Execution>>,
    abort: CancellationToken,
}

/// Provider owning every registered state machine and execution.
pub struct WorkflowProvider {
    name: String,
    machines: Mutex<HashMap<String, Machine>>,
    executions: DashMap<String, ExecutionHandle>,
    resolver: TaskResolver,
    status: Mutex<ProviderStatus>,
}

impl WorkflowProvider {
    /// `resolver` maps a Task state's resource ARN to a function invoker.
    pub fn new(resolver: TaskResolver) -> Self {
        Self {
            name: "workflow".to_string(),
            machines: Mutex::new(HashMap::new()),
            executions: DashMap::new(),
            resolver,
            status: Mutex::new(ProviderStatus::Stopped),
        }
    }

    pub fn create_state_machine(
        &self,
        machine_name: &str,
        definition: &Value,
        workflow_type: WorkflowType,
    ) -> Result<String, EmulatorError> {
        let mut machines = self.machines.lock().expect("machines lock");
        if machines.contains_key(machine_name) {
            return Err(EmulatorError::Conflict(format!(
                "state machine already exists: {machine_name}"
            )));
        }
        let def = Arc::new(StateMachineDef::parse(definition)?);
        let arn = machine_arn(machine_name);
        machines.insert(
            machine_name.to_string(),
            Machine {
                arn: arn.clone(),
                workflow_type,
                def,
                definition_json: definition.clone(),
            },
        );
        Ok(arn)
    }

    /// Replace the definition of an existing machine.
    pub fn update_state_machine(
        &self,
        machine_name: &str,
        definition: &Value,
    ) -> Result<(), EmulatorError> {
        let mut machines = self.machines.lock().expect("machines lock");
        let machine = machines
            .get_mut(machine_name)
            .ok_or_else(|| not_found(machine_name))?;
        machine.def = Arc::new(StateMachineDef::parse(definition)?);
        machine.definition_json = definition.clone();
        Ok(())
    }

    pub fn describe_state_machine(
        &self,
        machine_name: &str,
    ) -> Result<(String, Value, WorkflowType), EmulatorError> {
        let machines = self.machines.lock().expect("machines lock");
        let machine = machines.get(machine_name).ok_or_else(|| not_found(machine_name))?;
        Ok((
            machine.arn.clone(),
            machine.definition_json.clone(),
            machine.workflow_type,
        ))
    }

    pub fn list_state_machines(&self) -> Vec<(String, String)> {
        let machines = self.machines.lock().expect("machines lock");
        let mut out: Vec<_> = machines
            .iter()
            .map(|(name, machine)| (name.clone(), machine.arn.clone()))
            .collect();
        out.sort();
        out
    }

    /// Start an execution. Standard: spawns the run and returns the
    /// execution identifier. Express: awaits completion and returns the
    /// identifier anyway; the caller reads the output from the record.
    pub async fn start_execution(
        &self,
        machine_name: &str,
        input: Value,
    ) -> Result<String, EmulatorError> {
        let (def, workflow_type) = {
            let machines = self.machines.lock().expect("machines lock");
            let machine = machines.get(machine_name).ok_or_else(|| not_found(machine_name))?;
            (machine.def.clone(), machine.workflow_type)
        };

        let execution = Execution::new(machine_name, input);
        let execution_id = execution.execution_id.clone();
        let record = Arc::new(Mutex::new(execution));
        let abort = CancellationToken::new();
        self.executions.insert(
            execution_id.clone(),
            ExecutionHandle {
                record: record.clone(),
                abort: abort.clone(),
            },
        );

        let interpreter = Interpreter::new(def, self.resolver.clone());
        match workflow_type {
            WorkflowType::Express => {
                interpreter.run(record, abort).await;
            }
            WorkflowType::Standard => {
                tokio::spawn(async move {
                    interpreter.run(record, abort).await;
                });
            }
        }
        Ok(execution_id)
    }

    pub fn describe_execution(&self, execution_id: &str) -> Result<Execution, EmulatorError> {
        let handle = self.executions.get(execution_id).ok_or_else(|| {
            EmulatorError::NotFound(format!("no such execution: {execution_id}"))
        })?;
        let guard = handle.record.lock().expect("execution lock");
        Ok(guard.clone())
    }

    pub fn execution_history(
        &self,
        execution_id: &str,
    ) -> Result<Vec<interpreter::HistoryEvent>, EmulatorError> {
        Ok(self.describe_execution(execution_id)?.history)
    }

    /// Abort a running execution.
    pub fn stop_execution(&self, execution_id: &str) -> Result<(), EmulatorError> {
        let handle = self.executions.get(execution_id).ok_or_else(|| {
            EmulatorError::NotFound(format!("no such execution: {execution_id}"))
        })?;
        handle.abort.cancel();
        Ok(())
    }

    pub fn list_executions(&self, machine_name: &str) -> Vec<(String, ExecutionStatus)> {
        let mut out: Vec<_> = self
            .executions
            .iter()
            .filter_map(|entry| {
                let guard = entry.value().record.lock().expect("execution lock");
                (guard.workflow_name == machine_name)
                    .then(|| (guard.execution_id.clone(), guard.status))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

fn machine_arn(machine_name: &str) -> String {
    format!("arn:aws:states:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:stateMachine:{machine_name}")
}

fn not_found(machine_name: &str) -> EmulatorError {
    EmulatorError::NotFound(format!("no such state machine: {machine_name}"))
}

#[async_trait]
impl Provider for WorkflowProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), EmulatorError> {
        *self.status.lock().expect("status lock") = ProviderStatus::Running;
        Ok(())
    }

    async fn stop(&self) -> Result<(), EmulatorError> {
        for entry in self.executions.iter() {
            entry.value().abort.cancel();
        }
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
        for entry in self.executions.iter() {
            entry.value().abort.cancel();
        }
        self.executions.clear();
        Ok(())
    }
}
