//! Invocation environment construction.
//!
//! Three layers merged in order, later wins: the emulator's own process
//! environment, the function's declared environment, and the injected
//! service-endpoint overrides. Fixed per-invocation keys are overlaid last.

use std::collections::HashMap;

use nimbus_core::FunctionContext;

use crate::strategy::FunctionSpec;

/// Build the full child environment for one invocation.
pub fn build_invocation_env(
    spec: &FunctionSpec,
    sdk_env: &HashMap<String, String>,
    context: &FunctionContext,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(spec.environment.clone());
    env.extend(sdk_env.clone());
    env.extend(context.env_overrides.clone());

    env.insert("NIMBUS_HANDLER".to_string(), spec.handler.clone());
    env.insert(
        "NIMBUS_CODE_PATH".to_string(),
        spec.code_path.to_string_lossy().into_owned(),
    );
    env.insert("NIMBUS_REQUEST_ID".to_string(), context.request_id.clone());
    env.insert("NIMBUS_FUNCTION_ARN".to_string(), context.function_arn.clone());
    env.insert(
        "NIMBUS_TIMEOUT".to_string(),
        context.timeout.as_secs().to_string(),
    );
    env.insert("AWS_LAMBDA_FUNCTION_NAME".to_string(), spec.name.clone());
    env.insert(
        "AWS_LAMBDA_FUNCTION_MEMORY_SIZE".to_string(),
        context.memory_limit_mb.to_string(),
    );
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec() -> FunctionSpec {
        let mut spec = FunctionSpec::new("resize", "python3.12");
        spec.handler = "app.main".to_string();
        spec.environment
            .insert("TABLE_NAME".to_string(), "orders".to_string());
        spec.environment
            .insert("SHARED".to_string(), "from-function".to_string());
        spec
    }

    #[test]
    fn later_layers_win() {
        let sdk_env = HashMap::from([
            ("SHARED".to_string(), "from-sdk".to_string()),
            ("QUEUE_ENDPOINT".to_string(), "http://localhost:4601".to_string()),
        ]);
        let ctx = FunctionContext::new("resize");
        let env = build_invocation_env(&spec(), &sdk_env, &ctx);

        assert_eq!(env["TABLE_NAME"], "orders");
        assert_eq!(env["SHARED"], "from-sdk");
        assert_eq!(env["QUEUE_ENDPOINT"], "http://localhost:4601");
    }

    #[test]
    fn fixed_keys_are_overlaid() {
        let ctx = FunctionContext::new("resize")
            .with_timeout(Duration::from_secs(12))
            .with_memory(256);
        let env = build_invocation_env(&spec(), &HashMap::new(), &ctx);

        assert_eq!(env["NIMBUS_HANDLER"], "app.main");
        assert_eq!(env["NIMBUS_TIMEOUT"], "12");
        assert_eq!(env["AWS_LAMBDA_FUNCTION_NAME"], "resize");
        assert_eq!(env["AWS_LAMBDA_FUNCTION_MEMORY_SIZE"], "256");
        assert_eq!(env["NIMBUS_REQUEST_ID"], ctx.request_id);
        assert!(env["NIMBUS_FUNCTION_ARN"].ends_with(":function:resize"));
    }

    #[test]
    fn process_environment_is_the_base_layer() {
        std::env::set_var("NIMBUS_TEST_BASE_VAR", "present");
        let env = build_invocation_env(&spec(), &HashMap::new(), &FunctionContext::new("f"));
        assert_eq!(env["NIMBUS_TEST_BASE_VAR"], "present");
        std::env::remove_var("NIMBUS_TEST_BASE_VAR");
    }
}
