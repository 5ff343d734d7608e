//! Built-in `forrst.*` functions and their registration.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use forrst_core::{ArgumentSchema, Arguments, CallContext, FieldKind};
use serde_json::{json, Value};

use super::error::DispatchError;
use super::function::{DescriptorError, Function, FunctionDescriptor, Implementation};
use super::operation::{
    CancellationRegistry, OperationCancelFunction, OperationListFunction, OperationRepository,
    OperationStatusFunction,
};
use super::registry::FunctionRegistry;

pub const PING_URN: &str = "forrst.ping";
pub const DESCRIBE_URN: &str = "forrst.describe";

// ---------------------------------------------------------------------------
// forrst.ping
// ---------------------------------------------------------------------------

/// Liveness probe through the full dispatch path.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingFunction;

impl PingFunction {
    /// # Errors
    ///
    /// Never fails for the built-in URN and version.
    pub fn descriptor() -> Result<FunctionDescriptor, DescriptorError> {
        Ok(FunctionDescriptor::new(PING_URN, "1.0.0")?
            .with_description("Answers with pong")
            .with_result(json!({ "pong": "boolean" })))
    }
}

#[async_trait]
impl Function for PingFunction {
    async fn call(&self, _arguments: Arguments, _ctx: &CallContext) -> Result<Value, DispatchError> {
        Ok(json!({ "pong": true }))
    }
}

// ---------------------------------------------------------------------------
// forrst.describe
// ---------------------------------------------------------------------------

/// Lists registered functions.
///
/// Holds the registry weakly since the registry owns this function.
pub struct DescribeFunction {
    registry: Weak<FunctionRegistry>,
}

impl DescribeFunction {
    #[must_use]
    pub fn new(registry: &Arc<FunctionRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }

    /// # Errors
    ///
    /// Never fails for the built-in URN and version.
    pub fn descriptor() -> Result<FunctionDescriptor, DescriptorError> {
        Ok(FunctionDescriptor::new(DESCRIBE_URN, "1.0.0")?
            .with_description("Lists registered functions, optionally for one URN")
            .with_arguments(ArgumentSchema::new().optional("urn", FieldKind::String)))
    }
}

#[async_trait]
impl Function for DescribeFunction {
    async fn call(&self, arguments: Arguments, _ctx: &CallContext) -> Result<Value, DispatchError> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| DispatchError::Unavailable("function registry is gone".into()))?;
        let only = arguments.get("urn").and_then(Value::as_str);

        let functions: Vec<Value> = registry
            .functions()
            .iter()
            .filter(|f| only.is_none_or(|urn| f.descriptor.urn == urn))
            .map(|f| {
                let d = &f.descriptor;
                json!({
                    "urn": d.urn,
                    "version": d.version.to_string(),
                    "mode": f.mode(),
                    "description": d.description,
                    "deprecated": d.deprecated,
                    "errors": d.errors,
                    "arguments": d.arguments.fields,
                })
            })
            .collect();
        Ok(json!({ "functions": functions }))
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Registers `forrst.ping`, `forrst.describe` and the `forrst.operation.*`
/// functions.
///
/// # Errors
///
/// Fails if any of the built-in URNs is already registered at v1.0.0.
pub fn register_system_functions(
    registry: &Arc<FunctionRegistry>,
    repository: Arc<dyn OperationRepository>,
    cancellations: Arc<CancellationRegistry>,
) -> anyhow::Result<()> {
    registry.register(PingFunction::descriptor()?, Implementation::sync(PingFunction))?;
    registry.register(
        DescribeFunction::descriptor()?,
        Implementation::sync(DescribeFunction::new(registry)),
    )?;
    registry.register(
        OperationStatusFunction::descriptor()?,
        Implementation::sync(OperationStatusFunction::new(Arc::clone(&repository))),
    )?;
    registry.register(
        OperationListFunction::descriptor()?,
        Implementation::sync(OperationListFunction::new(Arc::clone(&repository))),
    )?;
    registry.register(
        OperationCancelFunction::descriptor()?,
        Implementation::sync(OperationCancelFunction::new(repository, cancellations)),
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use forrst_core::VersionConstraint;

    use super::*;
    use crate::service::operation::InMemoryOperationRepository;

    fn make_registry() -> Arc<FunctionRegistry> {
        let registry = Arc::new(FunctionRegistry::new());
        register_system_functions(
            &registry,
            Arc::new(InMemoryOperationRepository::new()),
            Arc::new(CancellationRegistry::new()),
        )
        .unwrap();
        registry
    }

    #[test]
    fn registers_all_builtins_once() {
        let registry = make_registry();
        assert_eq!(registry.len(), 5);
        assert!(registry
            .resolve("forrst.operation.cancel", &VersionConstraint::Latest)
            .is_ok());

        let again = register_system_functions(
            &registry,
            Arc::new(InMemoryOperationRepository::new()),
            Arc::new(CancellationRegistry::new()),
        );
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let out = PingFunction
            .call(Arguments::new(), &CallContext::system("n1"))
            .await
            .unwrap();
        assert_eq!(out, json!({"pong": true}));
    }

    #[tokio::test]
    async fn describe_lists_sorted_and_filters() {
        let registry = make_registry();
        let describe = DescribeFunction::new(&registry);

        let all = describe
            .call(Arguments::new(), &CallContext::system("n1"))
            .await
            .unwrap();
        let urns: Vec<&str> = all["functions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["urn"].as_str().unwrap())
            .collect();
        assert_eq!(
            urns,
            [
                "forrst.describe",
                "forrst.operation.cancel",
                "forrst.operation.list",
                "forrst.operation.status",
                "forrst.ping",
            ]
        );

        let mut only = Arguments::new();
        only.insert("urn".into(), json!("forrst.ping"));
        let one = describe.call(only, &CallContext::system("n1")).await.unwrap();
        assert_eq!(one["functions"][0]["mode"], "sync");
        assert_eq!(one["functions"][0]["version"], "1.0.0");
        assert_eq!(one["functions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn describe_after_registry_dropped_is_unavailable() {
        let registry = Arc::new(FunctionRegistry::new());
        let describe = DescribeFunction::new(&registry);
        drop(registry);
        let err = describe
            .call(Arguments::new(), &CallContext::system("n1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unavailable(_)));
    }
}
