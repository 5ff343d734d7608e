use async_trait::async_trait;
use forrst_core::ResponseObject;
use serde_json::json;
use tracing::debug;

use super::{Extension, FunctionExecuted};
use crate::service::error::DispatchError;

/// Flags calls that resolved to a deprecated function version.
///
/// Adds `meta.deprecated = { urn, version, message }` to the response; the
/// call itself proceeds normally.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeprecationExtension;

#[async_trait]
impl Extension for DeprecationExtension {
    fn name(&self) -> &'static str {
        "deprecation"
    }

    async fn on_function_executed(
        &self,
        event: &FunctionExecuted<'_>,
    ) -> Result<Option<ResponseObject>, DispatchError> {
        let Some(descriptor) = event.descriptor else {
            return Ok(None);
        };
        let Some(notice) = descriptor.deprecated.as_deref() else {
            return Ok(None);
        };
        debug!(
            urn = %descriptor.urn,
            version = %descriptor.version,
            caller = event.context.caller_id().unwrap_or("anonymous"),
            "deprecated function called"
        );
        let warning = json!({
            "urn": descriptor.urn,
            "version": descriptor.version.to_string(),
            "message": notice,
        });
        Ok(Some(
            event.response.clone().with_meta_entry("deprecated", warning),
        ))
    }
}

#[cfg(test)]
mod tests {
    use forrst_core::{validate, CallContext, RequestObject, ValidationRules};

    use super::*;
    use crate::service::function::FunctionDescriptor;

    async fn run(descriptor: Option<&FunctionDescriptor>) -> Option<ResponseObject> {
        let request = validate(
            RequestObject::new("r1", "app.report", json!({})),
            &ValidationRules::default(),
        )
        .unwrap();
        let ctx = CallContext::system("n1");
        let response = ResponseObject::success(Some("r1".into()), json!({"ok": true}));
        DeprecationExtension
            .on_function_executed(&FunctionExecuted {
                request: &request,
                context: &ctx,
                descriptor,
                response: &response,
                short_circuited: false,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn deprecated_version_gets_warning() {
        let descriptor = FunctionDescriptor::new("app.report", "1.2.0")
            .unwrap()
            .deprecated("use app.report@2");
        let response = run(Some(&descriptor)).await.unwrap();
        assert_eq!(
            response.meta().unwrap()["deprecated"],
            json!({"urn": "app.report", "version": "1.2.0", "message": "use app.report@2"})
        );
        assert_eq!(response.result(), Some(&json!({"ok": true})));
    }

    #[tokio::test]
    async fn current_version_is_untouched() {
        let descriptor = FunctionDescriptor::new("app.report", "2.0.0").unwrap();
        assert!(run(Some(&descriptor)).await.is_none());
        assert!(run(None).await.is_none());
    }
}
