use async_trait::async_trait;
use chrono::Utc;
use forrst_core::ResponseObject;
use serde_json::json;
use tracing::info;

use super::{Extension, FunctionExecuted};
use crate::service::error::DispatchError;

/// Attaches `meta.duration_ms` to every response and logs one line per call.
///
/// Duration is measured from [`CallContext::received_at`], so the extension
/// keeps no per-request state.
///
/// [`CallContext::received_at`]: forrst_core::CallContext::received_at
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingExtension;

#[async_trait]
impl Extension for TimingExtension {
    fn name(&self) -> &'static str {
        "timing"
    }

    async fn on_function_executed(
        &self,
        event: &FunctionExecuted<'_>,
    ) -> Result<Option<ResponseObject>, DispatchError> {
        let elapsed = Utc::now() - event.context.received_at;
        let duration_ms = elapsed.num_milliseconds().max(0);
        let outcome = if event.response.is_success() {
            "ok"
        } else {
            "error"
        };
        info!(
            request_id = event.request.id(),
            function = event.request.function(),
            trace_id = %event.context.trace_id,
            duration_ms,
            outcome,
            short_circuited = event.short_circuited,
            "call finished"
        );
        Ok(Some(
            event
                .response
                .clone()
                .with_meta_entry("duration_ms", json!(duration_ms)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use forrst_core::{validate, CallContext, RequestObject, ValidationRules};

    use super::*;

    #[tokio::test]
    async fn attaches_duration_meta() {
        let request = validate(
            RequestObject::new("r1", "app.echo", json!({})),
            &ValidationRules::default(),
        )
        .unwrap();
        let mut ctx = CallContext::system("n1");
        ctx.received_at -= chrono::Duration::milliseconds(25);
        let response = ResponseObject::success(Some("r1".into()), json!(null));

        let replaced = TimingExtension
            .on_function_executed(&FunctionExecuted {
                request: &request,
                context: &ctx,
                descriptor: None,
                response: &response,
                short_circuited: false,
            })
            .await
            .unwrap()
            .unwrap();
        let duration = replaced.meta().unwrap()["duration_ms"].as_i64().unwrap();
        assert!(duration >= 25);
        assert_eq!(replaced.result(), Some(&json!(null)));
    }
}
