// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration with the `lambda_runtime` crate.

use std::fmt;
use std::sync::Arc;

use lambda_runtime::{Context, LambdaEvent, service_fn};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::{DeadlineSource, PlatformContext};
use crate::wrapper::{Handler, SafeWrapper};

impl DeadlineSource for Context {
    fn remaining_millis(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        i64::try_from(self.deadline).unwrap_or(i64::MAX) - now
    }
}

impl PlatformContext for Context {
    fn invocation_id(&self) -> &str {
        &self.request_id
    }

    fn function_name(&self) -> &str {
        &self.env_config.function_name
    }
}

/// Serve a wrapped handler with the Lambda runtime loop.
///
/// Handler faults are reported by the wrapper and then returned to the
/// runtime as invocation errors.
pub async fn run<H, E>(wrapper: SafeWrapper<H>) -> Result<(), lambda_runtime::Error>
where
    H: Handler<E, Context> + 'static,
    H::Output: Serialize,
    H::Error: fmt::Display + fmt::Debug + Send + Sync + 'static,
    E: DeserializeOwned + Send + 'static,
{
    let wrapper = Arc::new(wrapper);
    lambda_runtime::run(service_fn(move |event: LambdaEvent<E>| {
        let wrapper = wrapper.clone();
        async move {
            wrapper
                .run(event.payload, event.context)
                .await
                .map_err(lambda_runtime::Error::from)
        }
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_identity_and_deadline() {
        let mut ctx = Context::default();
        ctx.request_id = "req-7".to_string();
        ctx.deadline = u64::try_from(chrono::Utc::now().timestamp_millis() + 30_000).unwrap();

        assert_eq!(ctx.invocation_id(), "req-7");
        let remaining = ctx.remaining_millis();
        assert!(remaining > 29_000 && remaining <= 30_000);
    }
}
