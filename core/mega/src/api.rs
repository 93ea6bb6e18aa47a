//! Command framing on top of an [`ApiTransport`].
//!
//! Each request carries a batch of commands and an increasing sequence id.
//! The server answers either with a bare negative code (request-level
//! failure) or with an array holding one result per command, where a
//! negative number is that command's error code.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use stowage_common::cancel::run_cancellable;
use stowage_common::{CancellationToken, Error, Result, RetryConfig, RetryExecutor};

use crate::error::error_from_code;
use crate::transport::ApiTransport;

/// Sends single commands with retry on rate limiting.
pub struct ApiClient {
    transport: Arc<dyn ApiTransport>,
    seq: AtomicU64,
    retry: RetryConfig,
}

impl ApiClient {
    /// Create a client over `transport`.
    pub fn new(transport: Arc<dyn ApiTransport>, retry: RetryConfig) -> Self {
        Self {
            transport,
            seq: AtomicU64::new(u64::from(rand::random::<u32>())),
            retry,
        }
    }

    /// Underlying transport, for transfer URLs.
    pub fn transport(&self) -> &Arc<dyn ApiTransport> {
        &self.transport
    }

    /// Retry schedule for requests.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Send one command and return its result.
    ///
    /// `EAGAIN`, rate limiting and transport failures are retried within the
    /// configured budget.
    pub async fn call(
        &self,
        sid: Option<&str>,
        command: Value,
        token: &CancellationToken,
    ) -> Result<Value> {
        let name = command
            .get("a")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        let name = name.as_str();
        let executor = RetryExecutor::new(self.retry.clone());

        executor
            .execute(token, || {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                let body = Value::Array(vec![command.clone()]);
                async move {
                    let response =
                        run_cancellable(token, self.transport.post_commands(seq, sid, body))
                            .await?;
                    unpack_response(response, name)
                }
            })
            .await
    }
}

fn negative_code(value: &Value) -> Option<i64> {
    value.as_i64().filter(|code| *code < 0)
}

/// Extract the single command result from a response.
pub(crate) fn unpack_response(response: Value, command: &str) -> Result<Value> {
    if let Some(code) = negative_code(&response) {
        return Err(error_from_code(code, command));
    }
    match response {
        Value::Array(mut items) if !items.is_empty() => {
            let result = items.swap_remove(0);
            match negative_code(&result) {
                Some(code) => Err(error_from_code(code, command)),
                None => Ok(result),
            }
        }
        other => Err(Error::Network(format!(
            "Unexpected response to '{}': {}",
            command, other
        ))),
    }
}
