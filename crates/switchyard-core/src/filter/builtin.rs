use super::{Filter, Next};
use crate::{
    config::ConsumerConfig,
    errors::RpcError,
    types::{RpcRequest, RpcResponse},
};
use async_trait::async_trait;
use std::time::Instant;
use tracing::debug;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Stamps a unique request id header unless the caller already set one.
pub struct RequestIdFilter;

impl RequestIdFilter {
    pub const ALIAS: &'static str = "request_id";
}

#[async_trait]
impl Filter for RequestIdFilter {
    fn alias(&self) -> &'static str {
        Self::ALIAS
    }

    fn order(&self) -> i32 {
        -10_000
    }

    async fn invoke(
        &self,
        request: &mut RpcRequest,
        next: Next<'_>,
    ) -> Result<RpcResponse, RpcError> {
        if !request.headers.contains_key(REQUEST_ID_HEADER) {
            request.headers.insert(REQUEST_ID_HEADER.to_string(), uuid::Uuid::new_v4().to_string());
        }
        next.invoke(request).await
    }
}

/// Best-effort debug log of every call and every async completion.
pub struct AccessLogFilter;

impl AccessLogFilter {
    pub const ALIAS: &'static str = "access_log";
}

#[async_trait]
impl Filter for AccessLogFilter {
    fn alias(&self) -> &'static str {
        Self::ALIAS
    }

    fn order(&self) -> i32 {
        10_000
    }

    async fn invoke(
        &self,
        request: &mut RpcRequest,
        next: Next<'_>,
    ) -> Result<RpcResponse, RpcError> {
        let started = Instant::now();
        let result = next.invoke(request).await;
        let elapsed_ms = started.elapsed().as_millis();
        match &result {
            Ok(response) if response.is_placeholder() => debug!(
                service = %request.service,
                method = %request.method,
                invoke_type = request.invoke_type.as_str(),
                "call dispatched"
            ),
            Ok(_) => debug!(
                service = %request.service,
                method = %request.method,
                elapsed_ms,
                route = ?request.route_record,
                "call succeeded"
            ),
            Err(e) => debug!(
                service = %request.service,
                method = %request.method,
                elapsed_ms,
                error = %e,
                "call failed"
            ),
        }
        result
    }

    fn on_async_response(
        &self,
        consumer: &ConsumerConfig,
        request: &RpcRequest,
        _response: Option<&RpcResponse>,
        error: Option<&RpcError>,
    ) -> Result<(), RpcError> {
        match error {
            None => debug!(
                consumer = consumer.consumer_id(),
                method = %request.method,
                request_id = request.request_id,
                "async call completed"
            ),
            Some(e) => debug!(
                consumer = consumer.consumer_id(),
                method = %request.method,
                request_id = request.request_id,
                error = %e,
                "async call failed"
            ),
        }
        Ok(())
    }
}
