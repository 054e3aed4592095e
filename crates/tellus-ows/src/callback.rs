//! Dispatcher extension hooks.
//!
//! Callbacks observe or replace in-flight values at each pipeline stage.
//! They run in registration order and each hook's return value becomes the
//! input of the next. The `finished` notification always runs, whatever the
//! outcome of the exchange.

use std::sync::Arc;

use tracing::{debug, info};

use crate::OwsResult;
use crate::operation::Operation;
use crate::request::RequestContext;
use crate::response::{BoxedResult, OperationResult, ResponseEncoder};
use crate::service::ServiceDescriptor;

pub trait DispatcherCallback: Send + Sync {
    /// The request context has been created and classified.
    fn initialized(&self, ctx: &mut RequestContext) {
        let _ = ctx;
    }

    /// A service descriptor has been resolved.
    fn service_dispatched(
        &self,
        ctx: &RequestContext,
        descriptor: Arc<ServiceDescriptor>,
    ) -> OwsResult<Arc<ServiceDescriptor>> {
        let _ = ctx;
        Ok(descriptor)
    }

    /// An operation has been resolved and its parameters bound.
    fn operation_dispatched(
        &self,
        ctx: &RequestContext,
        operation: Operation,
    ) -> OwsResult<Operation> {
        let _ = ctx;
        Ok(operation)
    }

    /// The operation has executed.
    fn operation_executed(
        &self,
        ctx: &RequestContext,
        operation: &Operation,
        result: Option<BoxedResult>,
    ) -> OwsResult<Option<BoxedResult>> {
        let _ = (ctx, operation);
        Ok(result)
    }

    /// A response encoder has been selected.
    fn response_dispatched(
        &self,
        ctx: &RequestContext,
        operation: &Operation,
        result: &dyn OperationResult,
        encoder: Arc<dyn ResponseEncoder>,
    ) -> OwsResult<Arc<dyn ResponseEncoder>> {
        let _ = (ctx, operation, result);
        Ok(encoder)
    }

    /// The exchange is over, successfully or not.
    fn finished(&self, ctx: &RequestContext) {
        let _ = ctx;
    }
}

/// Ordered chain of registered callbacks.
#[derive(Clone, Default)]
pub struct CallbackChain {
    callbacks: Vec<Arc<dyn DispatcherCallback>>,
}

impl CallbackChain {
    pub fn new(callbacks: Vec<Arc<dyn DispatcherCallback>>) -> Self {
        Self { callbacks }
    }

    pub fn initialized(&self, ctx: &mut RequestContext) {
        for callback in &self.callbacks {
            callback.initialized(ctx);
        }
    }

    pub fn service_dispatched(
        &self,
        ctx: &RequestContext,
        mut descriptor: Arc<ServiceDescriptor>,
    ) -> OwsResult<Arc<ServiceDescriptor>> {
        for callback in &self.callbacks {
            descriptor = callback.service_dispatched(ctx, descriptor)?;
        }
        Ok(descriptor)
    }

    pub fn operation_dispatched(
        &self,
        ctx: &RequestContext,
        mut operation: Operation,
    ) -> OwsResult<Operation> {
        for callback in &self.callbacks {
            operation = callback.operation_dispatched(ctx, operation)?;
        }
        Ok(operation)
    }

    pub fn operation_executed(
        &self,
        ctx: &RequestContext,
        operation: &Operation,
        mut result: Option<BoxedResult>,
    ) -> OwsResult<Option<BoxedResult>> {
        for callback in &self.callbacks {
            result = callback.operation_executed(ctx, operation, result)?;
        }
        Ok(result)
    }

    pub fn response_dispatched(
        &self,
        ctx: &RequestContext,
        operation: &Operation,
        result: &dyn OperationResult,
        mut encoder: Arc<dyn ResponseEncoder>,
    ) -> OwsResult<Arc<dyn ResponseEncoder>> {
        for callback in &self.callbacks {
            encoder = callback.response_dispatched(ctx, operation, result, encoder)?;
        }
        Ok(encoder)
    }

    pub fn finished(&self, ctx: &RequestContext) {
        for callback in &self.callbacks {
            callback.finished(ctx);
        }
    }
}

/// Stock callback logging the lifecycle of every exchange.
pub struct RequestLoggingCallback;

impl DispatcherCallback for RequestLoggingCallback {
    fn initialized(&self, ctx: &mut RequestContext) {
        debug!(method = %ctx.method, path = %ctx.path, "request received");
    }

    fn operation_dispatched(
        &self,
        ctx: &RequestContext,
        operation: Operation,
    ) -> OwsResult<Operation> {
        info!(
            service = %operation.descriptor.id,
            version = %operation.descriptor.version,
            operation = %operation.name,
            soap = ctx.is_soap,
            "dispatching"
        );
        Ok(operation)
    }

    fn finished(&self, ctx: &RequestContext) {
        debug!(path = %ctx.path, "request finished");
    }
}
