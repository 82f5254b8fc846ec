use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use fleece_proto::Response;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Typed failure raised by a handler. It is sent back to the caller as a
/// response with `status` and `detail` instead of breaking the channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("handler fault {status}: {detail}")]
pub struct HandlerFault {
    pub status: u16,
    pub detail: String,
}

impl HandlerFault {
    pub fn new(status: u16, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(Response::NOT_FOUND, detail)
    }

    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self::new(Response::UNPROCESSABLE, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(Response::INTERNAL, detail)
    }

    pub fn into_response(self) -> Response {
        Response::new(self.status, self.detail)
    }
}

pub type HandlerResult = Result<Response, HandlerFault>;

type SyncFn = dyn Fn(Bytes) -> HandlerResult + Send + Sync;
type AsyncFn = dyn Fn(Bytes) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// A registered operation. The variant is fixed at registration time so
/// dispatch never has to inspect the callable.
#[derive(Clone)]
pub enum Handler {
    /// Blocking function; run on the blocking pool.
    Sync(Arc<SyncFn>),
    /// Future-returning function; awaited on the runtime.
    Async(Arc<AsyncFn>),
}

impl Handler {
    pub async fn invoke(&self, payload: Bytes) -> HandlerResult {
        match self {
            Handler::Async(callback) => callback(payload).await,
            Handler::Sync(callback) => {
                let callback = Arc::clone(callback);
                tokio::task::spawn_blocking(move || callback(payload))
                    .await
                    .unwrap_or_else(|err| {
                        Err(HandlerFault::internal(format!("handler panicked: {err}")))
                    })
            }
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Handler::Async(_))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Handler::Sync"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// Operation name → handler table shared by every inward channel of a peer.
#[derive(Clone, Default, Debug)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn lookup(&self, op: &str) -> Option<&Handler> {
        self.handlers.get(op)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistryBuilder {
    /// Registers a blocking handler over the raw payload.
    pub fn sync_handler<F, R>(mut self, op: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Bytes) -> Result<R, HandlerFault> + Send + Sync + 'static,
        R: Into<Response>,
    {
        let handler = Handler::Sync(Arc::new(move |payload: Bytes| -> HandlerResult {
            callback(payload).map(Into::into)
        }));
        self.handlers.insert(op.into(), handler);
        self
    }

    /// Registers an async handler over the raw payload.
    pub fn async_handler<F, Fut, R>(mut self, op: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerFault>> + Send + 'static,
        R: Into<Response>,
    {
        let callback = Arc::new(callback);
        let handler = Handler::Async(Arc::new(move |payload: Bytes| -> BoxFuture<'static, HandlerResult> {
            let fut = callback(payload);
            Box::pin(async move { fut.await.map(Into::into) })
        }));
        self.handlers.insert(op.into(), handler);
        self
    }

    /// Async handler whose argument is decoded from a JSON payload. A payload
    /// that does not decode is answered with a 422 fault.
    pub fn json_handler<T, F, Fut, R>(self, op: impl Into<String>, callback: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerFault>> + Send + 'static,
        R: Into<Response> + Send + 'static,
    {
        let callback = Arc::new(callback);
        self.async_handler(op, move |payload: Bytes| {
            let callback = Arc::clone(&callback);
            async move {
                let arg = decode_json::<T>(&payload)?;
                callback(arg).await
            }
        })
    }

    /// Blocking counterpart of [`Self::json_handler`].
    pub fn json_sync_handler<T, F, R>(self, op: impl Into<String>, callback: F) -> Self
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> Result<R, HandlerFault> + Send + Sync + 'static,
        R: Into<Response>,
    {
        self.sync_handler(op, move |payload: Bytes| callback(decode_json::<T>(&payload)?))
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, HandlerFault> {
    serde_json::from_slice(payload)
        .map_err(|err| HandlerFault::unprocessable(format!("invalid payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::builder()
            .sync_handler("echo", |payload: Bytes| Ok::<_, HandlerFault>(payload))
            .async_handler("teapot", |_payload: Bytes| async {
                Err::<(), _>(HandlerFault::new(418, "short and stout"))
            })
            .json_handler("add", |args: Add| async move {
                Ok::<_, HandlerFault>((args.a + args.b).to_string())
            })
            .build()
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn dispatches_by_variant() {
        let registry = registry();
        assert_eq!(registry.len(), 3);

        let echo = registry.lookup("echo").expect("echo");
        assert!(!echo.is_async());
        let reply = echo.invoke(Bytes::from_static(b"hi")).await.expect("echo ok");
        assert_eq!(reply.text(), Some("hi"));

        let fault = registry
            .lookup("teapot")
            .expect("teapot")
            .invoke(Bytes::new())
            .await
            .expect_err("teapot faults");
        assert_eq!(fault.into_response(), Response::new(418, "short and stout"));

        assert!(registry.lookup("missing").is_none());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn json_arguments_are_decoded() {
        let registry = registry();
        let add = registry.lookup("add").expect("add");
        let reply = add
            .invoke(Bytes::from_static(br#"{"a":2,"b":40}"#))
            .await
            .expect("add ok");
        assert_eq!(reply.text(), Some("42"));

        let fault = add
            .invoke(Bytes::from_static(b"not json"))
            .await
            .expect_err("bad payload");
        assert_eq!(fault.status, Response::UNPROCESSABLE);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn panicking_sync_handler_becomes_fault() {
        let registry = HandlerRegistry::builder()
            .sync_handler("boom", |_payload: Bytes| -> Result<(), HandlerFault> {
                panic!("boom")
            })
            .build();
        let fault = registry
            .lookup("boom")
            .expect("boom")
            .invoke(Bytes::new())
            .await
            .expect_err("panic is reported");
        assert_eq!(fault.status, Response::INTERNAL);
    }
}
