use futures_util::future::BoxFuture;
use runtime::context::RequestContext;

/// Request context for the native runtime: a fresh id per execution, and
/// deferred work spawned onto the executor so the response never waits on
/// it.
pub struct NativeRequestContext {
    id: String,
}

impl NativeRequestContext {
    pub fn new() -> Self {
        NativeRequestContext {
            id: ulid::Ulid::new().to_string(),
        }
    }
}

impl Default for NativeRequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RequestContext for NativeRequestContext {
    fn request_id(&self) -> &str {
        &self.id
    }

    async fn wait_until(&self, fut: BoxFuture<'static, ()>) {
        tokio::spawn(fut);
    }
}
