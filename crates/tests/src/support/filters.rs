use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use switchyard_core::{
    config::ConsumerConfig,
    errors::RpcError,
    filter::{Filter, Next},
    types::{RpcRequest, RpcResponse},
};

/// Ordered record of what filters saw.
#[derive(Default)]
pub struct CallJournal {
    entries: Mutex<Vec<String>>,
}

impl CallJournal {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

/// Adds a header on the way in.
pub struct HeaderStamp {
    pub alias: &'static str,
    pub order: i32,
    pub name: &'static str,
    pub value: &'static str,
    pub journal: Arc<CallJournal>,
}

#[async_trait]
impl Filter for HeaderStamp {
    fn alias(&self) -> &'static str {
        self.alias
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn invoke(&self, request: &mut RpcRequest, next: Next<'_>) -> Result<RpcResponse, RpcError> {
        self.journal.push(format!("{}:in", self.alias));
        request.headers.insert(self.name.to_string(), self.value.to_string());
        let result = next.invoke(request).await;
        self.journal.push(format!("{}:out", self.alias));
        result
    }
}

/// Journals the headers it sees, the route taken and async completions.
pub struct JournalFilter {
    pub alias: &'static str,
    pub order: i32,
    pub watch_header: &'static str,
    pub journal: Arc<CallJournal>,
}

#[async_trait]
impl Filter for JournalFilter {
    fn alias(&self) -> &'static str {
        self.alias
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn invoke(&self, request: &mut RpcRequest, next: Next<'_>) -> Result<RpcResponse, RpcError> {
        let seen = request.header(self.watch_header).unwrap_or("-").to_string();
        self.journal.push(format!("{}:in:{}={seen}", self.alias, self.watch_header));
        let result = next.invoke(request).await;
        self.journal.push(format!("{}:route:{}", self.alias, request.route_record.join(">")));
        self.journal.push(format!("{}:out", self.alias));
        result
    }

    fn on_async_response(
        &self,
        _consumer: &ConsumerConfig,
        request: &RpcRequest,
        response: Option<&RpcResponse>,
        error: Option<&RpcError>,
    ) -> Result<(), RpcError> {
        let outcome = match (response, error) {
            (Some(_), _) => "ok".to_string(),
            (None, Some(e)) => e.as_str().to_string(),
            (None, None) => "none".to_string(),
        };
        self.journal.push(format!("{}:async:{}:{outcome}", self.alias, request.method));
        Ok(())
    }
}

/// Rejects every call before it reaches inner layers.
pub struct RejectingFilter {
    pub alias: &'static str,
    pub order: i32,
    pub journal: Arc<CallJournal>,
}

#[async_trait]
impl Filter for RejectingFilter {
    fn alias(&self) -> &'static str {
        self.alias
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn invoke(&self, request: &mut RpcRequest, _next: Next<'_>) -> Result<RpcResponse, RpcError> {
        self.journal.push(format!("{}:reject", self.alias));
        Err(RpcError::FilterRejected {
            filter: self.alias.to_string(),
            reason: format!("{} not authorized", request.method),
        })
    }
}
