//! Header-keyed handler table.
//!
//! Exact registrations are stored by header and win over any partial one.
//! Among partial registrations the most specific match wins; ties go to the
//! earliest registration.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use stellwerk_core::{
    MatchSpecificity, MessageFilter, MessageStatus, ServiceIdentity, ServiceMessage,
    ServiceMessageHeader, TransmissionPayload,
};

use crate::error::CommandError;

/// Responses emitted by a handler.
pub type HandlerResult = Result<Vec<TransmissionPayload>, CommandError>;

pub type HandlerFn = Arc<dyn Fn(RequestContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub type ExceptionHandlerFn =
    Arc<dyn Fn(CommandError, RequestContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// What a handler receives: the inbound payload and the identity to answer as.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub payload: TransmissionPayload,
    pub identity: ServiceIdentity,
}

impl RequestContext {
    pub fn message(&self) -> &ServiceMessage {
        &self.payload.message
    }

    pub fn decode<T: for<'de> serde::Deserialize<'de>>(&self) -> Result<T, CommandError> {
        Ok(self.payload.message.decode()?)
    }

    /// Reply envelope addressed back to the requester.
    pub fn response(&self, status: MessageStatus) -> ServiceMessage {
        self.payload.message.to_response(&self.identity, status)
    }

    /// Reply payload carrying `body`, or `None` when the request did not ask
    /// for a reply.
    pub fn reply<T: Serialize>(&self, body: &T) -> Result<Option<TransmissionPayload>, CommandError> {
        if self.payload.message.response_header.is_none() {
            return Ok(None);
        }
        let message = self.response(MessageStatus::Ok).with_body(body)?;
        Ok(Some(TransmissionPayload::new(message)))
    }
}

/// A registered handler.
pub struct Handler {
    filter: MessageFilter,
    body: HandlerFn,
    exception: Option<ExceptionHandlerFn>,
    invocations: AtomicU64,
    failures: AtomicU64,
}

impl Handler {
    pub fn new<F, Fut>(filter: MessageFilter, body: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            filter,
            body: Arc::new(move |ctx: RequestContext| body(ctx).boxed()),
            exception: None,
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Route handler failures to `handler` instead of returning them.
    /// Failures of the exception handler itself are returned.
    pub fn with_exception_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CommandError, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.exception = Some(Arc::new(move |err: CommandError, ctx: RequestContext| handler(err, ctx).boxed()));
        self
    }

    pub fn filter(&self) -> &MessageFilter {
        &self.filter
    }

    pub async fn execute(&self, ctx: RequestContext) -> HandlerResult {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let retained = self.exception.as_ref().map(|_| ctx.clone());
        match (self.body)(ctx).await {
            Ok(responses) => Ok(responses),
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                match (&self.exception, retained) {
                    (Some(on_error), Some(ctx)) => on_error(err, ctx).await,
                    _ => Err(err),
                }
            }
        }
    }

    pub fn statistics(&self) -> HandlerStatistics {
        HandlerStatistics {
            filter: self.filter.to_string(),
            invocations: self.invocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("filter", &self.filter)
            .field("has_exception_handler", &self.exception.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerStatistics {
    pub filter: String,
    pub invocations: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
pub struct DispatchTable {
    exact: HashMap<ServiceMessageHeader, Arc<Handler>>,
    partial: Vec<Arc<Handler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handler. Registering the same filter again replaces the
    /// previous handler in place.
    pub fn insert(&mut self, handler: Handler) {
        let handler = Arc::new(handler);
        if let Some(header) = handler.filter.exact_header() {
            self.exact.insert(header, handler);
            return;
        }
        match self.partial.iter_mut().find(|h| h.filter == handler.filter) {
            Some(existing) => *existing = handler,
            None => self.partial.push(handler),
        }
    }

    pub fn remove(&mut self, filter: &MessageFilter) -> bool {
        if let Some(header) = filter.exact_header() {
            return self.exact.remove(&header).is_some();
        }
        let before = self.partial.len();
        self.partial.retain(|h| h.filter != *filter);
        self.partial.len() != before
    }

    pub fn resolve(&self, header: &ServiceMessageHeader) -> Option<Arc<Handler>> {
        if let Some(handler) = self.exact.get(header) {
            return Some(Arc::clone(handler));
        }
        let mut best: Option<(MatchSpecificity, &Arc<Handler>)> = None;
        for handler in &self.partial {
            let Some(specificity) = handler.filter.matches(header) else {
                continue;
            };
            if best.map_or(true, |(b, _)| specificity > b) {
                best = Some((specificity, handler));
            }
        }
        best.map(|(_, h)| Arc::clone(h))
    }

    /// Whether some handler would resolve for `header`.
    pub fn supports(&self, header: &ServiceMessageHeader) -> bool {
        self.exact.contains_key(header)
            || self.partial.iter().any(|h| h.filter.matches(header).is_some())
    }

    pub fn filters(&self) -> Vec<MessageFilter> {
        self.exact
            .values()
            .chain(self.partial.iter())
            .map(|h| h.filter.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.partial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> Vec<HandlerStatistics> {
        self.exact
            .values()
            .chain(self.partial.iter())
            .map(|h| h.statistics())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(filter: MessageFilter, tag: &'static str) -> Handler {
        Handler::new(filter, move |ctx: RequestContext| async move {
            let mut message = ctx.response(MessageStatus::Ok);
            message.status_description = Some(tag.to_string());
            Ok(vec![TransmissionPayload::new(message)])
        })
    }

    fn ctx(header: ServiceMessageHeader) -> RequestContext {
        let identity = ServiceIdentity::new("test", "test-1");
        RequestContext {
            payload: TransmissionPayload::new(ServiceMessage::empty(header, &identity)),
            identity,
        }
    }

    async fn tag_of(table: &DispatchTable, header: ServiceMessageHeader) -> Option<String> {
        let handler = table.resolve(&header)?;
        let out = handler.execute(ctx(header)).await.unwrap();
        out[0].message.status_description.clone()
    }

    #[tokio::test]
    async fn exact_beats_partial_and_partial_catches_the_rest() {
        let mut table = DispatchTable::new();
        table.insert(tagged(MessageFilter::new("chA", Some("T1"), None).unwrap(), "partial"));
        table.insert(tagged(MessageFilter::new("chA", Some("T1"), Some("Act2")).unwrap(), "exact"));

        assert_eq!(
            tag_of(&table, ServiceMessageHeader::action("chA", "T1", "Act2")).await.as_deref(),
            Some("exact")
        );
        assert_eq!(
            tag_of(&table, ServiceMessageHeader::action("chA", "T1", "Act3")).await.as_deref(),
            Some("partial")
        );
        assert!(table.resolve(&ServiceMessageHeader::new("chA", "T2", None)).is_none());
    }

    #[test]
    fn supports_agrees_with_resolve() {
        let mut table = DispatchTable::new();
        table.insert(tagged(MessageFilter::new("chA", Some("T1"), Some("Act2")).unwrap(), "exact"));
        table.insert(tagged(MessageFilter::new("chB", Some("T1"), None).unwrap(), "partial"));

        for header in [
            ServiceMessageHeader::action("chA", "T1", "Act2"),
            ServiceMessageHeader::action("CHA", "t1", "ACT2"),
            ServiceMessageHeader::action("chA", "T1", "Act3"),
            ServiceMessageHeader::new("chA", "T1", None),
            ServiceMessageHeader::action("chB", "T1", "any"),
            ServiceMessageHeader::new("chB", "T2", None),
        ] {
            assert_eq!(table.supports(&header), table.resolve(&header).is_some(), "{header}");
        }
        assert!(table.supports(&ServiceMessageHeader::action("cha", "t1", "act2")));
        assert!(!table.supports(&ServiceMessageHeader::action("chA", "T1", "Act3")));
    }

    #[tokio::test]
    async fn more_specific_partial_wins_regardless_of_order() {
        let mut table = DispatchTable::new();
        table.insert(tagged(MessageFilter::channel("chA").unwrap(), "channel"));
        table.insert(tagged(MessageFilter::new("chA", Some("T1"), None).unwrap(), "type"));

        assert_eq!(
            tag_of(&table, ServiceMessageHeader::action("chA", "T1", "x")).await.as_deref(),
            Some("type")
        );
        assert_eq!(
            tag_of(&table, ServiceMessageHeader::action("chA", "T9", "x")).await.as_deref(),
            Some("channel")
        );
        assert!(table.resolve(&ServiceMessageHeader::new("chA1", "T1", None)).is_none());
    }

    #[tokio::test]
    async fn re_registration_overwrites() {
        let mut table = DispatchTable::new();
        let filter = MessageFilter::new("orders", Some("create"), Some("now")).unwrap();
        table.insert(tagged(filter.clone(), "old"));
        table.insert(tagged(filter.clone(), "new"));
        assert_eq!(table.len(), 1);
        assert_eq!(
            tag_of(&table, ServiceMessageHeader::action("orders", "create", "now")).await.as_deref(),
            Some("new")
        );
        assert!(table.remove(&filter));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn exception_handler_receives_failure() {
        let handler = Handler::new(MessageFilter::channel("c").unwrap(), |_| async {
            Err(CommandError::handler("boom"))
        })
        .with_exception_handler(|err, ctx: RequestContext| async move {
            let mut message = ctx.response(MessageStatus::Error);
            message.status_description = Some(err.to_string());
            Ok(vec![TransmissionPayload::new(message)])
        });

        let out = handler.execute(ctx(ServiceMessageHeader::new("c", "t", None))).await.unwrap();
        assert_eq!(out[0].message.status, Some(MessageStatus::Error));
        assert!(out[0].message.status_description.as_deref().unwrap().contains("boom"));
        assert_eq!(handler.statistics().failures, 1);
    }

    #[tokio::test]
    async fn exception_handler_failure_propagates() {
        let handler = Handler::new(MessageFilter::channel("c").unwrap(), |_| async {
            Err(CommandError::handler("first"))
        })
        .with_exception_handler(|_, _| async { Err(CommandError::handler("second")) });

        let err = handler
            .execute(ctx(ServiceMessageHeader::new("c", "t", None)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("second"));
    }

    #[tokio::test]
    async fn failure_without_exception_handler_propagates() {
        let handler = Handler::new(MessageFilter::channel("c").unwrap(), |_| async {
            Err(CommandError::handler("plain"))
        });
        assert!(handler
            .execute(ctx(ServiceMessageHeader::new("c", "t", None)))
            .await
            .is_err());
    }
}
