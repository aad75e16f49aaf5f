//! Asynchronous reverse-DNS lookups.
//!
//! # Responsibilities
//! - Resolve a peer address to a hostname without blocking the loop
//! - Bound every lookup with a timeout
//! - Hand out an owned request handle; dropping it cancels the lookup

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use futures_util::future::BoxFuture;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, TokioResolver};
use thiserror::Error;
use tokio::task::JoinHandle;

/// Upper bound on a single reverse lookup.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("no PTR record")]
    NotFound,

    #[error("lookup timed out")]
    Timeout,

    #[error("resolver failure: {0}")]
    Failed(String),
}

impl From<ResolveError> for LookupError {
    fn from(e: ResolveError) -> Self {
        if e.is_no_records_found() || e.is_nx_domain() {
            LookupError::NotFound
        } else {
            LookupError::Failed(e.to_string())
        }
    }
}

/// Address to hostname resolution.
pub trait ReverseResolver: Send + Sync + 'static {
    fn reverse(&self, ip: IpAddr) -> BoxFuture<'static, Result<String, LookupError>>;
}

/// Reverse resolver backed by hickory.
#[derive(Clone)]
pub struct DnsResolver {
    inner: TokioResolver,
}

impl DnsResolver {
    /// Use the system resolver configuration, or the library defaults when
    /// that cannot be read.
    pub fn from_system() -> Self {
        let inner = match TokioResolver::builder_tokio() {
            Ok(builder) => builder.build(),
            Err(e) => {
                tracing::warn!(error = %e, "Unable to read system resolver config, using defaults");
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            }
        };
        Self { inner }
    }
}

impl ReverseResolver for DnsResolver {
    fn reverse(&self, ip: IpAddr) -> BoxFuture<'static, Result<String, LookupError>> {
        let resolver = self.inner.clone();
        Box::pin(async move {
            let lookup = resolver.reverse_lookup(ip).await.map_err(LookupError::from)?;
            lookup
                .iter()
                .map(|ptr| ptr.to_string())
                .map(|name| name.trim_end_matches('.').to_owned())
                .find(|name| !name.is_empty())
                .ok_or(LookupError::NotFound)
        })
    }
}

/// An in-flight lookup. Dropping it cancels the lookup, and the completion
/// is then never run.
#[derive(Debug)]
pub struct LookupRequest {
    task: JoinHandle<()>,
}

impl LookupRequest {
    /// Start resolving `ip` and run `complete` exactly once with the result,
    /// unless the request is dropped first.
    pub fn issue<F, Fut>(resolver: &dyn ReverseResolver, ip: IpAddr, timeout: Duration, complete: F) -> Self
    where
        F: FnOnce(Result<String, LookupError>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let lookup = resolver.reverse(ip);
        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, lookup).await {
                Ok(result) => result,
                Err(_) => Err(LookupError::Timeout),
            };
            complete(result).await;
        });
        Self { task }
    }
}

impl Drop for LookupRequest {
    fn drop(&mut self) {
        self.task.abort();
    }
}
