//! The Operations service, backed by the cache of completed executions.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use tonic::{async_trait, Request, Response, Status};

use quarry_reapi::google::longrunning::{
    operations_server::Operations, CancelOperationRequest, DeleteOperationRequest,
    GetOperationRequest, ListOperationsRequest, ListOperationsResponse, Operation,
};

/// Bounded cache of completed operations, keyed by the unprefixed action
/// digest hash. Lets a client whose stream broke re-query the outcome.
pub struct OperationCache {
    max_entries: usize,
    inner: RwLock<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    ops: HashMap<String, Operation>,
    order: VecDeque<String>,
}

impl OperationCache {
    /// Cache sized to `2^exponent` entries.
    pub fn new(exponent: u8) -> Self {
        Self {
            max_entries: 1usize << exponent,
            inner: RwLock::new(CacheInner::default()),
        }
    }

    pub fn set(&self, key: String, op: Operation) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        if !inner.ops.contains_key(&key) {
            inner.order.push_back(key.clone());
        }
        inner.ops.insert(key, op);
        while inner.order.len() > self.max_entries {
            if let Some(evicted) = inner.order.pop_front() {
                inner.ops.remove(&evicted);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Operation> {
        self.inner.read().ok()?.ops.get(key).cloned()
    }
}

impl Default for OperationCache {
    fn default() -> Self {
        Self::new(14)
    }
}

pub struct OperationsService {
    cache: std::sync::Arc<OperationCache>,
}

impl OperationsService {
    pub fn new(cache: std::sync::Arc<OperationCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Operations for OperationsService {
    async fn get_operation(
        &self,
        request: Request<GetOperationRequest>,
    ) -> Result<Response<Operation>, Status> {
        let name = request.into_inner().name;
        match self.cache.get(&name) {
            Some(op) => Ok(Response::new(op)),
            None => Err(Status::not_found(format!(
                "operation {} not found in cache",
                name
            ))),
        }
    }

    async fn list_operations(
        &self,
        _request: Request<ListOperationsRequest>,
    ) -> Result<Response<ListOperationsResponse>, Status> {
        Err(Status::unimplemented("ListOperations not implemented"))
    }

    async fn delete_operation(
        &self,
        _request: Request<DeleteOperationRequest>,
    ) -> Result<Response<()>, Status> {
        Err(Status::unimplemented("DeleteOperation not implemented"))
    }

    async fn cancel_operation(
        &self,
        _request: Request<CancelOperationRequest>,
    ) -> Result<Response<()>, Status> {
        Err(Status::unimplemented("CancelOperation not implemented"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_evicts_oldest_beyond_capacity() {
        let cache = OperationCache::new(1); // two entries
        for key in ["a", "b", "c"] {
            cache.set(key.into(), Operation::default());
        }
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn overwrite_does_not_grow_the_cache() {
        let cache = OperationCache::new(1);
        cache.set("a".into(), Operation::default());
        cache.set("a".into(), Operation::default());
        cache.set("b".into(), Operation::default());
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_some());
    }
}
