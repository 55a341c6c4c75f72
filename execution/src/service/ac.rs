//! The server-side action cache.

use std::sync::Arc;

use prost::Message;
use tonic::{async_trait, Request, Response, Status};
use tracing::instrument;

use quarry_castore::{Digest, GarbageCollector, LocalCas};
use quarry_reapi::remexec::{
    action_cache_server::ActionCache, ActionResult, GetActionResultRequest,
    UpdateActionResultRequest,
};

pub struct ActionCacheService {
    storage: Arc<LocalCas>,
}

impl ActionCacheService {
    pub fn new(storage: Arc<LocalCas>) -> Self {
        Self { storage }
    }

    fn gc_lock(&self) -> Result<quarry_castore::GcLock, Status> {
        GarbageCollector::shared_lock(self.storage.root())
            .ok_or_else(|| Status::internal("could not acquire shared gc lock"))
    }
}

#[async_trait]
impl ActionCache for ActionCacheService {
    #[instrument(skip_all)]
    async fn get_action_result(
        &self,
        request: Request<GetActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let _gc_lock = self.gc_lock()?;
        let request = request.into_inner();
        let action: Digest = request
            .action_digest
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("request without action digest"))?
            .into();

        let content = self.storage.read_action_result(&action).ok_or_else(|| {
            Status::not_found(format!(
                "action {} not found in cache",
                action.unprefixed_hash()
            ))
        })?;
        let result = ActionResult::decode(content.as_slice()).map_err(|err| {
            Status::internal(format!(
                "failed to parse action result for {}: {}",
                action.unprefixed_hash(),
                err
            ))
        })?;
        Ok(Response::new(result))
    }

    #[instrument(skip_all)]
    async fn update_action_result(
        &self,
        request: Request<UpdateActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let _gc_lock = self.gc_lock()?;
        let request = request.into_inner();
        let action: Digest = request
            .action_digest
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("request without action digest"))?
            .into();
        let result = request
            .action_result
            .ok_or_else(|| Status::invalid_argument("request without action result"))?;

        self.storage
            .store_action_result(&action, &result.encode_to_vec())
            .map_err(|err| {
                Status::internal(format!(
                    "could not store action result for {}: {}",
                    action.unprefixed_hash(),
                    err
                ))
            })?;
        Ok(Response::new(result))
    }
}
