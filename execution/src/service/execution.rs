//! The server-side Execute RPC: resolve the action, dispatch it to the
//! local executor, record the result, and stream the finished operation.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use futures::stream::BoxStream;
use prost::Message;
use tonic::{async_trait, Request, Response, Status};
use tracing::{error, info, instrument, trace, warn};

use quarry_castore::{unprefix, Digest, GarbageCollector, LocalCas};
use quarry_reapi::google::longrunning::{operation, Operation};
use quarry_reapi::google::rpc;
use quarry_reapi::remexec::{
    execution_server::Execution, Action, Command, ExecuteRequest, ExecuteResponse, OutputDirectory,
    OutputFile, WaitExecutionRequest,
};
use quarry_reapi::remexec;

use crate::api::{CacheFlag, ExecutionApi, ExecutionResponse};
use crate::bridge;
use crate::service::operations::OperationCache;

/// Name carried by every finished execution operation.
const OPERATION_NAME: &str = "quarry-remote-execution";

/// Type URL under which the `ExecuteResponse` is packed into the
/// operation.
const EXECUTE_RESPONSE_TYPE_URL: &str =
    "type.googleapis.com/build.bazel.remote.execution.v2.ExecuteResponse";

pub struct ExecutionService {
    storage: Arc<LocalCas>,
    api: Arc<dyn ExecutionApi>,
    op_cache: Arc<OperationCache>,
}

impl ExecutionService {
    pub fn new(
        storage: Arc<LocalCas>,
        api: Arc<dyn ExecutionApi>,
        op_cache: Arc<OperationCache>,
    ) -> Self {
        Self {
            storage,
            api,
            op_cache,
        }
    }

    fn read_blob_message<M: Message + Default>(
        &self,
        digest: &Digest,
        what: &str,
    ) -> Result<M, String> {
        let path = self
            .storage
            .blob_path(digest, /*is_executable=*/ false)
            .ok_or_else(|| {
                format!(
                    "could not retrieve blob {} from cas",
                    digest.unprefixed_hash()
                )
            })?;
        let content = fs::read(path).map_err(|_| {
            format!(
                "could not retrieve blob {} from cas",
                digest.unprefixed_hash()
            )
        })?;
        bridge::message_from_string(&content).ok_or_else(|| {
            format!(
                "failed to parse {} from blob {}",
                what,
                digest.unprefixed_hash()
            )
        })
    }

    /// Resolves the action and checks its input root is present.
    fn get_action(&self, request: &ExecuteRequest) -> Result<Action, String> {
        let action_digest: Digest = request
            .action_digest
            .as_ref()
            .ok_or("execute request without action digest")?
            .into();
        let action: Action = self.read_blob_message(&action_digest, "action")?;

        let input_root: Digest = action
            .input_root_digest
            .as_ref()
            .ok_or_else(|| {
                format!(
                    "action {} has no input root",
                    action_digest.unprefixed_hash()
                )
            })?
            .into();
        let input_root_present = if self.storage.hash_function().is_compatible() {
            self.storage.blob_path(&input_root, false).is_some()
        } else {
            self.storage.tree_path(&input_root).is_some()
        };
        if !input_root_present {
            return Err(format!(
                "could not retrieve input root {} from cas",
                input_root.unprefixed_hash()
            ));
        }
        Ok(action)
    }

    fn get_command(&self, action: &Action) -> Result<Command, String> {
        let command_digest: Digest = action
            .command_digest
            .as_ref()
            .ok_or("action without command digest")?
            .into();
        self.read_blob_message(&command_digest, "command")
    }

    /// Builds the dispatchable executor action for a request.
    fn create_execution_action(
        &self,
        request: &ExecuteRequest,
        action: &Action,
    ) -> Result<Box<dyn crate::api::ExecutionAction>, String> {
        let command = self.get_command(action)?;

        let env_vars: BTreeMap<String, String> = command
            .environment_variables
            .iter()
            .map(|variable| (variable.name.clone(), variable.value.clone()))
            .collect();

        let input_root: Digest = action
            .input_root_digest
            .as_ref()
            .ok_or("action without input root digest")?
            .into();

        let mut execution_action = self
            .api
            .create_action(
                input_root,
                command.arguments.clone(),
                command.output_files.clone(),
                command.output_directories.clone(),
                env_vars,
                BTreeMap::new(),
            )
            .ok_or_else(|| {
                format!(
                    "could not create action from {}",
                    unprefixed_request_hash(request)
                )
            })?;
        execution_action.set_cache_flag(if action.do_not_cache {
            CacheFlag::DoNotCacheOutput
        } else {
            CacheFlag::CacheOutput
        });
        Ok(execution_action)
    }

    /// Converts executor artifacts into output files/directories. In
    /// compatibility mode a `Tree` message is synthesized on the fly for
    /// every tree-typed artifact.
    fn add_output_paths(
        &self,
        result: &mut remexec::ActionResult,
        execution: &dyn ExecutionResponse,
    ) -> bool {
        for (path, info) in execution.artifacts() {
            let digest: remexec::Digest = (&info.digest).into();
            if info.kind.is_tree() {
                let tree_digest = if self.storage.hash_function().is_compatible() {
                    match bridge::tree_digest_from_directory_digest(&digest, &self.storage) {
                        Some(tree_digest) => tree_digest,
                        None => return false,
                    }
                } else {
                    digest
                };
                result.output_directories.push(OutputDirectory {
                    path,
                    tree_digest: Some(tree_digest),
                });
            } else {
                result.output_files.push(OutputFile {
                    path,
                    digest: Some(digest),
                    is_executable: info.kind.is_executable(),
                });
            }
        }
        true
    }

    fn build_response(
        &self,
        request: &ExecuteRequest,
        execution: &dyn ExecutionResponse,
    ) -> Result<ExecuteResponse, String> {
        let action_hash = unprefixed_request_hash(request);

        let mut result = remexec::ActionResult {
            exit_code: execution.exit_code(),
            ..Default::default()
        };
        if !self.add_output_paths(&mut result, execution) {
            return Err(format!(
                "error in creating output paths of action {}",
                action_hash
            ));
        }

        if let Some(stderr) = execution.stderr() {
            let digest = self
                .storage
                .store_blob(&stderr, false)
                .map_err(|_| format!("could not store stderr of action {}", action_hash))?;
            result.stderr_digest = Some((&digest).into());
        }
        if let Some(stdout) = execution.stdout() {
            let digest = self
                .storage
                .store_blob(&stdout, false)
                .map_err(|_| format!("could not store stdout of action {}", action_hash))?;
            result.stdout_digest = Some((&digest).into());
        }

        Ok(ExecuteResponse {
            result: Some(result),
            cached_result: execution.is_cached(),
            // the action ran locally, so no communication issues can occur
            status: Some(rpc::Status {
                code: tonic::Code::Ok as i32,
                message: String::new(),
                details: Vec::new(),
            }),
            message: String::new(),
        })
    }

    /// Stores the action-cache entry (cache-before-stream: a client retry
    /// after a dropped connection must be able to hit the cache) and packs
    /// the finished operation.
    fn finalize(
        &self,
        request: &ExecuteRequest,
        action: &Action,
        execution: &dyn ExecutionResponse,
    ) -> Result<Operation, String> {
        let response = self.build_response(request, execution)?;
        let action_hash = unprefixed_request_hash(request);

        if execution.exit_code() == 0 && !action.do_not_cache {
            let action_digest: Digest = request
                .action_digest
                .as_ref()
                .ok_or("execute request without action digest")?
                .into();
            let result = response
                .result
                .as_ref()
                .ok_or("response without result")?;
            // A failed cache store only costs a later request its cache
            // hit; the response already produced stays valid.
            if let Err(err) = self
                .storage
                .store_action_result(&action_digest, &result.encode_to_vec())
            {
                warn!(
                    %err,
                    "could not store action result for action {}", action_hash
                );
            }
        }

        let op = Operation {
            name: OPERATION_NAME.to_owned(),
            metadata: None,
            done: true,
            result: Some(operation::Result::Response(prost_types::Any {
                type_url: EXECUTE_RESPONSE_TYPE_URL.to_owned(),
                value: response.encode_to_vec(),
            })),
        };
        self.op_cache.set(action_hash, op.clone());
        Ok(op)
    }
}

fn unprefixed_request_hash(request: &ExecuteRequest) -> String {
    request
        .action_digest
        .as_ref()
        .map(|digest| unprefix(&digest.hash).to_owned())
        .unwrap_or_default()
}

#[async_trait]
impl Execution for ExecutionService {
    type ExecuteStream = BoxStream<'static, Result<Operation, Status>>;
    type WaitExecutionStream = BoxStream<'static, Result<Operation, Status>>;

    #[instrument(skip_all, fields(action = %unprefixed_request_hash(request.get_ref())))]
    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let request = request.into_inner();

        // Held for the whole request: the garbage collector must not
        // remove anything the response refers to.
        let _gc_lock = GarbageCollector::shared_lock(self.storage.root()).ok_or_else(|| {
            let msg = "could not acquire shared gc lock";
            error!("{}", msg);
            Status::internal(msg)
        })?;

        let action = self.get_action(&request).map_err(internal)?;
        let execution_action = self
            .create_execution_action(&request, &action)
            .map_err(internal)?;

        info!("execute {}", unprefixed_request_hash(&request));
        let execution = tokio::task::spawn_blocking(move || execution_action.execute())
            .await
            .map_err(|err| Status::internal(format!("executor panicked: {}", err)))?
            .ok_or_else(|| {
                internal(format!(
                    "failed to execute action {}",
                    unprefixed_request_hash(&request)
                ))
            })?;
        trace!("finished execution of {}", unprefixed_request_hash(&request));

        let op = self
            .finalize(&request, &action, execution.as_ref())
            .map_err(internal)?;
        Ok(Response::new(Box::pin(tokio_stream::once(Ok(op)))))
    }

    async fn wait_execution(
        &self,
        _request: Request<WaitExecutionRequest>,
    ) -> Result<Response<Self::WaitExecutionStream>, Status> {
        let msg = "WaitExecution not implemented";
        error!("{}", msg);
        Err(Status::unimplemented(msg))
    }
}

fn internal(msg: impl Into<String>) -> Status {
    let msg = msg.into();
    error!("{}", msg);
    Status::internal(msg)
}
