//! The seam towards the local executor.
//!
//! The core only consumes this interface; the subprocess-based executor
//! that actually runs commands lives outside it. Tests provide doubles.

use std::collections::BTreeMap;

use quarry_castore::{Digest, ObjectInfo};

/// Whether the output of an action may be cached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheFlag {
    CacheOutput,
    DoNotCacheOutput,
}

/// The outcome of one executed action.
pub trait ExecutionResponse: Send + Sync {
    fn exit_code(&self) -> i32;

    /// True if the executor served the result from its own cache.
    fn is_cached(&self) -> bool;

    /// Captured standard output, if any was produced.
    fn stdout(&self) -> Option<Vec<u8>>;

    /// Captured standard error, if any was produced.
    fn stderr(&self) -> Option<Vec<u8>>;

    /// Produced artifacts by output path.
    fn artifacts(&self) -> BTreeMap<String, ObjectInfo>;
}

/// A single action, ready to dispatch.
pub trait ExecutionAction: Send {
    fn set_cache_flag(&mut self, flag: CacheFlag);

    /// Runs the action to completion. `None` signals an executor failure.
    fn execute(&self) -> Option<Box<dyn ExecutionResponse>>;
}

/// Factory for executable actions.
pub trait ExecutionApi: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn create_action(
        &self,
        input_root: Digest,
        command: Vec<String>,
        output_files: Vec<String>,
        output_directories: Vec<String>,
        env_vars: BTreeMap<String, String>,
        properties: BTreeMap<String, String>,
    ) -> Option<Box<dyn ExecutionAction>>;
}

/// An execution API that refuses every action. Useful to bring up the
/// storage-only services without a wired executor.
#[derive(Default)]
pub struct DummyExecutionApi;

impl ExecutionApi for DummyExecutionApi {
    fn create_action(
        &self,
        _input_root: Digest,
        _command: Vec<String>,
        _output_files: Vec<String>,
        _output_directories: Vec<String>,
        _env_vars: BTreeMap<String, String>,
        _properties: BTreeMap<String, String>,
    ) -> Option<Box<dyn ExecutionAction>> {
        None
    }
}
