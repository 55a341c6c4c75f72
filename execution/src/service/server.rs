//! Server assembly: binds the listening socket, reports the effective
//! address, and registers all six services.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{error, info};

use quarry_castore::{Error, LocalCas};
use quarry_reapi::google::bytestream::byte_stream_server::ByteStreamServer;
use quarry_reapi::google::longrunning::operations_server::OperationsServer;
use quarry_reapi::remexec::action_cache_server::ActionCacheServer;
use quarry_reapi::remexec::capabilities_server::CapabilitiesServer;
use quarry_reapi::remexec::content_addressable_storage_server::ContentAddressableStorageServer;
use quarry_reapi::remexec::execution_server::ExecutionServer;

use crate::api::ExecutionApi;
use crate::service::ac::ActionCacheService;
use crate::service::bytestream::ByteStreamService;
use crate::service::capabilities::CapabilitiesService;
use crate::service::cas::CasService;
use crate::service::execution::ExecutionService;
use crate::service::operations::{OperationCache, OperationsService};

/// TLS material for the server side; absent means insecure credentials.
pub struct TlsAuth {
    pub ca_cert: Vec<u8>,
    pub server_cert: Vec<u8>,
    pub server_key: Vec<u8>,
}

pub struct ServerConfig {
    pub interface: String,
    /// 0 selects a free port; the effective port lands in the info file.
    pub port: u16,
    pub pid_file: Option<PathBuf>,
    pub info_file: Option<PathBuf>,
    /// Completed-operation cache size as a power of two.
    pub op_exponent: Option<u8>,
}

impl ServerConfig {
    /// Runs the service until the process is terminated.
    pub async fn run(
        self,
        storage: Arc<LocalCas>,
        api: Arc<dyn ExecutionApi>,
        tls: Option<TlsAuth>,
    ) -> Result<(), Error> {
        let listener =
            tokio::net::TcpListener::bind((self.interface.as_str(), self.port)).await?;
        let local_addr = listener.local_addr()?;

        let pid = std::process::id();
        let info = serde_json::json!({
            "interface": self.interface,
            "port": local_addr.port(),
            "pid": pid,
        })
        .to_string();

        if let Some(pid_file) = &self.pid_file {
            fs::write(pid_file, pid.to_string())?;
        }
        if let Some(info_file) = &self.info_file {
            fs::write(info_file, &info)?;
        }
        info!(
            "{}execution service started: {}",
            if storage.hash_function().is_compatible() {
                "compatible "
            } else {
                ""
            },
            info
        );

        let op_cache = Arc::new(
            self.op_exponent
                .map(OperationCache::new)
                .unwrap_or_default(),
        );

        let mut builder = Server::builder();
        if let Some(tls) = tls {
            let identity = Identity::from_pem(tls.server_cert, tls.server_key);
            let tls_config = ServerTlsConfig::new()
                .identity(identity)
                .client_ca_root(Certificate::from_pem(tls.ca_cert));
            builder = builder.tls_config(tls_config).map_err(|err| {
                error!(%err, "could not apply TLS configuration");
                Error::Unsupported(format!("invalid TLS configuration: {}", err))
            })?;
        }

        let router = builder
            .add_service(ExecutionServer::new(ExecutionService::new(
                storage.clone(),
                api,
                op_cache.clone(),
            )))
            .add_service(ActionCacheServer::new(ActionCacheService::new(
                storage.clone(),
            )))
            .add_service(ContentAddressableStorageServer::new(CasService::new(
                storage.clone(),
            )))
            .add_service(ByteStreamServer::new(ByteStreamService::new(
                storage.clone(),
            )))
            .add_service(CapabilitiesServer::new(CapabilitiesService::new(
                storage.hash_function(),
            )))
            .add_service(OperationsServer::new(OperationsService::new(op_cache)));

        router
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .map_err(|err| {
                error!(%err, "could not start execution service");
                Error::Io(std::io::Error::other(err))
            })
    }
}
