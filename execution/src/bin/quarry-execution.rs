use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, Level};

use quarry_castore::{HashFunction, LocalCas};
use quarry_execution::{DummyExecutionApi, ServerConfig, TlsAuth, EXIT_CONFIG_ERROR};

/// Single-node remote-execution endpoint over a local storage root.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs. It's also possible
    /// to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,

    /// Interface to bind the service to.
    #[arg(long, default_value = "127.0.0.1")]
    interface: String,

    /// Port to listen on; 0 selects a free port.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Storage root for the content-addressed store.
    #[arg(long)]
    local_root: PathBuf,

    /// Run in compatibility mode (SHA-256 digests, flat directories)
    /// instead of the Git-native hashing.
    #[arg(long)]
    compatible: bool,

    /// File to write the server PID to, once the socket is bound.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// File to write the effective `{interface, port, pid}` JSON to.
    #[arg(long)]
    info_file: Option<PathBuf>,

    /// Size of the completed-operation cache, as a power of two.
    #[arg(long)]
    op_exponent: Option<u8>,

    /// CA certificate (PEM) for TLS; enables TLS together with the
    /// server certificate and key.
    #[arg(long)]
    tls_ca_cert: Option<PathBuf>,

    /// Server certificate (PEM) for TLS.
    #[arg(long)]
    tls_server_cert: Option<PathBuf>,

    /// Server key (PEM) for TLS.
    #[arg(long)]
    tls_server_key: Option<PathBuf>,
}

fn read_credential_file(path: &PathBuf) -> Vec<u8> {
    match std::fs::read(path) {
        Ok(content) => content,
        Err(err) => {
            error!(path = %path.display(), %err, "could not read credential file");
            exit(EXIT_CONFIG_ERROR);
        }
    }
}

fn tls_auth(cli: &Cli) -> Option<TlsAuth> {
    match (&cli.tls_ca_cert, &cli.tls_server_cert, &cli.tls_server_key) {
        (None, None, None) => None,
        (Some(ca_cert), Some(server_cert), Some(server_key)) => Some(TlsAuth {
            ca_cert: read_credential_file(ca_cert),
            server_cert: read_credential_file(server_cert),
            server_key: read_credential_file(server_key),
        }),
        _ => {
            error!("TLS requires CA certificate, server certificate, and server key");
            exit(EXIT_CONFIG_ERROR);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.log_level.into())
                .from_env_lossy(),
        )
        .init();

    let tls = tls_auth(&cli);

    let hash = if cli.compatible {
        HashFunction::Compatible
    } else {
        HashFunction::Native
    };
    let storage = match LocalCas::open(&cli.local_root, hash) {
        Ok(storage) => Arc::new(storage),
        Err(err) => {
            error!(root = %cli.local_root.display(), %err, "could not open storage root");
            exit(EXIT_CONFIG_ERROR);
        }
    };

    let config = ServerConfig {
        interface: cli.interface,
        port: cli.port,
        pid_file: cli.pid_file,
        info_file: cli.info_file,
        op_exponent: cli.op_exponent,
    };
    config
        .run(storage, Arc::new(DummyExecutionApi), tls)
        .await?;
    Ok(())
}
