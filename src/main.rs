//! realm-ldaps - security-realm driven LDAPS authentication
//!
//! Serves protected deployments over HTTP Basic auth, probes realms from the
//! command line, and mints the certificates both sides need.

use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use realm_ldaps::{
    Error,
    auth::{AuthOutcome, AuthenticationEvaluator},
    cli::{Cli, Command, TlsCommand},
    config::Config,
    directory::Directory,
    realm::ManagementModel,
    setup_tracing,
    tls::{CaParams, CertGenerator, LeafCertParams},
    web::{AppState, create_router, serve},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config_path = cli.config.clone();
    match cli.command {
        Some(Command::Tls(cmd)) => run_tls_command(cmd),
        Some(Command::Probe {
            realm,
            username,
            password,
        }) => run_probe(config_path.as_deref(), &realm, &username, &password).await,
        Some(Command::Serve {
            port,
            host,
            directory,
        }) => run_server(config_path.as_deref(), port, host, directory).await,
        None => run_server(config_path.as_deref(), None, None, false).await,
    }
}

fn load_model(path: Option<&Path>) -> Result<(Config, Arc<ManagementModel>), Error> {
    let config = Config::load(path)?;
    let model = ManagementModel::from_config(&config)?;
    Ok((config, Arc::new(model)))
}

/// Run the HTTP front, optionally with the embedded directory
async fn run_server(
    path: Option<&Path>,
    port: Option<u16>,
    host: Option<String>,
    with_directory: bool,
) -> ExitCode {
    let (mut config, model) = match load_model(path) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    let directory = if with_directory {
        let Some(settings) = config.directory.as_ref() else {
            error!("--directory given but the configuration has no `directory` section");
            return ExitCode::FAILURE;
        };
        let started = match settings.to_directory_config() {
            Ok(dir_config) => Directory::start(dir_config).await,
            Err(e) => Err(e),
        };
        match started {
            Ok(directory) => Some(directory),
            Err(e) => {
                error!("Failed to start directory: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    let addr = match config.server.host.parse() {
        Ok(ip) => SocketAddr::new(ip, config.server.port),
        Err(e) => {
            error!("Invalid host '{}': {e}", config.server.host);
            return ExitCode::FAILURE;
        }
    };
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        %addr,
        realms = config.security_realms.len(),
        connections = config.outbound_connections.len(),
        deployments = config.deployments.len(),
        "Starting realm-ldaps"
    );

    let state = AppState::new(
        AuthenticationEvaluator::new(model),
        config.deployments.clone(),
        config.server.request_timeout,
    );
    let result = serve(
        listener,
        create_router(Arc::new(state)),
        config.server.shutdown_timeout,
    )
    .await;

    if let Some(directory) = directory {
        directory.stop().await;
    }

    match result {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Authenticate once and report the outcome
async fn run_probe(path: Option<&Path>, realm: &str, username: &str, password: &str) -> ExitCode {
    let model = match load_model(path) {
        Ok((_, model)) => model,
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let evaluator = AuthenticationEvaluator::new(model);

    match evaluator.authenticate(realm, username, password).await {
        Ok(AuthOutcome::Accepted) => {
            println!("✅ {username} accepted by realm {realm}");
            for record in evaluator.server_identities().records() {
                println!("   Directory identity: {}", record.subject_dn);
            }
            for record in evaluator.presented_identities().records() {
                println!("   Presented identity: {}", record.subject_dn);
            }
            ExitCode::SUCCESS
        }
        Ok(AuthOutcome::Rejected) => {
            println!("❌ {username} rejected by realm {realm}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ Probe failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Handle `tls` subcommands
fn run_tls_command(cmd: TlsCommand) -> ExitCode {
    let result = match cmd {
        TlsCommand::InitCa { cn, days, out } => CertGenerator::init_ca(&CaParams {
            cn: &cn,
            validity_days: days,
        })
        .and_then(|ca| CertGenerator::write_to_dir(&ca, &out, "ca"))
        .map(|()| out.join("ca.crt")),
        TlsCommand::Issue {
            cn,
            ou,
            sans,
            days,
            ca_cert,
            ca_key,
            out,
            name,
        } => issue(&cn, ou.as_deref(), sans, days, &ca_cert, &ca_key, &out, name),
    };

    match result {
        Ok(written) => {
            println!("✅ Wrote {}", written.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn issue(
    cn: &str,
    ou: Option<&str>,
    sans: Vec<String>,
    days: u32,
    ca_cert: &Path,
    ca_key: &Path,
    out: &Path,
    name: Option<String>,
) -> Result<std::path::PathBuf, Error> {
    let read = |p: &Path| {
        std::fs::read_to_string(p)
            .map_err(|e| Error::Config(format!("Cannot read '{}': {e}", p.display())))
    };
    let ca_cert_pem = read(ca_cert)?;
    let ca_key_pem = read(ca_key)?;
    let leaf = CertGenerator::issue_leaf(
        &LeafCertParams {
            cn,
            ou,
            sans,
            validity_days: days,
        },
        &ca_cert_pem,
        &ca_key_pem,
    )?;
    let stem = name.unwrap_or_else(|| cn.to_lowercase());
    CertGenerator::write_to_dir(&leaf, out, &stem)?;
    Ok(out.join(format!("{stem}.keystore")))
}
