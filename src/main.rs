mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{ClientArgs, Cli, Commands};
use rv_client::{
    ClientConfig, ClientStateStore, HttpUploadApi, RunOutcome, UploadApi, UploadController,
    UploadOptions,
};
use rv_core::config::Config;

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

fn load_config(path: Option<&Path>) -> Config {
    let expanded = path.map(|p| expand(&p.to_string_lossy()));
    Config::load_or_default(expanded.as_deref())
}

async fn start_server(host: Option<String>, port: Option<u16>, config_path: Option<&Path>) -> Result<()> {
    let mut config = load_config(config_path);

    // Override host/port from CLI if specified
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing::info!("Starting reelvault server");
    tracing::info!(
        "Server will listen on {}:{}",
        config.server.host,
        config.server.port
    );

    rv_server::start(config).await?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "reelvault=debug,rv_server=debug,rv_client=debug,rv_db=debug,rv_av=debug,tower_http=debug"
                .to_string()
        } else {
            "reelvault=info,rv_server=info,rv_client=info,rv_db=info,rv_av=info,tower_http=info"
                .to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Upload {
            file,
            title,
            year,
            chunk_size,
            client,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(upload_file(
                &file,
                UploadOptions {
                    title,
                    year,
                    chunk_size,
                },
                client_config(&client, cli.config.as_deref()),
            ))
        }
        Commands::Resume { upload_id, client } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(resume_upload(
                &upload_id,
                client_config(&client, cli.config.as_deref()),
            ))
        }
        Commands::Cancel { upload_id, client } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cancel_upload(
                &upload_id,
                client_config(&client, cli.config.as_deref()),
            ))
        }
        Commands::Uploads { state } => {
            let args = ClientArgs {
                server: None,
                state,
                concurrency: None,
            };
            list_uploads(&client_config(&args, cli.config.as_deref()).state_path)
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("reelvault {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Upload client commands
// ---------------------------------------------------------------------------

struct ClientParts {
    api: Arc<dyn UploadApi>,
    store: Arc<ClientStateStore>,
    config: ClientConfig,
}

/// Client settings from the config file with CLI overrides on top.
fn client_config(args: &ClientArgs, config_path: Option<&Path>) -> ClientConfig {
    let expanded = config_path.map(|p| expand(&p.to_string_lossy()));
    let mut config = ClientConfig::load_or_default(expanded.as_deref());

    if let Some(server) = &args.server {
        config.server_url = server.clone();
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    let state = args
        .state
        .clone()
        .unwrap_or_else(|| config.state_path.to_string_lossy().into_owned());
    config.state_path = expand(&state);
    config
}

fn client_parts(config: ClientConfig) -> Result<ClientParts> {
    let store = ClientStateStore::load(&config.state_path)
        .with_context(|| format!("Failed to load {}", config.state_path.display()))?;
    let api = HttpUploadApi::new(&config.server_url, config.request_timeout());
    Ok(ClientParts {
        api: Arc::new(api),
        store: Arc::new(store),
        config,
    })
}

async fn upload_file(file: &Path, options: UploadOptions, config: ClientConfig) -> Result<()> {
    if !file.is_file() {
        anyhow::bail!("Input file does not exist: {}", file.display());
    }
    let parts = client_parts(config)?;
    let controller =
        UploadController::start(parts.api, parts.store, &parts.config, file, options)
            .await
            .context("Failed to start upload")?;
    println!("Upload id: {}", controller.upload_id());
    drive(Arc::new(controller)).await
}

async fn resume_upload(upload_id: &str, config: ClientConfig) -> Result<()> {
    let parts = client_parts(config)?;
    let controller =
        UploadController::restore(parts.api, parts.store, &parts.config, upload_id)
            .await
            .context("Failed to restore upload")?;
    println!(
        "Resuming {} ({} chunk(s) left)",
        controller.upload_id(),
        controller.pending_chunks().len()
    );
    drive(Arc::new(controller)).await
}

/// Run the upload to completion, pausing on Ctrl+C.
async fn drive(controller: Arc<UploadController>) -> Result<()> {
    let mut progress = controller.subscribe();
    let reporter = tokio::spawn(async move {
        let mut last_pct = -1.0;
        while progress.changed().await.is_ok() {
            let pct = progress.borrow_and_update().percent();
            if pct - last_pct >= 1.0 || (pct >= 100.0 && last_pct < 100.0) {
                eprintln!("{pct:.1}%");
                last_pct = pct;
            }
        }
    });

    let pauser = {
        let controller = controller.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                controller.pause();
            }
        })
    };

    let outcome = controller.run().await;
    pauser.abort();
    reporter.abort();

    match outcome? {
        RunOutcome::Completed(done) => {
            println!("Upload complete. Asset id: {}", done.asset_id);
        }
        RunOutcome::Paused => {
            println!(
                "Upload paused. Resume with: reelvault resume {}",
                controller.upload_id()
            );
        }
    }
    Ok(())
}

async fn cancel_upload(upload_id: &str, config: ClientConfig) -> Result<()> {
    let parts = client_parts(config)?;
    let state = parts
        .store
        .get(upload_id)
        .with_context(|| format!("No recorded upload {upload_id}"))?;
    match parts.api.cancel_session(state.session_id).await {
        Ok(()) | Err(rv_client::ClientError::SessionNotFound(_)) => {}
        Err(e) => return Err(e).context("Failed to cancel upload"),
    }
    parts.store.remove(upload_id);
    parts.store.save().await?;
    println!("Cancelled {upload_id}");
    Ok(())
}

fn list_uploads(path: &Path) -> Result<()> {
    let store = ClientStateStore::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let uploads = store.list();
    if uploads.is_empty() {
        println!("No uploads in progress");
        return Ok(());
    }
    for (id, state) in uploads {
        println!(
            "{id}  session={}  {}/{} chunks  {}",
            state.session_id,
            state.accepted_chunks.len(),
            state.total_chunks,
            state.source_path.display()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = load_config(config_path);
    let tools = rv_av::ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Uploads will work but transcoding will fail.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            let p = expand(&p.to_string_lossy());
            println!("Validating config: {}", p.display());
            let raw = std::fs::read_to_string(&p)
                .with_context(|| format!("Failed to read {}", p.display()))?;
            let config = Config::from_json(&raw)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Data dir: {}", config.server.data_dir.display());
    println!(
        "  Chunk size: {} (min {}, max {})",
        config.upload.default_chunk_size, config.upload.min_chunk_size, config.upload.max_chunk_size
    );
    println!("  Session TTL: {}s", config.upload.session_ttl_secs);
    println!(
        "  Transcodes: {} concurrent, {} attempt(s)",
        config.transcode.worker_count(),
        config.transcode.attempt_budget()
    );

    let warnings = config.validate();
    for warning in &warnings {
        println!("  ! {warning}");
    }
    Ok(())
}
