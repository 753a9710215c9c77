use anyhow::Result;

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use ipfeed::{
    config::{Cli, Command, Config},
    domain,
    store::Store,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);
    let store = cli.config.open_store()?;

    match cmd {
        Command::Run => run_server(&cli.config, store).await,
        Command::List => {
            for ip in store.allowlist.try_load()? {
                println!("{ip}");
            }
            Ok(())
        }
        Command::Add(args) => {
            let mut items = store.allowlist.try_load()?;
            let ip = domain::add_ip(&mut items, &args.ip)?;
            store.allowlist.save(&items)?;
            println!("added {ip}");
            Ok(())
        }
        Command::Remove(args) => {
            let mut items = store.allowlist.try_load()?;
            let ip = domain::remove_ip(&mut items, &args.ip)?;
            store.allowlist.save(&items)?;
            println!("removed {ip}");
            Ok(())
        }
        Command::Versions => {
            for id in store.snapshots.list()? {
                println!("{id}\t{}", id.created_at().to_rfc3339());
            }
            Ok(())
        }
        Command::Rollback(args) => {
            let id = store.snapshots.restore(&args.version)?;
            println!("rolled back to {id}");
            Ok(())
        }
    }
}

async fn run_server(config: &Config, store: Store) -> Result<()> {
    let app = ipfeed::http::build_router(store)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        ip_file = %config.ip_file.display(),
        versions_dir = %config.versions_dir.display(),
        "starting ipfeed"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
