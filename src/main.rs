use std::{error::Error, sync::Arc};

use clap::Parser;
use log::{error, warn};

use concord_repository::{
    cli::{
        args::{CliArgs, Command},
        command_handlers::{do_cleanup, do_fetch, do_invalidate, do_test_connection},
    },
    config::ConcordConfig,
    secret::FileSecretStore,
    RepositoryManager,
};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Dropping `run` on interrupt removes temporary directories and kills git.
    let result = tokio::select! {
        result = run() => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted");
            Err("interrupted".into())
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = CliArgs::parse();
    let config = ConcordConfig::load(cli_args.config)?;

    let mut builder = RepositoryManager::builder(config.repository).git_config(config.git);
    if let Some(secrets) = &cli_args.secrets {
        builder = builder.secret_store(Arc::new(FileSecretStore::from_file(secrets)?));
    }
    let manager = builder.try_build().await?;

    match cli_args.cmd {
        Command::Fetch { reference, project } => {
            do_fetch(&manager, project, &reference.to_reference()).await
        }
        Command::TestConnection {
            reference,
            project,
            org,
        } => do_test_connection(&manager, org, project, &reference.to_reference()).await,
        Command::Invalidate { url } => do_invalidate(&manager, &url).await,
        Command::Cleanup => do_cleanup(&manager).await,
    }
}
