use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use runner_launcher::{
    config::ConfigLoader,
    identity::derive_identity,
    jobs::{JobLocation, JobSpec},
};

/// Prints the job identity and job definition the service would ensure,
/// without contacting the control plane.
#[derive(Debug, Parser)]
#[command(name = "print_job_identity", version)]
struct Args {
    /// Directory holding the `.env*` files. Defaults to the working directory.
    #[arg(long)]
    env_dir: Option<PathBuf>,

    /// Overrides PROJECT_ID.
    #[arg(long)]
    project: Option<String>,

    /// Overrides LOCATION.
    #[arg(long)]
    location: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let loader = match args.env_dir {
        Some(dir) => ConfigLoader::with_base_dir(dir),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load().context("loading configuration")?;
    if args.project.is_some() {
        config.project_id = args.project;
    }
    if args.location.is_some() {
        config.location = args.location;
    }

    if config.control_plane_location().is_err() {
        eprintln!(
            "warning: PROJECT_ID or LOCATION is unset; the running service resolves them from the metadata server, so its identity will differ"
        );
    }

    let identity = derive_identity(&config).context("deriving job identity")?;
    println!("identity: {}", identity);
    println!("version:  {}", identity.version().as_str());
    if let Ok(location) = JobLocation::from_config(&config) {
        println!("job:      {}", location.job_name(&identity));
    }

    let spec = JobSpec::from_config(&config, &identity);
    let json = serde_json::to_string_pretty(&spec).context("serializing job definition")?;
    println!("{}", json);

    Ok(())
}
