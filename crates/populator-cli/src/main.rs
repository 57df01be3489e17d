//! fhir-populator - load FHIR packages from a registry into a FHIR server.
//!
//! Resolves the requested packages (optionally with their transitive
//! dependencies), orders them so that dependencies upload first, and feeds
//! every resource to the target server one at a time.

use anyhow::{Context, Result};
use clap::Parser;
use populator_pkg::{
    FetchDirs, PackageSpec, RegistryClient, RegistryConfig, WalkOptions, Walker,
    DEFAULT_REGISTRY_URL,
};
use populator_upload::{
    build_plan, scan_package, HttpStore, PackageResources, PlanOptions, RunReport,
    ScriptedDecider, TypeFilter, Uploader,
};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod prompt;

#[derive(Parser)]
#[command(name = "fhir-populator")]
#[command(version)]
#[command(about = "Load FHIR packages into a FHIR server", long_about = None)]
struct Cli {
    /// Base URL of the target FHIR server
    #[arg(long)]
    endpoint: String,

    /// Package registry to download from
    #[arg(long, default_value = DEFAULT_REGISTRY_URL)]
    registry_url: String,

    /// Authorization header passed verbatim to registry and server requests
    #[arg(long)]
    authorization_header: Option<String>,

    /// Packages to upload, as "name" or "name@version" (repeatable)
    #[arg(long = "package", required = true)]
    packages: Vec<String>,

    /// Also resolve and upload transitive dependencies
    #[arg(long)]
    get_dependencies: bool,

    /// Skip every rejected resource instead of prompting
    #[arg(long)]
    non_interactive: bool,

    /// Include resources from "examples" directories
    #[arg(long)]
    include_examples: bool,

    /// Rewrite each resource's version to its package version
    #[arg(long)]
    rewrite_versions: bool,

    /// Generate ids from file names for resources that declare none
    #[arg(long)]
    generate_ids: bool,

    /// Prefix every id with the package name and version
    #[arg(long)]
    versioned_ids: bool,

    /// Resource types to drop from the upload (repeatable)
    #[arg(long = "exclude-resource-type", conflicts_with = "only")]
    exclude_resource_types: Vec<String>,

    /// Upload only these resource types (repeatable)
    #[arg(long)]
    only: Vec<String>,

    /// Write the log to this file in addition to stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli) {
        eprintln!("failed to initialize logging: {e:#}");
        std::process::exit(2);
    }
    match run(&cli) {
        Ok(report) => std::process::exit(report.exit_code()),
        Err(e) => {
            tracing::error!("{e:#}");
            std::process::exit(2);
        }
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log level")?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let file_layer = match &cli.log_file {
        Some(path) => {
            let file = fs::File::create(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

fn run(cli: &Cli) -> Result<RunReport> {
    tracing::info!(
        endpoint = %cli.endpoint,
        registry = %cli.registry_url,
        packages = %cli.packages.join(", "),
        get_dependencies = cli.get_dependencies,
        non_interactive = cli.non_interactive,
        "starting upload run"
    );

    let specs = cli
        .packages
        .iter()
        .map(|raw| PackageSpec::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;

    // Scratch space for downloads and extractions; removed on drop, whether
    // the run succeeds or dies on an error path.
    let scratch = tempfile::Builder::new()
        .prefix("fhir-populator")
        .tempdir()
        .context("cannot create temporary directory")?;
    let dirs = FetchDirs {
        download: scratch.path().join("download"),
        extract: scratch.path().join("extract"),
    };
    fs::create_dir_all(&dirs.download)?;
    fs::create_dir_all(&dirs.extract)?;
    tracing::debug!(path = %scratch.path().display(), "created scratch directory");

    let config = RegistryConfig::default()
        .with_base_url(&cli.registry_url)
        .with_auth_header(cli.authorization_header.clone());
    let registry = RegistryClient::with_config(config)?;
    let options = WalkOptions::default().with_transitive(cli.get_dependencies);
    let resolved = Walker::new(&registry, options).walk(&specs, &dirs)?;

    let order = resolved.graph.topo_order()?;
    tracing::info!(
        packages = order.len(),
        order = %order.join(", "),
        "resolved upload order"
    );

    let mut packages = Vec::with_capacity(order.len());
    for name in &order {
        let Some(fetched) = resolved.packages.get(name) else {
            continue;
        };
        let resources = scan_package(&fetched.root, cli.include_examples);
        tracing::info!(
            package = %name,
            version = %fetched.version,
            resources = resources.len(),
            "scanned package"
        );
        packages.push(PackageResources {
            name: fetched.name.clone(),
            version: fetched.version.clone(),
            resources,
        });
    }

    let plan_options = PlanOptions {
        filter: type_filter(cli),
        generate_ids: cli.generate_ids,
        versioned_ids: cli.versioned_ids,
        rewrite_versions: cli.rewrite_versions,
    };
    let units = build_plan(packages, &plan_options);
    tracing::info!(units = units.len(), "upload plan ready");

    let store = HttpStore::new(&cli.endpoint, cli.authorization_header.clone())
        .map_err(|e| anyhow::anyhow!("cannot create server client: {e}"))?;

    // Ctrl-C must not kill the process outright: the uploader aborts between
    // dispatches and unwinds normally, so the scratch directory is removed.
    let interrupt = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
        .context("cannot install interrupt handler")?;

    let report = if cli.non_interactive {
        Uploader::new(store, ScriptedDecider)
            .with_interrupt(Arc::clone(&interrupt))
            .run(&units)
    } else {
        let decider = prompt::ConsoleDecider::new()?;
        Uploader::new(store, decider)
            .with_interrupt(Arc::clone(&interrupt))
            .run(&units)
    };

    summarize(&report);
    Ok(report)
}

fn type_filter(cli: &Cli) -> TypeFilter {
    if !cli.only.is_empty() {
        TypeFilter::only(cli.only.clone())
    } else if !cli.exclude_resource_types.is_empty() {
        TypeFilter::exclude(cli.exclude_resource_types.clone())
    } else {
        TypeFilter::All
    }
}

fn summarize(report: &RunReport) {
    for skipped in &report.skipped {
        tracing::warn!(
            file = %skipped.file_name,
            resource_type = %skipped.resource_type,
            id = skipped.id.as_deref().unwrap_or("-"),
            rejection = %skipped.rejection,
            "resource was skipped"
        );
    }
    if let Some(reason) = report.aborted {
        tracing::error!(?reason, committed = report.committed, "upload aborted");
    } else {
        tracing::info!(
            committed = report.committed,
            skipped = report.skipped.len(),
            "UPLOAD COMPLETE"
        );
    }
}
