use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_api::{DeployApi, InProcDeployer, LogStatusSink};
use keel_apply::KubeNamespaces;
use keel_build::{BuildOrchestrator, BuildRequest};
use keel_core::{EngineConfig, ResourceNames, ServiceSpec, Source};
use keel_kubehub::Cluster;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel build-and-deploy CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the manifests a service spec renders to (no cluster access)
    Render {
        /// Service spec file (YAML or JSON); `-` reads stdin
        spec: PathBuf,
        /// Image to run; defaults to the build output or the managed kind's image
        #[arg(long)]
        image: Option<String>,
        /// External port for TCP-exposed managed services
        #[arg(long = "public-port")]
        public_port: Option<i32>,
    },
    /// Build and push the image of a git-sourced service
    Build {
        spec: PathBuf,
        /// Commit to build instead of the one pinned in the spec
        #[arg(long)]
        commit: Option<String>,
        /// Registry to push to
        #[arg(long, env = "KEEL_REGISTRY")]
        registry: Option<String>,
    },
    /// Build (if needed), render and reconcile a service
    Deploy { spec: PathBuf },
    /// Remove every object of a service
    Teardown {
        spec: PathBuf,
        /// Also delete persistent volume claims
        #[arg(long = "purge-storage", action = ArgAction::SetTrue)]
        purge_storage: bool,
    },
    /// Show the effective engine configuration
    Config,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_spec(path: &Path) -> Result<ServiceSpec> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading spec from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    // YAML is a superset of JSON, so one parser covers both.
    let spec: ServiceSpec = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    spec.validate().with_context(|| format!("invalid service spec {}", path.display()))?;
    Ok(spec)
}

async fn connect() -> Result<(Cluster, Arc<KubeNamespaces>)> {
    let client = keel_kubehub::get_kube_client().await.context("connecting to the cluster")?;
    Ok((Cluster::from_client(client.clone()), Arc::new(KubeNamespaces::new(client))))
}

fn default_image(spec: &ServiceSpec, config: &EngineConfig) -> String {
    match &spec.source {
        Source::Managed(m) => m.kind.image(&m.version),
        Source::Git(git) => {
            let names = ResourceNames::for_service(&spec.id);
            keel_build::image::image_reference(&config.build.registry, &names, git.commit.as_deref())
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command {
        Commands::Render { spec, image, public_port } => {
            let spec = load_spec(&spec)?;
            let image = image.unwrap_or_else(|| default_image(&spec, &config));
            let topology = keel_render::render(&spec, &image, public_port, &config.render)?;
            let manifests = topology.manifests()?;
            match cli.output {
                Output::Human => {
                    for m in &manifests {
                        println!("---");
                        print!("{}", serde_yaml::to_string(m)?);
                    }
                }
                Output::Json => print_json(&manifests)?,
            }
        }
        Commands::Build { spec, commit, registry } => {
            let spec = load_spec(&spec)?;
            let (cluster, _) = connect().await?;
            let orchestrator = BuildOrchestrator::new(cluster, config.build.clone());
            let mut req = BuildRequest::new(spec, registry.unwrap_or_else(|| config.build.registry.clone()));
            req.commit = commit;
            info!(service = %req.service.id, "build invoked");
            match orchestrator.run_build(&req).await {
                Ok(artifact) => match cli.output {
                    Output::Human => println!("built {} (job {}, {:.1}s)", artifact.image, artifact.job, artifact.elapsed.as_secs_f64()),
                    Output::Json => print_json(&artifact)?,
                },
                Err(e) => {
                    error!(job = %e.job, reason = e.failure.reason(), "build failed");
                    for log in &e.logs {
                        eprintln!("==> {}/{} <==\n{}", log.pod, log.container, log.text);
                    }
                    return Err(anyhow!(e));
                }
            }
        }
        Commands::Deploy { spec } => {
            let spec = load_spec(&spec)?;
            let (cluster, namespaces) = connect().await?;
            let deployer = InProcDeployer::new(cluster, namespaces, &config, Arc::new(LogStatusSink));
            match deployer.deploy(&spec).await {
                Ok(report) => match cli.output {
                    Output::Human => {
                        println!("{} running {} in {}", report.service, report.image, report.namespace);
                        if let Some(port) = report.public_port {
                            println!("  external port {}", port);
                        }
                        for o in &report.apply.outcomes {
                            println!("  {:<9} {}/{}", o.action.as_str(), o.kind.as_str(), o.name);
                        }
                        for w in &report.apply.warnings {
                            println!("  warning: {}", w);
                        }
                    }
                    Output::Json => print_json(&report)?,
                },
                Err(e) => {
                    if cli.output == Output::Json {
                        print_json(&e)?;
                    }
                    for log in &e.logs {
                        eprintln!("==> {}/{} <==\n{}", log.pod, log.container, log.text);
                    }
                    return Err(anyhow!(e).context(format!("deploying {}", spec.id)));
                }
            }
        }
        Commands::Teardown { spec, purge_storage } => {
            let spec = load_spec(&spec)?;
            let (cluster, namespaces) = connect().await?;
            let deployer = InProcDeployer::new(cluster, namespaces, &config, Arc::new(LogStatusSink));
            let report = deployer.teardown(&spec, purge_storage).await.map_err(|e| anyhow!(e))?;
            match cli.output {
                Output::Human => {
                    if report.deleted.is_empty() {
                        println!("nothing to delete for {}", spec.id);
                    }
                    for d in &report.deleted {
                        println!("deleted {}", d);
                    }
                }
                Output::Json => print_json(&report)?,
            }
        }
        Commands::Config => match cli.output {
            Output::Human => print!("{}", serde_yaml::to_string(&config)?),
            Output::Json => print_json(&config)?,
        },
    }
    Ok(())
}
