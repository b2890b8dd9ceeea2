mod build;
mod launch;
mod manifest;
mod plan;
mod process_env;
mod settings;

use crate::build::{audit_dockerfile, BuildError, BuildSystem, ProjectDetector};
use crate::launch::{exit, LaunchMode, LogDestination, RuntimeStatus, WorkerClass};
use crate::manifest::DependencyManifest;
use crate::plan::Profile;
use crate::settings::Settings;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use estaleiro_probe::{HealthStatus, HttpProbe};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "estaleiro",
    version,
    about = "estaleiro: build de imagem e bootstrap de runtime para apps Django/gunicorn"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Mostra o Dockerfile que o build geraria
    Plan(PlanArgs),
    /// Procura lacunas de configuração no plano ou num Dockerfile existente
    Audit(AuditArgs),
    /// Constrói a imagem com o Docker
    Build(BuildArgs),
    /// Inicia e supervisiona o servidor (processo principal do contêiner)
    Launch(LaunchArgs),
    /// Verifica uma vez se o servidor responde (0 saudável, 1 não)
    Probe(ProbeArgs),
    /// Lista os perfis de build
    Profiles,
    /// Mostra o estado salvo por `launch --state-file`
    Status {
        #[arg(long, default_value = ".estaleiro/runtime.json")]
        state_file: PathBuf,
    },
}

#[derive(Debug, Args)]
struct ProjectArgs {
    /// Raiz do projeto (contexto do build)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[arg(long, value_enum)]
    profile: Option<Profile>,

    /// Imagem base (ex.: python:3.12-slim)
    #[arg(long)]
    base_image: Option<String>,

    /// Manifesto de dependências, relativo à raiz
    #[arg(long)]
    manifest: Option<String>,

    /// Entry point WSGI (`pacote.wsgi:application`)
    #[arg(long)]
    app: Option<String>,
}

impl ProjectArgs {
    fn build_config(&self) -> anyhow::Result<build::BuildConfig> {
        let settings = Settings::load(&self.root)?;
        let mut config = settings.build_config(&self.root);
        if let Some(profile) = self.profile {
            config.plan.profile = profile;
        }
        if let Some(base_image) = &self.base_image {
            config.plan.base_image = base_image.clone();
        }
        if let Some(manifest) = &self.manifest {
            config.plan.manifest = manifest.clone();
        }
        if let Some(app) = &self.app {
            config.app = Some(app.clone());
        }
        Ok(config)
    }
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[command(flatten)]
    project: ProjectArgs,

    /// Imprime as chaves de cache por camada em vez do Dockerfile
    #[arg(long)]
    keys: bool,

    /// Também grava o Dockerfile neste caminho
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct AuditArgs {
    #[command(flatten)]
    project: ProjectArgs,

    /// Audita este Dockerfile em vez do plano
    #[arg(long)]
    dockerfile: Option<PathBuf>,

    /// Saída em JSON
    #[arg(long)]
    json: bool,

    /// Sai com 1 se houver qualquer lacuna
    #[arg(long)]
    strict: bool,
}

#[derive(Debug, Args)]
struct BuildArgs {
    #[command(flatten)]
    project: ProjectArgs,

    #[arg(long)]
    tag: Option<String>,

    /// Imagem usada como fonte de cache (perfil cache-image)
    #[arg(long)]
    cache_from: Option<String>,

    /// Lacunas da auditoria abortam o build
    #[arg(long)]
    strict: bool,
}

#[derive(Debug, Args)]
struct LaunchArgs {
    /// Diretório com o `estaleiro.toml` opcional
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[arg(long)]
    app: Option<String>,

    #[arg(long, env = "ESTALEIRO_HOST")]
    host: Option<String>,

    #[arg(long, env = "PORT")]
    port: Option<u16>,

    #[arg(long, env = "WEB_CONCURRENCY")]
    workers: Option<u32>,

    #[arg(long, value_enum)]
    worker_class: Option<WorkerClass>,

    #[arg(long)]
    threads: Option<u32>,

    /// Segundos até um request ser abortado
    #[arg(long)]
    timeout: Option<u64>,

    /// Segundos entre SIGTERM e SIGKILL no shutdown
    #[arg(long)]
    graceful_timeout: Option<u64>,

    /// `-` para stdout ou caminho de arquivo
    #[arg(long)]
    access_log: Option<LogDestination>,

    /// `-` para stderr ou caminho de arquivo
    #[arg(long)]
    error_log: Option<LogDestination>,

    #[arg(long, value_enum, env = "ESTALEIRO_MODE")]
    mode: Option<LaunchMode>,

    /// Grava fase, pids e restarts em JSON
    #[arg(long, env = "ESTALEIRO_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Recusa iniciar com uid efetivo 0
    #[arg(long)]
    require_non_root: bool,

    /// Sonda HTTP interna com a política `[health]`
    #[arg(long)]
    self_probe: bool,
}

impl LaunchArgs {
    fn runtime_config(&self) -> anyhow::Result<launch::RuntimeConfig> {
        let settings = Settings::load(&self.root)?;
        let mut config = settings.runtime_config();

        if let Some(app) = &self.app {
            config.wsgi_app = app.clone();
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(worker_class) = self.worker_class {
            config.worker_class = worker_class;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(graceful_timeout) = self.graceful_timeout {
            config.graceful_timeout = graceful_timeout;
        }
        if let Some(access_log) = &self.access_log {
            config.access_log = access_log.clone();
        }
        if let Some(error_log) = &self.error_log {
            config.error_log = error_log.clone();
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if self.state_file.is_some() {
            config.state_file = self.state_file.clone();
        }
        if self.require_non_root {
            config.require_non_root = true;
        }
        if self.self_probe && config.self_probe.is_none() {
            config.self_probe = Some(settings.health.clone());
        }
        Ok(config)
    }
}

#[derive(Debug, Args)]
struct ProbeArgs {
    /// URL completa; sem ela `http://127.0.0.1:<port>/`
    #[arg(long)]
    url: Option<String>,

    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Timeout da verificação, em segundos
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Repete conforme a política `[health]` até um veredito
    #[arg(long)]
    wait: bool,

    #[arg(long, default_value = ".")]
    root: PathBuf,
}

fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Logs vão para stderr; stdout fica para Dockerfiles e relatórios
fn init_tracing() {
    let filter = EnvFilter::try_from_env("ESTALEIRO_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    if env_bool("ESTALEIRO_LOG_JSON") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM recebido"),
                _ = sigint.recv() => tracing::info!("SIGINT recebido"),
            }
        }
        _ => {
            tracing::warn!("falha ao registrar handlers de sinal; usando ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn tokio_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Falha ao iniciar runtime tokio")
}

fn plan(args: PlanArgs) -> anyhow::Result<i32> {
    let system = BuildSystem::new(args.project.build_config()?)?;
    let prepared = system.prepare()?;

    if args.keys {
        for key in &prepared.layer_keys {
            println!("{}  {:<8} {}", &key.key[..12], key.stage, key.instruction);
        }
    } else {
        print!("{}", prepared.plan.render());
    }

    if let Some(output) = args.output {
        std::fs::write(&output, prepared.plan.render())
            .with_context(|| format!("Falha ao gravar {}", output.display()))?;
        eprintln!("✅ Dockerfile gravado em {}", output.display());
    }
    Ok(0)
}

fn audit(args: AuditArgs) -> anyhow::Result<i32> {
    let config = args.project.build_config()?;
    let report = match &args.dockerfile {
        Some(path) => {
            let project = ProjectDetector::new(&config.project_root)?
                .with_manifest(&config.plan.manifest)
                .detect()?;
            let manifest = DependencyManifest::load(&project.manifest_path).ok();
            audit_dockerfile(path, &project, manifest.as_ref()).map_err(BuildError::from)?
        }
        None => BuildSystem::new(config)?.audit()?,
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Falha ao serializar relatório")?
        );
    } else {
        report.print_summary();
    }

    Ok(if args.strict && !report.is_clean() { 1 } else { 0 })
}

fn build(args: BuildArgs) -> anyhow::Result<i32> {
    let mut config = args.project.build_config()?;
    if args.tag.is_some() {
        config.tag = args.tag;
    }
    if args.cache_from.is_some() {
        config.cache_from = args.cache_from;
    }
    config.strict |= args.strict;

    let system = BuildSystem::new(config)?;
    match system.build() {
        Ok(artifacts) => {
            artifacts.print_summary();
            Ok(0)
        }
        Err(BuildError::StepFailed { step, code, tail }) => {
            let step = step
                .map(|s| s.to_string())
                .unwrap_or_else(|| "desconhecido".to_string());
            eprintln!("❌ Passo '{}' falhou (código {}); nenhuma imagem foi marcada", step, code);
            for line in tail {
                eprintln!("   {}", line);
            }
            Ok(if code == 0 { 1 } else { code })
        }
        Err(err) => Err(err.into()),
    }
}

fn launch_server(args: LaunchArgs) -> i32 {
    let config = match args.runtime_config() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("{:#}", err);
            return exit::INVALID_CONFIG;
        }
    };

    let runtime = match tokio_runtime() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("{:#}", err);
            return 1;
        }
    };

    match runtime.block_on(launch::launch(config, wait_for_shutdown_signal())) {
        Ok(code) => {
            tracing::info!(code, "launcher encerrado");
            code
        }
        Err(err) => {
            tracing::error!("{}", err);
            err.exit_code()
        }
    }
}

fn probe(args: ProbeArgs) -> anyhow::Result<i32> {
    let timeout = Duration::from_secs(args.timeout.max(1));
    let probe = match args.url {
        Some(url) => HttpProbe::new(url, timeout)?,
        None => HttpProbe::for_port("127.0.0.1", args.port, timeout)?,
    };

    let runtime = tokio_runtime()?;
    if args.wait {
        let mut policy = Settings::load(&args.root)?.health;
        policy.timeout = timeout;
        let verdict = runtime.block_on(estaleiro_probe::wait_for_verdict(&probe, &policy));
        println!(
            "{} {} após {} verificação(ões) em {:?}",
            probe.url(),
            verdict.status,
            verdict.checks,
            verdict.elapsed
        );
        return Ok(if verdict.status == HealthStatus::Healthy { 0 } else { 1 });
    }

    let policy = estaleiro_probe::HealthPolicy {
        timeout,
        ..Default::default()
    };
    let outcome = runtime.block_on(estaleiro_probe::check_once(&probe, &policy));
    match outcome {
        estaleiro_probe::ProbeOutcome::Success { status, elapsed } => {
            println!("✅ {} respondeu {} em {:?}", probe.url(), status, elapsed);
            Ok(0)
        }
        estaleiro_probe::ProbeOutcome::Failure { reason } => {
            println!("❌ {} falhou: {}", probe.url(), reason);
            Ok(1)
        }
    }
}

fn profiles() -> i32 {
    println!("Perfis de build:");
    for profile in Profile::ALL {
        let default = if profile == Profile::default() { " (padrão)" } else { "" };
        let label = format!("{profile}{default}");
        println!("- {:<22} {}", label, profile.description());
        let features = profile
            .features()
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>();
        if !features.is_empty() {
            println!("  {}", features.join(", "));
        }
    }
    0
}

fn status(state_file: PathBuf) -> anyhow::Result<i32> {
    let status = RuntimeStatus::load(&state_file)?;
    status.print_summary();
    Ok(0)
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Plan(args) => plan(args),
        Command::Audit(args) => audit(args),
        Command::Build(args) => build(args),
        Command::Launch(args) => Ok(launch_server(args)),
        Command::Probe(args) => probe(args),
        Command::Profiles => Ok(profiles()),
        Command::Status { state_file } => status(state_file),
    }
}

fn main() {
    init_tracing();

    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("❌ {:#}", err);
            1
        }
    };
    std::process::exit(code);
}
