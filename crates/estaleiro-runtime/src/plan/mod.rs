//! Plano de build da imagem
//!
//! O pipeline é linear e sempre na mesma ordem:
//! 1. Imagem base fixada por versão
//! 2. Ambiente de build (`ARG`/`ENV`/`WORKDIR`)
//! 3. Pacotes do sistema
//! 4. Dependências, a partir do manifesto copiado sozinho
//! 5. Código da aplicação
//! 6. Geração dos estáticos
//! 7. Usuário sem privilégios (opcional)
//! 8. Porta exposta, HEALTHCHECK e comando de launch
//!
//! O perfil decide quais passos opcionais entram; o plano é puro e pode ser
//! renderizado, auditado e ter as chaves de cache calculadas sem Docker.

pub mod cache;
pub mod ignore;
pub mod profile;
pub mod render;

pub use cache::{dependency_digest, layer_keys, source_digest, CacheInputs, LayerKey};
pub use ignore::IgnoreList;
pub use profile::{Feature, Profile};

use crate::launch::{container_command, shell_quote, RuntimeConfig};
use crate::process_env::ProcessEnv;
use estaleiro_probe::HealthPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEPS_STAGE: &str = "deps";
pub const RUNTIME_STAGE: &str = "runtime";
const WHEEL_DIR: &str = "/wheels";

/// Quem é o processo principal do contêiner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LauncherKind {
    /// `gunicorn` direto, via `sh -c` para expandir `PORT`/`WEB_CONCURRENCY`
    #[default]
    Gunicorn,
    /// `estaleiro launch`, copiado de uma imagem que contém o binário
    Estaleiro { image: String },
}

/// Entradas do plano
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub profile: Profile,
    pub base_image: String,
    /// Pacotes para compilar extensões nativas
    pub build_packages: Vec<String>,
    /// Bibliotecas de runtime (só no estágio final do `cache-image`)
    pub runtime_packages: Vec<String>,
    /// Caminho do manifesto, relativo à raiz
    pub manifest: String,
    /// O que mais o `pip install` lê (`-r`, `-c`, caminhos locais), relativo à raiz
    pub install_inputs: Vec<String>,
    pub workdir: String,
    pub user: String,
    pub uid: u32,
    pub settings_module: Option<String>,
    /// Variáveis só do passo de estáticos (não persistem na imagem)
    pub static_env: Vec<(String, String)>,
    pub process_env: ProcessEnv,
    pub runtime: RuntimeConfig,
    pub health: HealthPolicy,
    pub launcher: LauncherKind,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            base_image: "python:3.12-slim".to_string(),
            build_packages: vec![
                "build-essential".to_string(),
                "libpq-dev".to_string(),
                "libjpeg-dev".to_string(),
                "zlib1g-dev".to_string(),
            ],
            runtime_packages: vec![
                "libpq5".to_string(),
                "libjpeg62-turbo".to_string(),
                "zlib1g".to_string(),
            ],
            manifest: "requirements.txt".to_string(),
            install_inputs: Vec::new(),
            workdir: "/app".to_string(),
            user: "app".to_string(),
            uid: 1000,
            settings_module: None,
            static_env: vec![(
                "SECRET_KEY".to_string(),
                "estaleiro-collectstatic-placeholder".to_string(),
            )],
            process_env: ProcessEnv::default(),
            runtime: RuntimeConfig::default(),
            health: HealthPolicy::default(),
            launcher: LauncherKind::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    SelectBase,
    SetBuildEnv,
    InstallSystemPackages,
    InstallDependencies,
    CopySource,
    CollectStatic,
    CreateIdentity,
    Expose,
    Healthcheck,
    Launch,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepKind::SelectBase => "imagem base",
            StepKind::SetBuildEnv => "ambiente de build",
            StepKind::InstallSystemPackages => "pacotes do sistema",
            StepKind::InstallDependencies => "dependências",
            StepKind::CopySource => "código da aplicação",
            StepKind::CollectStatic => "arquivos estáticos",
            StepKind::CreateIdentity => "usuário sem privilégios",
            StepKind::Expose => "porta",
            StepKind::Healthcheck => "healthcheck",
            StepKind::Launch => "launch",
        };
        write!(f, "{label}")
    }
}

/// De onde vem o conteúdo que um `COPY` traz para a camada
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Content {
    None,
    Manifest,
    SourceTree,
    Stage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub keyword: String,
    pub args: String,
    pub content: Content,
}

impl Instruction {
    fn new(keyword: &str, args: impl Into<String>) -> Self {
        Self {
            keyword: keyword.to_string(),
            args: args.into(),
            content: Content::None,
        }
    }

    fn copying(keyword: &str, args: impl Into<String>, content: Content) -> Self {
        Self {
            content,
            ..Self::new(keyword, args)
        }
    }

    pub fn line(&self) -> String {
        format!("{} {}", self.keyword, self.args)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub kind: StepKind,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Stage {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
        }
    }

    fn push(&mut self, kind: StepKind, instructions: Vec<Instruction>) {
        if !instructions.is_empty() {
            self.steps.push(Step { kind, instructions });
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildPlan {
    pub profile: Profile,
    pub stages: Vec<Stage>,
    #[serde(skip)]
    pub ignore: Option<IgnoreList>,
}

impl BuildPlan {
    pub fn new(options: &PlanOptions) -> Self {
        let profile = options.profile;
        let mut stages = Vec::new();

        if profile.has(Feature::DepsStage) {
            stages.push(deps_stage(options));
        }
        stages.push(runtime_stage(options));

        let ignore = profile.has(Feature::IgnoreList).then(IgnoreList::defaults);

        Self {
            profile,
            stages,
            ignore,
        }
    }

    /// Estágio que vira a imagem final
    pub fn final_stage(&self) -> Option<&Stage> {
        self.stages.last()
    }

    /// Passos na ordem em que o builder executa
    pub fn steps(&self) -> impl Iterator<Item = (&Stage, &Step)> {
        self.stages
            .iter()
            .flat_map(|stage| stage.steps.iter().map(move |step| (stage, step)))
    }

    pub fn has_step(&self, kind: StepKind) -> bool {
        self.steps().any(|(_, step)| step.kind == kind)
    }

    /// Passos do estágio final, sem repetição
    pub fn step_kinds(&self) -> Vec<StepKind> {
        self.final_stage()
            .map(|stage| stage.steps.iter().map(|s| s.kind).collect())
            .unwrap_or_default()
    }

    pub fn render(&self) -> String {
        render::dockerfile(self)
    }

    /// SHA-256 do Dockerfile e da ignore list renderados
    pub fn digest(&self) -> String {
        let mut text = self.render();
        if let Some(ignore) = &self.ignore {
            text.push_str("\n# dockerignore\n");
            text.push_str(&ignore.render());
        }
        crate::manifest::sha256_hex(text.as_bytes())
    }
}

fn deps_stage(options: &PlanOptions) -> Stage {
    let mut stage = Stage::new(DEPS_STAGE);
    stage.push(
        StepKind::SelectBase,
        vec![Instruction::new(
            "FROM",
            format!("{} AS {}", options.base_image, DEPS_STAGE),
        )],
    );
    stage.push(StepKind::SetBuildEnv, build_env(options));
    stage.push(
        StepKind::InstallSystemPackages,
        vec![apt_install(&options.build_packages, true)],
    );
    let mut install = copy_manifest(options);
    install.push(Instruction::new(
        "RUN",
        format!(
            "pip wheel --no-cache-dir --wheel-dir {} -r {}",
            WHEEL_DIR, options.manifest
        ),
    ));
    stage.push(StepKind::InstallDependencies, install);
    stage
}

fn runtime_stage(options: &PlanOptions) -> Stage {
    let profile = options.profile;
    let purge = profile.has(Feature::PurgePackageCache);
    let deps_stage = profile.has(Feature::DepsStage);

    let mut stage = Stage::new(RUNTIME_STAGE);
    let from = if deps_stage {
        format!("{} AS {}", options.base_image, RUNTIME_STAGE)
    } else {
        options.base_image.clone()
    };
    stage.push(StepKind::SelectBase, vec![Instruction::new("FROM", from)]);
    stage.push(StepKind::SetBuildEnv, build_env(options));

    // Com estágio de wheels o runtime só precisa das bibliotecas compartilhadas
    let packages = if deps_stage {
        &options.runtime_packages
    } else {
        &options.build_packages
    };
    if !packages.is_empty() {
        stage.push(
            StepKind::InstallSystemPackages,
            vec![apt_install(packages, purge)],
        );
    }

    let manifest = &options.manifest;
    let install = if deps_stage {
        let mut install = vec![Instruction::copying(
            "COPY",
            format!("--from={} {} {}", DEPS_STAGE, WHEEL_DIR, WHEEL_DIR),
            Content::Stage(DEPS_STAGE.to_string()),
        )];
        install.extend(copy_manifest(options));
        install.push(Instruction::new(
            "RUN",
            format!(
                "pip install --no-cache-dir --no-index --find-links={} -r {} && rm -rf {}",
                WHEEL_DIR, manifest, WHEEL_DIR
            ),
        ));
        install
    } else {
        let cache_flag = if purge { " --no-cache-dir" } else { "" };
        let mut install = copy_manifest(options);
        install.push(Instruction::new(
            "RUN",
            format!("pip install{} -r {}", cache_flag, manifest),
        ));
        install
    };
    stage.push(StepKind::InstallDependencies, install);

    stage.push(
        StepKind::CopySource,
        vec![Instruction::copying("COPY", ". .", Content::SourceTree)],
    );
    stage.push(
        StepKind::CollectStatic,
        vec![Instruction::new("RUN", collectstatic(options))],
    );

    if profile.has(Feature::NonRootIdentity) {
        stage.push(
            StepKind::CreateIdentity,
            vec![
                Instruction::new(
                    "RUN",
                    format!(
                        "groupadd --system --gid {uid} {user} && \
                         useradd --system --uid {uid} --gid {user} --home-dir {dir} --no-create-home {user} && \
                         chown -R {user}:{user} {dir}",
                        uid = options.uid,
                        user = options.user,
                        dir = options.workdir
                    ),
                ),
                Instruction::new("USER", format!("{}:{}", options.user, options.user)),
            ],
        );
    }

    let mut expose = vec![Instruction::new("EXPOSE", options.runtime.port.to_string())];
    if let LauncherKind::Estaleiro { .. } = options.launcher {
        expose.push(Instruction::new(
            "ENV",
            format!(
                "PORT={} WEB_CONCURRENCY={}",
                options.runtime.port, options.runtime.workers
            ),
        ));
    }
    stage.push(StepKind::Expose, expose);

    if profile.has(Feature::Healthcheck) {
        stage.push(StepKind::Healthcheck, vec![healthcheck(options)]);
    }

    stage.push(StepKind::Launch, launch(options));
    stage
}

fn build_env(options: &PlanOptions) -> Vec<Instruction> {
    let mut instructions: Vec<Instruction> = options
        .process_env
        .build_only_vars()
        .into_iter()
        .map(|(k, v)| Instruction::new("ARG", format!("{k}={v}")))
        .collect();

    let runtime_vars = options.process_env.runtime_vars();
    if !runtime_vars.is_empty() {
        let assignments = runtime_vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        instructions.push(Instruction::new("ENV", assignments));
    }

    instructions.push(Instruction::new("WORKDIR", options.workdir.clone()));
    instructions
}

fn apt_install(packages: &[String], purge: bool) -> Instruction {
    let mut command = format!(
        "apt-get update && apt-get install -y --no-install-recommends {}",
        packages.join(" ")
    );
    if purge {
        command.push_str(" && rm -rf /var/lib/apt/lists/*");
    }
    Instruction::new("RUN", command)
}

/// Manifesto e tudo o que ele referencia, nos mesmos caminhos relativos do
/// projeto para que `-r` e caminhos locais resolvam igual dentro da imagem
fn copy_manifest(options: &PlanOptions) -> Vec<Instruction> {
    std::iter::once(&options.manifest)
        .chain(options.install_inputs.iter().filter(|p| **p != options.manifest))
        .map(|path| {
            let destination = if path.contains('/') || *path == "." {
                path.as_str()
            } else {
                "."
            };
            Instruction::copying(
                "COPY",
                format!("{} {}", path, destination),
                Content::Manifest,
            )
        })
        .collect()
}

fn collectstatic(options: &PlanOptions) -> String {
    let mut env: Vec<String> = options
        .static_env
        .iter()
        .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
        .collect();
    if let Some(module) = &options.settings_module {
        env.push(format!("DJANGO_SETTINGS_MODULE={}", shell_quote(module)));
    }

    let mut command = env;
    command.push("python manage.py collectstatic --noinput".to_string());
    command.join(" ")
}

fn healthcheck(options: &PlanOptions) -> Instruction {
    let health = &options.health;
    // http.client não segue redirects: um 301 para https conta como vivo,
    // a mesma regra da verificação HTTP do launcher
    let script = format!(
        "import os, sys, http.client; \
         c = http.client.HTTPConnection('127.0.0.1', int(os.environ.get('PORT', '{port}')), timeout={timeout}); \
         c.request('GET', '/'); \
         sys.exit(0 if c.getresponse().status < 400 else 1)",
        port = options.runtime.port,
        timeout = health.timeout.as_secs().max(1)
    );
    Instruction::new(
        "HEALTHCHECK",
        format!(
            "--interval={}s --timeout={}s --start-period={}s --retries={} CMD python -c \"{}\"",
            health.interval.as_secs(),
            health.timeout.as_secs(),
            health.start_period.as_secs(),
            health.retries,
            script
        ),
    )
}

fn launch(options: &PlanOptions) -> Vec<Instruction> {
    match &options.launcher {
        LauncherKind::Gunicorn => vec![Instruction::new(
            "CMD",
            json_array(&container_command(&options.runtime)),
        )],
        LauncherKind::Estaleiro { image } => {
            let runtime = &options.runtime;
            let mut argv = vec![
                "estaleiro".to_string(),
                "launch".to_string(),
                "--app".to_string(),
                runtime.wsgi_app.clone(),
                "--host".to_string(),
                runtime.host.clone(),
                "--worker-class".to_string(),
                runtime.worker_class.to_string(),
                "--threads".to_string(),
                runtime.threads.to_string(),
                "--timeout".to_string(),
                runtime.timeout.to_string(),
                "--graceful-timeout".to_string(),
                runtime.graceful_timeout.to_string(),
                "--access-log".to_string(),
                runtime.access_log.to_string(),
                "--error-log".to_string(),
                runtime.error_log.to_string(),
                "--mode".to_string(),
                runtime.mode.to_string(),
            ];
            if let Some(path) = &runtime.state_file {
                argv.push("--state-file".to_string());
                argv.push(path.display().to_string());
            }
            if options.profile.has(Feature::NonRootIdentity) {
                argv.push("--require-non-root".to_string());
            }
            vec![
                Instruction::copying(
                    "COPY",
                    format!("--from={} /usr/local/bin/estaleiro /usr/local/bin/estaleiro", image),
                    Content::Stage(image.clone()),
                ),
                Instruction::new("CMD", json_array(&argv)),
            ]
        }
    }
}

/// Forma exec do Dockerfile (array JSON)
fn json_array(argv: &[String]) -> String {
    serde_json::to_string(argv).unwrap_or_else(|_| "[]".to_string())
}
