//! Sistema de build de imagens para projetos Django
//!
//! Este módulo implementa o pipeline completo:
//! 1. Detecção do projeto (manage.py, settings, manifesto, WSGI)
//! 2. Preflight: problemas que tornam o build impossível
//! 3. Plano do perfil escolhido e auditoria de lacunas
//! 4. Chaves de cache por camada
//! 5. Execução no builder de imagens
//! 6. Metadados do build

mod artifacts;
pub mod audit;
mod docker;
mod preflight;
mod project;

pub use artifacts::{BuildArtifacts, BuildMetadata, LayerKeyRecord};
pub use audit::{audit_dockerfile, audit_plan, AuditError, AuditReport};
pub use docker::{BuildRequest, DockerImageBuilder, ImageBuilder};
pub use preflight::{Preflight, PreflightIssue};
pub use project::{ProjectDetector, ProjectInfo};

use crate::manifest::DependencyManifest;
use crate::plan::{
    dependency_digest, layer_keys, BuildPlan, CacheInputs, Feature, IgnoreList, LayerKey,
    PlanOptions, StepKind,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Diretório de trabalho dentro do projeto
pub const WORK_DIR: &str = ".estaleiro";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("projeto não encontrado em {path}: {source}")]
    ProjectNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("preflight falhou: {}", format_issues(.0))]
    Preflight(Vec<PreflightIssue>),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("auditoria em modo estrito: {}", .0.join(", "))]
    StrictAudit(Vec<&'static str>),

    #[error("'{tool}' não está disponível: {source}")]
    ToolUnavailable {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("passo '{}' falhou com código {code}", step.map(|s| s.to_string()).unwrap_or_else(|| "desconhecido".to_string()))]
    StepFailed {
        step: Option<StepKind>,
        code: i32,
        tail: Vec<String>,
    },

    #[error("falha ao salvar metadados: {0:#}")]
    Metadata(anyhow::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn format_issues(issues: &[PreflightIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Configuração do processo de build
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Diretório raiz do projeto (contexto do build)
    pub project_root: PathBuf,

    /// Perfil, imagem base, pacotes e configuração de runtime
    pub plan: PlanOptions,

    /// Entry point WSGI explícito; sem ele vale o detectado
    pub app: Option<String>,

    /// Tag da imagem; sem ela `<projeto>:<chave da última camada>`
    pub tag: Option<String>,

    /// Imagem usada como fonte de cache (`--cache-from`)
    pub cache_from: Option<String>,

    /// Lacunas da auditoria abortam o build
    pub strict: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            plan: PlanOptions::default(),
            app: None,
            tag: None,
            cache_from: None,
            strict: false,
        }
    }
}

/// Tudo o que o build precisa, calculado sem tocar no Docker
#[derive(Debug)]
pub struct PreparedBuild {
    pub project: ProjectInfo,
    pub manifest: DependencyManifest,
    pub plan: BuildPlan,
    pub audit: AuditReport,
    pub inputs: CacheInputs,
    pub layer_keys: Vec<LayerKey>,
    pub tag: String,
}

/// Sistema central de build de imagens
pub struct BuildSystem<B: ImageBuilder = DockerImageBuilder> {
    config: BuildConfig,
    detector: ProjectDetector,
    builder: B,
}

impl BuildSystem<DockerImageBuilder> {
    /// Cria um novo sistema de build com o executor do Docker
    pub fn new(config: BuildConfig) -> Result<Self, BuildError> {
        let detector =
            ProjectDetector::new(&config.project_root)?.with_manifest(&config.plan.manifest);
        let builder = DockerImageBuilder::new(&detector.root().join(WORK_DIR));
        Ok(Self {
            config,
            detector,
            builder,
        })
    }
}

impl<B: ImageBuilder> BuildSystem<B> {
    pub fn with_builder(config: BuildConfig, builder: B) -> Result<Self, BuildError> {
        let detector =
            ProjectDetector::new(&config.project_root)?.with_manifest(&config.plan.manifest);
        Ok(Self {
            config,
            detector,
            builder,
        })
    }

    pub fn work_dir(&self) -> PathBuf {
        self.detector.root().join(WORK_DIR)
    }

    /// Opções do plano com o que foi detectado no projeto
    fn plan_options(&self, project: &ProjectInfo, install_inputs: &[String]) -> PlanOptions {
        let mut options = self.config.plan.clone();
        if options.settings_module.is_none() {
            options.settings_module = project.settings_module.clone();
        }
        if let Some(app) = self.config.app.clone().or_else(|| project.wsgi_app.clone()) {
            options.runtime.wsgi_app = app;
        }
        options.manifest = project.manifest_relative();
        options.install_inputs = install_inputs.to_vec();
        options
    }

    /// Plano com a ignore list do projeto incorporada
    fn plan_for(
        &self,
        project: &ProjectInfo,
        install_inputs: &[String],
    ) -> Result<BuildPlan, BuildError> {
        let mut plan = BuildPlan::new(&self.plan_options(project, install_inputs));
        if let Some(ignore) = plan.ignore.take() {
            plan.ignore = Some(ignore.with_project_file(&project.root_dir)?);
        }
        Ok(plan)
    }

    /// Auditoria do plano sem exigir preflight aprovado
    pub fn audit(&self) -> Result<AuditReport, BuildError> {
        let project = self.detector.detect()?;
        let manifest = DependencyManifest::load(&project.manifest_path).ok();
        let install_inputs = manifest
            .as_ref()
            .map(|m| m.install_inputs(&project.root_dir).inside)
            .unwrap_or_default();
        let plan = self.plan_for(&project, &install_inputs)?;
        Ok(audit_plan(
            &plan,
            &project,
            manifest.as_ref(),
            &self.config.plan.base_image,
        )?)
    }

    /// Detecta, valida, planeja, audita e calcula as chaves de cache
    pub fn prepare(&self) -> Result<PreparedBuild, BuildError> {
        let project = self.detector.detect()?;
        tracing::debug!(root = %project.root_dir.display(), settings = ?project.settings_module, "projeto detectado");

        let preflight = Preflight::check(
            &project,
            &self.config.plan.base_image,
            Some(&self.config.plan.runtime.server),
        )?;
        let manifest = preflight.manifest;

        let plan = self.plan_for(&project, &preflight.install_inputs)?;
        let audit = audit_plan(&plan, &project, Some(&manifest), &self.config.plan.base_image)?;
        for finding in &audit.findings {
            tracing::warn!(gap = finding.id, severity = %finding.severity, "{}", finding.message);
        }
        if self.config.strict && !audit.is_clean() {
            return Err(BuildError::StrictAudit(audit.ids()));
        }

        // Sem ignore list no plano, o Docker usa o .dockerignore da raiz
        let context_ignore = match &plan.ignore {
            Some(list) => Some(list.clone()),
            None => read_project_ignore(&project.root_dir)?,
        };
        let dependencies = dependency_digest(
            &project.root_dir,
            manifest.digest(),
            &preflight.install_inputs,
            context_ignore.as_ref(),
        )?;
        let inputs = CacheInputs::compute(&project.root_dir, dependencies, context_ignore.as_ref())?;
        let keys = layer_keys(&plan, &inputs);

        let tag = match &self.config.tag {
            Some(tag) => tag.clone(),
            None => default_tag(&project, &keys),
        };

        Ok(PreparedBuild {
            project,
            manifest,
            plan,
            audit,
            inputs,
            layer_keys: keys,
            tag,
        })
    }

    /// Escreve Dockerfile e ignore list em `.estaleiro/`
    pub fn write_context(
        &self,
        prepared: &PreparedBuild,
    ) -> Result<(PathBuf, Option<PathBuf>), BuildError> {
        let work_dir = self.work_dir();
        fs::create_dir_all(&work_dir)?;

        let dockerfile = work_dir.join("Dockerfile");
        fs::write(&dockerfile, prepared.plan.render())?;

        // O BuildKit prefere `<Dockerfile>.dockerignore` ao da raiz
        let ignore_path = work_dir.join("Dockerfile.dockerignore");
        match &prepared.plan.ignore {
            Some(ignore) => {
                fs::write(&ignore_path, ignore.render())?;
                Ok((dockerfile, Some(ignore_path)))
            }
            None => {
                if ignore_path.exists() {
                    fs::remove_file(&ignore_path)?;
                }
                Ok((dockerfile, None))
            }
        }
    }

    /// Executa o build completo da imagem
    pub fn build(&self) -> Result<BuildArtifacts, BuildError> {
        println!("🔍 Detectando projeto Django...");
        let prepared = self.prepare()?;
        println!(
            "✅ Projeto detectado: {} ({} dependências)",
            prepared.project.name(),
            prepared.manifest.len()
        );
        if !prepared.audit.is_clean() {
            println!(
                "⚠️  {} lacuna(s) de configuração: {}",
                prepared.audit.findings.len(),
                prepared.audit.ids().join(", ")
            );
        }

        println!("\n📝 Renderizando plano (perfil {})...", prepared.plan.profile);
        let (dockerfile, ignore_path) = self.write_context(&prepared)?;
        println!("✅ Dockerfile: {}", dockerfile.display());

        let cache_from = self
            .config
            .cache_from
            .as_deref()
            .filter(|_| prepared.plan.profile.has(Feature::CacheFrom));
        if self.config.cache_from.is_some() && cache_from.is_none() {
            tracing::warn!(profile = %prepared.plan.profile, "--cache-from só vale no perfil cache-image; ignorado");
        }

        println!("\n🔨 Construindo {}...", prepared.tag);
        let request = BuildRequest {
            context: &prepared.project.root_dir,
            dockerfile: &dockerfile,
            tag: &prepared.tag,
            cache_from,
            plan: &prepared.plan,
        };
        let image = self.builder.build(&request)?;
        println!("✅ Imagem construída");

        let mut metadata = BuildMetadata::new(prepared.tag.clone(), prepared.plan.profile);
        metadata.image_id = image.image_id;
        metadata.plan_digest = prepared.plan.digest();
        metadata.manifest_digest = prepared.inputs.manifest_digest.clone();
        metadata.source_digest = prepared.inputs.source_digest.clone();
        metadata.layer_keys = prepared.layer_keys.iter().map(LayerKeyRecord::from).collect();

        let artifacts = BuildArtifacts {
            dockerfile_path: dockerfile,
            ignore_path,
            metadata,
        };
        artifacts
            .save(&self.work_dir())
            .map_err(BuildError::Metadata)?;

        println!("\n🎉 Build concluído com sucesso!");
        Ok(artifacts)
    }
}

fn read_project_ignore(root: &Path) -> Result<Option<IgnoreList>, BuildError> {
    let path = root.join(".dockerignore");
    if !path.is_file() {
        return Ok(None);
    }
    Ok(Some(IgnoreList::parse(&fs::read_to_string(path)?)))
}

/// `<projeto>:<12 primeiros hex da última chave de camada>`
fn default_tag(project: &ProjectInfo, keys: &[LayerKey]) -> String {
    let repository: String = project
        .name()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '-',
        })
        .collect();
    let repository = repository.trim_matches(|c| c == '.' || c == '-' || c == '_');
    let repository = if repository.is_empty() { "app" } else { repository };

    let version = keys
        .last()
        .map(|k| k.key.chars().take(12).collect::<String>())
        .unwrap_or_else(|| "latest".to_string());
    format!("{repository}:{version}")
}

#[cfg(test)]
mod tests {
    use super::docker::BuiltImage;
    use super::*;
    use crate::plan::Profile;
    use std::sync::Mutex;

    const MANAGE: &str = "import os\nos.environ.setdefault('DJANGO_SETTINGS_MODULE', 'shop.settings')\n";
    const SETTINGS: &str = "import os\n\
        SECRET_KEY = os.environ['SECRET_KEY']\n\
        DEBUG = os.environ.get('DEBUG', 'False') == 'True'\n\
        WSGI_APPLICATION = 'shop.wsgi.application'\n\
        STATIC_ROOT = 'staticfiles'\n";

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("manage.py"), MANAGE).unwrap();
        fs::create_dir_all(root.join("shop")).unwrap();
        fs::write(root.join("shop/settings.py"), SETTINGS).unwrap();
        fs::write(root.join("shop/wsgi.py"), "application = None\n").unwrap();
        fs::write(
            root.join("requirements.txt"),
            "Django==5.0.6\ngunicorn==22.0.0\n",
        )
        .unwrap();
        dir
    }

    fn config(root: &Path, profile: Profile) -> BuildConfig {
        BuildConfig {
            project_root: root.to_path_buf(),
            plan: PlanOptions {
                profile,
                ..PlanOptions::default()
            },
            ..BuildConfig::default()
        }
    }

    /// Builder que registra as tags pedidas e falha se mandado
    struct FakeBuilder {
        fail_at: Option<StepKind>,
        tags: Mutex<Vec<String>>,
    }

    impl FakeBuilder {
        fn ok() -> Self {
            Self {
                fail_at: None,
                tags: Mutex::new(Vec::new()),
            }
        }

        fn failing(step: StepKind) -> Self {
            Self {
                fail_at: Some(step),
                ..Self::ok()
            }
        }
    }

    impl ImageBuilder for FakeBuilder {
        fn build(&self, request: &BuildRequest<'_>) -> Result<BuiltImage, BuildError> {
            if let Some(step) = self.fail_at {
                return Err(BuildError::StepFailed {
                    step: Some(step),
                    code: 1,
                    tail: vec!["ImproperlyConfigured".to_string()],
                });
            }
            self.tags.lock().unwrap().push(request.tag.to_string());
            Ok(BuiltImage {
                image_id: "sha256:feedfacecafebeef0000111122223333".to_string(),
            })
        }
    }

    #[test]
    fn test_build_config_default() {
        let config = BuildConfig::default();
        assert_eq!(config.plan.profile, Profile::Hardened);
        assert!(config.tag.is_none());
        assert!(!config.strict);
    }

    #[test]
    fn test_successful_build_writes_context_and_metadata() {
        let dir = project();
        let system =
            BuildSystem::with_builder(config(dir.path(), Profile::Hardened), FakeBuilder::ok())
                .unwrap();
        let artifacts = system.build().unwrap();

        let dockerfile = fs::read_to_string(&artifacts.dockerfile_path).unwrap();
        assert!(dockerfile.contains("USER app:app"));
        assert!(dockerfile.contains("shop.wsgi:application"));
        assert!(dockerfile.contains("DJANGO_SETTINGS_MODULE=shop.settings"));
        assert!(artifacts.ignore_path.as_ref().unwrap().is_file());

        let metadata = BuildArtifacts::load_metadata(&system.work_dir()).unwrap();
        assert_eq!(metadata.tag, artifacts.metadata.tag);
        assert!(metadata.tag.starts_with("shop:"));
        assert_eq!(metadata.layer_keys.len(), artifacts.metadata.layer_keys.len());
        assert_eq!(system.builder.tags.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_static_failure_produces_no_metadata() {
        let dir = project();
        let system = BuildSystem::with_builder(
            config(dir.path(), Profile::Hardened),
            FakeBuilder::failing(StepKind::CollectStatic),
        )
        .unwrap();

        let err = system.build().unwrap_err();
        assert!(matches!(
            err,
            BuildError::StepFailed {
                step: Some(StepKind::CollectStatic),
                ..
            }
        ));
        assert!(!system.work_dir().join(artifacts::METADATA_FILE).exists());
    }

    #[test]
    fn test_preflight_failure_never_reaches_builder() {
        let dir = project();
        fs::write(dir.path().join("shop/settings.py"), "DEBUG = False\n").unwrap();
        let system =
            BuildSystem::with_builder(config(dir.path(), Profile::Hardened), FakeBuilder::ok())
                .unwrap();

        assert!(matches!(system.build(), Err(BuildError::Preflight(_))));
        assert!(system.builder.tags.lock().unwrap().is_empty());
    }

    #[test]
    fn test_strict_audit_rejects_minimal_profile() {
        let dir = project();
        let mut cfg = config(dir.path(), Profile::Minimal);
        cfg.strict = true;
        let system = BuildSystem::with_builder(cfg, FakeBuilder::ok()).unwrap();

        match system.prepare() {
            Err(BuildError::StrictAudit(ids)) => {
                assert!(ids.contains(&"GAP-001"));
                assert!(ids.contains(&"GAP-005"));
            }
            other => panic!("resultado inesperado: {other:?}"),
        }
    }

    #[test]
    fn test_minimal_profile_removes_stale_ignore_file() {
        let dir = project();
        let work = dir.path().join(WORK_DIR);
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("Dockerfile.dockerignore"), ".git\n").unwrap();

        let system =
            BuildSystem::with_builder(config(dir.path(), Profile::Minimal), FakeBuilder::ok())
                .unwrap();
        let artifacts = system.build().unwrap();
        assert!(artifacts.ignore_path.is_none());
        assert!(!work.join("Dockerfile.dockerignore").exists());
    }

    #[test]
    fn test_project_dockerignore_is_merged() {
        let dir = project();
        fs::write(dir.path().join(".dockerignore"), "fixtures/\n").unwrap();
        let system =
            BuildSystem::with_builder(config(dir.path(), Profile::Hardened), FakeBuilder::ok())
                .unwrap();
        let prepared = system.prepare().unwrap();
        let ignore = prepared.plan.ignore.unwrap();
        assert!(ignore.is_excluded("fixtures/users.json"));
        assert!(ignore.is_excluded(".env"));
    }

    #[test]
    fn test_explicit_tag_and_app_win() {
        let dir = project();
        let mut cfg = config(dir.path(), Profile::Hardened);
        cfg.tag = Some("registry.local/shop:1.0".to_string());
        cfg.app = Some("shop.asgi_compat:app".to_string());
        let system = BuildSystem::with_builder(cfg, FakeBuilder::ok()).unwrap();

        let prepared = system.prepare().unwrap();
        assert_eq!(prepared.tag, "registry.local/shop:1.0");
        assert!(prepared.plan.render().contains("shop.asgi_compat:app"));
    }

    #[test]
    fn test_included_requirements_are_copied_and_keyed() {
        let dir = project();
        fs::create_dir_all(dir.path().join("requirements")).unwrap();
        fs::write(dir.path().join("requirements/base.txt"), "Django==5.0.6\n").unwrap();
        fs::write(
            dir.path().join("requirements.txt"),
            "-r requirements/base.txt\ngunicorn==22.0.0\n",
        )
        .unwrap();
        let system =
            BuildSystem::with_builder(config(dir.path(), Profile::Hardened), FakeBuilder::ok())
                .unwrap();

        let before = system.prepare().unwrap();
        let rendered = before.plan.render();
        let copy = rendered
            .find("COPY requirements/base.txt requirements/base.txt")
            .unwrap();
        assert!(copy < rendered.find("pip install").unwrap());
        assert_ne!(before.inputs.manifest_digest, before.manifest.digest());

        fs::write(dir.path().join("requirements/base.txt"), "Django==5.0.7\n").unwrap();
        let after = system.prepare().unwrap();
        assert_ne!(before.inputs.manifest_digest, after.inputs.manifest_digest);
        assert_eq!(before.layer_keys[0], after.layer_keys[0]);
    }
}
