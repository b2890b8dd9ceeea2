//! Configuração em arquivo: `estaleiro.toml` no projeto e padrões do usuário
//! em `<config_dir>/estaleiro/config.toml`.
//!
//! Precedência: flags/variáveis de ambiente > projeto > usuário > padrões.
//! Os dois arquivos são mesclados tabela a tabela antes de desserializar,
//! então o projeto pode sobrescrever só `runtime.workers` sem repetir o resto.

use crate::build::BuildConfig;
use crate::launch::RuntimeConfig;
use crate::plan::{LauncherKind, PlanOptions, Profile};
use crate::process_env::ProcessEnv;
use anyhow::{Context, Result};
use estaleiro_probe::HealthPolicy;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const PROJECT_FILE: &str = "estaleiro.toml";

/// `<config_dir>/estaleiro/config.toml`, quando o sistema tem um
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("estaleiro").join("config.toml"))
}

/// Seção `[build]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSection {
    pub profile: Profile,
    pub base_image: String,
    pub manifest: String,
    pub build_packages: Vec<String>,
    pub runtime_packages: Vec<String>,
    pub workdir: String,
    pub user: String,
    pub uid: u32,
    pub settings_module: Option<String>,
    pub app: Option<String>,
    pub launcher: LauncherKind,
    pub tag: Option<String>,
    pub cache_from: Option<String>,
    pub strict: bool,
}

impl Default for BuildSection {
    fn default() -> Self {
        let plan = PlanOptions::default();
        Self {
            profile: plan.profile,
            base_image: plan.base_image,
            manifest: plan.manifest,
            build_packages: plan.build_packages,
            runtime_packages: plan.runtime_packages,
            workdir: plan.workdir,
            user: plan.user,
            uid: plan.uid,
            settings_module: plan.settings_module,
            app: None,
            launcher: plan.launcher,
            tag: None,
            cache_from: None,
            strict: false,
        }
    }
}

/// Conteúdo mesclado dos arquivos de configuração
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub build: BuildSection,
    pub runtime: RuntimeConfig,
    pub health: HealthPolicy,
    pub process_env: ProcessEnv,
}

impl Settings {
    /// Arquivo do usuário (se houver) e `estaleiro.toml` da raiz do projeto
    pub fn load(project_root: &Path) -> Result<Self> {
        let user = user_config_path();
        Self::load_from(user.as_deref(), &project_root.join(PROJECT_FILE))
    }

    /// Arquivos ausentes são ignorados; arquivos inválidos são erro
    pub fn load_from(user: Option<&Path>, project: &Path) -> Result<Self> {
        let mut merged = toml::Table::new();
        for path in user.into_iter().chain(std::iter::once(project)) {
            if !path.is_file() {
                continue;
            }
            tracing::debug!(path = %path.display(), "lendo configuração");
            let text = fs::read_to_string(path)
                .with_context(|| format!("Falha ao ler {}", path.display()))?;
            let table: toml::Table = toml::from_str(&text)
                .with_context(|| format!("TOML inválido em {}", path.display()))?;
            merge_tables(&mut merged, table);
        }

        toml::Value::Table(merged)
            .try_into()
            .context("Configuração inválida")
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Configuração inválida")
    }

    pub fn plan_options(&self) -> PlanOptions {
        let build = &self.build;
        PlanOptions {
            profile: build.profile,
            base_image: build.base_image.clone(),
            build_packages: build.build_packages.clone(),
            runtime_packages: build.runtime_packages.clone(),
            manifest: build.manifest.clone(),
            workdir: build.workdir.clone(),
            user: build.user.clone(),
            uid: build.uid,
            settings_module: build.settings_module.clone(),
            process_env: self.process_env,
            runtime: self.runtime_config(),
            health: self.health.clone(),
            launcher: build.launcher.clone(),
            ..PlanOptions::default()
        }
    }

    pub fn build_config(&self, project_root: &Path) -> BuildConfig {
        BuildConfig {
            project_root: project_root.to_path_buf(),
            plan: self.plan_options(),
            app: self.build.app.clone(),
            tag: self.build.tag.clone(),
            cache_from: self.build.cache_from.clone(),
            strict: self.build.strict,
        }
    }

    /// `[runtime]` com o `process_env` global aplicado
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            process_env: self.process_env,
            ..self.runtime.clone()
        }
    }
}

/// Mescla `overlay` sobre `base`; subtabelas são mescladas recursivamente
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
