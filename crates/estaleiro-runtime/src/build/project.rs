//! Detecção e análise de projetos Django para build de imagem

use super::BuildError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

static SETTINGS_ENV: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"DJANGO_SETTINGS_MODULE['"]\s*,\s*['"]([A-Za-z_][\w.]*)['"]"#)
        .expect("regex de DJANGO_SETTINGS_MODULE")
});

static WSGI_APPLICATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*WSGI_APPLICATION\s*=\s*['"]([A-Za-z_][\w.]*)['"]"#)
        .expect("regex de WSGI_APPLICATION")
});

static STATIC_ROOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*STATIC_ROOT\s*=").expect("regex de STATIC_ROOT"));

/// Literal direto (`SECRET_KEY = '...'`) ou padrão de `.get`/`getenv`/`default=`
static LITERAL_SECRET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?m)^\s*SECRET_KEY\s*=\s*(?:[rRbBuU]{0,2}['"]|.*(?:(?:\.get|getenv)\(\s*['"]\w+['"]\s*,|\bdefault\s*=)\s*[rRbBuU]{0,2}['"])"#,
    )
    .expect("regex de SECRET_KEY")
});

static DEBUG_DEFAULT_TRUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?m)^\s*DEBUG\s*=\s*(?:True\b|.*(?:\.get|getenv)\(\s*['"]\w+['"]\s*,\s*['"](?i:true|1|yes|on)['"])"#,
    )
        .expect("regex de DEBUG")
});

/// Fatos extraídos do módulo de settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsFacts {
    pub static_root_declared: bool,
    /// `SECRET_KEY` tem um valor literal no código, fixo ou como padrão
    /// quando a variável de ambiente falta
    pub literal_secret_key: bool,
    pub debug_default_true: bool,
    pub wsgi_application: Option<String>,
}

impl SettingsFacts {
    pub fn parse(source: &str) -> Self {
        Self {
            static_root_declared: STATIC_ROOT.is_match(source),
            literal_secret_key: LITERAL_SECRET.is_match(source),
            debug_default_true: DEBUG_DEFAULT_TRUE.is_match(source),
            wsgi_application: WSGI_APPLICATION
                .captures(source)
                .map(|c| c[1].to_string()),
        }
    }
}

/// Informações do projeto detectado
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    /// Diretório raiz (contexto do build)
    pub root_dir: PathBuf,

    /// `manage.py`, se existir
    pub manage_py: Option<PathBuf>,

    /// Caminho do manifesto de dependências (pode não existir)
    pub manifest_path: PathBuf,

    /// Módulo de settings (`pacote.settings`)
    pub settings_module: Option<String>,

    pub settings_path: Option<PathBuf>,

    pub settings: SettingsFacts,

    /// Entry point WSGI no formato `modulo:objeto`
    pub wsgi_app: Option<String>,
}

impl ProjectInfo {
    /// Nome curto do projeto para tags de imagem
    pub fn name(&self) -> String {
        self.settings_module
            .as_deref()
            .and_then(|m| m.split('.').next())
            .map(str::to_string)
            .or_else(|| {
                self.root_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_lowercase())
            })
            .unwrap_or_else(|| "app".to_string())
    }

    /// Caminho do manifesto relativo à raiz, com `/`
    pub fn manifest_relative(&self) -> String {
        self.manifest_path
            .strip_prefix(&self.root_dir)
            .unwrap_or(&self.manifest_path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Detector de projetos Django
pub struct ProjectDetector {
    root_dir: PathBuf,
    manifest: PathBuf,
}

impl ProjectDetector {
    /// Cria um novo detector para o diretório especificado
    pub fn new(root_dir: &Path) -> Result<Self, BuildError> {
        let root_dir = root_dir
            .canonicalize()
            .map_err(|source| BuildError::ProjectNotFound {
                path: root_dir.to_path_buf(),
                source,
            })?;

        Ok(Self {
            root_dir,
            manifest: PathBuf::from("requirements.txt"),
        })
    }

    /// Manifesto fora do padrão (`requirements/prod.txt`)
    pub fn with_manifest(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.manifest = manifest.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Coleta o que existir; o que faltar é problema do preflight
    pub fn detect(&self) -> Result<ProjectInfo, BuildError> {
        let manage_py = Some(self.root_dir.join("manage.py")).filter(|p| p.is_file());

        let mut settings_module = match &manage_py {
            Some(path) => {
                let source = fs::read_to_string(path)?;
                SETTINGS_ENV.captures(&source).map(|c| c[1].to_string())
            }
            None => None,
        };

        let mut settings_path = settings_module
            .as_deref()
            .map(|module| self.module_path(module))
            .filter(|p| p.is_file());

        if settings_path.is_none() {
            if let Some((module, path)) = self.find_settings_package()? {
                settings_module = Some(module);
                settings_path = Some(path);
            }
        }

        let settings = match &settings_path {
            Some(path) => SettingsFacts::parse(&fs::read_to_string(path)?),
            None => SettingsFacts::default(),
        };

        let wsgi_app = settings
            .wsgi_application
            .as_deref()
            .map(dotted_to_entry_point)
            .or_else(|| {
                settings_module
                    .as_deref()
                    .and_then(|m| m.rsplit_once('.'))
                    .map(|(package, _)| format!("{package}.wsgi:application"))
            });

        Ok(ProjectInfo {
            root_dir: self.root_dir.clone(),
            manage_py,
            manifest_path: self.root_dir.join(&self.manifest),
            settings_module,
            settings_path,
            settings,
            wsgi_app,
        })
    }

    fn module_path(&self, module: &str) -> PathBuf {
        let mut path = self.root_dir.clone();
        for part in module.split('.') {
            path.push(part);
        }
        path.set_extension("py");
        path
    }

    /// Primeiro pacote de topo (ordem alfabética) com `settings.py`
    fn find_settings_package(&self) -> Result<Option<(String, PathBuf)>, BuildError> {
        let mut dirs = fs::read_dir(&self.root_dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect::<Vec<_>>();
        dirs.sort();

        for dir in dirs {
            let settings = dir.join("settings.py");
            if settings.is_file() {
                let package = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                return Ok(Some((format!("{package}.settings"), settings)));
            }
        }
        Ok(None)
    }
}

/// `ecommerce.wsgi.application` -> `ecommerce.wsgi:application`
fn dotted_to_entry_point(dotted: &str) -> String {
    match dotted.rsplit_once('.') {
        Some((module, object)) => format!("{module}:{object}"),
        None => dotted.to_string(),
    }
}
