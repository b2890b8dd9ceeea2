//! Manifest de dependências Python (formato `requirements.txt`)

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};

static REQUIREMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<name>[A-Za-z0-9][A-Za-z0-9._-]*)\s*(?:\[(?P<extras>[^\]]*)\])?\s*(?P<spec>(?:(?:===|==|~=|!=|>=|<=|>|<)\s*[A-Za-z0-9.*+!_-]+\s*,?\s*)*)$",
    )
    .expect("regex de requirement válida")
});

static SPECIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<op>===|==|~=|!=|>=|<=|>|<)\s*(?P<version>[A-Za-z0-9.*+!_-]+)")
        .expect("regex de specifier válida")
});

/// PEP 508: `nome[extras] @ url`
static DIRECT_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<name>[A-Za-z0-9][A-Za-z0-9._-]*)\s*(?:\[(?P<extras>[^\]]*)\])?\s*@\s*(?P<reference>\S+)$",
    )
    .expect("regex de referência direta válida")
});

static EGG_FRAGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[#&]egg=(?P<name>[A-Za-z0-9][A-Za-z0-9._-]*)").expect("regex de #egg= válida")
});

static NAME_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-_.]+").expect("regex de normalização válida"));

const DIRECTIVES: &[&str] = &[
    "-r",
    "--requirement",
    "-c",
    "--constraint",
    "-e",
    "--editable",
    "-i",
    "--index-url",
    "--extra-index-url",
    "-f",
    "--find-links",
    "--no-binary",
    "--only-binary",
    "--pre",
    "--prefer-binary",
    "--trusted-host",
];

const VCS_PREFIXES: &[&str] = &["git+", "hg+", "svn+", "bzr+"];

const ARCHIVE_SUFFIXES: &[&str] = &[".whl", ".tar.gz", ".tar.bz2", ".tgz", ".zip"];

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("falha ao ler {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("linha {line} inválida no manifest: '{content}'")]
    InvalidLine { line: usize, content: String },
    #[error("pacote '{name}' declarado mais de uma vez (linhas {first} e {second})")]
    Duplicate {
        name: String,
        first: usize,
        second: usize,
    },
    #[error("em {}: {source}", path.display())]
    Included {
        path: PathBuf,
        #[source]
        source: Box<ManifestError>,
    },
}

/// Restrição de versão (`>=4.2`, `==1.0.0`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specifier {
    pub op: String,
    pub version: String,
}

impl std::fmt::Display for Specifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.op, self.version)
    }
}

/// Uma dependência declarada
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Nome normalizado (PEP 503)
    pub name: String,
    pub extras: Vec<String>,
    pub specifiers: Vec<Specifier>,
    pub marker: Option<String>,
    /// URL, VCS ou caminho local no lugar do índice de pacotes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub line: usize,
}

impl Requirement {
    /// Versão exata, quando fixada com `==` ou `===`
    pub fn pinned_version(&self) -> Option<&str> {
        if self.reference.is_some() {
            return None;
        }
        self.specifiers
            .iter()
            .find(|s| (s.op == "==" || s.op == "===") && !s.version.contains('*'))
            .map(|s| s.version.as_str())
    }

    /// Caminho local (`./libs/pagamentos`), relativo ao diretório de trabalho do pip
    pub fn local_path(&self) -> Option<&str> {
        self.reference.as_deref().filter(|r| is_local_reference(r))
    }
}

/// Linha do manifest na ordem em que aparece
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManifestEntry {
    Requirement(Requirement),
    /// Opção do pip preservada como está (`-r base.txt`, `--index-url ...`)
    Directive { line: usize, text: String },
}

impl ManifestEntry {
    /// Arquivo local trazido por `-r`/`-c`; URLs o pip baixa sozinho
    pub fn include(&self) -> Option<(IncludeKind, &str)> {
        let ManifestEntry::Directive { text, .. } = self else {
            return None;
        };
        let kind = match directive_parts(text) {
            ("-r" | "--requirement", Some(target)) => (IncludeKind::Requirements, target),
            ("-c" | "--constraint", Some(target)) => (IncludeKind::Constraints, target),
            _ => return None,
        };
        (!kind.1.contains("://")).then_some(kind)
    }

    /// Caminho local de `-e <caminho>`
    pub fn editable_path(&self) -> Option<&str> {
        let ManifestEntry::Directive { text, .. } = self else {
            return None;
        };
        match directive_parts(text) {
            ("-e" | "--editable", Some(target)) if is_local_reference(target) => Some(target),
            _ => None,
        }
    }
}

/// `-r` instala o que o arquivo lista; `-c` só restringe versões
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncludeKind {
    Requirements,
    Constraints,
}

/// Arquivo referenciado por `-r`/`-c`, direta ou indiretamente
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncludedFile {
    pub kind: IncludeKind,
    /// Resolvido a partir do diretório de quem o referencia
    pub path: PathBuf,
    pub entries: Vec<ManifestEntry>,
}

/// O que o `pip install` lê do contexto além do manifesto principal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallInputs {
    /// Relativos à raiz, com `/`, na ordem em que aparecem
    pub inside: Vec<String>,
    /// Fora do contexto de build; o Docker não consegue copiá-los
    pub outside: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyManifest {
    pub entries: Vec<ManifestEntry>,
    digest: String,

    #[serde(default)]
    includes: Vec<IncludedFile>,

    #[serde(skip)]
    path: PathBuf,
}

/// Normaliza nomes de pacote como o índice de pacotes faz
pub fn normalize_name(name: &str) -> String {
    NAME_SEPARATORS
        .replace_all(&name.to_ascii_lowercase(), "-")
        .into_owned()
}

impl DependencyManifest {
    /// Lê o manifesto e, recursivamente, os arquivos de `-r`/`-c`
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let mut manifest = Self::load_file(path)?;
        let mut visited = vec![normalize_path(path)];
        let mut includes = Vec::new();
        collect_includes(
            path,
            &manifest.entries,
            IncludeKind::Requirements,
            &mut visited,
            &mut includes,
        )?;
        manifest.includes = includes;
        Ok(manifest)
    }

    fn load_file(path: &Path) -> Result<Self, ManifestError> {
        let bytes = fs::read(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let text = String::from_utf8_lossy(&bytes);
        let mut manifest = Self::parse(&text)?;
        manifest.digest = sha256_hex(&bytes);
        manifest.path = path.to_path_buf();
        Ok(manifest)
    }

    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut entries = Vec::new();
        let mut seen: Vec<(String, usize)> = Vec::new();

        for (line, content) in logical_lines(text) {
            if is_directive(&content) {
                entries.push(ManifestEntry::Directive {
                    line,
                    text: content,
                });
                continue;
            }

            let requirement = parse_requirement(line, &content)?;
            if let Some((_, first)) = seen.iter().find(|(n, _)| *n == requirement.name) {
                return Err(ManifestError::Duplicate {
                    name: requirement.name,
                    first: *first,
                    second: line,
                });
            }
            seen.push((requirement.name.clone(), line));
            entries.push(ManifestEntry::Requirement(requirement));
        }

        Ok(Self {
            entries,
            digest: sha256_hex(text.as_bytes()),
            includes: Vec::new(),
            path: PathBuf::new(),
        })
    }

    /// SHA-256 do conteúdo bruto; chave de cache da camada de dependências
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn includes(&self) -> &[IncludedFile] {
        &self.includes
    }

    /// Dependências instaladas: as do manifesto e as dos arquivos de `-r`
    pub fn requirements(&self) -> impl Iterator<Item = &Requirement> {
        let included = self
            .includes
            .iter()
            .filter(|i| i.kind == IncludeKind::Requirements)
            .flat_map(|i| i.entries.iter());
        self.entries.iter().chain(included).filter_map(|e| match e {
            ManifestEntry::Requirement(r) => Some(r),
            ManifestEntry::Directive { .. } => None,
        })
    }

    /// Arquivos de `-r`/`-c` e caminhos locais, classificados contra `root`
    pub fn install_inputs(&self, root: &Path) -> InstallInputs {
        let mut inputs = InstallInputs::default();
        let mut push = |path: PathBuf| match context_path(root, &path) {
            Some(rel) => {
                if !inputs.inside.contains(&rel) {
                    inputs.inside.push(rel);
                }
            }
            None => {
                if !inputs.outside.contains(&path) {
                    inputs.outside.push(path);
                }
            }
        };

        for include in &self.includes {
            push(include.path.clone());
        }

        let editables = self
            .entries
            .iter()
            .chain(self.includes.iter().flat_map(|i| i.entries.iter()))
            .filter_map(ManifestEntry::editable_path);
        let locals = self.requirements().filter_map(Requirement::local_path);
        for local in editables.chain(locals) {
            push(PathBuf::from(local.strip_prefix("file:").unwrap_or(local)));
        }
        inputs
    }

    pub fn get(&self, name: &str) -> Option<&Requirement> {
        let name = normalize_name(name);
        self.requirements().find(|r| r.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_pinned(&self, name: &str) -> bool {
        self.get(name)
            .map(|r| r.pinned_version().is_some())
            .unwrap_or(false)
    }

    /// Dependências sem versão exata
    pub fn unpinned(&self) -> Vec<&Requirement> {
        self.requirements()
            .filter(|r| r.pinned_version().is_none())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requirements().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn collect_includes(
    from: &Path,
    entries: &[ManifestEntry],
    inherited: IncludeKind,
    visited: &mut Vec<PathBuf>,
    out: &mut Vec<IncludedFile>,
) -> Result<(), ManifestError> {
    let base = from.parent().unwrap_or_else(|| Path::new(""));
    for entry in entries {
        let Some((kind, target)) = entry.include() else {
            continue;
        };
        // Um `-r` dentro de um arquivo de constraints continua sendo constraint
        let kind = match inherited {
            IncludeKind::Constraints => IncludeKind::Constraints,
            IncludeKind::Requirements => kind,
        };
        let path = normalize_path(&base.join(target));
        if visited.contains(&path) {
            continue;
        }
        visited.push(path.clone());

        let included =
            DependencyManifest::load_file(&path).map_err(|source| ManifestError::Included {
                path: path.clone(),
                source: Box::new(source),
            })?;
        out.push(IncludedFile {
            kind,
            path: path.clone(),
            entries: included.entries.clone(),
        });
        collect_includes(&path, &included.entries, kind, visited, out)?;
    }
    Ok(())
}

/// Caminho relativo a `root` com `/`; `None` quando escapa da raiz
pub fn context_path(root: &Path, path: &Path) -> Option<String> {
    let full = if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&root.join(path))
    };
    let rel = full.strip_prefix(normalize_path(root)).ok()?;
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    Some(if joined.is_empty() { ".".to_string() } else { joined })
}

/// Resolve `.` e `..` sem tocar no sistema de arquivos
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let climbs_out = matches!(
                    out.components().next_back(),
                    None | Some(Component::ParentDir)
                );
                if climbs_out {
                    out.push("..");
                } else {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `--index-url=x`, `--index-url x` e `-rbase.txt` viram `(flag, valor)`
fn directive_parts(text: &str) -> (&str, Option<&str>) {
    let text = text.trim();
    let (head, rest) = match text.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, Some(rest.trim()).filter(|r| !r.is_empty())),
        None => (text, None),
    };
    if head.starts_with("--") {
        if let Some((flag, value)) = head.split_once('=') {
            return (flag, Some(value));
        }
    } else if head.len() > 2 && head.is_char_boundary(2) {
        return (&head[..2], Some(&head[2..]));
    }
    (head, rest)
}

fn is_directive(content: &str) -> bool {
    content.starts_with('-') && DIRECTIVES.contains(&directive_parts(content).0)
}

fn is_local_reference(reference: &str) -> bool {
    let reference = reference.trim();
    if reference.starts_with("file:") {
        return !reference.starts_with("file://");
    }
    !reference.contains("://") && !VCS_PREFIXES.iter().any(|p| reference.starts_with(p))
}

/// Linha sem nome de pacote: URL, VCS, caminho local ou arquivo de distribuição
fn is_bare_reference(body: &str) -> bool {
    body.contains("://")
        || VCS_PREFIXES.iter().any(|p| body.starts_with(p))
        || ["./", "../", "/", "file:"].iter().any(|p| body.starts_with(p))
        || body == "."
        || ARCHIVE_SUFFIXES.iter().any(|s| body.ends_with(s))
}

/// Nome de uma referência sem `nome @`: `#egg=` ou o último segmento do caminho
fn reference_name(reference: &str) -> Option<String> {
    if let Some(caps) = EGG_FRAGMENT.captures(reference) {
        return Some(normalize_name(&caps["name"]));
    }
    let path = reference
        .split(['#', '?'])
        .next()
        .unwrap_or(reference)
        .trim_end_matches('/');
    let segment = path.rsplit(['/', ':']).next().unwrap_or("");
    let segment = segment.split('@').next().unwrap_or(segment);

    let stem = if let Some(stem) = segment.strip_suffix(".git") {
        stem
    } else if let Some(suffix) = ARCHIVE_SUFFIXES.iter().find(|s| segment.ends_with(*s)) {
        // `pacote-1.0-py3-none-any.whl`, `pacote-1.0.tar.gz`
        let stem = &segment[..segment.len() - suffix.len()];
        stem.split('-').next().unwrap_or(stem)
    } else {
        segment
    };

    let valid = stem
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false)
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c));
    valid.then(|| normalize_name(stem))
}

fn parse_requirement(line: usize, content: &str) -> Result<Requirement, ManifestError> {
    // Opções por requirement (`--hash=...`) não mudam o que é instalado
    let content_without_options = content
        .find(" --")
        .map(|idx| &content[..idx])
        .unwrap_or(content);
    let (body, marker) = match content_without_options.split_once(';') {
        Some((body, marker)) => (body.trim(), Some(marker.trim().to_string())),
        None => (content_without_options.trim(), None),
    };

    let invalid = || ManifestError::InvalidLine {
        line,
        content: content.to_string(),
    };
    if marker.as_deref() == Some("") {
        return Err(invalid());
    }

    if let Some(caps) = DIRECT_REFERENCE.captures(body) {
        return Ok(Requirement {
            name: normalize_name(&caps["name"]),
            extras: parse_extras(caps.name("extras").map(|m| m.as_str())),
            specifiers: Vec::new(),
            marker,
            reference: Some(caps["reference"].to_string()),
            line,
        });
    }

    if is_bare_reference(body) {
        let name = reference_name(body).ok_or_else(invalid)?;
        return Ok(Requirement {
            name,
            extras: Vec::new(),
            specifiers: Vec::new(),
            marker,
            reference: Some(body.to_string()),
            line,
        });
    }

    let caps = REQUIREMENT.captures(body).ok_or_else(invalid)?;
    let specifiers = caps
        .name("spec")
        .map(|m| {
            SPECIFIER
                .captures_iter(m.as_str())
                .map(|c| Specifier {
                    op: c["op"].to_string(),
                    version: c["version"].to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Requirement {
        name: normalize_name(&caps["name"]),
        extras: parse_extras(caps.name("extras").map(|m| m.as_str())),
        specifiers,
        marker,
        reference: None,
        line,
    })
}

fn parse_extras(extras: Option<&str>) -> Vec<String> {
    extras
        .map(|extras| {
            extras
                .split(',')
                .map(|e| normalize_name(e.trim()))
                .filter(|e| !e.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
