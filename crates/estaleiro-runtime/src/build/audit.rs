//! Auditoria de lacunas de configuração (não-fatais)
//!
//! Roda sobre o plano gerado ou sobre um Dockerfile existente. Cada achado
//! tem um id estável (`GAP-00N`) para poder ser filtrado em CI.

use super::project::ProjectInfo;
use crate::manifest::DependencyManifest;
use crate::plan::cache::walk_context;
use crate::plan::ignore::{is_sensitive, IgnoreList};
use crate::plan::{BuildPlan, StepKind};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("{file} contém marcadores de conflito de merge nas linhas {lines:?}")]
    ConflictMarkers { file: String, lines: Vec<usize> },

    #[error("falha ao ler {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "baixa"),
            Severity::Medium => write!(f, "média"),
            Severity::High => write!(f, "alta"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub id: &'static str,
    pub severity: Severity,
    pub message: String,
    pub evidence: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl Finding {
    fn new(id: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id,
            severity,
            message: message.into(),
            evidence: Vec::new(),
            line: None,
        }
    }

    fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }

    fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub source: String,
    pub findings: Vec<Finding>,
}

impl AuditReport {
    pub fn ids(&self) -> Vec<&'static str> {
        self.findings.iter().map(|f| f.id).collect()
    }

    pub fn has(&self, id: &str) -> bool {
        self.findings.iter().any(|f| f.id == id)
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn print_summary(&self) {
        println!("\n🔎 Auditoria: {}", self.source);
        println!("─────────────────────────────────────");
        if self.findings.is_empty() {
            println!("✅ Nenhuma lacuna encontrada");
        }
        for finding in &self.findings {
            let location = finding
                .line
                .map(|l| format!(" (linha {l})"))
                .unwrap_or_default();
            println!(
                "⚠️  {} [{}]{} {}",
                finding.id, finding.severity, location, finding.message
            );
            for evidence in &finding.evidence {
                println!("      - {}", evidence);
            }
        }
        println!("─────────────────────────────────────");
    }
}

/// Instrução de Dockerfile com a linha física onde começa
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerInstruction {
    pub line: usize,
    pub keyword: String,
    pub args: String,
}

/// Junta continuações e ignora comentários
pub fn parse_dockerfile(text: &str) -> Vec<DockerInstruction> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut start_line = 0;

    for (idx, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if buf.is_empty() {
            start_line = idx + 1;
        } else {
            buf.push(' ');
        }
        if let Some(prefix) = trimmed.strip_suffix('\\') {
            buf.push_str(prefix.trim_end());
            continue;
        }
        buf.push_str(trimmed);

        let mut parts = buf.splitn(2, char::is_whitespace);
        let keyword = parts.next().unwrap_or("").to_ascii_uppercase();
        let args = parts.next().unwrap_or("").trim().to_string();
        if !keyword.is_empty() {
            out.push(DockerInstruction {
                line: start_line,
                keyword,
                args,
            });
        }
        buf.clear();
    }
    out
}

/// Linhas com `<<<<<<<`, `=======` ou `>>>>>>>` no início
pub fn conflict_marker_lines(text: &str) -> Vec<usize> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            line.starts_with("<<<<<<<") || line.starts_with(">>>>>>>") || line.trim_end() == "======="
        })
        .map(|(idx, _)| idx + 1)
        .collect()
}

/// Referência da imagem em `FROM [--platform=..] <ref> [AS nome]`
fn parse_from_ref(args: &str) -> Option<&str> {
    args.split_whitespace().find(|token| !token.starts_with("--"))
}

fn stage_alias(args: &str) -> Option<String> {
    let tokens: Vec<&str> = args.split_whitespace().collect();
    tokens
        .iter()
        .position(|t| t.eq_ignore_ascii_case("as"))
        .and_then(|idx| tokens.get(idx + 1))
        .map(|alias| alias.to_string())
}

/// Como a tag da imagem base está fixada
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagPin {
    Digest,
    /// Pelo menos `major.minor`
    Version,
    Floating,
    Latest,
}

pub fn classify_tag(image: &str) -> TagPin {
    if image.contains("@sha256:") {
        return TagPin::Digest;
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    let tag = match last_segment.split_once(':') {
        Some((_, tag)) => tag,
        None => return TagPin::Latest,
    };
    if tag == "latest" {
        return TagPin::Latest;
    }

    let version = tag.split('-').next().unwrap_or("");
    let numeric = version
        .split('.')
        .take_while(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
        .count();
    if numeric >= 2 {
        TagPin::Version
    } else {
        TagPin::Floating
    }
}

fn base_tag_finding(image: &str) -> Option<Finding> {
    match classify_tag(image) {
        TagPin::Digest | TagPin::Version => None,
        TagPin::Latest => Some(
            Finding::new(
                "GAP-004",
                Severity::High,
                "imagem base sem versão (latest); o build não é reproduzível",
            )
            .with_evidence(vec![image.to_string()]),
        ),
        TagPin::Floating => Some(
            Finding::new(
                "GAP-004",
                Severity::Medium,
                "imagem base com tag flutuante; fixe ao menos major.minor",
            )
            .with_evidence(vec![image.to_string()]),
        ),
    }
}

/// Achados que dependem só do projeto (manifesto, settings, arquivos)
fn project_findings(
    project: &ProjectInfo,
    manifest: Option<&DependencyManifest>,
    ignore: Option<&IgnoreList>,
    copies_source: bool,
) -> Result<Vec<Finding>, AuditError> {
    let mut findings = Vec::new();

    if copies_source {
        let files = walk_context(&project.root_dir, None).map_err(|source| AuditError::Io {
            path: project.root_dir.clone(),
            source,
        })?;
        let leaked: Vec<String> = files
            .into_iter()
            .filter(|rel| is_sensitive(rel))
            .filter(|rel| !ignore.map(|list| list.is_excluded(rel)).unwrap_or(false))
            .collect();
        if !leaked.is_empty() {
            findings.push(
                Finding::new(
                    "GAP-003",
                    Severity::High,
                    "arquivos sensíveis seriam copiados para a imagem",
                )
                .with_evidence(leaked),
            );
        }
    }

    if let Some(manifest) = manifest {
        let unpinned: Vec<String> = manifest
            .unpinned()
            .into_iter()
            .map(|r| format!("{} (linha {})", r.name, r.line))
            .collect();
        if !unpinned.is_empty() {
            findings.push(
                Finding::new(
                    "GAP-006",
                    Severity::Medium,
                    "dependências sem versão exata (==)",
                )
                .with_evidence(unpinned),
            );
        }
    }

    let settings_evidence = project
        .settings_path
        .as_ref()
        .map(|p| vec![p.display().to_string()])
        .unwrap_or_default();
    if project.settings.literal_secret_key {
        findings.push(
            Finding::new(
                "GAP-007",
                Severity::High,
                "SECRET_KEY tem valor literal no código (fixo ou padrão quando a variável de ambiente falta)",
            )
            .with_evidence(settings_evidence.clone()),
        );
    }
    if project.settings.debug_default_true {
        findings.push(
            Finding::new(
                "GAP-008",
                Severity::High,
                "DEBUG fica ligado por padrão quando a variável de ambiente falta",
            )
            .with_evidence(settings_evidence),
        );
    }

    Ok(findings)
}

/// Audita o plano que o estaleiro vai renderizar
pub fn audit_plan(
    plan: &BuildPlan,
    project: &ProjectInfo,
    manifest: Option<&DependencyManifest>,
    base_image: &str,
) -> Result<AuditReport, AuditError> {
    let mut findings = Vec::new();

    if !plan.has_step(StepKind::CreateIdentity) {
        findings.push(Finding::new(
            "GAP-001",
            Severity::High,
            "o processo rodaria como root; nenhum usuário sem privilégios é criado",
        ));
    }

    let project_ignore = read_ignore_file(&project.root_dir.join(".dockerignore"))?;
    let ignore = plan.ignore.clone().or(project_ignore);
    if ignore.is_none() {
        findings.push(Finding::new(
            "GAP-002",
            Severity::Medium,
            "sem ignore list: o contexto inteiro é copiado para a imagem",
        ));
    }

    findings.extend(base_tag_finding(base_image));

    if !plan.has_step(StepKind::Healthcheck) {
        findings.push(Finding::new(
            "GAP-005",
            Severity::Low,
            "sem HEALTHCHECK; o orquestrador não detecta processos travados",
        ));
    }

    findings.extend(project_findings(project, manifest, ignore.as_ref(), true)?);
    findings.sort_by(|a, b| a.id.cmp(b.id));

    Ok(AuditReport {
        source: format!("plano ({})", plan.profile),
        findings,
    })
}

/// Audita um Dockerfile existente escrito à mão
pub fn audit_dockerfile(
    path: &Path,
    project: &ProjectInfo,
    manifest: Option<&DependencyManifest>,
) -> Result<AuditReport, AuditError> {
    let text = std::fs::read_to_string(path).map_err(|source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file = path.display().to_string();

    let markers = conflict_marker_lines(&text);
    if !markers.is_empty() {
        return Err(AuditError::ConflictMarkers {
            file,
            lines: markers,
        });
    }

    let instructions = parse_dockerfile(&text);
    let mut findings = Vec::new();

    // Só o último estágio vira a imagem final
    let final_from = instructions
        .iter()
        .rposition(|i| i.keyword == "FROM")
        .unwrap_or(0);
    let final_stage = &instructions[final_from..];

    let last_user = final_stage.iter().rev().find(|i| i.keyword == "USER");
    match last_user {
        None => findings.push(Finding::new(
            "GAP-001",
            Severity::High,
            "nenhuma instrução USER no estágio final; o processo roda como root",
        )),
        Some(user) => {
            let name = user.args.split(':').next().unwrap_or("").trim();
            if name == "root" || name == "0" {
                findings.push(
                    Finding::new("GAP-001", Severity::High, "USER explícito é root")
                        .at_line(user.line),
                );
            }
        }
    }

    let ignore = read_ignore_file(&PathBuf::from(format!("{}.dockerignore", file)))?.or(
        read_ignore_file(&project.root_dir.join(".dockerignore"))?,
    );
    if ignore.is_none() {
        findings.push(Finding::new(
            "GAP-002",
            Severity::Medium,
            "sem .dockerignore: o contexto inteiro é copiado para a imagem",
        ));
    }

    let mut aliases = Vec::new();
    for instruction in instructions.iter().filter(|i| i.keyword == "FROM") {
        if let Some(image) = parse_from_ref(&instruction.args) {
            // FROM de um estágio anterior não é imagem base
            if !aliases.iter().any(|a: &String| a == image) {
                findings.extend(base_tag_finding(image).map(|f| f.at_line(instruction.line)));
            }
        }
        aliases.extend(stage_alias(&instruction.args));
    }

    let healthcheck = final_stage.iter().find(|i| i.keyword == "HEALTHCHECK");
    match healthcheck {
        Some(h) if h.args.trim().eq_ignore_ascii_case("NONE") => findings.push(
            Finding::new("GAP-005", Severity::Low, "HEALTHCHECK desabilitado").at_line(h.line),
        ),
        Some(_) => {}
        None => findings.push(Finding::new(
            "GAP-005",
            Severity::Low,
            "sem HEALTHCHECK; o orquestrador não detecta processos travados",
        )),
    }

    let copies_source = instructions.iter().any(|i| {
        (i.keyword == "COPY" || i.keyword == "ADD")
            && !i.args.contains("--from=")
            && i.args.split_whitespace().any(|t| t == "." || t == "./")
    });
    findings.extend(project_findings(project, manifest, ignore.as_ref(), copies_source)?);
    findings.sort_by(|a, b| a.id.cmp(b.id).then(a.line.cmp(&b.line)));

    Ok(AuditReport {
        source: file,
        findings,
    })
}

fn read_ignore_file(path: &Path) -> Result<Option<IgnoreList>, AuditError> {
    if !path.is_file() {
        return Ok(None);
    }
    std::fs::read_to_string(path)
        .map(|text| Some(IgnoreList::parse(&text)))
        .map_err(|source| AuditError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::ProjectDetector;
    use crate::plan::{PlanOptions, Profile};
    use std::fs;

    const SETTINGS: &str = "\
SECRET_KEY = os.environ.get('SECRET_KEY', 'django-insecure-change-me')
DEBUG = os.environ.get('DEBUG', 'True').lower() in ['true', '1', 'yes']
STATIC_ROOT = BASE_DIR / 'staticfiles'
";

    fn shop() -> (tempfile::TempDir, ProjectInfo, DependencyManifest) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(
            root.join("manage.py"),
            "os.environ.setdefault('DJANGO_SETTINGS_MODULE', 'ecommerce.settings')\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("ecommerce")).unwrap();
        fs::write(root.join("ecommerce/settings.py"), SETTINGS).unwrap();
        fs::write(
            root.join("requirements.txt"),
            "Django==5.0.6\ngunicorn==22.0.0\nPillow>=10\n",
        )
        .unwrap();
        fs::write(root.join(".env"), "SECRET_KEY=local\n").unwrap();
        fs::write(root.join("db.sqlite3"), "").unwrap();

        let info = ProjectDetector::new(root).unwrap().detect().unwrap();
        let manifest = DependencyManifest::load(&info.manifest_path).unwrap();
        (dir, info, manifest)
    }

    fn plan(profile: Profile) -> BuildPlan {
        BuildPlan::new(&PlanOptions {
            profile,
            ..PlanOptions::default()
        })
    }

    #[test]
    fn test_minimal_plan_has_every_hardening_gap() {
        let (_dir, info, manifest) = shop();
        let report =
            audit_plan(&plan(Profile::Minimal), &info, Some(&manifest), "python:3.12-slim")
                .unwrap();

        assert_eq!(
            report.ids(),
            vec!["GAP-001", "GAP-002", "GAP-003", "GAP-005", "GAP-006", "GAP-007", "GAP-008"]
        );
        let leaked = &report.findings.iter().find(|f| f.id == "GAP-003").unwrap().evidence;
        assert!(leaked.contains(&".env".to_string()));
        assert!(leaked.contains(&"db.sqlite3".to_string()));
    }

    #[test]
    fn test_hardened_plan_only_reports_project_gaps() {
        let (_dir, info, manifest) = shop();
        let report =
            audit_plan(&plan(Profile::Hardened), &info, Some(&manifest), "python:3.12-slim")
                .unwrap();
        assert_eq!(report.ids(), vec!["GAP-006", "GAP-007", "GAP-008"]);
    }

    #[test]
    fn test_tag_classification() {
        assert_eq!(classify_tag("python"), TagPin::Latest);
        assert_eq!(classify_tag("python:latest"), TagPin::Latest);
        assert_eq!(classify_tag("python:3"), TagPin::Floating);
        assert_eq!(classify_tag("python:slim"), TagPin::Floating);
        assert_eq!(classify_tag("python:3.12-slim"), TagPin::Version);
        assert_eq!(classify_tag("registry:5000/python:3.12.4"), TagPin::Version);
        assert_eq!(classify_tag("registry:5000/python"), TagPin::Latest);
        assert_eq!(
            classify_tag("python@sha256:0123456789abcdef"),
            TagPin::Digest
        );
    }

    #[test]
    fn test_parse_dockerfile_joins_continuations() {
        let text = "FROM python:3.12-slim\n# comentário\nRUN apt-get update && \\\n    apt-get install -y gcc\nCMD [\"gunicorn\"]\n";
        let instructions = parse_dockerfile(text);

        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[1].keyword, "RUN");
        assert_eq!(instructions[1].line, 3);
        assert_eq!(
            instructions[1].args,
            "apt-get update && apt-get install -y gcc"
        );
    }

    #[test]
    fn test_conflict_markers_rejected() {
        let (dir, info, manifest) = shop();
        let path = dir.path().join("Dockerfile");
        fs::write(
            &path,
            "FROM python:3.11\n<<<<<<< HEAD\nUSER app\n=======\nHEALTHCHECK CMD true\n>>>>>>> feature\n",
        )
        .unwrap();

        let err = audit_dockerfile(&path, &info, Some(&manifest)).unwrap_err();
        match err {
            AuditError::ConflictMarkers { lines, .. } => assert_eq!(lines, vec![2, 4, 6]),
            other => panic!("erro inesperado: {other}"),
        }
    }

    #[test]
    fn test_handwritten_dockerfile_gaps() {
        let (dir, info, manifest) = shop();
        let path = dir.path().join("Dockerfile");
        fs::write(
            &path,
            "FROM python:3 AS build\nFROM build\nWORKDIR /app\nCOPY . .\nUSER root\nCMD [\"gunicorn\"]\n",
        )
        .unwrap();

        let report = audit_dockerfile(&path, &info, Some(&manifest)).unwrap();
        assert!(report.has("GAP-001"));
        assert!(report.has("GAP-002"));
        assert!(report.has("GAP-003"));
        assert!(report.has("GAP-005"));

        // Só o FROM externo conta como imagem base
        let tags: Vec<_> = report.findings.iter().filter(|f| f.id == "GAP-004").collect();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].line, Some(1));
    }

    #[test]
    fn test_dockerignore_next_to_dockerfile_is_honoured() {
        let (dir, info, manifest) = shop();
        let path = dir.path().join("Dockerfile");
        fs::write(
            &path,
            "FROM python:3.12-slim\nCOPY . .\nUSER app\nHEALTHCHECK CMD true\n",
        )
        .unwrap();
        fs::write(dir.path().join("Dockerfile.dockerignore"), ".env\ndb.sqlite3\n").unwrap();

        let report = audit_dockerfile(&path, &info, Some(&manifest)).unwrap();
        assert_eq!(report.ids(), vec!["GAP-006", "GAP-007", "GAP-008"]);
    }
}
