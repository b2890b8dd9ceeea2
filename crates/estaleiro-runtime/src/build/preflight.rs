//! Verificações que abortam o build antes de chamar o builder de imagens

use super::project::ProjectInfo;
use super::BuildError;
use crate::manifest::{DependencyManifest, ManifestError};
use std::fmt;
use std::path::PathBuf;

/// Problema que torna o build impossível
#[derive(Debug)]
pub enum PreflightIssue {
    MissingManifest(PathBuf),
    InvalidManifest(ManifestError),
    MissingManagePy,
    MissingSettings,
    /// `collectstatic` falha sem `STATIC_ROOT`
    MissingStaticRoot(PathBuf),
    EmptyBaseImage,
    /// O servidor do launch não está entre as dependências
    MissingServer(String),
    /// `-r`, `-c` ou caminho local que o Docker não alcança
    OutsideContext(PathBuf),
}

impl fmt::Display for PreflightIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreflightIssue::MissingManifest(path) => {
                write!(f, "manifesto de dependências não encontrado: {}", path.display())
            }
            PreflightIssue::InvalidManifest(err) => write!(f, "manifesto inválido: {err}"),
            PreflightIssue::MissingManagePy => write!(f, "manage.py não encontrado na raiz"),
            PreflightIssue::MissingSettings => {
                write!(f, "módulo de settings não encontrado (DJANGO_SETTINGS_MODULE)")
            }
            PreflightIssue::MissingStaticRoot(path) => write!(
                f,
                "STATIC_ROOT não declarado em {}; collectstatic falharia",
                path.display()
            ),
            PreflightIssue::EmptyBaseImage => write!(f, "imagem base vazia"),
            PreflightIssue::MissingServer(server) => {
                write!(f, "'{server}' não está no manifesto de dependências")
            }
            PreflightIssue::OutsideContext(path) => write!(
                f,
                "{} é usado pelo pip install mas fica fora do contexto de build",
                path.display()
            ),
        }
    }
}

/// Resultado de um preflight aprovado
#[derive(Debug)]
pub struct Preflight {
    pub manifest: DependencyManifest,
    /// Arquivos e diretórios copiados junto com o manifesto, relativos à raiz
    pub install_inputs: Vec<String>,
}

impl Preflight {
    /// Junta todos os problemas antes de falhar, para o operador ver tudo de uma vez.
    /// `server` é o pacote que precisa estar no manifesto quando o launch usa o
    /// gerenciador direto.
    pub fn check(
        project: &ProjectInfo,
        base_image: &str,
        server: Option<&str>,
    ) -> Result<Self, BuildError> {
        let mut issues = Vec::new();

        if base_image.trim().is_empty() {
            issues.push(PreflightIssue::EmptyBaseImage);
        }
        if project.manage_py.is_none() {
            issues.push(PreflightIssue::MissingManagePy);
        }
        match &project.settings_path {
            None => issues.push(PreflightIssue::MissingSettings),
            Some(path) if !project.settings.static_root_declared => {
                issues.push(PreflightIssue::MissingStaticRoot(path.clone()))
            }
            Some(_) => {}
        }

        let manifest = if project.manifest_path.is_file() {
            match DependencyManifest::load(&project.manifest_path) {
                Ok(manifest) => Some(manifest),
                Err(err) => {
                    issues.push(PreflightIssue::InvalidManifest(err));
                    None
                }
            }
        } else {
            issues.push(PreflightIssue::MissingManifest(project.manifest_path.clone()));
            None
        };

        if let (Some(manifest), Some(server)) = (&manifest, server) {
            if !manifest.contains(server) {
                issues.push(PreflightIssue::MissingServer(server.to_string()));
            }
        }

        let inputs = manifest
            .as_ref()
            .map(|m| m.install_inputs(&project.root_dir))
            .unwrap_or_default();
        issues.extend(inputs.outside.into_iter().map(PreflightIssue::OutsideContext));

        match manifest {
            Some(manifest) if issues.is_empty() => Ok(Self {
                manifest,
                install_inputs: inputs.inside,
            }),
            _ => Err(BuildError::Preflight(issues)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::ProjectDetector;
    use std::fs;

    fn project(files: &[(&str, &str)]) -> (tempfile::TempDir, ProjectInfo) {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let path = dir.path().join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let info = ProjectDetector::new(dir.path()).unwrap().detect().unwrap();
        (dir, info)
    }

    fn issues(err: BuildError) -> Vec<PreflightIssue> {
        match err {
            BuildError::Preflight(issues) => issues,
            other => panic!("erro inesperado: {other}"),
        }
    }

    const MANAGE: &str = "os.environ.setdefault('DJANGO_SETTINGS_MODULE', 'shop.settings')\n";

    #[test]
    fn test_complete_project_passes() {
        let (_dir, info) = project(&[
            ("manage.py", MANAGE),
            ("shop/settings.py", "STATIC_ROOT = BASE_DIR / 'staticfiles'\n"),
            ("requirements.txt", "Django==5.0.6\ngunicorn==22.0.0\n"),
        ]);
        let checked = Preflight::check(&info, "python:3.12-slim", Some("gunicorn")).unwrap();
        assert_eq!(checked.manifest.len(), 2);
    }

    #[test]
    fn test_all_issues_reported_together() {
        let (_dir, info) = project(&[("shop/settings.py", "DEBUG = True\n")]);
        let found = issues(Preflight::check(&info, " ", None).unwrap_err());

        assert!(found.iter().any(|i| matches!(i, PreflightIssue::EmptyBaseImage)));
        assert!(found.iter().any(|i| matches!(i, PreflightIssue::MissingManagePy)));
        assert!(found
            .iter()
            .any(|i| matches!(i, PreflightIssue::MissingStaticRoot(_))));
        assert!(found
            .iter()
            .any(|i| matches!(i, PreflightIssue::MissingManifest(_))));
    }

    #[test]
    fn test_unparsable_manifest_is_fatal() {
        let (_dir, info) = project(&[
            ("manage.py", MANAGE),
            ("shop/settings.py", "STATIC_ROOT = 'x'\n"),
            ("requirements.txt", "Django==5.0.6\n=== broken\n"),
        ]);
        let found = issues(Preflight::check(&info, "python:3.12-slim", None).unwrap_err());
        assert!(matches!(found[0], PreflightIssue::InvalidManifest(_)));
    }

    #[test]
    fn test_server_must_be_a_dependency() {
        let (_dir, info) = project(&[
            ("manage.py", MANAGE),
            ("shop/settings.py", "STATIC_ROOT = 'x'\n"),
            ("requirements.txt", "Django==5.0.6\n"),
        ]);
        let found = issues(
            Preflight::check(&info, "python:3.12-slim", Some("gunicorn")).unwrap_err(),
        );
        assert!(matches!(&found[0], PreflightIssue::MissingServer(s) if s == "gunicorn"));
    }

    #[test]
    fn test_server_found_in_included_file() {
        let (_dir, info) = project(&[
            ("manage.py", MANAGE),
            ("shop/settings.py", "STATIC_ROOT = 'x'\n"),
            ("requirements.txt", "-r requirements/base.txt\nDjango==5.0.6\n"),
            ("requirements/base.txt", "gunicorn==22.0.0\n"),
        ]);
        let checked = Preflight::check(&info, "python:3.12-slim", Some("gunicorn")).unwrap();
        assert_eq!(checked.install_inputs, vec!["requirements/base.txt"]);
    }

    #[test]
    fn test_include_outside_context_is_fatal() {
        let (_dir, info) = project(&[
            ("manage.py", MANAGE),
            ("shop/settings.py", "STATIC_ROOT = 'x'\n"),
            ("requirements.txt", "gunicorn==22.0.0\n-e ../vendor/pagamentos\n"),
        ]);

        let found = issues(
            Preflight::check(&info, "python:3.12-slim", Some("gunicorn")).unwrap_err(),
        );
        assert!(matches!(
            &found[0],
            PreflightIssue::OutsideContext(path) if path.ends_with("vendor/pagamentos")
        ));
        assert!(found[0].to_string().contains("fora do contexto"));
    }
}
