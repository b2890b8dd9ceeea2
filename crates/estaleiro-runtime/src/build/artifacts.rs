//! Gerenciamento de artefatos de build

use crate::launch::lifecycle::current_timestamp;
use crate::plan::{LayerKey, Profile};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "build-metadata.json";

/// Metadados do build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMetadata {
    /// Timestamp do build (Unix epoch)
    pub build_time: u64,

    /// Id da imagem (`sha256:...`) devolvido pelo builder
    pub image_id: String,

    pub tag: String,

    pub profile: Profile,

    /// SHA-256 do Dockerfile + ignore list renderados
    pub plan_digest: String,

    pub manifest_digest: String,

    pub source_digest: String,

    /// Chaves de cache por instrução, na ordem do Dockerfile
    #[serde(default)]
    pub layer_keys: Vec<LayerKeyRecord>,

    pub estaleiro_version: String,
}

/// Forma persistida de uma chave de camada
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerKeyRecord {
    pub stage: String,
    pub step: String,
    pub instruction: String,
    pub key: String,
}

impl From<&LayerKey> for LayerKeyRecord {
    fn from(key: &LayerKey) -> Self {
        Self {
            stage: key.stage.clone(),
            step: key.step.to_string(),
            instruction: key.instruction.clone(),
            key: key.key.clone(),
        }
    }
}

/// Artefatos gerados pelo build
#[derive(Debug, Clone)]
pub struct BuildArtifacts {
    /// Dockerfile renderado
    pub dockerfile_path: PathBuf,

    /// Ignore list ao lado do Dockerfile, quando o perfil tem uma
    pub ignore_path: Option<PathBuf>,

    /// Metadados do build
    pub metadata: BuildMetadata,
}

impl BuildArtifacts {
    /// Salva os metadados em `<dir>/build-metadata.json`
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).context("Falha ao criar diretório de artefatos")?;

        let path = dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(&self.metadata)
            .context("Falha ao serializar metadata")?;
        fs::write(&path, json).context("Falha ao salvar metadata")?;
        Ok(path)
    }

    /// Metadados do último build bem-sucedido
    pub fn load_metadata(dir: &Path) -> Result<BuildMetadata> {
        let path = dir.join(METADATA_FILE);
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Falha ao ler {}", path.display()))?;
        serde_json::from_str(&json).context("Falha ao parsear metadata")
    }

    /// Exibe um resumo dos artefatos
    pub fn print_summary(&self) {
        let metadata = &self.metadata;
        println!("\n📦 Resumo do Build:");
        println!("─────────────────────────────────────");
        println!("Imagem:     {}", metadata.tag);
        if !metadata.image_id.is_empty() {
            println!("Id:         {}", short_digest(&metadata.image_id));
        }
        println!("Perfil:     {}", metadata.profile);
        println!("Dockerfile: {}", self.dockerfile_path.display());
        if let Some(ignore) = &self.ignore_path {
            println!("Ignore:     {}", ignore.display());
        }
        println!("Plano:      {}", short_digest(&metadata.plan_digest));
        println!("Manifesto:  {}", short_digest(&metadata.manifest_digest));
        println!("Camadas:    {}", metadata.layer_keys.len());
        println!("─────────────────────────────────────");
    }
}

/// `abcdef12...89abcdef`
pub fn short_digest(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    if hex.len() <= 16 {
        return hex.to_string();
    }
    format!("{}...{}", &hex[..8], &hex[hex.len() - 8..])
}

impl BuildMetadata {
    pub fn new(tag: String, profile: Profile) -> Self {
        Self {
            build_time: current_timestamp(),
            image_id: String::new(),
            tag,
            profile,
            plan_digest: String::new(),
            manifest_digest: String::new(),
            source_digest: String::new(),
            layer_keys: Vec::new(),
            estaleiro_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_metadata_new() {
        let metadata = BuildMetadata::new("shop:abc".to_string(), Profile::Hardened);
        assert!(metadata.build_time > 0);
        assert!(metadata.layer_keys.is_empty());
        assert_eq!(metadata.estaleiro_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_metadata_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = BuildMetadata::new("shop:abc".to_string(), Profile::CacheImage);
        metadata.image_id = "sha256:0123456789abcdef0123456789abcdef".to_string();
        metadata.layer_keys.push(LayerKeyRecord {
            stage: "runtime".to_string(),
            step: "imagem base".to_string(),
            instruction: "FROM python:3.12-slim AS runtime".to_string(),
            key: "ab".repeat(32),
        });

        let artifacts = BuildArtifacts {
            dockerfile_path: dir.path().join("Dockerfile"),
            ignore_path: None,
            metadata,
        };
        let path = artifacts.save(dir.path()).unwrap();
        assert!(path.ends_with(METADATA_FILE));

        let loaded = BuildArtifacts::load_metadata(dir.path()).unwrap();
        assert_eq!(loaded.tag, "shop:abc");
        assert_eq!(loaded.profile, Profile::CacheImage);
        assert_eq!(loaded.layer_keys.len(), 1);
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(
            short_digest("sha256:0123456789abcdef0123456789abcdef"),
            "01234567...89abcdef"
        );
        assert_eq!(short_digest("abc"), "abc");
    }
}
