//! Chaves de cache por camada
//!
//! `key_n = sha256(key_{n-1} ‖ instrução ‖ digest do conteúdo)`. O conteúdo
//! de `COPY <manifesto>` é o digest do manifesto; o de `COPY . .` é o digest
//! da árvore de código depois da ignore list. Assim uma mudança só no código
//! não altera nenhuma chave até a instalação de dependências.

use super::ignore::IgnoreList;
use super::{BuildPlan, Content, StepKind};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInputs {
    pub manifest_digest: String,
    pub source_digest: String,
}

impl CacheInputs {
    pub fn compute(
        root: &Path,
        manifest_digest: String,
        ignore: Option<&IgnoreList>,
    ) -> io::Result<Self> {
        Ok(Self {
            manifest_digest,
            source_digest: source_digest(root, ignore)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerKey {
    pub stage: String,
    pub step: StepKind,
    pub instruction: String,
    pub key: String,
}

/// Chaves de todas as instruções, em ordem. Cada estágio começa uma cadeia
/// nova; `COPY --from=<estágio>` usa a última chave daquele estágio.
pub fn layer_keys(plan: &BuildPlan, inputs: &CacheInputs) -> Vec<LayerKey> {
    let mut keys = Vec::new();
    let mut stage_tips: HashMap<&str, String> = HashMap::new();

    for stage in &plan.stages {
        let mut previous = String::new();
        for step in &stage.steps {
            for instruction in &step.instructions {
                let line = instruction.line();
                let content = match &instruction.content {
                    Content::None => String::new(),
                    Content::Manifest => inputs.manifest_digest.clone(),
                    Content::SourceTree => inputs.source_digest.clone(),
                    Content::Stage(name) => stage_tips
                        .get(name.as_str())
                        .cloned()
                        .unwrap_or_else(|| name.clone()),
                };

                let mut hasher = Sha256::new();
                hasher.update(previous.as_bytes());
                hasher.update([0u8]);
                hasher.update(line.as_bytes());
                hasher.update([0u8]);
                hasher.update(content.as_bytes());
                let key = format!("{:x}", hasher.finalize());

                keys.push(LayerKey {
                    stage: stage.name.clone(),
                    step: step.kind,
                    instruction: line,
                    key: key.clone(),
                });
                previous = key;
            }
        }
        stage_tips.insert(stage.name.as_str(), previous);
    }

    keys
}

/// Digest da árvore de código: caminhos relativos ordenados e bytes de cada
/// arquivo que sobrevive à ignore list.
pub fn source_digest(root: &Path, ignore: Option<&IgnoreList>) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for rel in walk_context(root, ignore)? {
        let bytes = fs::read(root.join(&rel))?;
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(Sha256::digest(&bytes));
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Digest do que a instalação de dependências lê: o manifesto mais cada
/// entrada extra (`-r`, `-c`, caminhos locais), arquivo ou diretório.
/// Sem entradas extras é o próprio digest do manifesto.
pub fn dependency_digest(
    root: &Path,
    manifest_digest: &str,
    inputs: &[String],
    ignore: Option<&IgnoreList>,
) -> io::Result<String> {
    if inputs.is_empty() {
        return Ok(manifest_digest.to_string());
    }

    let mut context = None;
    let mut hasher = Sha256::new();
    hasher.update(manifest_digest.as_bytes());
    for rel in inputs {
        let path = root.join(rel);
        let digest = if path.is_dir() {
            if context.is_none() {
                context = Some(walk_context(root, ignore)?);
            }
            let prefix = format!("{}/", rel);
            let files = context
                .iter()
                .flatten()
                .filter(|file| rel == "." || file.starts_with(&prefix));
            let mut tree = Sha256::new();
            for file in files {
                tree.update(file.as_bytes());
                tree.update([0u8]);
                tree.update(Sha256::digest(fs::read(root.join(file))?));
            }
            format!("{:x}", tree.finalize())
        } else {
            format!("{:x}", Sha256::digest(fs::read(&path)?))
        };
        hasher.update([0u8]);
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest.as_bytes());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Arquivos do contexto de build, relativos à raiz com `/`, ordenados.
/// Diretório excluído só é percorrido se um `!` puder reincluir algo nele.
pub fn walk_context(root: &Path, ignore: Option<&IgnoreList>) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([PathBuf::new()]);

    while let Some(dir) = queue.pop_front() {
        let mut entries = fs::read_dir(root.join(&dir))?
            .filter_map(Result::ok)
            .collect::<Vec<_>>();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let rel_path = dir.join(entry.file_name());
            let rel = rel_path
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let excluded = ignore.map(|list| list.is_excluded(&rel)).unwrap_or(false);

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let descend = !excluded
                    || ignore
                        .map(|list| list.may_reinclude_under(&rel))
                        .unwrap_or(false);
                if descend {
                    queue.push_back(rel_path);
                }
            } else if file_type.is_file() && !excluded {
                out.push(rel);
            }
        }
    }

    out.sort();
    Ok(out)
}
