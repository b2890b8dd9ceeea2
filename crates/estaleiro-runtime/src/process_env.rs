//! Flags de ambiente do interpretador Python, explícitas e imutáveis.
//!
//! Em vez de herdar variáveis globais do processo, o plano de build e o
//! launcher recebem este struct e decidem onde cada flag vai parar.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessEnv {
    /// `PYTHONDONTWRITEBYTECODE=1`: não grava `.pyc` no filesystem da imagem
    pub dont_write_bytecode: bool,

    /// `PYTHONUNBUFFERED=1`: stdout/stderr sem buffer, logs em ordem
    pub unbuffered: bool,

    /// `PIP_DISABLE_PIP_VERSION_CHECK=1`: só tem efeito durante o build
    pub pip_disable_version_check: bool,
}

impl Default for ProcessEnv {
    fn default() -> Self {
        Self {
            dont_write_bytecode: true,
            unbuffered: true,
            pip_disable_version_check: true,
        }
    }
}

impl ProcessEnv {
    /// Variáveis que valem para o processo em execução
    pub fn runtime_vars(&self) -> Vec<(&'static str, &'static str)> {
        let mut vars = Vec::new();
        if self.dont_write_bytecode {
            vars.push(("PYTHONDONTWRITEBYTECODE", "1"));
        }
        if self.unbuffered {
            vars.push(("PYTHONUNBUFFERED", "1"));
        }
        vars
    }

    /// Variáveis que só existem durante o build (renderizadas como `ARG`)
    pub fn build_only_vars(&self) -> Vec<(&'static str, &'static str)> {
        let mut vars = Vec::new();
        if self.pip_disable_version_check {
            vars.push(("PIP_DISABLE_PIP_VERSION_CHECK", "1"));
        }
        vars
    }
}
