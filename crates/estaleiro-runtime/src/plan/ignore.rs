//! Lista de exclusão do contexto de build (formato `.dockerignore`)

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::path::Path;

/// Exclusões padrão: segredos, bancos locais, caches e artefatos gerados
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    ".git",
    ".env",
    ".env.*",
    "**/*.pem",
    "**/*.key",
    "db.sqlite3",
    "**/*.log",
    "**/__pycache__",
    "**/*.pyc",
    "media",
    "staticfiles",
    ".venv",
    "venv",
    "node_modules",
    ".estaleiro",
];

/// Arquivos que nunca deveriam chegar à imagem
pub const SENSITIVE_PATTERNS: &[&str] = &[".env", ".env.*", "**/*.pem", "**/*.key", "db.sqlite3"];

static SENSITIVE: Lazy<Vec<IgnorePattern>> = Lazy::new(|| {
    SENSITIVE_PATTERNS
        .iter()
        .filter_map(|p| IgnorePattern::parse(p))
        .collect()
});

#[derive(Debug, Clone)]
pub struct IgnorePattern {
    raw: String,
    body: String,
    negated: bool,
    regex: Regex,
}

impl IgnorePattern {
    /// Linhas vazias e comentários não são padrões
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (negated, body) = match line.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, line),
        };
        let body = body.trim_start_matches("./").trim_start_matches('/');
        let body = body.trim_end_matches('/');
        if body.is_empty() {
            return None;
        }

        let regex = Regex::new(&glob_to_regex(body)).ok()?;
        Some(Self {
            raw: line.to_string(),
            body: body.to_string(),
            negated,
            regex,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Casa o caminho ou algum diretório ancestral dele
    fn matches(&self, rel: &str) -> bool {
        if self.regex.is_match(rel) {
            return true;
        }
        rel.match_indices('/')
            .any(|(idx, _)| self.regex.is_match(&rel[..idx]))
    }
}

/// Converte um glob em regex ancorada: `*` e `?` não atravessam `/`,
/// `**` atravessa qualquer número de diretórios.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                let at_start = i == 0 || chars[i - 1] == '/';
                let followed_by_slash = chars.get(i + 2) == Some(&'/');
                if at_start && followed_by_slash {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    out.push('$');
    out
}

/// Padrões em ordem; o último que casa decide
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    patterns: Vec<IgnorePattern>,
}

impl IgnoreList {
    pub fn defaults() -> Self {
        Self::parse(&DEFAULT_EXCLUSIONS.join("\n"))
    }

    pub fn parse(text: &str) -> Self {
        Self {
            patterns: text.lines().filter_map(IgnorePattern::parse).collect(),
        }
    }

    /// Padrões do projeto vão depois dos padrões padrão, então `!` no
    /// projeto pode reincluir algo
    pub fn with_project_file(mut self, root: &Path) -> io::Result<Self> {
        let path = root.join(".dockerignore");
        if path.exists() {
            let text = fs::read_to_string(&path)?;
            self.extend(IgnoreList::parse(&text));
        }
        Ok(self)
    }

    pub fn extend(&mut self, other: IgnoreList) {
        for pattern in other.patterns {
            if !self.patterns.iter().any(|p| p.raw == pattern.raw) {
                self.patterns.push(pattern);
            }
        }
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(IgnorePattern::raw)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// `rel` é relativo à raiz do contexto, com `/` como separador
    pub fn is_excluded(&self, rel: &str) -> bool {
        let rel = rel.trim_start_matches("./");
        let mut excluded = false;
        for pattern in &self.patterns {
            if pattern.matches(rel) {
                excluded = !pattern.negated;
            }
        }
        excluded
    }

    /// Algum `!` pode reincluir algo dentro do diretório `dir`? Compara o
    /// prefixo literal do padrão (até o primeiro curinga) com o diretório.
    pub fn may_reinclude_under(&self, dir: &str) -> bool {
        let dir = format!("{}/", dir.trim_start_matches("./").trim_end_matches('/'));
        self.patterns.iter().filter(|p| p.negated).any(|pattern| {
            let literal = pattern
                .body
                .split(|c: char| matches!(c, '*' | '?' | '['))
                .next()
                .unwrap_or("");
            literal.starts_with(&dir) || dir.starts_with(literal)
        })
    }

    /// Texto do arquivo `.dockerignore`
    pub fn render(&self) -> String {
        let mut out = String::from("# Gerado por estaleiro\n");
        for pattern in &self.patterns {
            out.push_str(&pattern.raw);
            out.push('\n');
        }
        out
    }
}

/// O caminho é um arquivo sensível (segredo, chave, banco local)?
pub fn is_sensitive(rel: &str) -> bool {
    SENSITIVE.iter().any(|p| p.matches(rel))
}
