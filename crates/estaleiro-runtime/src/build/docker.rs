//! Executor de `docker build` para o plano renderizado

use super::BuildError;
use crate::plan::{BuildPlan, StepKind};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;

const TAIL_LINES: usize = 20;

/// `#7 [runtime 4/9] RUN pip install ...` ou `#7 [4/9] RUN ...`
static STEP_STARTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#\d+ \[(?:[^\]\s]+ )?\d+/\d+\] (?P<instruction>.+)$")
        .expect("regex de passo do BuildKit")
});

static EXIT_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"exit code: (?P<code>\d+)").expect("regex de exit code"));

/// O que o builder precisa para uma execução
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub context: &'a Path,
    pub dockerfile: &'a Path,
    pub tag: &'a str,
    pub cache_from: Option<&'a str>,
    pub plan: &'a BuildPlan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub image_id: String,
}

/// Ponto de extensão para o builder de imagens
pub trait ImageBuilder {
    fn build(&self, request: &BuildRequest<'_>) -> Result<BuiltImage, BuildError>;
}

/// Executor via CLI do Docker com BuildKit
pub struct DockerImageBuilder {
    program: String,
    work_dir: PathBuf,
}

impl DockerImageBuilder {
    /// `work_dir` guarda o arquivo de id da imagem
    pub fn new(work_dir: &Path) -> Self {
        Self {
            program: "docker".to_string(),
            work_dir: work_dir.to_path_buf(),
        }
    }

    /// Outro executável compatível (`podman`, wrapper de CI)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn args(&self, request: &BuildRequest<'_>, iidfile: &Path) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--progress=plain".to_string(),
            "--file".to_string(),
            request.dockerfile.display().to_string(),
            "--tag".to_string(),
            request.tag.to_string(),
            "--iidfile".to_string(),
            iidfile.display().to_string(),
        ];
        if let Some(cache_from) = request.cache_from {
            args.push("--cache-from".to_string());
            args.push(cache_from.to_string());
        }
        args.push(request.context.display().to_string());
        args
    }

    fn check_available(&self) -> Result<(), BuildError> {
        match Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(_) => Ok(()),
            Err(source) if source.kind() == ErrorKind::NotFound => {
                Err(BuildError::ToolUnavailable {
                    tool: self.program.clone(),
                    source,
                })
            }
            Err(source) => Err(BuildError::Io(source)),
        }
    }
}

impl ImageBuilder for DockerImageBuilder {
    fn build(&self, request: &BuildRequest<'_>) -> Result<BuiltImage, BuildError> {
        self.check_available()?;

        fs::create_dir_all(&self.work_dir)?;
        let iidfile = self.work_dir.join("image.iid");
        if iidfile.exists() {
            fs::remove_file(&iidfile)?;
        }

        let args = self.args(request, &iidfile);
        tracing::info!(command = %format!("{} {}", self.program, args.join(" ")), "executando build");

        let mut child = Command::new(&self.program)
            .args(&args)
            .env("DOCKER_BUILDKIT", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BuildError::ToolUnavailable {
                tool: self.program.clone(),
                source,
            })?;

        // stdout e stderr chegam pelo mesmo canal, na ordem em que saem
        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    let _ = tx.send(line);
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    let _ = tx.send(line);
                }
            }));
        }
        drop(tx);

        let mut progress = BuildProgress::default();
        for line in rx {
            tracing::info!(target: "estaleiro::docker", "{}", line);
            progress.observe(&line);
        }
        for reader in readers {
            let _ = reader.join();
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(progress.into_error(request.plan, status.code().unwrap_or(1)));
        }

        let image_id = fs::read_to_string(&iidfile)
            .map(|id| id.trim().to_string())
            .unwrap_or_default();
        Ok(BuiltImage { image_id })
    }
}

/// Acompanha a saída do BuildKit para apontar o passo que falhou
#[derive(Debug, Default)]
pub struct BuildProgress {
    last_started: Option<String>,
    failed_process: Option<String>,
    exit_code: Option<i32>,
    tail: VecDeque<String>,
}

impl BuildProgress {
    pub fn observe(&mut self, line: &str) {
        if let Some(caps) = STEP_STARTED.captures(line) {
            self.last_started = Some(caps["instruction"].trim().to_string());
        }
        if line.contains("did not complete successfully") {
            if let Some(start) = line.find("process \"") {
                let rest = &line[start + 9..];
                if let Some(end) = rest.find("\" did not complete") {
                    let process = rest[..end].trim_start_matches("/bin/sh -c ");
                    self.failed_process = Some(process.to_string());
                }
            }
            if let Some(caps) = EXIT_CODE.captures(line) {
                self.exit_code = caps["code"].parse().ok();
            }
        }

        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }

    /// Passo do plano cujo texto casa com o processo que falhou ou com o
    /// último passo iniciado
    pub fn failed_step(&self, plan: &BuildPlan) -> Option<StepKind> {
        let find = |needle: &str| {
            plan.steps()
                .flat_map(|(_, step)| step.instructions.iter().map(move |i| (step.kind, i)))
                .find(|(_, instruction)| {
                    let line = instruction.line();
                    line == needle || instruction.args == needle
                })
                .map(|(kind, _)| kind)
        };

        self.failed_process
            .as_deref()
            .and_then(|process| find(process))
            .or_else(|| self.last_started.as_deref().and_then(|last| find(last)))
    }

    pub fn into_error(self, plan: &BuildPlan, status_code: i32) -> BuildError {
        BuildError::StepFailed {
            step: self.failed_step(plan),
            code: self.exit_code.unwrap_or(status_code),
            tail: self.tail.into_iter().collect(),
        }
    }
}
