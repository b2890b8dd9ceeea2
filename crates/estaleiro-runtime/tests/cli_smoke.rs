use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn copy_dir(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).expect("create dir");
    for entry in fs::read_dir(src).expect("read dir") {
        let entry = entry.expect("entry");
        let target = dst.join(entry.file_name());
        if entry.file_type().expect("file type").is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).expect("copy file");
        }
    }
}

/// Cópia da loja de exemplo num diretório temporário
fn shop() -> TempDir {
    let temp = TempDir::new().expect("tempdir");
    copy_dir(&fixture("shop"), temp.path());
    temp
}

fn write_executable(path: &Path, content: &str) {
    fs::write(path, content).expect("write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

fn estaleiro() -> Command {
    let mut cmd = Command::cargo_bin("estaleiro").expect("binary");
    cmd.env_remove("PORT")
        .env_remove("WEB_CONCURRENCY")
        .env_remove("ESTALEIRO_MODE")
        .env_remove("ESTALEIRO_HOST")
        .env_remove("ESTALEIRO_STATE_FILE")
        .env("XDG_CONFIG_HOME", "/nonexistent/estaleiro-config")
        .env("ESTALEIRO_LOG", "warn");
    cmd
}

#[test]
fn profiles_lists_every_profile() {
    estaleiro()
        .arg("profiles")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("minimal")
                .and(predicate::str::contains("hardened (padrão)"))
                .and(predicate::str::contains("cache-image")),
        );
}

#[test]
fn plan_renders_hardened_dockerfile() {
    let project = shop();
    estaleiro()
        .args(["plan", "--root"])
        .arg(project.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("FROM python:3.12-slim")
                .and(predicate::str::contains("COPY requirements.txt ."))
                .and(predicate::str::contains("python manage.py collectstatic --noinput"))
                .and(predicate::str::contains("USER app:app"))
                .and(predicate::str::contains("HEALTHCHECK"))
                .and(predicate::str::contains("ecommerce.wsgi:application")),
        );
}

#[test]
fn plan_minimal_has_no_identity_or_healthcheck() {
    let project = shop();
    estaleiro()
        .args(["plan", "--profile", "minimal", "--root"])
        .arg(project.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("USER")
                .not()
                .and(predicate::str::contains("HEALTHCHECK").not()),
        );
}

#[test]
fn plan_respects_project_file() {
    let project = shop();
    fs::write(
        project.path().join("estaleiro.toml"),
        "[build]\nprofile = \"cache-image\"\nbase_image = \"python:3.11.9-slim\"\n",
    )
    .expect("write config");

    estaleiro()
        .args(["plan", "--root"])
        .arg(project.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("FROM python:3.11.9-slim AS deps")
                .and(predicate::str::contains("COPY --from=deps /wheels /wheels")),
        );
}

#[test]
fn plan_copies_included_requirements() {
    let project = shop();
    fs::write(project.path().join("base.txt"), "Django==5.0.6\ngunicorn==22.0.0\n")
        .expect("write base.txt");
    fs::write(project.path().join("requirements.txt"), "-r base.txt\nwhitenoise==6.6.0\n")
        .expect("rewrite requirements");

    estaleiro()
        .args(["plan", "--root"])
        .arg(project.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("COPY requirements.txt .")
                .and(predicate::str::contains("COPY base.txt ."))
                .and(predicate::str::contains("pip install --no-cache-dir -r requirements.txt")),
        );
}

#[test]
fn plan_fails_preflight_without_static_root() {
    let project = shop();
    fs::write(
        project.path().join("ecommerce/settings.py"),
        "DEBUG = False\nWSGI_APPLICATION = 'ecommerce.wsgi.application'\n",
    )
    .expect("rewrite settings");

    estaleiro()
        .args(["plan", "--root"])
        .arg(project.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("STATIC_ROOT"));
}

#[test]
fn audit_minimal_plan_reports_gaps() {
    let project = shop();
    fs::write(project.path().join(".env"), "SECRET_KEY=local\n").expect("write .env");

    estaleiro()
        .args(["audit", "--json", "--profile", "minimal", "--root"])
        .arg(project.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("GAP-001")
                .and(predicate::str::contains("GAP-002"))
                .and(predicate::str::contains("GAP-003"))
                .and(predicate::str::contains("GAP-006"))
                .and(predicate::str::contains("GAP-007"))
                .and(predicate::str::contains("GAP-008")),
        );
}

#[test]
fn audit_strict_fails_on_findings() {
    let project = shop();
    estaleiro()
        .args(["audit", "--strict", "--root"])
        .arg(project.path())
        .assert()
        .code(1)
        .stdout(predicate::str::contains("GAP-007"));
}

#[test]
fn audit_handwritten_dockerfile() {
    let project = shop();
    estaleiro()
        .args(["audit", "--json", "--root"])
        .arg(project.path())
        .arg("--dockerfile")
        .arg(fixture("handwritten.Dockerfile"))
        .assert()
        .success()
        .stdout(
            predicate::str::contains("GAP-001")
                .and(predicate::str::contains("GAP-004"))
                .and(predicate::str::contains("GAP-005")),
        );
}

#[test]
fn audit_rejects_conflict_markers() {
    let project = shop();
    estaleiro()
        .args(["audit", "--root"])
        .arg(project.path())
        .arg("--dockerfile")
        .arg(fixture("conflicted.Dockerfile"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("conflito de merge"));
}

#[test]
fn probe_dead_port_is_unhealthy() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };

    estaleiro()
        .args(["probe", "--timeout", "2", "--port", &port.to_string()])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("falhou"));
}

#[test]
fn launch_rejects_invalid_config() {
    let temp = TempDir::new().expect("tempdir");
    estaleiro()
        .args(["launch", "--workers", "0", "--root"])
        .arg(temp.path())
        .assert()
        .code(64);
}

#[test]
fn launch_rejects_misspelled_runtime_key() {
    let temp = TempDir::new().expect("tempdir");
    fs::write(
        temp.path().join("estaleiro.toml"),
        "[runtime]\nwokers = 0\nserver = \"/nonexistent/gunicorn\"\n",
    )
    .expect("write config");

    estaleiro()
        .args(["launch", "--root"])
        .arg(temp.path())
        .assert()
        .code(64)
        .stderr(predicate::str::contains("wokers"));
}

#[test]
fn launch_reports_missing_server() {
    let temp = TempDir::new().expect("tempdir");
    fs::write(
        temp.path().join("estaleiro.toml"),
        "[runtime]\nserver = \"/nonexistent/bin/gunicorn\"\n",
    )
    .expect("write config");

    estaleiro()
        .args(["launch", "--root"])
        .arg(temp.path())
        .assert()
        .code(127);
}

#[test]
fn launch_propagates_server_exit_code_and_records_state() {
    let temp = TempDir::new().expect("tempdir");
    let server = temp.path().join("fake-gunicorn");
    write_executable(&server, "#!/bin/sh\nexit 3\n");
    fs::write(
        temp.path().join("estaleiro.toml"),
        format!("[runtime]\nserver = \"{}\"\nport = 0\n", server.display()),
    )
    .expect("write config");
    let state = temp.path().join("runtime.json");

    estaleiro()
        .args(["launch", "--root"])
        .arg(temp.path())
        .arg("--state-file")
        .arg(&state)
        .assert()
        .code(3);

    estaleiro()
        .args(["status", "--state-file"])
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains("terminated"));
}
