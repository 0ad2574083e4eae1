#![cfg(all(unix, feature = "cli"))]

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Output, Stdio};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/gwcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

struct Server {
    child: Child,
    // Held open so serve never writes into a closed pipe.
    _stdout: BufReader<ChildStdout>,
    endpoint: String,
    dir: PathBuf,
}

impl Server {
    fn start(tag: &str, extra: &[&str]) -> Self {
        let dir = unique_temp_dir(tag);
        let endpoint = format!("unix://{}", dir.join("serve.sock").display());
        let mut child = Command::new(env!("CARGO_BIN_EXE_gamewire"))
            .args(["--log-level", "error", "--format", "json", "serve", &endpoint])
            .args(extra)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("serve command should start");

        let stdout = child.stdout.take().expect("serve stdout should be piped");
        let mut stdout = BufReader::new(stdout);
        let mut line = String::new();
        stdout
            .read_line(&mut line)
            .expect("serve should announce its endpoint");
        assert!(line.contains("gamewire.cli.v1.listening"), "unexpected banner: {line}");

        Self {
            child,
            _stdout: stdout,
            endpoint,
            dir,
        }
    }

    fn call(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_gamewire"))
            .args(["--log-level", "error", "--format", "json", "call", &self.endpoint])
            .args(args)
            .output()
            .expect("call should run")
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn echo_call_returns_the_payload() {
    let server = Server::start("echo", &[]);
    let output = server.call(&["--data", "hello gamewire"]);

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("gamewire.cli.v1.call-result"));
    assert!(stdout.contains("\"response\":\"hello gamewire\""));
}

#[test]
fn whoami_reports_the_calling_identity() {
    let server = Server::start("whoami", &[]);
    let output = server.call(&["--method", "2", "--identity", "scene-7"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("scene-7"));
    assert!(stdout.contains("responder"));
}

#[test]
fn unknown_method_exits_with_data_invalid() {
    let server = Server::start("missing", &[]);
    let output = server.call(&["--service", "99", "--method", "1"]);

    assert_eq!(output.status.code(), Some(60));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no such method"));
}

#[test]
fn one_way_send_succeeds_without_answer() {
    let server = Server::start("oneway", &[]);
    let output = server.call(&["--method", "3", "--one-way", "--data", "note"]);

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("\"one_way\":true"));
}

#[test]
fn token_is_enforced_when_configured() {
    let server = Server::start("token", &["--token", "letmein"]);

    let refused = server.call(&["--token", "guess", "--timeout", "2s"]);
    assert_eq!(refused.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&refused.stderr).contains("invalid token"));

    let accepted = server.call(&["--token", "letmein", "--data", "x"]);
    assert!(accepted.status.success());
}

#[test]
fn interrupt_stops_serve_cleanly() {
    let mut server = Server::start("sigint", &[]);
    let status = Command::new("kill")
        .args(["-INT", &server.child.id().to_string()])
        .status()
        .expect("kill should run");
    assert!(status.success());

    let exit = server.child.wait().expect("serve should exit");
    assert!(exit.success());
}

#[test]
fn missing_endpoint_fails_to_connect() {
    let dir = unique_temp_dir("absent");
    let endpoint = format!("unix://{}", dir.join("nobody.sock").display());
    let output = Command::new(env!("CARGO_BIN_EXE_gamewire"))
        .args(["--log-level", "error", "call", &endpoint, "--data", "x"])
        .output()
        .expect("call should run");

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("connect failed"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn config_rejects_invalid_files() {
    let dir = unique_temp_dir("config");
    let path = dir.join("gamewire.json");
    std::fs::write(&path, r#"{"ringBufferSize": 1000}"#).expect("config should be writable");

    let output = Command::new(env!("CARGO_BIN_EXE_gamewire"))
        .args(["--format", "json", "config", "--config"])
        .arg(&path)
        .output()
        .expect("config should run");
    assert_eq!(output.status.code(), Some(60));
    assert!(String::from_utf8_lossy(&output.stderr).contains("ringBufferSize"));

    std::fs::write(&path, r#"{"loopThreads": 2}"#).expect("config should be writable");
    let output = Command::new(env!("CARGO_BIN_EXE_gamewire"))
        .args(["--format", "json", "config", "--config"])
        .arg(&path)
        .output()
        .expect("config should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"loopThreads\": 2"));
    assert!(stdout.contains("\"orderedDelivery\": true"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_prints_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_gamewire"))
        .arg("version")
        .output()
        .expect("version should run");
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        format!("gamewire {}", env!("CARGO_PKG_VERSION"))
    );
}
