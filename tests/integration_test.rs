use pretty_assertions::assert_eq;
use scriptcon::{Overrides, RunOptions, Script, SessionError, SessionOptions, Target, Verdict};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const LOGIN: &str = r#"
name = "login"

[vars]
user = "[1,2]"

[defaults]
timeout = "5s"
max_retries = 1

[pacing]
line_delay = "10ms"

[[steps]]
name = "login"
[[steps.on]]
text = "User:"
do = ['sendline "${user}"']
goto = "password"

[[steps]]
name = "password"
[[steps.on]]
text = "Password:"
do = ['sendline "Digital1977"']
goto = "ready"

[[steps]]
name = "ready"
[[steps.on]]
regex = '\$ $'
finish = "success"
"#;

/// Read until a carriage return arrives and return everything read.
async fn read_line(stream: &mut TcpStream) -> Vec<u8> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while !line.ends_with(b"\r") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        line.push(byte[0]);
    }
    line
}

async fn listen() -> (TcpListener, Target) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Target::tcp("127.0.0.1", port))
}

fn compile(src: &str) -> scriptcon::CompiledScript {
    Script::from_toml_str(src)
        .unwrap()
        .compile(&Overrides::default())
        .unwrap()
}

#[tokio::test]
async fn test_login_over_tcp() {
    let (listener, target) = listen().await;
    let console = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"\r\nUser: ").await.unwrap();
        let user = read_line(&mut stream).await;
        stream.write_all(b"\r\nPassword: ").await.unwrap();
        let password = read_line(&mut stream).await;
        stream.write_all(b"\r\n$ ").await.unwrap();
        (user, password)
    });

    let script = compile(LOGIN);
    let report = scriptcon::run(&target, &script, RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.verdict, Verdict::Success, "{}", report.reason);
    assert_eq!(report.retries, 0);
    assert_eq!(report.path, ["login", "password", "ready"]);
    assert_eq!(report.target.as_deref(), Some(target.to_string().as_str()));

    let (user, password) = console.await.unwrap();
    assert_eq!(user, b"[1,2]\r");
    assert_eq!(password, b"Digital1977\r");
}

#[tokio::test]
async fn test_missing_prompt_keeps_transcript() {
    let (listener, target) = listen().await;
    let console = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"User:").await.unwrap();
        read_line(&mut stream).await;
        // Stay silent until the client hangs up.
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });

    let script = Script::from_toml_str(LOGIN)
        .unwrap()
        .compile(&Overrides {
            timeout: Some(Duration::from_millis(300)),
            ..Overrides::default()
        })
        .unwrap();
    let report = scriptcon::run(&target, &script, RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.verdict, Verdict::Failure);
    assert_eq!(report.terminal_step.as_deref(), Some("password"));
    assert_eq!(report.transcript.text(), "User:");
    console.await.unwrap();
}

#[tokio::test]
async fn test_telnet_negotiation_is_filtered() {
    let (listener, target) = listen().await;
    let console = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // IAC DO TERMINAL-TYPE, IAC WILL ECHO
        stream.write_all(&[255, 253, 24, 255, 251, 1]).await.unwrap();
        stream.write_all(b"User: ").await.unwrap();
        let reply = read_line(&mut stream).await;
        stream.write_all(b"Password: ").await.unwrap();
        read_line(&mut stream).await;
        stream.write_all(b"$ ").await.unwrap();
        reply
    });

    let script = compile(LOGIN);
    let report = scriptcon::run(
        &target.with_telnet(true),
        &script,
        RunOptions::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.verdict, Verdict::Success, "{}", report.reason);
    assert!(report.transcript.text().starts_with("User: "));

    // IAC WONT TERMINAL-TYPE, IAC DO ECHO, then the user name
    let reply = console.await.unwrap();
    assert_eq!(reply, b"\xff\xfc\x18\xff\xfd\x01[1,2]\r");
}

#[tokio::test]
async fn test_refused_connection_is_an_error() {
    let (listener, target) = listen().await;
    drop(listener);

    let script = compile(LOGIN);
    let err = scriptcon::run(&target, &script, RunOptions::default(), CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SessionError::Connection { .. }), "{err}");
}

#[tokio::test]
async fn test_cancel_closes_connection() {
    let (listener, target) = listen().await;
    let console = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut rest = Vec::new();
        // Zero linger turns the client's close into a reset.
        let _ = stream.read_to_end(&mut rest).await;
        rest
    });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let script = compile(LOGIN);
    let report = scriptcon::run(&target, &script, RunOptions::default(), cancel)
        .await
        .unwrap();

    assert_eq!(report.verdict, Verdict::Cancelled);
    assert!(report.elapsed < Duration::from_secs(5));
    assert!(console.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_before_connect() {
    let (listener, target) = listen().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let script = compile(LOGIN);
    let report = scriptcon::run(&target, &script, RunOptions::default(), cancel)
        .await
        .unwrap();

    assert_eq!(report.verdict, Verdict::Cancelled);
    assert_eq!(report.terminal_step, None);
    assert!(report.path.is_empty());
    let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
    assert!(accepted.is_err(), "no connection should have been attempted");
}

#[tokio::test]
async fn test_deadline_covers_connect() {
    let (_listener, target) = listen().await;
    let options = RunOptions {
        session: SessionOptions {
            deadline: Some(Duration::ZERO),
            ..SessionOptions::default()
        },
        ..RunOptions::default()
    };

    let script = compile(LOGIN);
    let report = scriptcon::run(&target, &script, options, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.verdict, Verdict::Cancelled);
    assert!(report.reason.contains("deadline"), "{}", report.reason);
    assert_eq!(report.target.as_deref(), Some(target.to_string().as_str()));
}

#[test]
fn test_demo_scripts_compile() {
    let demos = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");
    for name in ["rsts_boot.toml", "login.json"] {
        let script = Script::load(demos.join(name)).unwrap();
        script
            .compile(&Overrides::default())
            .unwrap_or_else(|e| panic!("{name}: {e:#}"));
    }
}

mod cli {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::process::{Command, Output};
    use std::thread;
    use tempfile::TempDir;

    fn script_file(dir: &TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("script.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn scriptcon(args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_scriptcon"))
            .args(args)
            .env("RUST_LOG", "warn")
            .output()
            .expect("Failed to execute scriptcon")
    }

    /// Accept one connection, write `greeting`, then echo nothing until the
    /// client goes away.
    fn console(greeting: &'static [u8]) -> (String, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut stream, _): (TcpStream, _) = listener.accept().unwrap();
            stream.write_all(greeting).unwrap();
            let mut received = Vec::new();
            let _ = stream.read_to_end(&mut received);
            received
        });
        (addr, handle)
    }

    const READY: &str = r#"
name = "ready"
[[steps]]
name = "prompt"
timeout = "300ms"
max_retries = 1
[[steps.on]]
text = "READY"
do = ['sendline "RUN"']
finish = "success"
[[steps.on]]
text = "?ERROR"
finish = "failure"
"#;

    #[test]
    fn test_success_writes_report_and_log() {
        let dir = TempDir::new().unwrap();
        let script = script_file(&dir, READY);
        let report = dir.path().join("report.json");
        let log = dir.path().join("session.log");
        let (addr, server) = console(b"boot\r\nREADY\r\n");

        let output = scriptcon(&[
            "--script",
            script.to_str().unwrap(),
            "--target",
            &addr,
            "--report",
            report.to_str().unwrap(),
            "--log",
            log.to_str().unwrap(),
        ]);

        assert_eq!(
            output.status.code(),
            Some(0),
            "stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
        assert_eq!(json["verdict"], "success");
        assert_eq!(json["path"], serde_json::json!(["prompt"]));
        assert!(std::fs::read_to_string(&log).unwrap().contains("READY"));
        assert_eq!(server.join().unwrap(), b"RUN\r");
    }

    #[test]
    fn test_failure_terminal_exits_3() {
        let dir = TempDir::new().unwrap();
        let script = script_file(&dir, READY);
        let (addr, _server) = console(b"?ERROR\r\n");

        let output = scriptcon(&["-s", script.to_str().unwrap(), "-t", &addr]);
        assert_eq!(output.status.code(), Some(3));
    }

    #[test]
    fn test_echo_mirrors_console_output() {
        let dir = TempDir::new().unwrap();
        let script = script_file(&dir, READY);
        let (addr, _server) = console(b"hello READY");

        let output = scriptcon(&["-s", script.to_str().unwrap(), "-t", &addr, "--echo"]);
        assert_eq!(output.status.code(), Some(0));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello READY");
    }

    #[test]
    fn test_deadline_exits_4() {
        let dir = TempDir::new().unwrap();
        let script = script_file(&dir, READY);
        let (addr, _server) = console(b"");

        let output = scriptcon(&[
            "-s",
            script.to_str().unwrap(),
            "-t",
            &addr,
            "--timeout",
            "10s",
            "--deadline",
            "200ms",
        ]);
        assert_eq!(output.status.code(), Some(4));
    }

    #[test]
    fn test_refused_connection_exits_2() {
        let dir = TempDir::new().unwrap();
        let script = script_file(&dir, READY);
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let output = scriptcon(&["-s", script.to_str().unwrap(), "-t", &addr]);
        assert_eq!(output.status.code(), Some(2));
    }

    #[test]
    fn test_invalid_script_exits_1() {
        let dir = TempDir::new().unwrap();
        let script = script_file(
            &dir,
            r#"
name = "broken"
[[steps]]
name = "a"
[[steps.on]]
text = "x"
goto = "missing"
"#,
        );

        let output = scriptcon(&["-s", script.to_str().unwrap(), "-t", "127.0.0.1:1"]);
        assert_eq!(output.status.code(), Some(1));
        assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown step: missing"));
    }

    #[test]
    fn test_missing_target_exits_1() {
        let dir = TempDir::new().unwrap();
        let script = script_file(&dir, READY);

        let output = scriptcon(&["-s", script.to_str().unwrap()]);
        assert_eq!(output.status.code(), Some(1));
    }

    #[test]
    fn test_bad_arguments_exit_1() {
        let output = scriptcon(&["--no-such-flag"]);
        assert_eq!(output.status.code(), Some(1));
    }
}
