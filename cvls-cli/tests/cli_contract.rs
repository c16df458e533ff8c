//! Integration tests for core CLI contract behavior.

use {
    cvls::protocol::{AdminCommand, CommandWord, FrameDecoder, SystemCommand, encode_frame},
    predicates::prelude::*,
    std::{
        fs,
        io::{BufRead, BufReader, Read, Write},
        net::TcpListener,
        thread,
    },
    tempfile::tempdir,
};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("cvls");
    for var in [
        "CVLS_HOST",
        "CVLS_PORT",
        "CVLS_SERIAL",
        "CVLS_BAUD",
        "CVLS_TIMEOUT",
        "CVLS_USER",
        "CVLS_PASSWORD",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// A port on which nothing listens.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

/// Text protocol unit on a loopback socket answering from `answer`.
fn text_unit(answer: fn(&str) -> String) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut writer = stream.try_clone().expect("clone stream");
        let mut lines = BufReader::new(stream).lines();
        while let Some(Ok(line)) = lines.next() {
            let reply = answer(line.trim_end());
            if writer.write_all(reply.as_bytes()).is_err() {
                return;
            }
        }
    });
    port
}

/// Binary protocol unit that only accepts admin commands after a login as
/// `admin`/`secret`.
fn binary_unit() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 2048];
        let mut user = Vec::new();
        let mut logged_in = false;
        while let Ok(n) = stream.read(&mut buf) {
            if n == 0 {
                return;
            }
            for frame in decoder.push(&buf[..n]) {
                let command = frame.command;
                let reply = match (command.system_command(), command.admin_command()) {
                    (Some(SystemCommand::Keepalive), _) => encode_frame(command, &[]),
                    (Some(SystemCommand::LoginUsername), _) => {
                        user = frame.data.clone();
                        continue;
                    },
                    (Some(SystemCommand::LoginPassword), _) => {
                        logged_in = user == b"admin" && frame.data == b"secret";
                        let verdict = if logged_in {
                            SystemCommand::LoginSuccessful
                        } else {
                            SystemCommand::LoginFailed
                        };
                        encode_frame(CommandWord::system(verdict), &[])
                    },
                    (_, Some(AdminCommand::ConfigImport)) if logged_in => {
                        encode_frame(command, &frame.data)
                    },
                    (_, Some(AdminCommand::ConfigImportComplete)) if logged_in => {
                        encode_frame(command, &[1])
                    },
                    (_, Some(_)) => {
                        encode_frame(CommandWord::system(SystemCommand::LoginRequest), &[])
                    },
                    _ => continue,
                };
                if stream.write_all(&reply.expect("encode reply")).is_err() {
                    return;
                }
            }
        }
    });
    port
}

fn config_unit(command: &str) -> String {
    match command {
        "&f" => "&f1.20 Apr 12 2022\r\n".to_string(),
        "&@i?" => "&@i2\r\n".to_string(),
        "&@i0" => "&@i0,[Led]\r\nPower=50\r\nMULTILINECOMPLETE\r\n".to_string(),
        "&@i1" => "&@i1,[Fan]\r\nSpeed=3\r\nMULTILINECOMPLETE\r\n".to_string(),
        other => format!("{other},MULTILINECOMPLETE\r\n"),
    }
}

fn log_unit(command: &str) -> String {
    match command {
        "&f" => "&f1.20 Apr 12 2022\r\n".to_string(),
        "&@e?" => "&@e2\r\n".to_string(),
        "&@e0" => "&@e0,3,120,Over temperature\r\n".to_string(),
        "&@e1" => "&@e1,1,7,Power on\r\n".to_string(),
        other => format!("{other}\r\n"),
    }
}

fn old_firmware_unit(command: &str) -> String {
    match command {
        "&f" => "&f1.02 Jan 01 2015\r\n".to_string(),
        other => format!("{other}!v\r\n"),
    }
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cvls"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cvls"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn completions_bash_exits_zero() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .code(0)
        .stdout(predicate::str::contains("config-export"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    // Enumeration can fail on hosts without serial support; when it
    // succeeds, stdout must be a JSON array.
    if output.status.success() {
        let parsed: serde_json::Value =
            serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
        assert!(parsed.is_array(), "should be JSON array");
    }
}

#[test]
fn exit_code_two_for_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_invalid_protocol() {
    let mut cmd = cli_cmd();
    cmd.args(["--protocol", "modbus", "logs"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("modbus"));
}

#[test]
fn firmware_missing_file_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("missing.bin");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["--host", "127.0.0.1", "--tcp-port"])
        .arg(closed_port().to_string())
        .arg("firmware")
        .arg(missing.as_os_str())
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Failed to read firmware image"));
}

#[test]
fn firmware_with_bad_header_is_refused_before_connecting() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("image.bin");
    let mut data = vec![0u8; 64];
    data[12..16].copy_from_slice(&1000u32.to_be_bytes());
    fs::write(&image, data).expect("write image");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["--host", "127.0.0.1", "--tcp-port"])
        .arg(closed_port().to_string())
        .arg("firmware")
        .arg(image.as_os_str())
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not a firmware image"));
}

#[test]
fn unreachable_unit_fails_with_connect_error() {
    let dir = tempdir().expect("tempdir should be created");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["--host", "127.0.0.1", "--tcp-port"])
        .arg(closed_port().to_string())
        .arg("logs")
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Failed to connect"));
}

#[test]
fn config_export_text_unit_writes_stdout() {
    let dir = tempdir().expect("tempdir should be created");
    let port = text_unit(config_unit);

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["-q", "--protocol", "text", "--host", "127.0.0.1", "--tcp-port"])
        .arg(port.to_string())
        .arg("config-export")
        .assert()
        .success()
        .stdout("[Led]\r\nPower=50\r\n[Fan]\r\nSpeed=3\r\n");
}

#[test]
fn config_export_to_file() {
    let dir = tempdir().expect("tempdir should be created");
    let out = dir.path().join("unit.ini");
    let port = text_unit(config_unit);

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["--protocol", "text", "--host", "127.0.0.1", "--tcp-port"])
        .arg(port.to_string())
        .arg("config-export")
        .arg("-o")
        .arg(out.as_os_str())
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    let saved = fs::read_to_string(&out).expect("exported file");
    assert!(saved.starts_with("[Led]\r\n"));
}

#[test]
fn logs_json_from_text_unit() {
    let dir = tempdir().expect("tempdir should be created");
    let port = text_unit(log_unit);

    let mut cmd = cli_cmd();
    let output = cmd
        .current_dir(dir.path())
        .args(["-q", "--protocol", "text", "--host", "127.0.0.1", "--tcp-port"])
        .arg(port.to_string())
        .args(["logs", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let logs: serde_json::Value = serde_json::from_slice(&output.stdout).expect("JSON logs");
    let logs = logs.as_array().expect("array");
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0]["message"], "Over temperature");
    assert_eq!(logs[0]["count"], 3);
    assert_eq!(logs[1]["timestamp"], 7);
}

#[test]
fn failed_transfer_exits_non_zero_with_message() {
    let dir = tempdir().expect("tempdir should be created");
    let port = text_unit(old_firmware_unit);

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["--protocol", "text", "--host", "127.0.0.1", "--tcp-port"])
        .arg(port.to_string())
        .arg("logs")
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("upgrade the unit firmware"));
}

#[test]
fn config_import_binary_logs_in_first() {
    let dir = tempdir().expect("tempdir should be created");
    let file = dir.path().join("unit.ini");
    fs::write(&file, "[Led]\r\nPower=80\r\n").expect("write config");
    let port = binary_unit();

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["--user", "admin", "--password", "secret", "--host", "127.0.0.1"])
        .arg("--tcp-port")
        .arg(port.to_string())
        .arg("config-import")
        .arg(file.as_os_str())
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Configuration accepted"));
}

#[test]
fn rejected_login_fails_before_transfer() {
    let dir = tempdir().expect("tempdir should be created");
    let file = dir.path().join("unit.ini");
    fs::write(&file, "[Led]\r\nPower=80\r\n").expect("write config");
    let port = binary_unit();

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .env("CVLS_USER", "admin")
        .env("CVLS_PASSWORD", "guess")
        .args(["--host", "127.0.0.1", "--tcp-port"])
        .arg(port.to_string())
        .arg("config-import")
        .arg(file.as_os_str())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Login as admin rejected"));
}

#[test]
fn local_config_file_selects_unit() {
    let dir = tempdir().expect("tempdir should be created");
    let port = text_unit(config_unit);
    fs::write(
        dir.path().join("cvls.toml"),
        format!("[connection]\nhost = \"127.0.0.1\"\ntcp_port = {port}\nprotocol = \"text\"\n"),
    )
    .expect("write config");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["-q", "config-export"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Power=50"));
}

#[test]
fn invalid_config_file_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("cvls.toml"), "invalid toml [[[").expect("write invalid config");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["completions", "zsh"])
        .assert()
        .success();

    let mut cmd = cli_cmd();
    let output = cmd
        .current_dir(dir.path())
        .args(["--host", "127.0.0.1", "--tcp-port"])
        .arg(closed_port().to_string())
        .arg("logs")
        .output()
        .expect("command should execute");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}
