use serde_json::Value;
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    base: PathBuf,
    home: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            base,
            home,
            xdg_config,
            xdg_state,
        }
    }

    fn write(&self, name: &str, content: &str) -> String {
        let path = self.base.join(name);
        fs::write(&path, content).unwrap_or_else(|e| panic!("failed to write {name}: {e}"));
        path.to_string_lossy().into_owned()
    }

    fn log_dir(&self) -> PathBuf {
        self.xdg_state.join("kitrelay")
    }
}

const KITS: &str = r#"[
  {
    "id": 1,
    "settings": {"name": "analytics"},
    "projectionRules": [{
      "projectionId": 7,
      "matcher": {"eventName": "Play"},
      "output": {"shape": {"type": "custom", "eventName": "Song Played"}}
    }]
  },
  {"id": 2, "settings": {"capabilities": "screen"}}
]"#;

const EVENTS: &str = r#"{"kind":"event","name":"Play","event_type":"media","attributes":{"song":"Blue"}}
{"kind":"screen","name":"Home"}
{"kind":"commerce","product_action":"purchase","products":[{"name":"Shoe","sku":"s1","price":10.0}]}

{"kind":"configure","kits":[{"id":1}]}
{"kind":"screen","name":"Home"}
"#;

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("kitrelay"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute kitrelay: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "kitrelay {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn json_lines(output: &Output) -> Vec<Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap_or_else(|e| panic!("bad line {line}: {e}")))
        .collect()
}

#[test]
fn replay_prints_reporting_stream_as_json_lines() {
    let env = CliTestEnv::new();
    let kits = env.write("kits.json", KITS);
    let events = env.write("events.jsonl", EVENTS);
    let args = ["replay", "--kits", kits.as_str(), "--events", events.as_str()];

    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let messages = json_lines(&output);
    let summary: Vec<(i64, &str)> = messages
        .iter()
        .map(|m| {
            (
                m["destination_id"].as_i64().unwrap(),
                m["message_type"].as_str().unwrap(),
            )
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            (1, "event"),
            (1, "screen_view"),
            (2, "screen_view"),
            (1, "commerce_event"),
            (1, "screen_view"),
        ]
    );

    let reports = messages[0]["projection_reports"].as_array().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0]["projection_id"], 7);
    assert_eq!(reports[0]["derived_event_name"], "Song Played");
    assert_eq!(messages[3]["event_name"], "eCommerce - purchase");

    assert!(
        env.log_dir().exists(),
        "log directory should exist at {}",
        env.log_dir().display()
    );
}

#[test]
fn replay_text_format_prints_summary() {
    let env = CliTestEnv::new();
    let kits = env.write("kits.json", KITS);
    let events = env.write("events.jsonl", EVENTS);
    let args = ["replay", "--kits", kits.as_str(), "--events", events.as_str(), "--format", "text"];

    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Kits: 2 created, 2 active, 0 failed"), "got:\n{stdout}");
    assert!(stdout.contains("#7 Song Played"), "got:\n{stdout}");
    assert!(
        stdout.contains("Replay complete: 5 reporting message(s)"),
        "got:\n{stdout}"
    );
}

#[test]
fn replay_honors_config_file() {
    let env = CliTestEnv::new();
    let config_dir = env.xdg_config.join("kitrelay");
    fs::create_dir_all(&config_dir).expect("failed to create config dir");
    fs::write(
        config_dir.join("config.toml"),
        "[engine]\nsupported_kits = [2]\n",
    )
    .expect("failed to write config");

    let kits = env.write("kits.json", KITS);
    let events = env.write("events.jsonl", "{\"kind\":\"screen\",\"name\":\"Home\"}\n");
    let args = ["replay", "--kits", kits.as_str(), "--events", events.as_str()];

    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let messages = json_lines(&output);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["destination_id"], 2);
}

#[test]
fn replay_rejects_invalid_event_line() {
    let env = CliTestEnv::new();
    let kits = env.write("kits.json", KITS);
    let events = env.write("events.jsonl", "{\"kind\":\"teleport\"}\n");

    let output = run_bin(&env, &["replay", "--kits", kits.as_str(), "--events", events.as_str()]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid event on line 1"), "got:\n{stderr}");
}

#[test]
fn check_config_reports_valid_snapshot() {
    let env = CliTestEnv::new();
    let kits = env.write("kits.json", KITS);
    let args = ["check-config", "--kits", kits.as_str()];

    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("kit 1: ok (enabled, 1 projection rule(s))"));
    assert!(stdout.contains("All 2 kit configuration block(s) valid"));
}

#[test]
fn check_config_fails_on_malformed_block() {
    let env = CliTestEnv::new();
    let kits = env.write(
        "kits.json",
        r#"[{"id": 1}, {"id": 2, "eventFilters": "nope"}, {"name": "no id"}]"#,
    );

    let output = run_bin(&env, &["check-config", "--kits", kits.as_str()]);

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stdout.contains("kit 1: ok"), "got:\n{stdout}");
    assert!(stdout.contains("block 1:"), "got:\n{stdout}");
    assert!(stdout.contains("block 2:"), "got:\n{stdout}");
    assert!(stderr.contains("2 of 3 kit configuration block(s) invalid"), "got:\n{stderr}");
}
