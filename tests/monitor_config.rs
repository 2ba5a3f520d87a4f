use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use engagement_monitor::config::{CollectorConfig, MonitorConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ENGAGEMENT_CONFIG",
        "ENGAGEMENT_OUTPUT_ROOT",
        "ENGAGEMENT_SOURCE",
        "ENGAGEMENT_RESPONDENT",
        "ENGAGEMENT_FORWARD_URL",
        "ENGAGEMENT_CLASSIFIER",
        "ENGAGEMENT_VIDEO",
        "ENGAGEMENT_FORWARD_QUEUE",
        "ENGAGEMENT_COLLECTOR_CONFIG",
        "ENGAGEMENT_COLLECTOR_ADDR",
        "ENGAGEMENT_COLLECTOR_WS_ADDR",
        "ENGAGEMENT_COLLECTOR_ROOT",
        "ENGAGEMENT_COLLECTOR_GLOBAL_LOG",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "output_root": "/srv/engagement",
        "respondent": "student_01",
        "session_label": "2024-05-01",
        "classifier": "stub",
        "video": true,
        "source": {
            "uri": "serial:///dev/ttyUSB1?baud=921600",
            "read_timeout_ms": 250,
            "target_fps": 8
        },
        "forward": {
            "url": "http://10.0.0.5:8000",
            "queue_capacity": 16,
            "timeout_secs": 2
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("ENGAGEMENT_CONFIG", file.path());
    std::env::set_var("ENGAGEMENT_RESPONDENT", "student_02");
    std::env::set_var("ENGAGEMENT_VIDEO", "off");
    std::env::set_var("ENGAGEMENT_FORWARD_QUEUE", "32");

    let cfg = MonitorConfig::load().expect("load config");

    assert_eq!(cfg.output_root, PathBuf::from("/srv/engagement"));
    assert_eq!(cfg.respondent.as_deref(), Some("student_02"));
    assert_eq!(cfg.session_label.as_deref(), Some("2024-05-01"));
    assert!(!cfg.video);
    assert_eq!(cfg.source.uri, "serial:///dev/ttyUSB1?baud=921600");
    assert_eq!(cfg.source.read_timeout, Duration::from_millis(250));
    assert_eq!(cfg.source.target_fps, 8);
    assert_eq!(cfg.forward.url.as_deref(), Some("http://10.0.0.5:8000"));
    assert_eq!(cfg.forward.queue_capacity, 32);
    assert_eq!(cfg.forward.timeout, Duration::from_secs(2));

    let forward = cfg.forward_config();
    assert_eq!(forward.queue_capacity, 32);
    assert_eq!(cfg.source_options().read_timeout, Duration::from_millis(250));

    clear_env();
}

#[test]
fn toml_config_is_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        respondent = "r7"
        classifier = "stub"

        [source]
        uri = "stub://lab?frames=10"
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("ENGAGEMENT_CONFIG", file.path());

    let cfg = MonitorConfig::load().expect("load config");
    assert_eq!(cfg.respondent.as_deref(), Some("r7"));
    assert_eq!(cfg.source.uri, "stub://lab?frames=10");
    assert!(cfg.forward.url.is_none());

    clear_env();
}

#[test]
fn invalid_overrides_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ENGAGEMENT_RESPONDENT", "../escape");
    assert!(MonitorConfig::load().is_err());
    clear_env();

    std::env::set_var("ENGAGEMENT_FORWARD_QUEUE", "0");
    assert!(MonitorConfig::load().is_err());
    clear_env();

    std::env::set_var("ENGAGEMENT_VIDEO", "sometimes");
    assert!(MonitorConfig::load().is_err());
    clear_env();

    std::env::set_var("ENGAGEMENT_CONFIG", "/nonexistent/engagement.json");
    assert!(MonitorConfig::load().is_err());
    clear_env();
}

#[test]
fn collector_config_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let defaults = CollectorConfig::load().expect("default collector config");
    assert_eq!(defaults.addr, "0.0.0.0:8000");
    assert!(defaults.ws_addr.is_none());
    assert!(!defaults.global_log);

    std::env::set_var("ENGAGEMENT_COLLECTOR_ADDR", "127.0.0.1:9100");
    std::env::set_var("ENGAGEMENT_COLLECTOR_ROOT", "/tmp/collector");
    std::env::set_var("ENGAGEMENT_COLLECTOR_GLOBAL_LOG", "yes");
    let cfg = CollectorConfig::load().expect("collector config");
    assert_eq!(cfg.addr, "127.0.0.1:9100");
    assert_eq!(cfg.root, PathBuf::from("/tmp/collector"));
    assert!(cfg.global_log);

    std::env::set_var("ENGAGEMENT_COLLECTOR_GLOBAL_LOG", "sometimes");
    assert!(CollectorConfig::load().is_err());
    std::env::remove_var("ENGAGEMENT_COLLECTOR_GLOBAL_LOG");

    std::env::set_var("ENGAGEMENT_COLLECTOR_ADDR", "not-an-address");
    assert!(CollectorConfig::load().is_err());

    clear_env();
}
