//! End-to-end scenarios for the supervisor
//!
//! Scripts are plain `sh`; container and compose runtimes are treated as
//! absent, so container requests exercise the refusal and fallback paths.

use std::collections::HashMap;
use std::path::PathBuf;

use appvisor_server::domain::sandbox::{IsolationKind, SandboxConfig};
use appvisor_server::domain::service::ServiceStatus;
use appvisor_server::ErrorKind;
use integration_tests::*;
use serde_json::json;

// ============================================================================
// Registry Tests
// ============================================================================

#[tokio::test]
async fn test_bad_manifest_does_not_block_other_apps() {
    let env = TestEnv::new();
    env.add_app("broken", "[app\nid = ", &[]);
    env.add_app("weather", WEATHER_MANIFEST, &[("scripts/get_weather.sh", WEATHER_SCRIPT)]);
    std::fs::create_dir_all(env.apps_dir().join("not-an-app")).unwrap();

    let supervisor = env.supervisor(env.config()).await;

    let ids: Vec<String> = supervisor
        .apps()
        .data
        .unwrap()
        .into_iter()
        .map(|a| a.id)
        .collect();
    assert_eq!(ids, vec!["weather".to_string()]);
}

#[tokio::test]
async fn test_resolve_polish_phrase() {
    let env = TestEnv::new();
    env.add_app("weather", WEATHER_MANIFEST, &[("scripts/get_weather.sh", WEATHER_SCRIPT)]);
    let supervisor = env.supervisor(env.config()).await;

    let outcome = supervisor.resolve("pokaż mi dzisiaj pogodę");
    assert!(outcome.success);
    assert_eq!(outcome.data.as_deref(), Some("weather"));

    let missing = supervisor.resolve("zamów pizzę");
    assert!(!missing.success);
    assert_eq!(missing.error_kind(), Some(ErrorKind::NotFound));
}

#[tokio::test]
async fn test_run_script_returns_structured_data() {
    let env = TestEnv::new();
    env.add_app("weather", WEATHER_MANIFEST, &[("scripts/get_weather.sh", WEATHER_SCRIPT)]);
    let supervisor = env.supervisor(env.config()).await;

    let outcome = supervisor
        .run_script("weather", "get_weather", &["Kraków".to_string()])
        .await;

    assert!(outcome.success, "run failed: {:?}", outcome.error);
    let result = outcome.data.unwrap();
    assert!(result.success);
    assert_eq!(result.output.as_structured(), Some(&json!({"city": "Kraków"})));

    // the run is recorded in the app's own log sink
    let logs = supervisor.registry().app_logs("weather", 10).unwrap();
    assert!(!logs.logs.is_empty());
}

#[tokio::test]
async fn test_script_timeout_is_not_a_plain_failure() {
    let env = TestEnv::new();
    env.add_app("weather", WEATHER_MANIFEST, &[("scripts/slow.sh", SLOW_SCRIPT)]);
    let config = appvisor_server::Config {
        script_timeout: 1,
        ..env.config()
    };
    let supervisor = env.supervisor(config).await;

    let started = std::time::Instant::now();
    let outcome = supervisor.run_script("weather", "slow", &[]).await;
    assert!(started.elapsed() < std::time::Duration::from_secs(10));

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));
    let result = outcome.data.unwrap();
    assert!(result.timed_out);
    assert!(result.exit_code.is_none());
}

#[tokio::test]
async fn test_file_access_is_contained() {
    let env = TestEnv::new();
    env.add_app("weather", WEATHER_MANIFEST, &[("notes.txt", "hello")]);
    let supervisor = env.supervisor(env.config()).await;

    let read = supervisor.read_file("weather", "notes.txt").await;
    assert_eq!(read.data.as_deref(), Some("hello"));

    for path in ["../escape.txt", "sub/../../escape.txt", "/etc/passwd"] {
        let outcome = supervisor.write_file("weather", path, "x").await;
        assert!(!outcome.success, "write to {} was allowed", path);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Security), "path {}", path);
    }
    assert!(!env.apps_dir().join("escape.txt").exists());
    assert!(!env.path().join("escape.txt").exists());

    let outcome = supervisor.read_file("weather", "../../state.db").await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Security));

    let outcome = supervisor.write_file("weather", "data/out.txt", "ok").await;
    assert!(outcome.success);
}

// ============================================================================
// Sandbox Tests
// ============================================================================

fn process_sandbox(network: bool, timeout: u64) -> SandboxConfig {
    SandboxConfig {
        isolation: IsolationKind::Process,
        network,
        timeout,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_sandbox_exec_runs_and_cleans_up() {
    let env = TestEnv::new();
    let supervisor = env.supervisor(env.config()).await;

    let mut vars = HashMap::new();
    vars.insert("GREETING".to_string(), "cześć".to_string());
    let outcome = supervisor
        .sandbox_exec("notes", process_sandbox(true, 10), "echo \"$GREETING\"", None, vars)
        .await;

    assert!(outcome.success, "sandbox run failed: {:?}", outcome.error);
    let run = outcome.data.unwrap();
    assert!(!run.degraded);
    assert_eq!(run.result.output.as_raw(), Some("cześć"));
    assert!(supervisor.sandboxes().list().is_empty());
}

#[tokio::test]
async fn test_sandbox_timeout_kills_command() {
    let env = TestEnv::new();
    let supervisor = env.supervisor(env.config()).await;

    let outcome = supervisor
        .sandbox_exec("notes", process_sandbox(true, 1), "sleep 30", None, HashMap::new())
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));
    assert!(outcome.data.unwrap().result.timed_out);
}

#[tokio::test]
async fn test_sandbox_without_network_cannot_reach_interfaces() {
    let env = TestEnv::new();
    let supervisor = env.supervisor(env.config()).await;

    let outcome = supervisor
        .sandbox_exec("notes", process_sandbox(false, 10), "cat /proc/net/dev", None, HashMap::new())
        .await;

    if outcome.success {
        let run = outcome.data.unwrap();
        let stdout = run.result.output.as_raw().unwrap_or_default().to_string();
        let ifaces = interfaces(&stdout);
        assert!(
            ifaces.iter().all(|i| i == "lo"),
            "sandbox saw interfaces {:?}",
            ifaces
        );
    } else {
        // host refused to create the namespace: the run must not happen
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Infra));
    }
}

#[tokio::test]
async fn test_container_isolation_is_never_silently_weakened() {
    let env = TestEnv::new();
    let supervisor = env.supervisor(env.config()).await;

    let refused = supervisor
        .sandbox_exec("notes", SandboxConfig::default(), "true", None, HashMap::new())
        .await;
    assert!(!refused.success);
    assert_eq!(refused.error_kind(), Some(ErrorKind::Infra));

    let config = SandboxConfig {
        allow_process_fallback: true,
        network: true,
        ..Default::default()
    };
    let outcome = supervisor
        .sandbox_exec("notes", config, "echo fallback", None, HashMap::new())
        .await;
    assert!(outcome.success, "fallback run failed: {:?}", outcome.error);
    let run = outcome.data.unwrap();
    assert!(run.degraded);
    assert_eq!(run.isolation, IsolationKind::Process);
    assert!(!run.warnings.is_empty());
}

// ============================================================================
// Service Tests
// ============================================================================

const SERVICES: &str = r#"
[services.db]
type = "internal"
health_check_interval = 3600

[services.api]
type = "internal"
dependencies = ["db"]
auto_start = false
health_check_interval = 3600
"#;

#[tokio::test]
async fn test_dependency_gate_and_idempotent_lifecycle() {
    let env = TestEnv::new();
    let config = appvisor_server::Config {
        services_file: Some(env.services_file(SERVICES)),
        ..env.config()
    };
    let supervisor = env.supervisor(config).await;

    let gated = supervisor.start_service("api").await;
    assert!(!gated.success);
    assert_eq!(gated.error_kind(), Some(ErrorKind::Configuration));
    assert_eq!(
        supervisor.service_status("db").await.data.unwrap().status,
        ServiceStatus::Stopped
    );

    assert!(supervisor.start_service("db").await.success);
    assert!(supervisor.start_service("api").await.success);
    let again = supervisor.start_service("api").await;
    assert!(again.success);
    assert_eq!(again.data.unwrap().status, ServiceStatus::Running);

    assert!(supervisor.stop_service("api").await.success);
    let again = supervisor.stop_service("api").await;
    assert!(again.success);
    assert_eq!(again.data.unwrap().status, ServiceStatus::Stopped);

    let missing = supervisor.start_service("nope").await;
    assert_eq!(missing.error_kind(), Some(ErrorKind::NotFound));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_service_state_survives_supervisor_restart() {
    let env = TestEnv::new();
    let services_file: PathBuf = env.services_file(SERVICES);

    {
        let config = appvisor_server::Config {
            services_file: Some(services_file.clone()),
            ..env.config()
        };
        let supervisor = env.supervisor(config).await;
        let started = supervisor.services().start_auto().await;
        assert_eq!(started, vec!["db".to_string()]);
        assert!(supervisor.restart_service("db").await.success);
    }

    let config = appvisor_server::Config {
        services_file: Some(services_file),
        ..env.config()
    };
    let supervisor = env.supervisor(config).await;
    let state = supervisor.services().state("db").await.unwrap();
    assert_eq!(state.status, ServiceStatus::Stopped);
    assert_eq!(state.restart_count, 1);
    assert_eq!(state.last_known_status, Some(ServiceStatus::Running));
}

#[tokio::test]
async fn test_compose_without_runtime_is_reported_unavailable() {
    let env = TestEnv::new();
    let supervisor = env.supervisor(env.config()).await;

    let status = supervisor.compose_status().data.unwrap();
    assert!(!status.available);

    let outcome = supervisor.compose_up(&[]).await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Infra));
}
