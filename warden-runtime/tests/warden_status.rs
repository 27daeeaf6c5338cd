//! Warden against a scripted control port; no Tor and no outbound network

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use warden_core::{
    Connectivity, HealthLevel, Lifecycle, ProbeSettings, ProcessOrigin, ProxyConfiguration,
    SupervisorSettings, WardenConfig, WardenError,
};
use warden_runtime::Warden;

/// hex("s3cret")
const SECRET_HEX: &str = "733363726574";

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn respond(command: &str, pid: u32) -> String {
    match command {
        c if c.starts_with("AUTHENTICATE ") => {
            if c.ends_with(SECRET_HEX) {
                "250 OK\r\n".to_string()
            } else {
                "515 Authentication failed: Password did not match\r\n".to_string()
            }
        },
        "GETINFO process/pid" => format!("250-process/pid={}\r\n250 OK\r\n", pid),
        "GETINFO status/bootstrap-phase" => {
            "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"\r\n250 OK\r\n"
                .to_string()
        },
        "GETINFO circuit-status" => "250+circuit-status=\r\n\
            1 BUILT $AAAA1111~Alpha,$BBBB2222~Beta,$CCCC3333~Gamma PURPOSE=GENERAL\r\n\
            2 LAUNCHED $DDDD4444~Delta PURPOSE=GENERAL\r\n\
            .\r\n\
            250 OK\r\n"
            .to_string(),
        c if c.starts_with("SIGNAL ") => "250 OK\r\n".to_string(),
        "QUIT" => "250 closing connection\r\n".to_string(),
        _ => "510 Unrecognized command\r\n".to_string(),
    }
}

/// Control port that reports `pid` as its process
async fn fake_control_port(pid: u32) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let reply = respond(line.trim(), pid);
                    if write.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                    if line.trim() == "QUIT" {
                        break;
                    }
                }
            });
        }
    });

    port
}

async fn warden(control_port: u16) -> Warden {
    let config = WardenConfig {
        proxy: ProxyConfiguration {
            socks_port: free_port().await,
            control_port,
            control_secret: "s3cret".to_string(),
            ..Default::default()
        },
        supervisor: SupervisorSettings {
            grace_secs: 1,
            control_timeout_secs: 2,
            ..Default::default()
        },
        probe: ProbeSettings {
            geolocation: false,
            http_timeout_secs: 2,
            port_timeout_ms: 500,
            ..Default::default()
        },
    };
    Warden::new(config).unwrap()
}

#[tokio::test]
async fn test_idle_warden_reports_unhealthy() {
    let warden = warden(free_port().await).await;

    let report = warden.snapshot().await;
    assert_eq!(report.lifecycle, Lifecycle::NotStarted);
    assert_eq!(report.overall, HealthLevel::Unhealthy);
    assert_eq!(report.overall.exit_code(), 2);
    assert!(!report.socks_reachable);
    assert!(!report.control_reachable);
    assert!(matches!(report.connectivity, Connectivity::NotAttempted { .. }));
    assert!(report.circuit_count.is_none());
    assert!(report
        .findings
        .iter()
        .any(|f| f.check == "process" && f.level == HealthLevel::Unhealthy));
}

#[tokio::test]
async fn test_status_and_test_run_without_secret() {
    let mut config = WardenConfig::default();
    config.proxy.socks_port = free_port().await;
    config.proxy.control_port = free_port().await;
    config.probe.geolocation = false;
    config.probe.port_timeout_ms = 500;
    let warden = Warden::new(config).unwrap();

    let report = warden.snapshot().await;
    assert_eq!(report.overall, HealthLevel::Unhealthy);
    assert!(report.circuit_count.is_none());
    assert!(matches!(
        warden.test_connectivity().await,
        Connectivity::NotAttempted { .. }
    ));
    assert!(warden.attach().await.unwrap().is_none());
}

#[tokio::test]
async fn test_control_commands_need_secret() {
    let port = fake_control_port(std::process::id()).await;
    let mut config = WardenConfig::default();
    config.proxy.socks_port = free_port().await;
    config.proxy.control_port = port;
    let warden = Warden::new(config).unwrap();

    let err = warden.attach().await.unwrap_err();
    assert!(matches!(err, WardenError::Configuration(_)));

    let report = warden.snapshot().await;
    assert!(report.control_reachable);
    assert!(report.circuit_count.is_none());
}

#[tokio::test]
async fn test_commands_require_running_daemon() {
    let warden = warden(free_port().await).await;

    assert!(matches!(warden.rotate().await, Err(WardenError::NotRunning)));
    assert!(matches!(warden.circuits().await, Err(WardenError::NotRunning)));
    assert!(!warden.is_healthy().await);

    warden.stop().await.unwrap();
    warden.stop().await.unwrap();
}

#[tokio::test]
async fn test_attach_without_daemon() {
    let warden = warden(free_port().await).await;
    assert!(warden.attach().await.unwrap().is_none());
}

#[tokio::test]
async fn test_attach_rejected_secret() {
    let port = fake_control_port(std::process::id()).await;
    let mut config = WardenConfig::default();
    config.proxy.socks_port = free_port().await;
    config.proxy.control_port = port;
    config.proxy.control_secret = "wrong".to_string();
    config.supervisor.control_timeout_secs = 2;
    let warden = Warden::new(config).unwrap();

    let err = warden.attach().await.unwrap_err();
    assert!(matches!(err, WardenError::AuthenticationRejected(_)));
    assert!(err.is_authentication());
}

#[tokio::test]
async fn test_adopted_daemon_status_and_circuits() {
    // Our own PID is guaranteed alive for the whole test; never stop() here
    let port = fake_control_port(std::process::id()).await;
    let warden = warden(port).await;

    let handle = warden.attach().await.unwrap().unwrap();
    assert_eq!(handle.origin, ProcessOrigin::Adopted);
    assert_eq!(handle.pid, Some(std::process::id()));
    assert!(warden.is_healthy().await);

    let circuits = warden.circuits().await.unwrap();
    assert_eq!(circuits.len(), 1);
    assert_eq!(circuits[0].path.len(), 3);
    assert_eq!(circuits[0].purpose.as_deref(), Some("GENERAL"));

    let report = warden.snapshot().await;
    assert_eq!(report.lifecycle, Lifecycle::Running);
    assert!(report.control_reachable);
    assert!(!report.socks_reachable);
    assert_eq!(report.circuit_count, Some(1));
    assert!(matches!(report.connectivity, Connectivity::NotAttempted { .. }));
    // SOCKS down outweighs everything else
    assert_eq!(report.overall, HealthLevel::Unhealthy);
    assert!(report
        .findings
        .iter()
        .any(|f| f.check == "socks_port" && f.level == HealthLevel::Unhealthy));
}

#[tokio::test]
async fn test_rotation_without_observable_address_is_unchanged() {
    let port = fake_control_port(std::process::id()).await;
    let warden = warden(port).await;
    warden.attach().await.unwrap();

    let outcome = warden.rotate().await.unwrap();
    assert!(!outcome.changed);
    assert!(matches!(
        outcome.ensure_changed(),
        Err(WardenError::RotationFailure(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_adopted_daemon_kills_after_grace() {
    let mut stand_in = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let port = fake_control_port(stand_in.id()).await;
    let warden = warden(port).await;

    let handle = warden.attach().await.unwrap().unwrap();
    let token = handle.liveness();

    // The fake acknowledges SHUTDOWN but never exits, so the PID is killed
    warden.stop().await.unwrap();
    assert!(!token.is_alive());
    assert_eq!(
        warden.supervisor().lifecycle().await.lifecycle(),
        Lifecycle::Stopped
    );

    let status = stand_in.wait().unwrap();
    assert!(!status.success());

    warden.stop().await.unwrap();
}
