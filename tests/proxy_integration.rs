//! Proxy pipeline integration tests.
//!
//! Validates: subscription fetch over HTTP, multi-source engine download with
//! version discovery fallback, data file mirrors, and the parse → select →
//! generate path against a local listener. HTTP sources are served by
//! wiremock; nothing leaves the machine.

use std::io::{Cursor, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use xray_pilot::proxy::{
    generate, DataFile, DownloadSource, EngineInstaller, NodeKind, NodeManager, ProxyError,
    SubscriptionParser, VersionFormat,
};

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn engine_entry() -> &'static str {
    if cfg!(windows) {
        "Xray-linux-64/xray.exe"
    } else {
        "Xray-linux-64/xray"
    }
}

fn release_zip(payload: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer.start_file("LICENSE", options).unwrap();
    writer.write_all(b"MPL-2.0").unwrap();
    writer.start_file(engine_entry(), options).unwrap();
    writer.write_all(payload).unwrap();
    writer.finish().unwrap().into_inner()
}

fn plain_source(server: &MockServer, name: &str, prefix: &str) -> DownloadSource {
    DownloadSource::new(
        name,
        format!("{}/{prefix}/VERSION", server.uri()),
        format!("{}/{prefix}", server.uri()),
        VersionFormat::PlainText,
    )
}

async fn mount_bytes(server: &MockServer, route: &str, status: u16, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status).set_body_bytes(body))
        .mount(server)
        .await;
}

fn leftover_temp_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// A. Subscription fetch
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fetch_base64_subscription_keeps_good_lines_in_order() {
    let vmess = serde_json::json!({
        "ps": "tokyo", "add": "tokyo.example.com", "port": 443,
        "id": "b831381d-6324-4d53-ad4f-8cda48b30811"
    });
    let links = [
        format!("vmess://{}", STANDARD.encode(vmess.to_string())),
        "not a link".to_string(),
        "trojan://secret@sg.example.com:443?sni=cdn.example.com#singapore".to_string(),
        "vless://uuid@:443#missing-host".to_string(),
        "ss://YWVzLTI1Ni1nY206cGFzcw@hk.example.com:8388#hongkong".to_string(),
    ]
    .join("\n");

    let server = MockServer::start().await;
    mount_bytes(&server, "/sub", 200, STANDARD.encode(links).into_bytes()).await;

    let sub = SubscriptionParser::fetch(&format!("{}/sub", server.uri()))
        .await
        .unwrap();

    let names: Vec<&str> = sub.nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, ["tokyo", "singapore", "hongkong"]);
    assert_eq!(sub.nodes[0].kind, NodeKind::VMess);
    assert_eq!(sub.nodes[1].credential, "secret");
    assert_eq!(sub.nodes[1].sni_or_server(), "sg.example.com");
    assert_eq!(sub.nodes[2].cipher.as_deref(), Some("aes-256-gcm"));
    assert_eq!(sub.nodes[2].credential, "pass");
}

#[tokio::test]
async fn fetch_non_success_status_is_download_error() {
    let server = MockServer::start().await;
    mount_bytes(&server, "/sub", 403, b"forbidden".to_vec()).await;

    let err = SubscriptionParser::fetch(&format!("{}/sub", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Download(ref msg) if msg.contains("403")));
}

// ─────────────────────────────────────────────────────────────────────────────
// B. Engine download
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn falls_back_to_second_source_and_leaves_no_temp_files() {
    let server = MockServer::start().await;
    mount_bytes(&server, "/cdn/VERSION", 200, b"v1.8.24\n".to_vec()).await;
    mount_bytes(&server, "/cdn/v1.8.24/Xray-linux-64.zip", 404, Vec::new()).await;
    mount_bytes(
        &server,
        "/upstream/v1.8.24/Xray-linux-64.zip",
        200,
        release_zip(b"engine-bytes"),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    let binary = bin_dir.join("xray");
    let installer = EngineInstaller::new(
        &binary,
        vec![
            plain_source(&server, "cdn", "cdn"),
            plain_source(&server, "upstream", "upstream"),
        ],
        Vec::new(),
    )
    .unwrap()
    .platform("linux", "x86_64");

    installer.install_binary().await.unwrap();

    assert_eq!(std::fs::read(&binary).unwrap(), b"engine-bytes");
    assert!(leftover_temp_files(&bin_dir).is_empty());
}

#[tokio::test]
async fn unusable_archive_moves_on_to_next_source() {
    let server = MockServer::start().await;
    mount_bytes(&server, "/portal/VERSION", 200, b"v1.8.24".to_vec()).await;
    mount_bytes(
        &server,
        "/portal/v1.8.24/Xray-linux-64.zip",
        200,
        b"<html>captive portal</html>".to_vec(),
    )
    .await;
    mount_bytes(
        &server,
        "/upstream/v1.8.24/Xray-linux-64.zip",
        200,
        release_zip(b"engine-bytes"),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let binary = dir.path().join("xray");
    EngineInstaller::new(
        &binary,
        vec![
            plain_source(&server, "portal", "portal"),
            plain_source(&server, "upstream", "upstream"),
        ],
        Vec::new(),
    )
    .unwrap()
    .platform("linux", "x86_64")
    .install_binary()
    .await
    .unwrap();

    assert_eq!(std::fs::read(&binary).unwrap(), b"engine-bytes");
    assert!(leftover_temp_files(dir.path()).is_empty());
}

#[tokio::test]
async fn unusable_archive_then_http_failure_is_download_error() {
    let server = MockServer::start().await;
    mount_bytes(&server, "/a/VERSION", 200, b"v1.0.0".to_vec()).await;
    mount_bytes(&server, "/a/v1.0.0/Xray-linux-64.zip", 200, b"truncated".to_vec()).await;

    let dir = tempfile::tempdir().unwrap();
    let err = EngineInstaller::new(
        dir.path().join("xray"),
        vec![
            plain_source(&server, "mirror-a", "a"),
            plain_source(&server, "mirror-b", "b"),
        ],
        Vec::new(),
    )
    .unwrap()
    .platform("linux", "x86_64")
    .install_binary()
    .await
    .unwrap_err();

    let ProxyError::Download(msg) = err else {
        panic!("expected a download error, got {err:?}");
    };
    assert!(msg.contains("mirror-a") && msg.contains("unreadable zip"), "{msg}");
    assert!(msg.contains("mirror-b") && msg.contains("HTTP 404"), "{msg}");
}

#[tokio::test]
async fn unanswered_discovery_uses_fallback_version() {
    let server = MockServer::start().await;
    // No VERSION route: discovery gets 404 everywhere.
    mount_bytes(
        &server,
        "/cdn/v1.8.4/Xray-linux-64.zip",
        200,
        release_zip(b"fallback"),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let binary = dir.path().join("xray");
    EngineInstaller::new(&binary, vec![plain_source(&server, "cdn", "cdn")], Vec::new())
        .unwrap()
        .platform("linux", "x86_64")
        .install_binary()
        .await
        .unwrap();

    assert_eq!(std::fs::read(&binary).unwrap(), b"fallback");
}

#[tokio::test]
async fn github_release_discovery_picks_platform_asset() {
    let server = MockServer::start().await;
    let release = serde_json::json!({
        "tag_name": "v25.3.6",
        "assets": [
            {"name": "Xray-linux-64.zip.dgst"},
            {"name": "Xray-linux-arm64-v8a.zip"},
            {"name": "Xray-linux-64.zip"}
        ]
    });
    mount_bytes(&server, "/api/latest", 200, release.to_string().into_bytes()).await;
    mount_bytes(
        &server,
        "/download/v25.3.6/Xray-linux-arm64-v8a.zip",
        200,
        release_zip(b"arm"),
    )
    .await;

    let source = DownloadSource::new(
        "github",
        format!("{}/api/latest", server.uri()),
        format!("{}/download", server.uri()),
        VersionFormat::GithubRelease,
    );
    let dir = tempfile::tempdir().unwrap();
    let binary = dir.path().join("xray");
    EngineInstaller::new(&binary, vec![source], Vec::new())
        .unwrap()
        .platform("linux", "aarch64")
        .install_binary()
        .await
        .unwrap();

    assert_eq!(std::fs::read(&binary).unwrap(), b"arm");
}

#[tokio::test]
async fn all_sources_failing_reports_each_one() {
    let server = MockServer::start().await;
    mount_bytes(&server, "/a/VERSION", 200, b"v1.0.0".to_vec()).await;
    mount_bytes(&server, "/a/v1.0.0/Xray-linux-64.zip", 500, Vec::new()).await;

    let dir = tempfile::tempdir().unwrap();
    let binary = dir.path().join("xray");
    let err = EngineInstaller::new(
        &binary,
        vec![
            plain_source(&server, "mirror-a", "a"),
            plain_source(&server, "mirror-b", "b"),
        ],
        Vec::new(),
    )
    .unwrap()
    .platform("linux", "x86_64")
    .install_binary()
    .await
    .unwrap_err();

    let ProxyError::Download(msg) = err else {
        panic!("expected a download error, got {err:?}");
    };
    assert!(msg.contains("mirror-a") && msg.contains("HTTP 500"), "{msg}");
    assert!(msg.contains("mirror-b") && msg.contains("HTTP 404"), "{msg}");
    assert!(!binary.exists());
}

#[tokio::test]
async fn archive_without_engine_is_rejected() {
    let server = MockServer::start().await;
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("README.md", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"nothing here").unwrap();
    let archive = writer.finish().unwrap().into_inner();
    mount_bytes(&server, "/cdn/v1.8.4/Xray-linux-64.zip", 200, archive).await;

    let dir = tempfile::tempdir().unwrap();
    let err = EngineInstaller::new(
        dir.path().join("xray"),
        vec![plain_source(&server, "cdn", "cdn")],
        Vec::new(),
    )
    .unwrap()
    .platform("linux", "x86_64")
    .install_binary()
    .await
    .unwrap_err();
    assert!(matches!(err, ProxyError::Archive(_)));
}

// ─────────────────────────────────────────────────────────────────────────────
// C. Data files
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn data_files_try_mirrors_and_report_failures() {
    let server = MockServer::start().await;
    mount_bytes(&server, "/primary/geoip.dat", 503, Vec::new()).await;
    mount_bytes(&server, "/fallback/geoip.dat", 200, b"geoip".to_vec()).await;

    let files = vec![
        DataFile::new(
            "geoip.dat",
            vec![
                format!("{}/primary/geoip.dat", server.uri()),
                format!("{}/fallback/geoip.dat", server.uri()),
            ],
        ),
        DataFile::new(
            "geosite.dat",
            vec![format!("{}/primary/geosite.dat", server.uri())],
        ),
    ];

    let dir = tempfile::tempdir().unwrap();
    let installer = EngineInstaller::new(dir.path().join("xray"), Vec::new(), files).unwrap();
    let failed = installer.install_data_files().await;

    assert_eq!(failed, ["geosite.dat"]);
    assert_eq!(std::fs::read(dir.path().join("geoip.dat")).unwrap(), b"geoip");
    assert!(!dir.path().join("geosite.dat").exists());
    assert!(leftover_temp_files(dir.path()).is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// D. Parse → select → generate
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn selects_the_reachable_node_and_generates_its_config() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open_port = listener.local_addr().unwrap().port();
    let closed_port = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };

    let yaml = format!(
        r#"
proxies:
  - {{name: closed, type: trojan, server: 127.0.0.1, port: {closed_port}, password: a}}
  - {{name: broken, type: vmess, server: "", port: 443, uuid: x}}
  - {{name: open, type: trojan, server: 127.0.0.1, port: {open_port}, password: b}}
"#
    );
    let mut sub = xray_pilot::proxy::Subscription::new(
        "inline",
        SubscriptionParser::parse_str(&yaml).unwrap(),
    );
    assert_eq!(sub.len(), 2, "entry with an empty server is dropped");

    let best = NodeManager::new().select_best(&mut sub).await.unwrap();
    assert_eq!(best.name, "open");

    let config = serde_json::to_value(generate(&best, 10808).unwrap()).unwrap();
    let outbound = &config["outbounds"][0];
    assert_eq!(outbound["protocol"], "trojan");
    assert_eq!(outbound["settings"]["servers"][0]["port"], open_port);
    assert_eq!(
        outbound["streamSettings"]["tlsSettings"]["serverName"],
        "127.0.0.1"
    );
}
