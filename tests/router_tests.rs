use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{Request, StatusCode, header},
};
use std::net::SocketAddr;
use embark::config::Config;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

const KEY: &str = "pwd";
const BOUNDARY: &str = "embark-test-boundary";

async fn test_app() -> (Router, Config, TempDir) {
    test_app_with(|_| {}).await
}

async fn test_app_with(tweak: impl FnOnce(&mut Config)) -> (Router, Config, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let database_url = format!("sqlite:{}", dir.path().join("embark.sqlite").display());
    let storage = embark::EmbarkStorage::connect(&database_url)
        .await
        .expect("connect storage");

    let mut cfg = Config {
        database_url,
        embark_key: KEY.to_string(),
        insecure_cookie: true,
        log_root: dir.path().join("emba_logs"),
        upload_root: dir.path().join("uploads"),
        active_root: dir.path().join("uploads/active"),
        emba_script: None,
        body_limit_mb: 1,
        ..Config::default()
    };
    tweak(&mut cfg);

    let handle = embark::service::analysis_actor::spawn(storage.clone(), cfg.clone())
        .await
        .expect("spawn analysis actor");
    let state = embark::router::EmbarkState::new(storage, handle, cfg.clone());
    (embark::router::embark_router(state), cfg, dir)
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn authed(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-embark-key", KEY)
}

fn multipart_body(file_name: &str, content: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn upload(app: &Router, file_name: &str, content: &[u8]) -> axum::response::Response {
    app.clone()
        .oneshot(
            authed("POST", "/home/upload/0/save_file")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(Body::from(multipart_body(file_name, content)))
                .expect("request"),
        )
        .await
        .expect("oneshot")
}

async fn start(app: &Router, firmware: i64) -> i64 {
    let payload = serde_json::json!({
        "firmware": firmware,
        "version": "1.0",
        "vendor": "acme",
        "firmware_architecture": "MIPS",
        "scan_modules": ["s20", "F50"],
    });
    let resp = app
        .clone()
        .oneshot(
            authed("POST", "/home/upload/0/")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))
                .expect("request"),
        )
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "pending");
    body["id"].as_i64().expect("analysis id")
}

#[tokio::test]
async fn home_requires_login() {
    let (app, _cfg, _dir) = test_app().await;

    let resp = app
        .clone()
        .oneshot(Request::get("/home/").body(Body::empty()).expect("request"))
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let resp = app
        .oneshot(authed("GET", "/home/").body(Body::empty()).expect("request"))
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["analyses"], 0);
    assert_eq!(body["running"], 0);
}

#[tokio::test]
async fn login_sets_session_cookie() {
    let (app, _cfg, _dir) = test_app().await;

    let login = |key: &str| {
        Request::post("/")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("key={key}")))
            .expect("request")
    };

    let resp = app.clone().oneshot(login("nope")).await.expect("oneshot");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app.clone().oneshot(login(KEY)).await.expect("oneshot");
    assert_eq!(resp.status(), StatusCode::OK);
    let cookie = resp
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .expect("session cookie")
        .to_string();
    assert!(cookie.starts_with("embark_session="));

    let resp = app
        .oneshot(
            Request::get("/home/about/")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["name"], "EMBArk");
}

#[tokio::test]
async fn upload_rejects_taken_names() {
    let (app, cfg, _dir) = test_app().await;

    let resp = upload(&app, "router.tar.gz", b"firmware bytes").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["saved"][0]["file_name"], "router.tar.gz");
    assert_eq!(body["saved"][0]["size"], 14);
    assert_eq!(body["saved"][0]["archive"], true);
    assert!(cfg.upload_root.join("router.tar.gz").is_file());

    let resp = upload(&app, "router.tar.gz", b"other bytes").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    assert_eq!(&bytes[..], b"File Exists");

    let resp = app
        .oneshot(authed("GET", "/home/upload/1/").body(Body::empty()).expect("request"))
        .await
        .expect("oneshot");
    let body = body_json(resp).await;
    assert_eq!(body["files"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn oversized_upload_returns_413() {
    let (app, cfg, _dir) = test_app().await;

    let resp = upload(&app, "huge.bin", &vec![b'a'; 2 * 1024 * 1024]).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(!cfg.upload_root.join("huge.bin").exists());
}

#[tokio::test]
async fn analysis_without_emba_stays_pending() {
    let (app, _cfg, _dir) = test_app().await;

    let resp = upload(&app, "fw.bin", b"\x7fELF").await;
    let firmware = body_json(resp).await["saved"][0]["id"]
        .as_i64()
        .expect("firmware id");
    let id = start(&app, firmware).await;

    let resp = app
        .clone()
        .oneshot(
            authed("GET", "/home/serviceDashboard/")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("oneshot");
    let body = body_json(resp).await;
    assert_eq!(body["running"], 0);
    assert_eq!(body["analyses"][0]["id"], id);
    assert_eq!(body["analyses"][0]["status"], "pending");
    assert_eq!(body["analyses"][0]["scan_modules"][1], "f50");

    let resp = app
        .oneshot(
            authed("POST", "/home/stop/")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(format!("analysis={id}")))
                .expect("request"),
        )
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn import_and_download_results() {
    let (app, cfg, _dir) = test_app().await;

    let resp = upload(&app, "fw.bin", b"\x7fELF").await;
    let firmware = body_json(resp).await["saved"][0]["id"]
        .as_i64()
        .expect("firmware id");
    let id = start(&app, firmware).await;

    let csv_dir = cfg.csv_log_dir(id);
    std::fs::create_dir_all(&csv_dir).expect("csv dir");
    std::fs::write(
        csv_dir.join("f50_base_aggregator.csv"),
        "FW_path;/fw.bin;\n\
         architecture_verified;MIPS;\n\
         os_verified;Linux;\n\
         files;12;\n\
         entropy_value; 7.55 bits per byte.;\n\
         canary;3;\n\
         canary_per;25;\n\
         strcpy_bin;busybox;4;libc.so;2;\n",
    )
    .expect("f50");
    std::fs::write(
        csv_dir.join("f20_vul_aggregator.csv"),
        "Binary;Version;CVE identifier;CVSS rating;exploit db exploit available;metasploit module;trickest PoC;Routersploit;local exploit;remote exploit;DoS exploit;known exploited vuln;\n\
         busybox;1.30.1;CVE-2021-42377;9.8;yes;no;no;no;no;yes;no;no;\n",
    )
    .expect("f20");
    std::fs::write(csv_dir.join("emba_notes.csv"), "ignored;yes;\n").expect("other csv");

    let resp = app
        .clone()
        .oneshot(
            authed("POST", &format!("/home/import/{id}/"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(
            authed("GET", &format!("/home/result/{id}/"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["result"]["files"], 12);
    assert_eq!(body["result"]["entropy_value"], 7.55);
    assert_eq!(body["result"]["architecture_verified"], "MIPS");
    assert_eq!(body["strcpy_bin"]["busybox"]["4"]["libc.so"], "2");
    assert_eq!(body["vulnerabilities"][0]["cve"], "CVE-2021-42377");
    assert_eq!(body["vulnerabilities"][0]["info"]["CVSS"], "9.8");

    let resp = app
        .clone()
        .oneshot(
            authed("GET", &format!("/download_zipped/{id}/"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).map(|v| v.as_bytes()),
        Some(&b"application/zip"[..])
    );
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    assert!(bytes.starts_with(b"PK"));

    let resp = app
        .oneshot(
            authed("GET", "/download_zipped/999/")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn empty_key_locks_every_route() {
    let (app, _cfg, _dir) = test_app_with(|cfg| cfg.embark_key.clear()).await;

    let resp = app
        .clone()
        .oneshot(authed("GET", "/home/").body(Body::empty()).expect("request"))
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .oneshot(
            Request::get("/home/?key=")
                .header("x-embark-key", "")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_limit_is_per_client() {
    let (app, _cfg, _dir) = test_app_with(|cfg| cfg.login_per_minute = 1).await;

    let login = |peer: &str| {
        let addr: SocketAddr = peer.parse().expect("socket addr");
        Request::post("/")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .extension(ConnectInfo(addr))
            .body(Body::from("key=wrong"))
            .expect("request")
    };

    let resp = app.clone().oneshot(login("10.0.0.1:5000")).await.expect("oneshot");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let resp = app.clone().oneshot(login("10.0.0.1:5001")).await.expect("oneshot");
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    let resp = app.oneshot(login("10.0.0.2:5000")).await.expect("oneshot");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn upload_refuses_file_already_on_disk() {
    let (app, cfg, _dir) = test_app().await;
    std::fs::create_dir_all(&cfg.upload_root).expect("upload root");
    std::fs::write(cfg.upload_root.join("stray.bin"), b"keep me").expect("stray file");

    let resp = upload(&app, "stray.bin", b"new bytes").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    assert_eq!(&bytes[..], b"File Exists");
    assert_eq!(
        std::fs::read(cfg.upload_root.join("stray.bin")).expect("stray file"),
        b"keep me"
    );
}

#[tokio::test]
async fn delete_keeps_record_when_file_cannot_be_removed() {
    let (app, cfg, _dir) = test_app().await;

    let resp = upload(&app, "fw.bin", b"\x7fELF").await;
    let firmware = body_json(resp).await["saved"][0]["id"]
        .as_i64()
        .expect("firmware id");

    // a directory in place of the file makes the removal fail
    let path = cfg.upload_root.join("fw.bin");
    std::fs::remove_file(&path).expect("remove upload");
    std::fs::create_dir_all(path.join("nested")).expect("blocking dir");

    let delete = || {
        authed("POST", "/home/delete/")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("firmware={firmware}")))
            .expect("request")
    };
    let resp = app.clone().oneshot(delete()).await.expect("oneshot");
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let list = || authed("GET", "/home/upload/0/").body(Body::empty()).expect("request");
    let body = body_json(app.clone().oneshot(list()).await.expect("oneshot")).await;
    assert_eq!(body["files"].as_array().map(Vec::len), Some(1));

    std::fs::remove_dir_all(&path).expect("clear blocking dir");
    let resp = app.clone().oneshot(delete()).await.expect("oneshot");
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(app.oneshot(list()).await.expect("oneshot")).await;
    assert_eq!(body["files"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn concurrent_downloads_get_complete_archives() {
    let (app, cfg, _dir) = test_app().await;

    let resp = upload(&app, "fw.bin", b"\x7fELF").await;
    let firmware = body_json(resp).await["saved"][0]["id"]
        .as_i64()
        .expect("firmware id");
    let id = start(&app, firmware).await;

    let log_dir = cfg.analysis_log_dir(id).join("emba_logs");
    std::fs::create_dir_all(&log_dir).expect("log dir");
    std::fs::write(log_dir.join("emba.log"), "x".repeat(256 * 1024)).expect("emba.log");

    let download = || {
        app.clone().oneshot(
            authed("GET", &format!("/download_zipped/{id}/"))
                .body(Body::empty())
                .expect("request"),
        )
    };
    let (a, b) = tokio::join!(download(), download());
    for resp in [a.expect("oneshot"), b.expect("oneshot")] {
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        assert!(bytes.starts_with(b"PK"));
        // end of central directory record closes a complete archive
        assert!(bytes.windows(4).any(|w| w == b"PK\x05\x06"));
    }

    let leftovers: Vec<_> = std::fs::read_dir(&cfg.log_root)
        .expect("log root")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".part"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
    assert!(cfg.log_root.join(format!("{id}.zip")).is_file());
}
