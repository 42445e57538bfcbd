use std::{fs, panic};

use flate2::{write::GzEncoder, Compression};
use httptest::{matchers::*, responders::*, Expectation, Server};
use sha2::{Digest, Sha512};

mod common;

use common::{parse_json, path_of, CacheRoot};

fn tar_gz_bytes() -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let payload = b"hello\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(payload.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "demo/hello.txt", &payload[..])
        .expect("append");
    builder
        .into_inner()
        .expect("tar finish")
        .finish()
        .expect("gzip finish")
}

#[test]
fn blob_insert_show_and_stats() {
    let root = CacheRoot::new();
    let source = root.file("payload.bin", b"payload");
    let digest = hex::encode(Sha512::digest(b"payload"));

    let assert = root
        .cmd()
        .args(["--json", "blob", "insert"])
        .arg(&source)
        .assert()
        .success();
    let payload = parse_json(&assert);
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["details"]["sha512"], digest.as_str());
    assert_eq!(payload["details"]["size"], 7);
    let stored = path_of(&payload["details"]["path"]);
    assert!(stored.starts_with(root.base().join("blos").join("objects")));
    assert_eq!(fs::read(stored).expect("blob"), b"payload");

    let assert = root
        .cmd()
        .args(["--json", "blob", "show", &digest])
        .assert()
        .success();
    assert_eq!(parse_json(&assert)["details"]["sha512"], digest.as_str());

    let assert = root
        .cmd()
        .args(["--json", "blob", "stats"])
        .assert()
        .success();
    let payload = parse_json(&assert);
    assert_eq!(payload["details"]["blobs"], 1);
    assert_eq!(payload["details"]["total_bytes"], 7);
}

#[test]
fn blob_show_reports_missing_digest_as_user_error() {
    let root = CacheRoot::new();
    let digest = hex::encode(Sha512::digest(b"never stored"));
    let assert = root
        .cmd()
        .args(["--json", "blob", "show", &digest])
        .assert()
        .code(1);
    assert_eq!(parse_json(&assert)["status"], "user_error");
}

#[test]
fn blob_verify_flags_corruption() {
    let root = CacheRoot::new();
    let source = root.file("payload.bin", b"pristine");
    let digest = hex::encode(Sha512::digest(b"pristine"));
    let assert = root
        .cmd()
        .args(["--json", "blob", "insert"])
        .arg(&source)
        .assert()
        .success();
    let stored = path_of(&parse_json(&assert)["details"]["path"]).to_path_buf();

    root.cmd()
        .args(["blob", "verify", &digest])
        .assert()
        .success();

    fs::write(&stored, b"tampered").expect("tamper");
    let assert = root
        .cmd()
        .args(["--json", "blob", "verify", &digest])
        .assert()
        .code(2);
    assert_eq!(parse_json(&assert)["details"]["code"], "FP800");
}

#[test]
fn dynamic_store_then_get() {
    let root = CacheRoot::new();
    let source = root.file("artifact.whl", b"wheel");

    root.cmd()
        .args([
            "--json", "dynamic", "store", "--scope", "build", "--key", "name=demo", "--key",
            "version=1.0", "--meta", "origin=ci", "--path",
        ])
        .arg(&source)
        .assert()
        .success();

    let assert = root
        .cmd()
        .args([
            "--json", "dynamic", "get", "--scope", "build", "--key", "version=1.0", "--key",
            "name=demo",
        ])
        .assert()
        .success();
    let payload = parse_json(&assert);
    assert_eq!(payload["details"]["metadata"]["origin"], "ci");
    assert!(payload["details"]["metadata"]["created_on"].is_string());
    assert_eq!(
        fs::read(path_of(&payload["details"]["path"])).expect("blob"),
        b"wheel"
    );
}

#[test]
fn dynamic_get_miss_exits_one() {
    let root = CacheRoot::new();
    let assert = root
        .cmd()
        .args(["--json", "dynamic", "get", "--key", "name=absent"])
        .assert()
        .code(1);
    let payload = parse_json(&assert);
    assert_eq!(payload["status"], "user_error");
    assert_eq!(payload["details"]["key"]["name"], "absent");
}

#[test]
fn dynamic_rejects_malformed_pairs() {
    let root = CacheRoot::new();
    root.cmd()
        .args(["dynamic", "get", "--key", "no-equals-sign"])
        .assert()
        .failure();
}

#[test]
fn verify_checks_archives_by_extension() {
    let root = CacheRoot::new();
    let garbage = root.file("notes.zip", b"not really a zip");
    let assert = root
        .cmd()
        .args(["--json", "verify"])
        .arg(&garbage)
        .assert()
        .success();
    assert_eq!(parse_json(&assert)["details"]["checked"], false);

    if which::which("tar").is_err() {
        eprintln!("skipping archive half of verify test (tar unavailable)");
        return;
    }
    let good = root.file("demo.tar.gz", &tar_gz_bytes());
    let assert = root
        .cmd()
        .args(["--json", "verify"])
        .arg(&good)
        .assert()
        .success();
    assert_eq!(parse_json(&assert)["details"]["archive"], "tar.gz");

    let bad = root.file("broken.tar.gz", b"<html>oops</html>");
    let assert = root
        .cmd()
        .args(["--json", "verify"])
        .arg(&bad)
        .assert()
        .code(2);
    assert_eq!(parse_json(&assert)["details"]["code"], "FP821");
}

#[test]
fn fetch_downloads_once_per_scope() {
    let Ok(server) = panic::catch_unwind(Server::run) else {
        eprintln!("skipping fetch test (httptest server unavailable)");
        return;
    };
    server.expect(
        Expectation::matching(request::method_path("GET", "/notes.txt"))
            .times(1)
            .respond_with(status_code(200).body("release notes")),
    );
    let root = CacheRoot::new();
    let url = server.url_str("/notes.txt");

    for _ in 0..2 {
        let assert = root
            .cmd()
            .args(["--json", "fetch", "--scope", "docs", &url])
            .assert()
            .success();
        let payload = parse_json(&assert);
        assert_eq!(
            payload["details"]["sha512"],
            hex::encode(Sha512::digest(b"release notes")).as_str()
        );
    }
    assert!(root
        .base()
        .join("records")
        .join("docs")
        .join("url.sqlite")
        .is_file());
}

#[test]
fn fetch_reports_http_errors() {
    let Ok(server) = panic::catch_unwind(Server::run) else {
        eprintln!("skipping fetch error test (httptest server unavailable)");
        return;
    };
    server.expect(
        Expectation::matching(request::method_path("GET", "/missing.tar.gz"))
            .times(1)
            .respond_with(status_code(404)),
    );
    let root = CacheRoot::new();
    let assert = root
        .cmd()
        .args(["--json", "fetch", &server.url_str("/missing.tar.gz")])
        .assert()
        .code(2);
    assert_eq!(parse_json(&assert)["details"]["code"], "FP820");
}

#[test]
fn invalid_scope_is_reported_in_the_envelope() {
    let root = CacheRoot::new();
    let source = root.file("artifact.whl", b"wheel");
    let assert = root
        .cmd()
        .args([
            "--json", "dynamic", "store", "--scope", "../escape", "--key", "name=demo", "--path",
        ])
        .arg(&source)
        .assert()
        .code(2);
    let payload = parse_json(&assert);
    assert_eq!(payload["status"], "failure");
    assert_eq!(payload["details"]["code"], "FP831");

    let assert = root
        .cmd()
        .args(["--json", "fetch", "--scope", "no/slashes", "http://127.0.0.1:9/x"])
        .assert()
        .code(2);
    assert_eq!(parse_json(&assert)["details"]["code"], "FP831");
}
