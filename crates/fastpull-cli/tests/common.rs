#![allow(dead_code)]

use std::path::{Path, PathBuf};

use assert_cmd::{assert::Assert, cargo::cargo_bin_cmd, Command};
use serde_json::Value;
use tempfile::TempDir;

pub struct CacheRoot {
    pub temp: TempDir,
}

impl CacheRoot {
    pub fn new() -> Self {
        Self {
            temp: tempfile::Builder::new()
                .prefix("fastpull-cli")
                .tempdir()
                .expect("tempdir"),
        }
    }

    pub fn base(&self) -> PathBuf {
        self.temp.path().join("cache")
    }

    pub fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp.path().join(name);
        std::fs::write(&path, contents).expect("write fixture");
        path
    }

    pub fn cmd(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("fastpull");
        cmd.env("FASTPULL_PATH", self.base())
            .env_remove("FASTPULL_TEMP_PATH")
            .env_remove("FASTPULL_HASHES")
            .env_remove("RUST_LOG");
        cmd
    }
}

pub fn parse_json(assert: &Assert) -> Value {
    let output = assert.get_output();
    serde_json::from_slice(&output.stdout).expect("json output")
}

pub fn path_of(value: &Value) -> &Path {
    Path::new(value.as_str().expect("string path"))
}
