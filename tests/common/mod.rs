use std::fs;
use std::path::PathBuf;

use conduit::mcp::config::ServerConfig;
use conduit::mcp::session::SessionOptions;
use tempfile::TempDir;

/// Path to the `mcp_test_server` binary Cargo builds for integration tests.
#[allow(dead_code)]
pub fn test_server_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mcp_test_server"))
}

/// A stdio server entry that launches the test server under `label`.
#[allow(dead_code)]
pub fn test_server_config(name: &str, label: &str) -> ServerConfig {
    let exe = test_server_exe();
    let exe = exe.to_string_lossy();
    ServerConfig::stdio(name, &exe, &["--name", label])
}

/// Session options with a short reconnect backoff.
#[allow(dead_code)]
pub fn fast_options() -> SessionOptions {
    let mut options = SessionOptions::default();
    options.reconnect.initial_backoff_ms = 10;
    options.reconnect.max_backoff_ms = 100;
    options
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("conduit.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}
