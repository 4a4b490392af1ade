//! Mount-time configuration.
//!
//! Mirrors the flag bitmap `wimlib_mount`/`wimlib_unmount` take in
//! `original_source/src/mount.c`, but expressed as a structured,
//! `serde`-loadable configuration object rather than raw bit flags, per the
//! per-mount-context design note (spec §9).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How alternate data streams are exposed in the mounted namespace
/// (`WIMLIB_MOUNT_FLAG_STREAM_INTERFACE_*`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamInterface {
    /// Alternate data streams are not reachable at all.
    None,
    /// Streams are exposed as `file:stream` path suffixes (Windows-style).
    Windows,
    /// Streams are exposed as extended attributes.
    #[default]
    Xattr,
}

/// Configuration for one mount instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount the image read-write instead of read-only.
    pub read_write: bool,
    /// Enable verbose FUSE/daemon debug logging.
    pub debug: bool,
    /// How ADS entries are surfaced in the namespace.
    pub stream_interface: StreamInterface,
    /// Directory under which the staging directory is created. Defaults to
    /// the daemon's working directory at mount time, per spec §4.1.
    pub staging_root: Option<PathBuf>,
    /// How long the daemon waits for the unmount client's commit decision
    /// before assuming `commit = false` (spec §4.6). Default 3000ms.
    pub handshake_daemon_timeout_ms: u64,
    /// How long the unmount client waits for the daemon's terminal status
    /// byte (spec §4.6). Default 600_000ms (600s).
    pub handshake_client_timeout_ms: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            read_write: false,
            debug: false,
            stream_interface: StreamInterface::default(),
            staging_root: None,
            handshake_daemon_timeout_ms: 3_000,
            handshake_client_timeout_ms: 600_000,
        }
    }
}

impl MountConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Serializes the configuration back to TOML text.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Flags accepted by [`crate::mount_entry::unmount`] (spec §6).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct UnmountFlags {
    /// Integrate staged changes into a rewritten archive.
    pub commit: bool,
    /// Ask the codec to write an integrity table while rewriting.
    pub check_integrity: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stream_interface_is_xattr() {
        assert_eq!(MountConfig::default().stream_interface, StreamInterface::Xattr);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = MountConfig::default();
        config.read_write = true;
        config.stream_interface = StreamInterface::Windows;
        let text = config.to_toml().expect("serialize");
        let parsed = MountConfig::from_toml(&text).expect("parse");
        assert_eq!(parsed.read_write, true);
        assert_eq!(parsed.stream_interface, StreamInterface::Windows);
    }
}
