//! Tracing initialization and size-bounded log rotation.
//!
//! When `GATEWAY_LOG_FILE` is configured, tracing output is written through a
//! ping-pong [`LogRotator`]: one current file plus one `.old` backup, rotated
//! when the current file exceeds the configured size.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::config::AppConfig;

/// Size-bounded file writer with ping-pong rotation.
pub struct LogRotator {
    inner: Mutex<RotatorState>,
    path: PathBuf,
    max_size: u64,
}

struct RotatorState {
    file: File,
    current_size: u64,
}

impl LogRotator {
    /// Open (appending) the log file; `max_size_mb` bounds it before rotation.
    pub fn new(path: impl Into<PathBuf>, max_size_mb: u64) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(Self {
            inner: Mutex::new(RotatorState { file, current_size }),
            path,
            max_size: max_size_mb * 1024 * 1024,
        })
    }

    fn rotate(&self, state: &mut RotatorState) -> std::io::Result<()> {
        let backup = self.path.with_extension(append_ext(&self.path, "old"));
        // Ping-pong: a single backup, overwritten each rotation
        let _ = std::fs::remove_file(&backup);
        std::fs::rename(&self.path, &backup)?;

        state.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        state.current_size = 0;
        Ok(())
    }
}

fn append_ext(path: &PathBuf, suffix: &str) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", ext, suffix),
        None => suffix.to_string(),
    }
}

impl Write for &LogRotator {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.inner.lock().expect("log rotator lock poisoned");
        if state.current_size + buf.len() as u64 > self.max_size {
            if let Err(e) = self.rotate(&mut state) {
                // Rotation failed: keep writing to the oversized file
                eprintln!("log rotation failed: {}", e);
            }
        }
        let written = state.file.write(buf)?;
        state.current_size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner
            .lock()
            .expect("log rotator lock poisoned")
            .file
            .flush()
    }
}

/// Initialize the global tracing subscriber from the app config.
///
/// `RUST_LOG` is respected when set; otherwise the default filter is `info`
/// for dependencies and `debug` for this crate when `DEBUG=true`. Noisy HTTP
/// internals are always suppressed to `warn`.
pub fn init_tracing(config: &AppConfig) {
    // DEBUG=true escalates; GATEWAY_MODE=release quiets dependency noise
    let crate_level = if config.debug { "debug" } else { "info" };
    let default_filter = if config.release_mode && !config.debug {
        format!("warn,llm_gateway={}", crate_level)
    } else {
        format!("info,llm_gateway={}", crate_level)
    };
    let base = std::env::var("RUST_LOG").unwrap_or(default_filter);
    let filter = EnvFilter::new(format!("{},hyper=warn,h2=warn,reqwest=warn", base));

    match &config.log_file {
        Some(path) => {
            let rotator: &'static LogRotator = Box::leak(Box::new(
                LogRotator::new(path.clone(), config.log_max_size_mb)
                    .expect("failed to open gateway log file"),
            ));
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(move || rotator)
                        .with_ansi(false),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

/// Secret-key file loader for the encrypting secret provider.
///
/// The file holds a 32-char hex string. When the path is configured but the
/// file is missing, a fresh key is generated and written with mode 0600.
pub fn load_or_create_secret_key(path: &str) -> std::io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            use rand::RngCore;
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);
            let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();

            let mut options = OpenOptions::new();
            options.create_new(true).write(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(path)?;
            file.write_all(hex.as_bytes())?;
            tracing::info!(path, "generated new gateway secret key file");
            Ok(hex)
        }
        Err(e) => Err(e),
    }
}

/// Shared accessor so several components can write through one rotator.
pub type SharedRotator = Arc<LogRotator>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotator_ping_pong() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.log");
        // 0 MB threshold: every write beyond the first byte triggers rotation
        let rotator = LogRotator::new(&path, 0).unwrap();

        let mut writer = &rotator;
        writer.write_all(b"first line\n").unwrap();
        writer.write_all(b"second line\n").unwrap();
        writer.flush().unwrap();

        let backup = dir.path().join("gateway.log.old");
        assert!(backup.exists());
        let current = std::fs::read_to_string(&path).unwrap();
        assert_eq!(current, "second line\n");
    }

    #[test]
    fn test_secret_key_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        let path_str = path.to_str().unwrap();

        let first = load_or_create_secret_key(path_str).unwrap();
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        let second = load_or_create_secret_key(path_str).unwrap();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
