use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_channel::Sender;
use chrono::Local;
use fancy_regex::Regex;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

const MAX_AGE_DAYS: u64 = 3;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
  Debug,
  Info,
  Warn,
  Error,
}

impl Level {
  fn as_str(&self) -> &'static str {
    match self {
      Level::Debug => "DEBUG",
      Level::Info => "INFO",
      Level::Warn => "WARN",
      Level::Error => "ERROR",
    }
  }
}

struct LogMessage {
  line: String,
}

/// Structured line logger: `[LEVEL] [YYYY-MM-DD HH:MM:SS] [proxy] MESSAGE key=value ...`.
///
/// Writes go over an unbounded channel to a single writer task, so
/// concurrent callers never interleave partial lines and never block on
/// file I/O.
#[derive(Clone)]
pub struct Logger {
  tx: Sender<LogMessage>,
  debug_enabled: bool,
  cancel_token: CancellationToken,
}

impl Logger {
  /// Logs to stdout only.
  pub fn stdout(debug_enabled: bool) -> Self {
    let (tx, rx) = async_channel::unbounded::<LogMessage>();
    let cancel_token = CancellationToken::new();
    let cancel_token_clone = cancel_token.clone();
    tokio::spawn(async move {
      while let Ok(msg) = tokio::select! {
        msg = rx.recv() => msg,
        _ = cancel_token_clone.cancelled() => return,
      } {
        println!("{}", msg.line);
      }
    });
    Self {
      tx,
      debug_enabled,
      cancel_token,
    }
  }

  /// Logs to a daily-rotating file under `log_dir`, replacing the stdout sink.
  pub async fn to_file(log_dir: &Path, debug_enabled: bool) -> anyhow::Result<Self> {
    tokio::fs::create_dir_all(log_dir).await?;
    let (tx, rx) = async_channel::unbounded::<LogMessage>();
    let cancel_token = CancellationToken::new();
    let cancel_token_clone = cancel_token.clone();
    let log_dir = log_dir.to_path_buf();

    tokio::spawn(async move {
      let writer = Arc::new(AsyncMutex::new(DailyWriter::new(log_dir)));
      let writer_for_flush = writer.clone();

      tokio::spawn(async move {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        loop {
          interval.tick().await;
          let mut w = writer_for_flush.lock().await;
          w.flush().await;
        }
      });

      while let Ok(msg) = tokio::select! {
        msg = rx.recv() => msg,
        _ = cancel_token_clone.cancelled() => return,
      } {
        let mut w = writer.lock().await;
        w.write_line(&msg.line).await;
      }
    });

    Ok(Self {
      tx,
      debug_enabled,
      cancel_token,
    })
  }

  pub fn debug(&self, message: &str, fields: &[(&str, &str)]) {
    if self.debug_enabled {
      self.emit(Level::Debug, message, fields);
    }
  }

  pub fn info(&self, message: &str, fields: &[(&str, &str)]) {
    self.emit(Level::Info, message, fields);
  }

  pub fn warn(&self, message: &str, fields: &[(&str, &str)]) {
    self.emit(Level::Warn, message, fields);
  }

  pub fn error(&self, message: &str, fields: &[(&str, &str)]) {
    self.emit(Level::Error, message, fields);
  }

  fn emit(&self, level: Level, message: &str, fields: &[(&str, &str)]) {
    let now = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let mut line = format!("[{}] [{}] [proxy] {}", level.as_str(), now, message);
    for (k, v) in fields {
      line.push_str(&format!(" {k}={v}"));
    }
    let _ = self.tx.try_send(LogMessage { line });
  }

  /// Stops the background writer task. Call once, at process shutdown —
  /// `Logger` is cloned freely across requests and must not tear down its
  /// shared writer just because one clone goes out of scope.
  pub fn shutdown(&self) {
    self.cancel_token.cancel();
  }
}

struct DailyWriter {
  log_dir: PathBuf,
  current_day: Option<String>,
  file: Option<BufWriter<tokio::fs::File>>,
}

impl DailyWriter {
  fn new(log_dir: PathBuf) -> Self {
    Self {
      log_dir,
      current_day: None,
      file: None,
    }
  }

  async fn write_line(&mut self, line: &str) {
    self.rotate_if_needed().await;
    if let Some(file) = self.file.as_mut() {
      let mut buf = line.as_bytes().to_vec();
      buf.push(b'\n');
      if let Err(e) = file.write_all(&buf).await {
        eprintln!("failed to write to log file: {e}");
      }
    }
  }

  async fn flush(&mut self) {
    if let Some(file) = self.file.as_mut() {
      let _ = file.flush().await;
    }
  }

  async fn rotate_if_needed(&mut self) {
    let today = Local::now().format("%Y-%m-%d").to_string();
    if self.current_day.as_deref() == Some(today.as_str()) {
      return;
    }
    if let Some(file) = self.file.as_mut() {
      let _ = file.flush().await;
    }
    let path = self.log_dir.join(format!("proxy.{today}.log"));
    match OpenOptions::new().append(true).create(true).open(&path).await {
      Ok(file) => {
        self.file = Some(BufWriter::with_capacity(131072, file));
        self.current_day = Some(today);
      }
      Err(e) => {
        eprintln!("failed to open log file {}: {e}", path.display());
      }
    }
    self.cleanup_old_files().await;
  }

  async fn cleanup_old_files(&self) {
    let Ok(pattern) = Regex::new(r"^proxy\.\d{4}-\d{2}-\d{2}\.log$") else {
      return;
    };
    let Ok(mut entries) = tokio::fs::read_dir(&self.log_dir).await else {
      return;
    };
    let threshold = std::time::SystemTime::now() - Duration::from_secs(MAX_AGE_DAYS * 24 * 3600);
    while let Ok(Some(entry)) = entries.next_entry().await {
      let Ok(file_type) = entry.file_type().await else {
        continue;
      };
      if !file_type.is_file() {
        continue;
      }
      let name = entry.file_name();
      let Some(name) = name.to_str() else { continue };
      if !pattern.is_match(name).unwrap_or(false) {
        continue;
      }
      let Ok(metadata) = entry.metadata().await else {
        continue;
      };
      let Ok(modified) = metadata.modified() else {
        continue;
      };
      if modified < threshold {
        let _ = tokio::fs::remove_file(entry.path()).await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_log_filename_pattern_matches() {
    let pattern = Regex::new(r"^proxy\.\d{4}-\d{2}-\d{2}\.log$").unwrap();
    assert!(pattern.is_match("proxy.2026-07-27.log").unwrap());
    assert!(!pattern.is_match("proxy.2026-07-27.log.bak").unwrap());
    assert!(!pattern.is_match("other.log").unwrap());
  }

  #[tokio::test]
  async fn test_daily_writer_creates_file_for_today() {
    let dir = std::env::temp_dir().join(format!("proxy-pool-gateway-log-test-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let mut writer = DailyWriter::new(dir.clone());
    writer.write_line("[INFO] [2026-07-27 00:00:00] [proxy] test").await;
    writer.flush().await;
    let today = Local::now().format("%Y-%m-%d").to_string();
    let expected = dir.join(format!("proxy.{today}.log"));
    assert!(expected.exists());
    tokio::fs::remove_dir_all(&dir).await.unwrap();
  }
}
