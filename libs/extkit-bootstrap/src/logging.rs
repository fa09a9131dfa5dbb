use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::{LoggingConfig, Section};

fn parse_tracing_level(s: &str) -> Option<Level> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        "off" | "none" => None,
        _ => Some(Level::INFO),
    }
}

// ================= rotating writer for files =================

use file_rotate::{compression::Compression, suffix::AppendCount, ContentLimit, FileRotate};

#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendCount>>>);

impl<'a> fmt::MakeWriter<'a> for RotWriter {
    type Writer = RotWriterHandle;
    fn make_writer(&'a self) -> Self::Writer {
        RotWriterHandle(self.0.clone())
    }
}

#[derive(Clone)]
struct RotWriterHandle(Arc<Mutex<FileRotate<AppendCount>>>);

impl Write for RotWriterHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

fn rotating_writer(home_dir: &Path, section: &Section) -> Option<RotWriter> {
    if section.file.is_empty() {
        return None;
    }
    let path = home_dir.join(&section.file);
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("cannot create log directory {}: {e}", parent.display());
            return None;
        }
    }
    let max_bytes = section.max_size_mb.unwrap_or(100) * 1024 * 1024;
    let keep = section.max_backups.unwrap_or(3);
    let rotate = FileRotate::new(
        path,
        AppendCount::new(keep),
        ContentLimit::Bytes(max_bytes as usize),
        Compression::None,
        None,
    );
    Some(RotWriter(Arc::new(Mutex::new(rotate))))
}

/// Initialize console + rotating-file logging from the `logging` config
/// section. The "default" subsystem entry drives both sinks.
pub fn init_logging(config: &LoggingConfig, home_dir: &Path) {
    let section = config.get("default").cloned().unwrap_or(Section {
        console_level: "info".to_string(),
        file: String::new(),
        file_level: String::new(),
        max_backups: None,
        max_size_mb: None,
    });

    let console_layer = parse_tracing_level(&section.console_level).map(|level| {
        fmt::layer()
            .with_target(true)
            .with_filter(tracing_subscriber::filter::LevelFilter::from_level(level))
    });

    let file_level = if section.file_level.is_empty() {
        section.console_level.clone()
    } else {
        section.file_level.clone()
    };
    let file_layer = parse_tracing_level(&file_level).and_then(|level| {
        rotating_writer(home_dir, &section).map(|writer| {
            fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(tracing_subscriber::filter::LevelFilter::from_level(level))
        })
    });

    let registry = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);

    // A second init (tests, embedders) is not fatal.
    if registry.try_init().is_err() {
        tracing::debug!("logging already initialized; keeping existing subscriber");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing_matches_config_strings() {
        assert_eq!(parse_tracing_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_tracing_level("WARN"), Some(Level::WARN));
        assert_eq!(parse_tracing_level("off"), None);
        assert_eq!(parse_tracing_level("bogus"), Some(Level::INFO));
    }

    #[test]
    fn empty_file_section_skips_file_sink() {
        let section = Section {
            console_level: "info".to_string(),
            file: String::new(),
            file_level: String::new(),
            max_backups: None,
            max_size_mb: None,
        };
        assert!(rotating_writer(Path::new("/tmp"), &section).is_none());
    }
}
