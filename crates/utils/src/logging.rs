//! provides logging helpers

use std::path::Path;

use tracing::Dispatch;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Build a dispatch that appends to `path`.
///
/// Writes are synchronous: the process may `exec` at any point and nothing
/// buffered would survive it. Nothing is installed globally; callers scope
/// the dispatch with [`tracing::dispatcher::with_default`]. Events go nowhere
/// when the file cannot be opened.
pub fn file_dispatch(path: &Path) -> Dispatch {
    let writer = match file_appender(path) {
        Some(appender) => BoxMakeWriter::new(appender),
        None => {
            eprintln!("can't open log file {}", path.display());
            BoxMakeWriter::new(std::io::sink)
        }
    };

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(env_filter);

    Dispatch::new(registry().with(fmt_layer))
}

fn file_appender(path: &Path) -> Option<RollingFileAppender> {
    let dir = path.parent()?;
    let file_name = path.file_name()?.to_str()?;
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
        .ok()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn writes_to_file_only_within_scope() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.log");

        let dispatch = file_dispatch(&path);
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!("inside scope");
        });
        tracing::info!("outside scope");

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("inside scope"), "{content}");
        assert!(!content.contains("outside scope"), "{content}");
    }

    #[test]
    fn appends_across_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.log");

        for message in ["first", "second"] {
            let dispatch = file_dispatch(&path);
            tracing::dispatcher::with_default(&dispatch, || tracing::info!("{message}"));
        }

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2, "{content}");
    }

    #[test]
    fn unopenable_file_falls_back_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let path = blocker.join("runtime.log");

        let dispatch = file_dispatch(&path);
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!("dropped");
        });
        assert!(!path.exists());
    }
}
