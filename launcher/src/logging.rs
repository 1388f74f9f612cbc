//! Tracing setup: one subscriber whose output goes to the log file, the event bus and,
//! in debug mode, the console.

use alloc::sync::Arc;
use std::{
    env,
    fs::{self, File, OpenOptions},
    io::{self, Write as _},
    path::Path,
    sync::{Mutex, Once},
};

use tracing_subscriber::{EnvFilter, fmt::MakeWriter, fmt::time::ChronoLocal};

use crate::{
    cli::{GlobalOptions, LogFormat},
    events::{EventBus, LauncherEvent},
};

static INIT_TRACING: Once = Once::new();

/// Fans every formatted log line out to its sinks.
#[derive(Clone)]
struct TeeWriter {
    events: EventBus,
    file: Option<Arc<Mutex<File>>>,
    echo: bool,
}

/// Buffers one formatted event and hands it to the sinks when dropped.
struct TeeLine {
    sink: TeeWriter,
    buf: Vec<u8>,
}

impl io::Write for TeeLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for TeeLine {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        if self.sink.echo {
            drop(io::stderr().write_all(&self.buf));
        }
        if let Some(ref file) = self.sink.file
            && let Ok(mut file) = file.lock()
        {
            drop(file.write_all(&self.buf));
        }
        let line = String::from_utf8_lossy(&self.buf).trim_end().to_owned();
        self.sink.events.publish(LauncherEvent::Log(line));
    }
}

impl<'writer> MakeWriter<'writer> for TeeWriter {
    type Writer = TeeLine;

    fn make_writer(&'writer self) -> Self::Writer {
        TeeLine {
            sink: self.clone(),
            buf: Vec::new(),
        }
    }
}

fn open_log_file(data_dir: &Path) -> Option<File> {
    let path = data_dir.join("launcher.log");
    let opened = fs::create_dir_all(data_dir).and_then(|()| {
        OpenOptions::new().create(true).append(true).open(&path)
    });
    match opened {
        Ok(file) => Some(file),
        Err(e) => {
            // tracing is not up yet
            eprintln!("Cannot open log file {}: {e}", path.display());
            None
        }
    }
}

/// Installs the global subscriber. Later calls are no-ops.
///
/// The level comes from `RUST_LOG` when set, else `info` (`debug` with `--debug`).
pub fn init(options: &GlobalOptions, events: &EventBus, data_dir: &Path) {
    let default_level = if options.debug { "debug" } else { "info" };
    let format = options.log_format;
    let writer = TeeWriter {
        events: events.clone(),
        file: open_log_file(data_dir).map(|f| Arc::new(Mutex::new(f))),
        echo: options.debug || env::var_os("NODE_LAUNCHER_LOG_STDERR").is_some(),
    };

    INIT_TRACING.call_once(move || {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
            )
            .with_timer(ChronoLocal::rfc_3339())
            .with_ansi(false)
            .with_writer(writer);

        match format {
            LogFormat::Compact => builder.compact().init(),
            LogFormat::Json => builder.json().init(),
            LogFormat::Pretty => builder.pretty().init(),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_reach_file_and_bus() {
        let dir = env::temp_dir().join(format!("launcher_log_{}", std::process::id()));
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let writer = TeeWriter {
            events,
            file: open_log_file(&dir).map(|f| Arc::new(Mutex::new(f))),
            echo: false,
        };

        {
            let mut line = writer.make_writer();
            line.write_all(b"hello ").unwrap();
            line.write_all(b"world\n").unwrap();
        }

        assert_eq!(
            rx.recv().await.unwrap(),
            LauncherEvent::Log("hello world".to_owned())
        );
        let logged = fs::read_to_string(dir.join("launcher.log")).unwrap();
        assert!(logged.ends_with("hello world\n"), "log file: {logged:?}");
        drop(fs::remove_dir_all(&dir));
    }
}
