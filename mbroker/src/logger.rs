use std::fs::{self, File, OpenOptions};
use std::io::{self, Stdout, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use slog::{o, Drain};

use crate::settings::logging::{Log, To};

pub use slog::Logger;

/// Keeps the async log drain alive; dropping it flushes pending records.
pub struct LoggerGuard {
    pub logger: Logger,
    _guard: slog_async::AsyncGuard,
}

/// Installs a slog backend behind the `log` facade macros.
pub fn logger_init(cfg: &Log) -> Result<LoggerGuard> {
    let (logger, guard) = config_logger(cfg)?;
    log::set_boxed_logger(Box::new(LoggerEx(logger.clone())))
        .map_err(|e| anyhow!("logger already initialized, {:?}", e))?;
    log::set_max_level(slog_log_to_level(cfg.level).to_level_filter());
    Ok(LoggerGuard { logger, _guard: guard })
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

/// Builds the drain chain: term formatting, level filter, async channel.
pub fn config_logger(cfg: &Log) -> Result<(Logger, slog_async::AsyncGuard)> {
    let writer = WriteFilter::new(cfg.to, if cfg.to.file() { Some(open_file(&cfg.filename())?) } else { None });
    let decorator = slog_term::PlainDecorator::new(writer);
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = LevelFilter { drain, level: cfg.level }.fuse();

    let (drain, guard) = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build_with_guard();

    Ok((Logger::root(drain.fuse(), o!()), guard))
}

struct LevelFilter<D> {
    drain: D,
    level: slog::Level,
}

impl<D> Drain for LevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(&self, record: &slog::Record, values: &slog::OwnedKVList) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

struct WriteFilter {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(to: To, file: Option<File>) -> Self {
        Self { to, file, console: io::stdout() }
    }

    fn write_file(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }
}

impl Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.to {
            To::Console => self.console.write(buf),
            To::File => self.write_file(buf),
            To::Both => {
                self.console.write_all(buf)?;
                self.write_file(buf)
            }
            To::Off => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if let Some(f) = self.file.as_mut() {
            f.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> Result<File> {
    if filename.is_empty() {
        return Err(anyhow!("logger file config error, no filename"));
    }
    if let Some(dir) = Path::new(filename).parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .map_err(|e| anyhow!("logger file config error, dir: {:?}, {:?}", dir, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| anyhow!("logger file config error, filename: {}, {:?}", filename, e))
}
