use std::fs;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use time::format_description;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use ctor::ctor;
pub use tracing::Level as LogLevel;

/// 按大小拆分的日志写入器。
/// chunks 虽然最低要求为 1，但不建议使用 1，否则容量刚好达到上限时日志会被清空掉。
pub struct SizeBasedWriter {
    directory: PathBuf,
    file_prefix: String,
    max_size: u64,
    chunks: usize,
    log_file: Option<File>,
    file_size: u64,
}

impl SizeBasedWriter {
    pub fn new(
        directory: &Path,
        file_prefix: &str,
        max_size: u64,
        chunks: usize,
    ) -> std::io::Result<Self> {
        assert!(chunks > 0, "file chunks must be greater than 0");

        let (log_file, file_size) = Self::get_last_log(directory)?;

        Ok(Self {
            directory: directory.to_path_buf(),
            file_prefix: file_prefix.to_string(),
            max_size,
            chunks,
            log_file,
            file_size,
        })
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        if let Some(file) = self.log_file.take() {
            file.sync_all()?;
        }

        let format =
            format_description::parse("[year][month][day]_[hour][minute][second]").unwrap();
        let timestamp = time::OffsetDateTime::now_utc().format(&format).unwrap();
        let new_path = self
            .directory
            .join(format!("{}_{}.log", self.file_prefix, timestamp));

        self.log_file = Some(File::create(new_path)?);
        self.file_size = 0;

        self.cleanup_old_files()?;

        Ok(())
    }

    /// 获取最后的一个文件，续写
    fn get_last_log(dir: &Path) -> std::io::Result<(Option<File>, u64)> {
        let entries: Vec<fs::DirEntry> = match fs::read_dir(dir) {
            Ok(rd) => rd.filter_map(|entry| entry.ok()).collect(),
            Err(_) => return Ok((None, 0)),
        };

        let file = entries.iter().max_by_key(|entry| {
            entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        });

        match file {
            Some(file) => Ok((
                Some(OpenOptions::new().append(true).open(file.path())?),
                file.metadata()?.len(),
            )),
            None => Ok((None, 0)),
        }
    }

    /// 清理最旧的文件，只保留 chunks 个
    pub fn cleanup_old_files(&self) -> std::io::Result<()> {
        let mut entries: Vec<fs::DirEntry> = fs::read_dir(&self.directory)?
            .filter_map(|entry| entry.ok())
            .collect();

        if entries.len() <= self.chunks {
            return Ok(());
        }

        entries.sort_by_key(|entry| {
            entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        });

        let take = entries.len() - self.chunks;
        for entry in entries.iter().take(take) {
            fs::remove_file(entry.path())?;
        }

        Ok(())
    }
}

impl Write for SizeBasedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // 满了或者文件不存在，则创建新文件
        if self.log_file.is_none() || self.file_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }

        if let Some(file) = &mut self.log_file {
            let written = file.write(buf)?;
            self.file_size += written as u64;
            Ok(written)
        } else {
            Ok(0)
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.log_file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 注册日志记录器，文件 + 控制台双输出
///
/// 返回的 `WorkerGuard` 要持有到进程结束，避免日志线程退出导致日志丢失。
pub fn register_logger(
    dir: &str,
    file_prefix: &str,
    max_size: u64,
    chunks: usize,
    level: Level,
) -> std::io::Result<WorkerGuard> {
    let log_dir = Path::new(dir);
    fs::create_dir_all(log_dir)?;

    let writer = SizeBasedWriter::new(log_dir, file_prefix, max_size, chunks)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);

    let out_file = fmt::layer()
        .with_line_number(true)
        .with_thread_ids(true)
        .with_ansi(false)
        .with_writer(non_blocking.with_max_level(level));

    let console = fmt::layer()
        .with_line_number(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr.with_max_level(level));

    tracing_subscriber::registry()
        .with(out_file)
        .with(console)
        .init();

    Ok(guard)
}

static DEFAULT_LOGGER_SET: AtomicBool = AtomicBool::new(false);

/// 注册仅控制台输出的默认日志记录器，给二进制入口和测试用。
/// 重复注册会被忽略，所以不要在测试 mod 里反复调用。
pub fn init_default_logger(level: Level) {
    if DEFAULT_LOGGER_SET.swap(true, Ordering::SeqCst) {
        return;
    }
    let console = fmt::layer()
        .with_line_number(true)
        .with_writer(std::io::stderr.with_max_level(level));
    let _ = tracing_subscriber::registry().with(console).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("diaodu-log-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// 写满就切新文件，旧文件只保留 chunks 个
    #[test]
    fn test_rotate_and_cleanup() {
        let dir = temp_dir("rotate");
        let mut writer = SizeBasedWriter::new(&dir, "diaodu", 64, 2).unwrap();
        for _ in 0..10 {
            writer.write_all(&[b'x'; 40]).unwrap();
        }
        writer.flush().unwrap();

        let files = fs::read_dir(&dir).unwrap().count();
        assert!(files >= 1);
        assert!(files <= 2, "旧日志没有被清理: {files}");
        let _ = fs::remove_dir_all(&dir);
    }
}

#[macro_export]
macro_rules! default_logger {
    ($level:expr) => {
        #[doc(hidden)]
        static __DEFAULT_LOG_LEVEL: $crate::log::LogLevel = $level;

        #[doc(hidden)]
        mod __default_logger_init {
            use $crate::log::ctor;

            #[ctor]
            fn init() {
                $crate::log::init_default_logger(super::__DEFAULT_LOG_LEVEL);
            }
        }
    };
}
