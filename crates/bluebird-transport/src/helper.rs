//! 助手子进程链路
//!
//! 子进程的 stdout 按行读取（每行一个 JSON 事件），stdin 按行写入文本命令。
//! 读写两端与进程控制拆分为三个独立对象，分别交给读线程、工作线程和关闭流程。

use crate::{TransportDeviceError, TransportDeviceErrorKind, TransportError};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 行读取端
pub trait LineSource: Send {
    /// 读取一行（不含换行符），EOF 返回 `Ok(None)`
    fn read_line(&mut self) -> Result<Option<String>, TransportError>;
}

/// 行写入端
pub trait LineSink: Send {
    fn write_line(&mut self, line: &str) -> Result<(), TransportError>;
}

/// 进程生命周期控制
pub trait ProcessControl: Send {
    fn is_alive(&mut self) -> bool;

    /// 等待进程在 `grace` 内自行退出，超时则强制结束
    fn terminate(&mut self, grace: Duration) -> Result<(), TransportError>;
}

/// 已拆分的助手链路
pub struct HelperChannel {
    pub source: Box<dyn LineSource>,
    pub sink: Box<dyn LineSink>,
    pub control: Box<dyn ProcessControl>,
}

/// 助手子进程
pub struct HelperProcess {
    program: PathBuf,
    args: Vec<String>,
}

impl HelperProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// 启动子进程并拆分为读/写/控制三端
    pub fn spawn(&self) -> Result<HelperChannel, TransportError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                let kind = match e.kind() {
                    std::io::ErrorKind::NotFound => TransportDeviceErrorKind::NotFound,
                    std::io::ErrorKind::PermissionDenied => TransportDeviceErrorKind::AccessDenied,
                    _ => TransportDeviceErrorKind::Backend,
                };
                TransportDeviceError::new(kind, format!("{}: {}", self.program.display(), e))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            TransportDeviceError::new(TransportDeviceErrorKind::Backend, "helper stdout not piped")
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportDeviceError::new(TransportDeviceErrorKind::Backend, "helper stdin not piped")
        })?;

        info!("Spawned helper process {} (pid {})", self.program.display(), child.id());

        Ok(HelperChannel {
            source: Box::new(ChildLineSource {
                reader: BufReader::new(stdout),
            }),
            sink: Box::new(ChildLineSink { stdin }),
            control: Box::new(ChildControl { child }),
        })
    }
}

struct ChildLineSource {
    reader: BufReader<ChildStdout>,
}

impl LineSource for ChildLineSource {
    fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

struct ChildLineSink {
    stdin: ChildStdin,
}

impl LineSink for ChildLineSink {
    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        debug!("helper <- {}", line);
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }
}

struct ChildControl {
    child: Child,
}

impl ProcessControl for ChildControl {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self, grace: Duration) -> Result<(), TransportError> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        thread::sleep(grace);
        if let Some(status) = self.child.try_wait()? {
            debug!("Helper process exited with {}", status);
            return Ok(());
        }
        warn!("Helper process did not exit within {:?}, killing", grace);
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}
