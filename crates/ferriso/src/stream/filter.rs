//! Filter stream that pipes its input through an external process.
//!
//! The child is driven with non-blocking pipes from a single thread: drain
//! child stdout first, feed stdin when stdout would block, sleep 1 ms when
//! both directions stall. After input EOF the child's stdin is closed and
//! stdout switched back to blocking until it reports EOF too.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{IsoError, Result};
use crate::stream::{next_filter_serial, IsoStream, OpenSize, SharedStream, StreamId, FILTER_FS_ID};

const FEED_CHUNK: usize = 8192;

/// Description of an external filter program.
#[derive(Debug, Clone)]
pub struct ExternalFilterCommand {
    /// Name for diagnostics, e.g. "gzip".
    pub name: String,
    /// Path of the binary to execute.
    pub path: String,
    /// Arguments, not including argv[0].
    pub args: Vec<String>,
}

fn set_nonblocking(fd: i32, nonblocking: bool) -> Result<()> {
    // Safety: plain fcntl on a fd we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(IsoError::FilterBroken("fcntl(F_GETFL) failed".into()));
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(IsoError::FilterBroken("fcntl(F_SETFL) failed".into()));
        }
    }
    Ok(())
}

struct Running {
    /// None for zero-length input, which never starts the child at all.
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    in_eof: bool,
    inner_eof: bool,
    pending: Vec<u8>,
    pending_pos: usize,
}

/// A stream that reads its wrapped input through an external process.
pub struct ExternalFilterStream {
    cmd: Arc<ExternalFilterCommand>,
    inner: SharedStream,
    ino_id: u64,
    cached_size: Option<u64>,
    running: Option<Running>,
}

impl ExternalFilterStream {
    /// Wrap `inner`. The input must be repeatable since the size of the
    /// filter output can only be discovered by a dry run; that run happens
    /// here so the size is available for layout, and is cached after.
    pub fn new(cmd: Arc<ExternalFilterCommand>, inner: SharedStream) -> Result<Self> {
        if !inner.lock().expect("stream poisoned").is_repeatable() {
            return Err(IsoError::WrongArg(
                "external filter input must be repeatable".into(),
            ));
        }
        let mut stream = ExternalFilterStream {
            cmd,
            inner,
            ino_id: next_filter_serial(),
            cached_size: None,
            running: None,
        };
        stream.update_size()?;
        Ok(stream)
    }

    fn spawn(&mut self) -> Result<Running> {
        let mut child = Command::new(&self.cmd.path)
            .args(&self.cmd.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| IsoError::FilterBroken(format!("cannot run {}: {e}", self.cmd.name)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IsoError::FilterBroken("child stdin missing".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IsoError::FilterBroken("child stdout missing".into()))?;
        set_nonblocking(stdin.as_raw_fd(), true)?;
        set_nonblocking(stdout.as_raw_fd(), true)?;
        Ok(Running {
            child: Some(child),
            stdin: Some(stdin),
            stdout: Some(stdout),
            in_eof: false,
            inner_eof: false,
            pending: Vec::new(),
            pending_pos: 0,
        })
    }

    /// Move input bytes towards the child. Returns Ok(()) also when the
    /// child's stdin would block; the caller sleeps and retries.
    fn feed(&mut self) -> Result<()> {
        let run = self.running.as_mut().expect("filter not open");
        if run.pending_pos == run.pending.len() && !run.inner_eof {
            run.pending.resize(FEED_CHUNK, 0);
            run.pending_pos = 0;
            let n = self
                .inner
                .lock()
                .expect("stream poisoned")
                .read(&mut run.pending)?;
            run.pending.truncate(n);
            if n == 0 {
                run.inner_eof = true;
            }
        }
        if run.pending_pos == run.pending.len() && run.inner_eof {
            // Close the child's stdin and read the rest in blocking mode.
            run.stdin = None;
            run.in_eof = true;
            if let Some(stdout) = run.stdout.as_ref() {
                set_nonblocking(stdout.as_raw_fd(), false)?;
            }
            return Ok(());
        }
        let stdin = run.stdin.as_mut().expect("stdin still open while feeding");
        match stdin.write(&run.pending[run.pending_pos..]) {
            Ok(n) => {
                run.pending_pos += n;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
                Ok(())
            }
            Err(e) => Err(IsoError::FilterBroken(format!(
                "feeding {} failed: {e}",
                self.cmd.name
            ))),
        }
    }
}

impl IsoStream for ExternalFilterStream {
    fn class_name(&self) -> &'static str {
        "extf"
    }

    fn open(&mut self) -> Result<OpenSize> {
        if self.running.is_some() {
            return Err(IsoError::WrongArg("filter stream already open".into()));
        }
        self.inner.lock().expect("stream poisoned").open()?;
        // Zero-length input: do not bother the child at all.
        if self.inner.lock().expect("stream poisoned").size() == 0 {
            self.running = Some(Running {
                child: None,
                stdin: None,
                stdout: None,
                in_eof: true,
                inner_eof: true,
                pending: Vec::new(),
                pending_pos: 0,
            });
            return Ok(OpenSize::Exact);
        }
        self.running = Some(self.spawn()?);
        Ok(OpenSize::Exact)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(run) = self.running.take() {
            if let Some(mut child) = run.child {
                // A surviving child is killed; a finished one reaps cleanly.
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        self.inner.lock().expect("stream poisoned").close()
    }

    fn size(&self) -> u64 {
        self.cached_size.unwrap_or(0)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.running.is_none() {
            return Err(IsoError::WrongArg("filter stream is not open".into()));
        }
        loop {
            let run = self.running.as_mut().expect("filter open");
            let stdout = match run.stdout.as_mut() {
                Some(s) => s,
                None => return Ok(0),
            };
            match stdout.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if run.in_eof {
                        std::thread::sleep(Duration::from_millis(1));
                    } else {
                        self.feed()?;
                    }
                }
                Err(e) => {
                    return Err(IsoError::FilterBroken(format!(
                        "reading from {} failed: {e}",
                        self.cmd.name
                    )))
                }
            }
        }
    }

    fn is_repeatable(&self) -> bool {
        self.inner.lock().expect("stream poisoned").is_repeatable()
    }

    fn update_size(&mut self) -> Result<()> {
        // Sizes of filter output are only discoverable by a full dry run.
        let mut total: u64 = 0;
        let mut buf = vec![0u8; FEED_CHUNK];
        self.open()?;
        loop {
            match self.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n as u64,
                Err(e) => {
                    let _ = self.close();
                    return Err(e);
                }
            }
        }
        self.close()?;
        self.cached_size = Some(total);
        Ok(())
    }

    fn id(&self) -> StreamId {
        StreamId {
            fs_id: FILTER_FS_ID,
            dev_id: 0,
            ino_id: self.ino_id,
        }
    }

    fn input_stream(&mut self) -> Option<&mut SharedStream> {
        Some(&mut self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{share, MemoryStream};

    fn cat_cmd() -> Arc<ExternalFilterCommand> {
        Arc::new(ExternalFilterCommand {
            name: "cat".into(),
            path: "/bin/cat".into(),
            args: vec![],
        })
    }

    #[test]
    fn cat_filter_is_identity() {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let inner = share(MemoryStream::new(payload.clone()));
        let mut f = ExternalFilterStream::new(cat_cmd(), inner).unwrap();

        f.update_size().unwrap();
        assert_eq!(f.size(), payload.len() as u64);

        f.open().unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = f.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        f.close().unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn zero_length_input_short_circuits() {
        let inner = share(MemoryStream::new(Vec::new()));
        let mut f = ExternalFilterStream::new(cat_cmd(), inner).unwrap();
        f.open().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(f.read(&mut buf).unwrap(), 0);
        f.close().unwrap();
    }
}
