// src/exec/process.rs

//! Default step runner: stage the step's content as a script and run it under
//! the matching interpreter.
//!
//! A run goes through four phases:
//!
//! 1. **stage**: write `<script_dir>/<step name><suffix>`;
//! 2. **launch**: spawn the interpreter in its own process group with the
//!    step's environment and workspace;
//! 3. **race**: process exit vs. step timeout vs. manual stop; the latter two
//!    kill the whole process group;
//! 4. **capture**: stdout and stderr are merged line by line into numbered
//!    `StepOutput` records, followed by the done sentinel.
//!
//! The staged script is removed when the runner's [`ScriptGuard`] drops.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::exec::backend::{RunFuture, StepContext, StepError, StepRunner};
use crate::exec::encoding::{self, CP_GBK};
use crate::exec::shell::{self, ShellSpec};
use crate::store::records::now_nanos;
use crate::store::{StateStore, StepOutput};

/// How long output readers may keep going after the process is gone.
const CAPTURE_GRACE: Duration = Duration::from_secs(5);

pub const ENV_TASK_ID: &str = "TASK_ID";
pub const ENV_STEP_ID: &str = "TASK_STEP_ID";
pub const ENV_STEP_NAME: &str = "TASK_STEP_NAME";

/// Removes a staged script on drop.
#[derive(Debug)]
pub struct ScriptGuard {
    path: PathBuf,
}

impl ScriptGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScriptGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(script = ?self.path, "removed staged script"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(script = ?self.path, error = %e, "failed to remove staged script"),
        }
    }
}

/// Runs one step as a local process.
#[derive(Debug)]
pub struct ProcessRunner {
    ctx: StepContext,
    store: StateStore,
    script: Option<ScriptGuard>,
}

impl ProcessRunner {
    pub fn new(ctx: StepContext, store: StateStore) -> Self {
        Self {
            ctx,
            store,
            script: None,
        }
    }

    pub fn context(&self) -> &StepContext {
        &self.ctx
    }

    /// Path of the staged script, while it exists.
    pub fn script_path(&self) -> Option<&Path> {
        self.script.as_ref().map(ScriptGuard::path)
    }

    fn resolve_shell(&self) -> Result<&'static ShellSpec, StepError> {
        shell::lookup(&self.ctx.kind).ok_or_else(|| StepError::UnsupportedShell(self.ctx.kind.clone()))
    }

    /// Write the step content to its script file.
    pub fn stage(&mut self, spec: &ShellSpec) -> Result<PathBuf, StepError> {
        let path = self
            .ctx
            .script_dir
            .join(format!("{}{}", file_stem(&self.ctx.name), spec.suffix));

        let transcode = spec.legacy_console && encoding::active_code_page() == Some(CP_GBK);
        let bytes = if transcode {
            encoding::utf8_to_gbk(&self.ctx.content).into_owned()
        } else {
            self.ctx.content.clone().into_bytes()
        };

        write_script(&path, &bytes).map_err(|source| StepError::ScriptCreationFailed {
            path: path.clone(),
            source,
        })?;

        info!(
            task = %self.ctx.task_id,
            step = self.ctx.index,
            script = ?path.file_name().unwrap_or_default(),
            "created script"
        );
        self.script = Some(ScriptGuard { path: path.clone() });
        Ok(path)
    }

    fn command(&self, spec: &ShellSpec, script: &Path) -> Command {
        let mut cmd = Command::new(spec.program);
        cmd.args(spec.command_args(script))
            .current_dir(&self.ctx.workspace)
            .envs(&self.ctx.env)
            .env(ENV_TASK_ID, &self.ctx.task_id)
            .env(ENV_STEP_ID, self.ctx.index.to_string())
            .env(ENV_STEP_NAME, &self.ctx.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        cmd
    }

    async fn execute(&mut self, cancel: CancellationToken) -> Result<(), StepError> {
        let spec = self.resolve_shell()?;
        let script = self.stage(spec)?;

        let mut child = self
            .command(spec, &script)
            .spawn()
            .map_err(|source| StepError::ProcessLaunchFailed {
                program: spec.program.to_string(),
                source,
            })?;

        info!(
            task = %self.ctx.task_id,
            step = self.ctx.index,
            step_name = %self.ctx.name,
            shell = spec.name,
            pid = child.id(),
            "step process started"
        );

        let force_gbk = spec.legacy_console && encoding::active_code_page() == Some(CP_GBK);
        let capture = OutputCapture::start(&mut child, self.sink(force_gbk));

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => exit_result(status),
                Err(e) => Err(StepError::Backend(
                    anyhow::Error::new(e).context("waiting for step process"),
                )),
            },
            _ = tokio::time::sleep(self.ctx.timeout) => {
                warn!(
                    task = %self.ctx.task_id,
                    step = self.ctx.index,
                    timeout = ?self.ctx.timeout,
                    "step timed out; killing process group"
                );
                kill_process_group(&mut child).await;
                Err(StepError::Timeout(self.ctx.timeout))
            }
            _ = cancel.cancelled() => {
                info!(
                    task = %self.ctx.task_id,
                    step = self.ctx.index,
                    "manual stop; killing process group"
                );
                kill_process_group(&mut child).await;
                Err(StepError::ManualStop)
            }
        };

        let lines = capture.finish().await;
        info!(
            task = %self.ctx.task_id,
            step = self.ctx.index,
            exit_code = outcome.as_ref().err().map_or(0, StepError::exit_code),
            lines,
            "step process finished"
        );
        outcome
    }

    fn sink(&self, force_gbk: bool) -> OutputSink {
        OutputSink {
            store: self.store.clone(),
            task_id: self.ctx.task_id.clone(),
            index: self.ctx.index,
            ttl: self.ctx.key_ttl + self.ctx.timeout,
            force_gbk,
        }
    }
}

impl StepRunner for ProcessRunner {
    fn run(&mut self, cancel: CancellationToken) -> RunFuture<'_> {
        Box::pin(self.execute(cancel))
    }

    fn cleanup(&mut self) -> anyhow::Result<()> {
        // Dropping the guard removes the script.
        self.script.take();
        Ok(())
    }
}

/// Script file stem derived from a step name.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_script(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}

fn exit_result(status: ExitStatus) -> Result<(), StepError> {
    if status.success() {
        return Ok(());
    }
    Err(StepError::NonZeroExit(exit_code(status)))
}

/// Numeric exit code; on unix a signal death maps to `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }

    crate::exec::backend::SYSTEM_EXIT_CODE
}

/// Kill the child together with every process in its group, then reap it.
#[cfg(unix)]
pub async fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        let pgid = libc::pid_t::try_from(pid).unwrap_or(libc::pid_t::MAX);
        // SAFETY: killpg only sends a signal; the group was created by
        // `process_group(0)` at spawn time.
        let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            warn!(pid, error = %err, "killpg failed; killing direct child only");
            let _ = child.start_kill();
        }
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap killed step process");
    }
}

#[cfg(windows)]
pub async fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        let result = Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!(pid, ?status, "taskkill failed; killing direct child only");
                let _ = child.start_kill();
            }
            Err(e) => {
                warn!(pid, error = %e, "taskkill unavailable; killing direct child only");
                let _ = child.start_kill();
            }
        }
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap killed step process");
    }
}

/// Destination of captured lines.
struct OutputSink {
    store: StateStore,
    task_id: String,
    index: usize,
    ttl: Duration,
    force_gbk: bool,
}

impl OutputSink {
    /// Number lines from 1 in arrival order, then write the done sentinel.
    async fn write_all(self, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> u64 {
        let mut count: u64 = 0;
        while let Some(raw) = rx.recv().await {
            let content = encoding::normalize_line(&raw, self.force_gbk);
            if content.is_empty() {
                continue;
            }
            count += 1;
            debug!(task = %self.task_id, step = self.index, line = count, "{}", content);
            self.store.append_output(
                &self.task_id,
                self.index,
                &StepOutput {
                    line: count,
                    timestamp: now_nanos(),
                    content,
                },
                self.ttl,
            );
        }
        self.store
            .set_output_done(&self.task_id, self.index, count, self.ttl);
        count
    }
}

/// Readers for stdout/stderr feeding a single line writer.
struct OutputCapture {
    readers: JoinSet<()>,
    writer: tokio::task::JoinHandle<u64>,
}

impl OutputCapture {
    fn start(child: &mut Child, sink: OutputSink) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = JoinSet::new();
        if let Some(stdout) = child.stdout.take() {
            readers.spawn(read_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.spawn(read_lines(stderr, tx.clone()));
        }
        drop(tx);

        let writer = tokio::spawn(sink.write_all(rx));
        Self { readers, writer }
    }

    /// Wait for the streams to close (bounded by [`CAPTURE_GRACE`]) and
    /// return the number of lines written.
    async fn finish(mut self) -> u64 {
        let drained = tokio::time::timeout(CAPTURE_GRACE, async {
            while self.readers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("output streams still open after process exit; detaching readers");
            self.readers.shutdown().await;
        }

        match self.writer.await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "output writer failed");
                0
            }
        }
    }
}

async fn read_lines<R>(stream: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(buf.clone()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "output stream read error");
                break;
            }
        }
    }
}
