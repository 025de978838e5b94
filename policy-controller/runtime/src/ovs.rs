use crate::core::{FlowOp, FlowTable};
use anyhow::{bail, Context, Result};
use std::{
    io::{self, Read, Write},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

/// The OpenFlow version spoken to the bridge.
const OPENFLOW_VERSION: &str = "OpenFlow13";

/// How often a running `ovs-ofctl` is checked for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Applies flow modifications to an Open vSwitch bridge with `ovs-ofctl bundle`, so that each
/// transaction is committed atomically.
///
/// Each invocation is bounded by a timeout, after which `ovs-ofctl` is killed and the transaction
/// fails.
#[derive(Clone, Debug)]
pub struct OvsOfctl {
    path: PathBuf,
    bridge: String,
    timeout: Duration,
}

/// Logs flow modifications without applying them.
#[derive(Clone, Debug, Default)]
pub struct DryRun(());

// === impl OvsOfctl ===

impl OvsOfctl {
    pub fn new(path: impl Into<PathBuf>, bridge: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            bridge: bridge.into(),
            timeout,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.arg("-O")
            .arg(OPENFLOW_VERSION)
            .arg("bundle")
            .arg(&self.bridge)
            .arg("-");
        cmd
    }
}

impl FlowTable for OvsOfctl {
    fn apply(&self, ops: &[FlowOp]) -> Result<()> {
        let cmd = self.command();
        debug!(command = ?cmd, ops = ops.len(), "Applying flow bundle");
        let input = bundle(ops);
        blocking(|| run(cmd, input.as_bytes(), self.timeout))
            .with_context(|| format!("{} bundle {} failed", self.path.display(), self.bridge))
    }
}

/// Runs a blocking operation without stalling the other tasks scheduled on this worker.
///
/// The index's lock is held across commits, so the operation runs in place.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Runs a command to completion, writing `input` to its stdin.
///
/// The command is killed if it does not exit within `timeout`. Its stderr is included in the
/// error when it exits unsuccessfully.
fn run(mut cmd: Command, input: &[u8], timeout: Duration) -> Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to execute {program}"))?;
    let stdin = child.stdin.take();
    let stderr = child.stderr.take();

    // A child that stops reading stdin or fills stderr must not block past the deadline.
    let (status, written, stderr) = thread::scope(|s| {
        let writer = s.spawn(move || match stdin {
            Some(mut stdin) => stdin.write_all(input),
            None => Ok(()),
        });
        let reader = s.spawn(move || {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                if let Err(error) = stderr.read_to_string(&mut buf) {
                    debug!(%error, "Failed to read stderr");
                }
            }
            buf
        });

        let status = wait(&mut child, timeout);
        let written = writer
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));
        let stderr = reader.join().unwrap_or_default();
        (status, written, stderr)
    });

    let status = status?;
    if !status.success() {
        bail!("{status}: {}", stderr.trim());
    }
    written.context("failed to write flow bundle")?;
    Ok(())
}

/// Waits for the child to exit, killing it once `timeout` elapses.
fn wait(child: &mut Child, timeout: Duration) -> Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(error) => {
                kill(child)?;
                return Err(error).context("failed to wait for child");
            }
        }
        if Instant::now() >= deadline {
            kill(child)?;
            bail!("timed out after {timeout:?}");
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Kills and reaps the child, closing its end of the pipes.
fn kill(child: &mut Child) -> Result<()> {
    if let Err(error) = child.kill() {
        warn!(%error, "Failed to kill child");
    }
    child.wait().context("failed to wait for killed child")?;
    Ok(())
}

/// Renders a transaction in the `ovs-ofctl bundle` file format.
fn bundle(ops: &[FlowOp]) -> String {
    ops.iter().map(|op| format!("flow {op}\n")).collect()
}

// === impl DryRun ===

impl FlowTable for DryRun {
    fn apply(&self, ops: &[FlowOp]) -> Result<()> {
        for op in ops {
            info!(%op, "Dry run");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Flow, FlowMatch, Transaction};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn renders_bundle() {
        let ops = [
            FlowOp::Delete(FlowMatch::namespace(5)),
            FlowOp::Add(Flow::namespace_policy(5, "tcp, tp_dst=80, ")),
        ];
        assert_eq!(
            bundle(&ops),
            "flow delete table=80, reg1=5\n\
             flow add table=80, priority=100, reg1=5, tcp, tp_dst=80, actions=output:NXM_NX_REG2[]\n"
        );
    }

    #[test]
    fn command_targets_bridge() {
        let cmd = OvsOfctl::new("/usr/bin/ovs-ofctl", "br0", TIMEOUT).command();
        assert_eq!(cmd.get_program(), "/usr/bin/ovs-ofctl");
        assert_eq!(
            cmd.get_args().collect::<Vec<_>>(),
            ["-O", "OpenFlow13", "bundle", "br0", "-"]
        );
    }

    #[test]
    fn missing_ofctl_fails_commit() {
        let table = OvsOfctl::new("/nonexistent/ovs-ofctl", "br0", TIMEOUT);
        let mut tx = Transaction::new(&table);
        tx.delete_flows(FlowMatch::namespace(5));
        let error = tx.commit().expect_err("commit must fail");
        assert!(
            error.to_string().contains("/nonexistent/ovs-ofctl"),
            "{error:#}"
        );
    }

    #[test]
    fn dry_run_accepts_everything() {
        let table = DryRun::default();
        let mut tx = Transaction::new(&table);
        tx.add_flow(Flow::namespace_allow_all(5));
        tx.commit().expect("dry run must succeed");
    }

    #[test]
    fn run_feeds_input() {
        let input = b"flow delete table=80, reg1=5\n";
        run(sh(r#"grep "^flow delete" >/dev/null || exit 7"#), input, TIMEOUT)
            .expect("command must succeed");

        let error = run(sh(r#"grep "^flow add" >/dev/null || exit 7"#), input, TIMEOUT)
            .expect_err("command must fail");
        assert!(error.to_string().contains("7"), "{error:#}");
    }

    #[test]
    fn run_reports_stderr() {
        let script = "cat >/dev/null; echo 'bridge br0 does not exist' >&2; exit 1";
        let error = run(sh(script), b"", TIMEOUT).expect_err("command must fail");
        assert!(
            error.to_string().contains("bridge br0 does not exist"),
            "{error:#}"
        );
    }

    #[test]
    fn run_kills_hung_command() {
        let started = Instant::now();
        let error = run(sh("exec sleep 30"), b"", Duration::from_millis(100))
            .expect_err("command must time out");
        assert!(error.to_string().contains("timed out"), "{error:#}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn run_survives_unread_input() {
        // More than a pipe's worth of input that the command never reads.
        let input = vec![b'x'; 1 << 20];
        let error = run(sh("exec sleep 30"), &input, Duration::from_millis(100))
            .expect_err("command must time out");
        assert!(error.to_string().contains("timed out"), "{error:#}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commits_on_multi_threaded_runtime() {
        let table = OvsOfctl::new("/nonexistent/ovs-ofctl", "br0", TIMEOUT);
        let mut tx = Transaction::new(&table);
        tx.delete_flows(FlowMatch::namespace(5));
        assert!(tx.commit().is_err());
    }
}
