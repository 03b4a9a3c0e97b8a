//! Delegation to an external IPAM plugin.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::Output;
use std::process::Stdio;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::errors::CniError;
use crate::skel::CmdArgs;
use crate::types::CniResult;
use crate::types::ErrorResult;

/// Upper bound on a single IPAM plugin invocation.
pub const IPAM_TIMEOUT: Duration = Duration::from_secs(60);

pub trait Ipam {
    /// Allocates addresses for the attachment described by `args`.
    fn add(&self, plugin: &str, args: &CmdArgs) -> Result<CniResult, Report<CniError>>;

    /// Releases whatever `add` allocated. Must tolerate repeated calls.
    fn del(&self, plugin: &str, args: &CmdArgs) -> Result<(), Report<CniError>>;
}

/// Runs IPAM plugin binaries found on `CNI_PATH`, forwarding the stdin config verbatim.
#[derive(Debug)]
pub struct ExecIpam {
    timeout: Duration,
}

impl Default for ExecIpam {
    fn default() -> Self {
        Self::with_timeout(IPAM_TIMEOUT)
    }
}

impl ExecIpam {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn find(plugin: &str, args: &CmdArgs) -> Result<PathBuf, Report<CniError>> {
        std::env::split_paths(&args.path)
            .map(|dir| dir.join(plugin))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                Report::new(CniError::Ipam {
                    plugin: plugin.to_string(),
                })
                .attach_printable(format!("failed to find plugin {plugin:?} in path {:?}", args.path))
            })
    }

    fn exec(&self, command: &str, plugin: &str, args: &CmdArgs) -> Result<Vec<u8>, Report<CniError>> {
        let context = || CniError::Ipam {
            plugin: plugin.to_string(),
        };
        let binary = Self::find(plugin, args)?;
        info!("exec IPAM plugin {} {command}", binary.display());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .change_context_lazy(context)?;
        let output = runtime
            .block_on(async {
                timeout(self.timeout, Self::run(&binary, command, args)).await
            })
            .change_context_lazy(context)
            .attach_printable_lazy(|| format!("no answer within {:?}", self.timeout))?
            .change_context_lazy(context)?;
        debug!(
            "IPAM plugin {plugin} stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );

        if !output.status.success() {
            let report = Report::new(context());
            return Err(match serde_json::from_slice::<ErrorResult>(&output.stdout) {
                Ok(error) => report.attach_printable(format!(
                    "code {}: {} {}",
                    error.code, error.msg, error.details
                )),
                Err(_) => report.attach_printable(format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )),
            });
        }
        Ok(output.stdout)
    }

    /// Feeds stdin while collecting output, so neither side can stall the other.
    /// The child is killed if this future is dropped.
    async fn run(binary: &Path, command: &str, args: &CmdArgs) -> io::Result<Output> {
        let mut cmd = TokioCommand::new(binary);
        cmd.kill_on_drop(true)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &args.container_id)
            .env("CNI_NETNS", &args.netns)
            .env("CNI_IFNAME", &args.if_name)
            .env("CNI_ARGS", &args.args)
            .env("CNI_PATH", &args.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let stdin = child.stdin.take();
        let feed = async move {
            match stdin {
                // dropped once written, closing the pipe
                Some(mut stdin) => stdin.write_all(&args.stdin).await,
                None => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        match fed {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                warn!("{} exited before reading its config", binary.display());
            }
            Err(e) => return Err(e),
        }
        Ok(output)
    }
}

impl Ipam for ExecIpam {
    fn add(&self, plugin: &str, args: &CmdArgs) -> Result<CniResult, Report<CniError>> {
        let stdout = self.exec("ADD", plugin, args)?;
        CniResult::parse(&stdout)
    }

    fn del(&self, plugin: &str, args: &CmdArgs) -> Result<(), Report<CniError>> {
        self.exec("DEL", plugin, args).map(|_| ())
    }
}
