use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use super::ServerConfig;
use crate::error::Error;

pub(crate) struct ServerProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Starts a tool server process with piped stdio. Its stderr is drained
/// into the log so a chatty server can never block on a full pipe.
pub(crate) fn spawn(config: &ServerConfig) -> Result<ServerProcess, Error> {
    debug!(
        "starting tool server `{}`: {} {:?}",
        config.name, config.command, config.args
    );
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|err| {
        Error::registration()
            .with_reason(format!("cannot start `{}`: {err}", config.command))
    })?;
    let missing =
        |pipe: &str| Error::registration().with_reason(format!("no {pipe} pipe"));
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
    drain_stderr(config.name.clone(), stderr);

    Ok(ServerProcess {
        child,
        stdin,
        stdout,
    })
}

fn drain_stderr(name: String, stderr: ChildStderr) {
    tokio::spawn(drain_lines(name, stderr));
}

/// Logs every line until the end of the stream. Bytes that aren't UTF-8
/// are replaced, never fatal.
async fn drain_lines<R: AsyncRead + Unpin>(name: String, reader: R) -> usize {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                count += 1;
                let line = String::from_utf8_lossy(&buf);
                debug!("[{name}] {}", line.trim_end());
            }
            Err(err) => {
                debug!("[{name}] stopped reading stderr: {err}");
                break;
            }
        }
    }
    count
}
