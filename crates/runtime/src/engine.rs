//! Engine process management.
//!
//! Spawns the external engine and wires its stdio pipes into transport
//! parts. How the engine binary is located and what arguments it takes is
//! the caller's business; this module only owns the process lifecycle.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::{Error, Result};
use crate::transport::{PipeTransport, TransportParts};

/// A spawned engine whose stdio carries the message channel.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    /// Spawns `command` with piped stdio and returns the process handle plus
    /// the transport parts speaking to it. Stderr is inherited so engine
    /// diagnostics reach the terminal.
    pub async fn spawn(mut command: Command) -> Result<(Self, TransportParts)> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .map_err(|err| Error::LaunchFailed(format!("failed to spawn engine: {err}")))?;

        // A bad invocation usually dies within the first few milliseconds;
        // catch that here instead of as an opaque EOF later.
        tokio::time::sleep(Duration::from_millis(100)).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(Error::LaunchFailed(format!(
                    "engine exited immediately with {status}"
                )));
            }
            Ok(None) => {}
            Err(err) => {
                return Err(Error::LaunchFailed(format!(
                    "failed to poll engine status: {err}"
                )));
            }
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::LaunchFailed("engine stdin is not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::LaunchFailed("engine stdout is not piped".to_string()))?;

        Ok((Self { child }, PipeTransport::new(stdin, stdout)))
    }

    /// OS process id, while the engine is running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kills the engine and reaps it.
    pub async fn shutdown(mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}
