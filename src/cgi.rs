use crate::config::CgiConfig;
use crate::error::{ConfigError, HandlerError};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// A ready-to-run command line
#[derive(Debug, Clone)]
pub struct CgiCommand {
    program: String,
    args: Vec<String>,
    working_dir: Option<String>,
    env: HashMap<String, String>,
}

impl CgiCommand {
    pub fn from_config(config: &CgiConfig) -> Result<Self, ConfigError> {
        let mut argv = config.argv().map_err(|e| ConfigError(vec![e]))?;
        let program = argv.remove(0);
        Ok(Self {
            program,
            args: argv,
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
        })
    }

    /// Run to completion and return everything written to stdout.
    ///
    /// Nothing is piped in. Stderr goes wherever the worker's stderr goes.
    /// The exit status is only logged: a failing command still yields its
    /// (possibly empty) output.
    pub async fn run(&self) -> Result<Vec<u8>, HandlerError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let output = cmd.output().await.map_err(HandlerError::Command)?;
        debug!(
            program = %self.program,
            status = ?output.status,
            bytes = output.stdout.len(),
            "Command finished"
        );

        Ok(output.stdout)
    }
}
