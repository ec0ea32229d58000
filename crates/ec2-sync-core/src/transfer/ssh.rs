//! ssh command construction
//!
//! Builds the option set shared by direct ssh calls and rsync's `-e` shell,
//! and runs subprocesses with optional stdin input.

use std::path::PathBuf;
use std::process::{Output, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::TransferError;
use crate::config::SshConfig;

/// ssh exit status for connection-level failures
pub const SSH_CONNECTION_FAILURE: i32 = 255;

/// Connection options for one remote user
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub user: String,
    pub key_file: Option<PathBuf>,
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub strict_host_checking: bool,
}

impl From<&SshConfig> for SshOptions {
    fn from(config: &SshConfig) -> Self {
        Self {
            user: config.user.clone(),
            key_file: config.key_file.clone(),
            port: config.port,
            connect_timeout_secs: config.connect_timeout_secs,
            strict_host_checking: config.strict_host_checking,
        }
    }
}

impl SshOptions {
    /// `user@address`
    pub fn target(&self, address: &str) -> String {
        format!("{}@{}", self.user, address)
    }

    /// Options passed to every ssh invocation
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.port.to_string()];
        if let Some(key) = &self.key_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }

        let mut opts = vec![
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "BatchMode=yes".to_string(),
            "PasswordAuthentication=no".to_string(),
            "ServerAliveInterval=15".to_string(),
        ];
        if self.strict_host_checking {
            opts.push("StrictHostKeyChecking=yes".to_string());
        } else {
            opts.push("StrictHostKeyChecking=no".to_string());
            opts.push("UserKnownHostsFile=/dev/null".to_string());
            opts.push("LogLevel=ERROR".to_string());
        }
        for opt in opts {
            args.push("-o".to_string());
            args.push(opt);
        }
        args
    }

    /// Remote shell string for rsync's `-e`
    pub fn rsync_shell(&self) -> String {
        std::iter::once("ssh".to_string())
            .chain(self.args().iter().map(|a| shell_quote(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// ssh command running `remote_command` on `address`
    pub fn command(&self, address: &str, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.args())
            .arg(self.target(address))
            .arg(remote_command);
        cmd
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Run a command to completion, feeding `input` on stdin
///
/// The child is killed if the returned future is dropped.
pub async fn run(
    mut cmd: Command,
    program: &str,
    input: Option<Vec<u8>>,
) -> Result<Output, TransferError> {
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| TransferError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let stdin = child.stdin.take();
    let feed = async move {
        if let (Some(mut stdin), Some(input)) = (stdin, input) {
            // The child may exit before reading everything; its status tells us
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!("{} closed stdin early: {}", program, e);
            }
        }
    };

    let (_, output) = tokio::join!(feed, child.wait_with_output());
    output.map_err(|source| TransferError::Spawn {
        program: program.to_string(),
        source,
    })
}

/// Last non-empty stderr line, for compact error messages
pub fn stderr_summary(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no error output")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SshOptions {
        SshOptions {
            user: "ubuntu".to_string(),
            key_file: Some(PathBuf::from("/home/me/.ssh/dev key.pem")),
            port: 2222,
            connect_timeout_secs: 10,
            strict_host_checking: false,
        }
    }

    #[test]
    fn test_args_include_batch_mode_and_key() {
        let args = options().args();
        assert_eq!(&args[..2], &["-p", "2222"]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/dev/null".to_string()));
        assert!(args.contains(&"/home/me/.ssh/dev key.pem".to_string()));
    }

    #[test]
    fn test_strict_host_checking() {
        let mut opts = options();
        opts.strict_host_checking = true;
        let args = opts.args();
        assert!(args.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(!args.contains(&"UserKnownHostsFile=/dev/null".to_string()));
    }

    #[test]
    fn test_rsync_shell_quotes_key_path() {
        let shell = options().rsync_shell();
        assert!(shell.starts_with("ssh -p 2222"));
        assert!(shell.contains("'/home/me/.ssh/dev key.pem'"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/srv/app"), "/srv/app");
        assert_eq!(shell_quote("my dir"), "'my dir'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_target() {
        assert_eq!(options().target("1.2.3.4"), "ubuntu@1.2.3.4");
    }

    #[tokio::test]
    async fn test_run_feeds_stdin() {
        let cmd = Command::new("cat");
        let output = run(cmd, "cat", Some(b"hello\n".to_vec())).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, b"hello\n");
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let cmd = Command::new("definitely-not-a-real-binary-ec2sync");
        let err = run(cmd, "definitely-not-a-real-binary-ec2sync", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Spawn { .. }));
    }
}
