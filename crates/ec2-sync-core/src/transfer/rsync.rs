//! rsync-over-ssh transport
//!
//! Remote state comes from `find -printf` run over ssh. Transfers are one
//! `rsync --files-from=-` invocation per mapping and direction, with the
//! path list streamed on stdin.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

use super::ssh::{self, shell_quote, stderr_summary, SshOptions, SSH_CONNECTION_FAILURE};
use super::{
    ProbeReport, RemoteDirInfo, TransferDirection, TransferError, TransferReport, Transport,
};
use crate::config::{Config, DirectoryMapping, SshConfig, TransferConfig};
use crate::endpoint::Endpoint;
use crate::models::FileState;

/// rsync exit codes that mean the remote side was not reachable
///
/// 10: socket I/O, 12: protocol stream, 30: data timeout, 35: connect timeout,
/// 255: ssh connection failure.
const CONNECTIVITY_CODES: &[i32] = &[10, 12, 30, 35, SSH_CONNECTION_FAILURE];

/// Partial transfer: some files failed (23) or vanished (24)
const PARTIAL_CODES: &[i32] = &[23, 24];

/// Remote roots known to exist, valid for one endpoint generation
#[derive(Debug, Default)]
struct PreparedRoots {
    generation: u64,
    roots: HashSet<String>,
}

/// Transport that shells out to `rsync` and `ssh`
#[derive(Debug)]
pub struct RsyncTransport {
    ssh: SshOptions,
    compress: bool,
    partial: bool,
    bandwidth_limit_kbps: u32,
    prepared: Mutex<PreparedRoots>,
}

impl RsyncTransport {
    pub fn new(ssh: &SshConfig, transfer: &TransferConfig) -> Self {
        Self {
            ssh: SshOptions::from(ssh),
            compress: transfer.compress,
            partial: transfer.partial,
            bandwidth_limit_kbps: transfer.bandwidth_limit_kbps,
            prepared: Mutex::new(PreparedRoots::default()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.ssh, &config.transfer)
    }

    /// rsync options shared by both directions
    fn rsync_args(&self) -> Vec<String> {
        let mut args = vec!["-a".to_string(), "--protect-args".to_string()];
        if self.compress {
            args.push("-z".to_string());
        }
        if self.partial {
            args.push("--partial".to_string());
        }
        if self.bandwidth_limit_kbps > 0 {
            args.push(format!("--bwlimit={}", self.bandwidth_limit_kbps));
        }
        args.push("--files-from=-".to_string());
        args.push("--from0".to_string());
        args.push("-e".to_string());
        args.push(self.ssh.rsync_shell());
        args
    }

    fn remote_spec(&self, endpoint: &Endpoint, remote_root: &str) -> String {
        format!(
            "{}:{}/",
            self.ssh.target(&endpoint.address),
            remote_root.trim_end_matches('/')
        )
    }

    /// Run a shell command on the endpoint and return stdout
    async fn remote_exec(
        &self,
        endpoint: &Endpoint,
        script: &str,
        input: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, TransferError> {
        let cmd = self.ssh.command(&endpoint.address, script);
        let output = ssh::run(cmd, "ssh", input).await?;
        match output.status.code() {
            Some(0) => Ok(output.stdout),
            Some(SSH_CONNECTION_FAILURE) => {
                Err(TransferError::Connection(stderr_summary(&output)))
            }
            code => Err(TransferError::Failed {
                code,
                message: stderr_summary(&output),
            }),
        }
    }

    /// Create the remote root once per endpoint generation
    async fn ensure_remote_root(
        &self,
        endpoint: &Endpoint,
        remote_root: &str,
    ) -> Result<(), TransferError> {
        {
            let mut prepared = self.prepared.lock().unwrap_or_else(|e| e.into_inner());
            if prepared.generation != endpoint.generation {
                prepared.generation = endpoint.generation;
                prepared.roots.clear();
            }
            if prepared.roots.contains(remote_root) {
                return Ok(());
            }
        }

        let script = format!("mkdir -p {}", shell_quote(remote_root));
        self.remote_exec(endpoint, &script, None).await?;

        let mut prepared = self.prepared.lock().unwrap_or_else(|e| e.into_inner());
        if prepared.generation == endpoint.generation {
            prepared.roots.insert(remote_root.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RsyncTransport {
    async fn remote_states(
        &self,
        endpoint: &Endpoint,
        mapping: &DirectoryMapping,
        paths: Option<&[String]>,
    ) -> Result<Vec<FileState>, TransferError> {
        let root = remote_root(&mapping.remote_path);
        let (script, input) = match paths {
            None => (full_listing_script(&root), None),
            Some([]) => return Ok(Vec::new()),
            Some(paths) => (targeted_listing_script(&root), Some(paths.join("\n").into_bytes())),
        };

        let stdout = self.remote_exec(endpoint, &script, input).await?;
        Ok(parse_listing(&String::from_utf8_lossy(&stdout)))
    }

    async fn transfer(
        &self,
        endpoint: &Endpoint,
        mapping: &DirectoryMapping,
        direction: TransferDirection,
        paths: &[String],
    ) -> Result<TransferReport, TransferError> {
        if paths.is_empty() {
            return Ok(TransferReport::default());
        }

        let root = remote_root(&mapping.remote_path);
        let local_root = mapping.local_path.display().to_string();
        let local = format!("{}/", local_root.trim_end_matches('/'));
        let remote = self.remote_spec(endpoint, &root);

        let (src, dst) = match direction {
            TransferDirection::ToRemote => {
                self.ensure_remote_root(endpoint, &root).await?;
                (local, remote)
            }
            TransferDirection::ToLocal => {
                tokio::fs::create_dir_all(&mapping.local_path)
                    .await
                    .map_err(|e| TransferError::Failed {
                        code: None,
                        message: format!(
                            "cannot create {}: {}",
                            mapping.local_path.display(),
                            e
                        ),
                    })?;
                (remote, local)
            }
        };

        tracing::debug!(
            mapping = %mapping.name,
            ?direction,
            files = paths.len(),
            "Running rsync"
        );

        let mut cmd = Command::new("rsync");
        cmd.args(self.rsync_args()).arg(&src).arg(&dst);
        let output = ssh::run(cmd, "rsync", Some(paths.join("\0").into_bytes())).await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let roots = [local_root.as_str(), root.as_str()];
        classify_exit(output.status.code(), &stderr, paths, &roots)
    }

    async fn probe(&self, endpoint: &Endpoint) -> Result<ProbeReport, TransferError> {
        match self
            .remote_exec(endpoint, "rsync --version | head -n 1", None)
            .await
        {
            Ok(stdout) => {
                let version = String::from_utf8_lossy(&stdout).trim().to_string();
                Ok(ProbeReport {
                    ssh_ok: true,
                    remote_rsync: (!version.is_empty()).then_some(version),
                })
            }
            Err(TransferError::Failed { .. }) => Ok(ProbeReport {
                ssh_ok: true,
                remote_rsync: None,
            }),
            Err(e) => Err(e),
        }
    }

    async fn remote_dir_info(
        &self,
        endpoint: &Endpoint,
        mapping: &DirectoryMapping,
    ) -> Result<RemoteDirInfo, TransferError> {
        let root = remote_root(&mapping.remote_path);
        let stdout = self.remote_exec(endpoint, &dir_info_script(&root), None).await?;
        parse_dir_info(&String::from_utf8_lossy(&stdout)).ok_or_else(|| TransferError::Failed {
            code: None,
            message: format!("unexpected directory summary for {}", root),
        })
    }
}

/// Normalize a remote root so that `~/x` and `x` both mean a path under home
fn remote_root(path: &str) -> String {
    let trimmed = path.trim();
    let relative = if trimmed == "~" {
        "."
    } else {
        trimmed.strip_prefix("~/").unwrap_or(trimmed)
    };
    let root = relative.trim_end_matches('/');
    if root.is_empty() {
        "/".to_string()
    } else {
        root.to_string()
    }
}

fn full_listing_script(root: &str) -> String {
    let root = shell_quote(root);
    format!(
        "[ -d {root} ] || exit 0; cd {root} && find . -type f -printf '%P\\t%s\\t%T@\\n'",
        root = root
    )
}

/// Stat the paths read from stdin; each is prefixed with `./` so names
/// starting with `-` are not taken for `find` options
fn targeted_listing_script(root: &str) -> String {
    let root = shell_quote(root);
    format!(
        "[ -d {root} ] || exit 0; cd {root} || exit 1; \
         while IFS= read -r p; do \
         [ -f \"./$p\" ] && find \"./$p\" -maxdepth 0 -printf '%p\\t%s\\t%T@\\n'; \
         done; exit 0",
        root = root
    )
}

fn dir_info_script(root: &str) -> String {
    let root = shell_quote(root);
    format!(
        "[ -d {root} ] || {{ echo missing; exit 0; }}; cd {root} && \
         find . -type f -printf '%s\\n' | awk '{{ n++; s += $1 }} END {{ printf \"%d %.0f\\n\", n, s }}'",
        root = root
    )
}

/// Parse `missing` or `<count> <bytes>`
fn parse_dir_info(stdout: &str) -> Option<RemoteDirInfo> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line == "missing" {
        return Some(RemoteDirInfo::default());
    }
    let mut parts = line.split_whitespace();
    let file_count = parts.next()?.parse().ok()?;
    let total_bytes = parts.next()?.parse().ok()?;
    Some(RemoteDirInfo {
        exists: true,
        file_count,
        total_bytes,
    })
}

/// Parse `path<TAB>size<TAB>mtime` lines
fn parse_listing(stdout: &str) -> Vec<FileState> {
    stdout
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(|line| {
            let mut parts = line.rsplitn(3, '\t');
            let mtime = parts.next()?.trim().parse::<f64>().ok()?;
            let size = parts.next()?.trim().parse::<u64>().ok()?;
            let path = parts.next()?;
            let path = path.strip_prefix("./").unwrap_or(path);
            if path.is_empty() {
                return None;
            }
            Some(FileState::present(path, size, mtime.floor() as i64))
        })
        .collect()
}

/// Turn an rsync exit status into a per-file report
///
/// `roots` are the local and remote mapping roots, used to recognise the
/// absolute paths rsync prints in its error lines.
fn classify_exit(
    code: Option<i32>,
    stderr: &str,
    paths: &[String],
    roots: &[&str],
) -> Result<TransferReport, TransferError> {
    let summary = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no error output")
        .to_string();

    match code {
        Some(0) => Ok(TransferReport::all_succeeded(paths)),
        Some(c) if CONNECTIVITY_CODES.contains(&c) => Err(TransferError::Connection(format!(
            "rsync exit {}: {}",
            c, summary
        ))),
        Some(c) if PARTIAL_CODES.contains(&c) => {
            Ok(partial_report(c, stderr, paths, roots, &summary))
        }
        code => Err(TransferError::Failed {
            code,
            message: summary,
        }),
    }
}

/// Attribute rsync error lines to the requested paths
fn partial_report(
    code: i32,
    stderr: &str,
    paths: &[String],
    roots: &[&str],
    summary: &str,
) -> TransferReport {
    let error_lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| l.contains('"'))
        .collect();

    let mut report = TransferReport::default();
    for path in paths {
        let hit = error_lines.iter().find(|line| {
            quoted_names(line).any(|name| names_path(name, path, roots))
        });
        match hit {
            Some(line) => report.failed.push((path.clone(), line.to_string())),
            None => report.succeeded.push(path.clone()),
        }
    }

    // Nothing attributable: a generic error fails the batch, vanished files don't
    if report.failed.is_empty() && code == 23 {
        return TransferReport {
            succeeded: Vec::new(),
            failed: paths
                .iter()
                .map(|p| (p.clone(), summary.to_string()))
                .collect(),
        };
    }
    report
}

/// Strings between double quotes in an rsync message
fn quoted_names(line: &str) -> impl Iterator<Item = &str> {
    line.split('"').skip(1).step_by(2)
}

/// Whether a quoted name is exactly `path`, either bare or under one of the roots
fn names_path(name: &str, path: &str, roots: &[&str]) -> bool {
    if name == path {
        return true;
    }
    roots.iter().any(|root| {
        let full = format!("{}/{}", root.trim_end_matches('/'), path);
        if name == full {
            return true;
        }
        // Home-relative remote roots show up as absolute paths under $HOME
        !root.starts_with('/') && name.ends_with(&format!("/{}", full))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn transport() -> RsyncTransport {
        let ssh = SshConfig {
            key_file: Some(PathBuf::from("/keys/dev.pem")),
            ..SshConfig::default()
        };
        let transfer = TransferConfig {
            bandwidth_limit_kbps: 500,
            ..TransferConfig::default()
        };
        RsyncTransport::new(&ssh, &transfer)
    }

    const ROOTS: &[&str] = &["/home/me/app", "project/app"];

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rsync_args() {
        let args = transport().rsync_args();
        assert_eq!(args[0], "-a");
        assert!(args.contains(&"-z".to_string()));
        assert!(args.contains(&"--partial".to_string()));
        assert!(args.contains(&"--bwlimit=500".to_string()));
        assert!(args.contains(&"--files-from=-".to_string()));
        let shell = args.last().unwrap();
        assert!(shell.starts_with("ssh -p 22 -i /keys/dev.pem"));
    }

    #[test]
    fn test_remote_spec() {
        let endpoint = Endpoint {
            instance_id: "i-1".into(),
            address: "3.3.3.3".into(),
            generation: 1,
        };
        assert_eq!(
            transport().remote_spec(&endpoint, "/srv/app/"),
            "ubuntu@3.3.3.3:/srv/app/"
        );
    }

    #[test]
    fn test_remote_root_normalization() {
        assert_eq!(remote_root("~/project/src/"), "project/src");
        assert_eq!(remote_root("~"), ".");
        assert_eq!(remote_root("/srv/app"), "/srv/app");
        assert_eq!(remote_root("/"), "/");
    }

    #[test]
    fn test_listing_scripts_quote_root() {
        let script = full_listing_script("my project");
        assert!(script.starts_with("[ -d 'my project' ] || exit 0; cd 'my project'"));
        assert!(script.contains("-printf '%P\\t%s\\t%T@\\n'"));

        let script = targeted_listing_script("/srv/app");
        assert!(script.contains("while IFS= read -r p"));
        assert!(script.ends_with("exit 0"));
    }

    #[test]
    fn test_targeted_listing_handles_dash_names() {
        let script = targeted_listing_script("/srv/app");
        assert!(script.contains("[ -f \"./$p\" ]"));
        assert!(script.contains("find \"./$p\" -maxdepth 0"));
        assert!(!script.contains("find \"$p\""));

        // find echoes the ./ prefix back, which the parser drops
        let states = parse_listing("./-draft.md\t42\t1700000000.0\n");
        assert_eq!(states, vec![FileState::present("-draft.md", 42, 1700000000)]);
    }

    #[test]
    fn test_dir_info_script_and_parse() {
        let script = dir_info_script("my project");
        assert!(script.starts_with("[ -d 'my project' ] || { echo missing; exit 0; }"));
        assert!(script.contains("find . -type f -printf '%s\\n'"));

        assert_eq!(parse_dir_info("missing\n"), Some(RemoteDirInfo::default()));
        assert_eq!(
            parse_dir_info("12 40960\n"),
            Some(RemoteDirInfo {
                exists: true,
                file_count: 12,
                total_bytes: 40960,
            })
        );
        assert_eq!(parse_dir_info("0 0\n").map(|i| i.exists), Some(true));
        assert_eq!(parse_dir_info(""), None);
        assert_eq!(parse_dir_info("bash: find: not found"), None);
    }

    #[test]
    fn test_parse_listing() {
        let out = "src/main.rs\t1204\t1700000000.5321\n\
                   ./notes/with space.md\t10\t1700000001.0000000000\n\
                   garbage line\n\
                   odd\tname.txt\t7\t1700000002.9\n";
        let states = parse_listing(out);
        assert_eq!(states.len(), 3);
        assert_eq!(states[0], FileState::present("src/main.rs", 1204, 1700000000));
        assert_eq!(states[1].path, "notes/with space.md");
        assert_eq!(states[2].path, "odd\tname.txt");
        assert_eq!(states[2].mtime, 1700000002);
    }

    #[test]
    fn test_classify_success() {
        let files = paths(&["a.txt", "b.txt"]);
        let report = classify_exit(Some(0), "", &files, ROOTS).unwrap();
        assert_eq!(report.succeeded, files);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn test_classify_connectivity() {
        let files = paths(&["a.txt"]);
        let err = classify_exit(
            Some(255),
            "ssh: connect to host 1.2.3.4 port 22: Connection refused",
            &files,
            ROOTS,
        )
        .unwrap_err();
        assert!(err.is_connectivity());
        assert!(err.to_string().contains("Connection refused"));

        let err = classify_exit(Some(30), "timeout in data send/receive", &files, ROOTS).unwrap_err();
        assert!(err.is_connectivity());
    }

    #[test]
    fn test_classify_partial_attributes_files() {
        let files = paths(&["ok.txt", "locked.txt"]);
        let stderr = "rsync: [sender] send_files failed to open \"/home/me/app/locked.txt\": Permission denied (13)\n\
                      rsync error: some files/attrs were not transferred (see previous errors) (code 23)";
        let report = classify_exit(Some(23), stderr, &files, ROOTS).unwrap();
        assert_eq!(report.succeeded, paths(&["ok.txt"]));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "locked.txt");
        assert!(report.failed[0].1.contains("Permission denied"));
    }

    #[test]
    fn test_classify_partial_matches_whole_path() {
        let files = paths(&["a.txt", "x/a.txt", "b.txt"]);
        let stderr = "rsync: [sender] send_files failed to open \"/home/me/app/x/a.txt\": Permission denied (13)\n\
                      rsync: [generator] failed to set times on \"/home/ubuntu/project/app/b.txt\": Operation not permitted (1)\n\
                      rsync error: some files/attrs were not transferred (see previous errors) (code 23)";
        let report = classify_exit(Some(23), stderr, &files, ROOTS).unwrap();
        assert_eq!(report.succeeded, paths(&["a.txt"]));
        let failed: Vec<&str> = report.failed.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(failed, vec!["x/a.txt", "b.txt"]);
    }

    #[test]
    fn test_classify_partial_without_attribution() {
        let files = paths(&["a.txt", "b.txt"]);
        let report = classify_exit(Some(23), "rsync error: something (code 23)", &files, ROOTS).unwrap();
        assert_eq!(report.failed.len(), 2);

        let report = classify_exit(Some(24), "rsync warning: some files vanished", &files, ROOTS).unwrap();
        assert_eq!(report.succeeded.len(), 2);
    }

    #[test]
    fn test_classify_other_failure() {
        let err = classify_exit(Some(11), "rsync error: error in file IO (code 11)", &[], ROOTS)
            .unwrap_err();
        assert!(matches!(err, TransferError::Failed { code: Some(11), .. }));
        assert!(!err.is_connectivity());

        let err = classify_exit(None, "", &[], ROOTS).unwrap_err();
        assert!(matches!(err, TransferError::Failed { code: None, .. }));
    }

    #[tokio::test]
    async fn test_empty_transfer_is_noop() {
        let endpoint = Endpoint {
            instance_id: "i-1".into(),
            address: "192.0.2.1".into(),
            generation: 1,
        };
        let mapping = DirectoryMapping::new("m", "/tmp/never-used", "/srv/m");
        let report = transport()
            .transfer(&endpoint, &mapping, TransferDirection::ToRemote, &[])
            .await
            .unwrap();
        assert_eq!(report, TransferReport::default());
    }
}
