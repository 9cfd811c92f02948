//! Per-family command execution
//!
//! Every interaction with the live rule store goes through a [`CommandRunner`]:
//! dumping (`iptables-save`), mutating (`iptables -t ... -I ...`) and
//! persisting. Production code uses [`SystemRunner`], which elevates through
//! [`crate::elevation`]; tests substitute a runner that records invocations and
//! returns canned dumps.
//!
//! A [`FamilyBackend`] binds one protocol family to its binaries and its
//! persistence method. The three families share all logic; they differ only in
//! these parameters and in the chain declaration format.

use crate::core::error::{Error, Result};
use crate::core::property::Family;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Captured result of one external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes external programs with an argument vector
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Runs `program` to completion and captures its output.
    ///
    /// # Errors
    ///
    /// Returns `Err` only if the program could not be started; a nonzero exit
    /// is reported through [`CommandOutput::exit_code`].
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// Runs approved programs on the host, elevating as needed
#[derive(Debug, Clone)]
pub struct SystemRunner {
    allowed: BTreeSet<String>,
}

impl SystemRunner {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        if !self.allowed.contains(program) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("'{program}' is not an approved firewall tool"),
            ));
        }

        let output = crate::elevation::create_elevated_command(program, args)?
            .output()
            .await?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Renders a command line for messages and logs
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut out = program.to_string();
    for arg in args {
        out.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            out.push('"');
            out.push_str(arg);
            out.push('"');
        } else {
            out.push_str(arg);
        }
    }
    out
}

/// Binary names for one family
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FamilyCommands {
    /// Mutating tool (`iptables`)
    pub binary: String,
    /// Dump tool (`iptables-save`)
    pub save: String,
}

impl FamilyCommands {
    pub fn default_for(family: Family) -> Self {
        let binary = match family {
            Family::Ipv4 => option_env!("FWCONVERGE_IPTABLES").unwrap_or("iptables"),
            Family::Ipv6 => option_env!("FWCONVERGE_IP6TABLES").unwrap_or("ip6tables"),
            Family::Ethernet => "ebtables",
        };
        Self {
            binary: binary.to_string(),
            save: format!("{binary}-save"),
        }
    }
}

/// How a family's live rules are made durable after a change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PersistMethod {
    /// Write the save tool's output to `path`
    SaveFile { path: PathBuf },
    /// Run a distribution command such as `netfilter-persistent save`
    Command { argv: Vec<String> },
    Disabled,
}

impl PersistMethod {
    pub fn default_for(family: Family) -> Self {
        match family {
            Family::Ipv4 => PersistMethod::SaveFile {
                path: PathBuf::from("/etc/iptables/rules.v4"),
            },
            Family::Ipv6 => PersistMethod::SaveFile {
                path: PathBuf::from("/etc/iptables/rules.v6"),
            },
            Family::Ethernet => PersistMethod::Disabled,
        }
    }
}

/// One protocol family's tools and persistence method
#[derive(Debug, Clone)]
pub struct FamilyBackend {
    pub family: Family,
    pub commands: FamilyCommands,
    pub persist: PersistMethod,
}

impl FamilyBackend {
    pub fn new(family: Family, commands: FamilyCommands, persist: PersistMethod) -> Self {
        Self {
            family,
            commands,
            persist,
        }
    }

    /// Runs the family's save tool and returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the tool cannot be started and
    /// [`Error::DumpFailed`] if it exits nonzero.
    pub async fn dump<R: CommandRunner>(&self, runner: &R) -> Result<String> {
        let program = &self.commands.save;
        debug!("Reading live {} state with {}", self.family, program);

        let output = runner.run(program, &[]).await?;
        if !output.success() {
            return Err(Error::DumpFailed {
                family: self.family,
                command: program.clone(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Runs the family's mutating tool with `args` on behalf of `subject`
    /// (a rule or chain name, used in the error).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ApplyFailed`] if the tool cannot be started or exits
    /// nonzero.
    pub async fn mutate<R: CommandRunner>(
        &self,
        runner: &R,
        subject: &str,
        args: &[String],
    ) -> Result<CommandOutput> {
        let program = &self.commands.binary;
        let command = display_command(program, args);
        info!("Running {}", command);

        let output = match runner.run(program, args).await {
            Ok(output) => output,
            Err(e) => CommandOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
            },
        };

        if !output.success() {
            return Err(Error::ApplyFailed {
                rule: subject.to_string(),
                command,
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Flushes the live state to its durable store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PersistFailed`] on any failure; the live state has
    /// already changed at this point.
    pub async fn persist<R: CommandRunner>(&self, runner: &R) -> Result<()> {
        let failed = |message: String| Error::PersistFailed {
            family: self.family,
            message,
        };

        match &self.persist {
            PersistMethod::Disabled => {
                debug!("Persistence disabled for {}", self.family);
                Ok(())
            }
            PersistMethod::Command { argv } => {
                let Some((program, args)) = argv.split_first() else {
                    return Err(failed("persist command is empty".to_string()));
                };
                let output = runner
                    .run(program, args)
                    .await
                    .map_err(|e| failed(format!("{program}: {e}")))?;
                if !output.success() {
                    return Err(failed(format!(
                        "`{}` failed: {}",
                        display_command(program, args),
                        output.stderr.trim()
                    )));
                }
                info!("Persisted {} rules with {}", self.family, program);
                Ok(())
            }
            PersistMethod::SaveFile { path } => {
                let dump = self.dump(runner).await.map_err(|e| failed(e.to_string()))?;
                self.install_dump(runner, &dump, path).await.map_err(failed)?;
                info!("Persisted {} rules to {}", self.family, path.display());
                Ok(())
            }
        }
    }

    /// Writes `dump` to a private temp file, then installs it over `path`
    async fn install_dump<R: CommandRunner>(
        &self,
        runner: &R,
        dump: &str,
        path: &std::path::Path,
    ) -> std::result::Result<(), String> {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut temp =
            NamedTempFile::new().map_err(|e| format!("Failed to create temp file: {e}"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            temp.as_file()
                .set_permissions(perms)
                .map_err(|e| format!("Failed to set permissions: {e}"))?;
        }
        temp.write_all(dump.as_bytes())
            .map_err(|e| format!("Failed to write temp file: {e}"))?;
        temp.flush()
            .map_err(|e| format!("Failed to flush temp file: {e}"))?;

        let temp_path = temp
            .path()
            .to_str()
            .ok_or_else(|| "Invalid temp path".to_string())?
            .to_string();
        let target = path
            .to_str()
            .ok_or_else(|| format!("Invalid target path {}", path.display()))?
            .to_string();

        let args = vec![
            "-D".to_string(),
            "-m".to_string(),
            "0600".to_string(),
            temp_path,
            target,
        ];
        let output = runner
            .run("install", &args)
            .await
            .map_err(|e| format!("Failed to execute install: {e}"))?;
        if !output.success() {
            warn!("install exited with {:?}", output.exit_code);
            return Err(format!(
                "Failed to copy rules to {}: {}",
                path.display(),
                output.stderr.trim()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::RecordingRunner;

    fn backend(persist: PersistMethod) -> FamilyBackend {
        FamilyBackend::new(Family::Ipv4, FamilyCommands::default_for(Family::Ipv4), persist)
    }

    #[test]
    fn test_default_commands() {
        let v6 = FamilyCommands::default_for(Family::Ipv6);
        assert!(v6.save.ends_with("-save"));
        assert_eq!(FamilyCommands::default_for(Family::Ethernet).save, "ebtables-save");
        assert_eq!(PersistMethod::default_for(Family::Ethernet), PersistMethod::Disabled);
    }

    #[test]
    fn test_display_command_quotes() {
        let args = vec!["--comment".to_string(), "100 allow ssh".to_string()];
        assert_eq!(
            display_command("iptables", &args),
            "iptables --comment \"100 allow ssh\""
        );
    }

    #[test]
    fn test_persist_method_serde() {
        let json = r#"{"method":"command","argv":["netfilter-persistent","save"]}"#;
        let method: PersistMethod = serde_json::from_str(json).unwrap();
        assert_eq!(
            method,
            PersistMethod::Command {
                argv: vec!["netfilter-persistent".into(), "save".into()]
            }
        );
        let json = serde_json::to_string(&PersistMethod::Disabled).unwrap();
        assert_eq!(json, r#"{"method":"disabled"}"#);
    }

    #[tokio::test]
    async fn test_mutate_failure_is_apply_failed() {
        let runner = RecordingRunner::new().fail_on("-I", 1, "iptables: Bad argument");
        let args = vec!["-t".to_string(), "filter".to_string(), "-I".to_string()];
        let err = backend(PersistMethod::Disabled)
            .mutate(&runner, "100 allow ssh", &args)
            .await
            .unwrap_err();
        match err {
            Error::ApplyFailed {
                rule,
                exit_code,
                stderr,
                ..
            } => {
                assert_eq!(rule, "100 allow ssh");
                assert_eq!(exit_code, Some(1));
                assert!(stderr.contains("Bad argument"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_dump_failure() {
        let save = FamilyCommands::default_for(Family::Ipv4).save;
        let runner = RecordingRunner::new().missing(&save);
        let err = backend(PersistMethod::Disabled)
            .dump(&runner)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_persist_command() {
        let runner = RecordingRunner::new();
        backend(PersistMethod::Command {
            argv: vec!["netfilter-persistent".into(), "save".into()],
        })
        .persist(&runner)
        .await
        .unwrap();
        assert_eq!(runner.programs(), ["netfilter-persistent"]);
    }

    #[tokio::test]
    async fn test_persist_failure_is_distinct() {
        let runner = RecordingRunner::new().fail_program("netfilter-persistent", 1, "read-only fs");
        let err = backend(PersistMethod::Command {
            argv: vec!["netfilter-persistent".into(), "save".into()],
        })
        .persist(&runner)
        .await
        .unwrap_err();
        assert!(err.is_partial_failure());
        assert!(err.to_string().contains("read-only fs"));
    }

    #[tokio::test]
    async fn test_persist_save_file_installs_dump() {
        let runner = RecordingRunner::new().with_dump(Family::Ipv4, "*filter\nCOMMIT\n");
        backend(PersistMethod::SaveFile {
            path: PathBuf::from("/etc/iptables/rules.v4"),
        })
        .persist(&runner)
        .await
        .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "install");
        assert_eq!(calls[1].1[..3], ["-D", "-m", "0600"]);
        assert_eq!(calls[1].1[4], "/etc/iptables/rules.v4");
    }

    #[tokio::test]
    async fn test_system_runner_rejects_unapproved() {
        let runner = SystemRunner::new(["iptables"]);
        let err = runner.run("rm", &["-rf".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }
}
