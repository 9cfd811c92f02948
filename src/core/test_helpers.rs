//! Shared test utilities for core module tests
//!
//! Provides a recording [`CommandRunner`] and rule fixtures so tests never
//! touch the host's firewall or require elevation.
//! This module is only compiled in test mode.

use crate::core::backend::{CommandOutput, CommandRunner, FamilyCommands};
use crate::core::property::{Family, Property};
use crate::core::rule::{Action, PropertyValue, Rule};
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("FWCONVERGE_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("FWCONVERGE_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone)]
enum Canned {
    Output(CommandOutput),
    Missing,
}

/// Runner that records every invocation and answers from canned responses.
///
/// Unknown programs succeed with empty output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    programs: Mutex<HashMap<String, Canned>>,
    failing_args: Vec<(String, CommandOutput)>,
}

fn failure(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers the family's default save tool with `dump`
    #[must_use]
    pub fn with_dump(self, family: Family, dump: &str) -> Self {
        self.set_dump(family, dump);
        self
    }

    /// Replaces the family's dump (e.g. after a simulated mutation)
    pub fn set_dump(&self, family: Family, dump: &str) {
        let save = FamilyCommands::default_for(family).save;
        self.programs.lock().unwrap().insert(
            save,
            Canned::Output(CommandOutput {
                exit_code: Some(0),
                stdout: dump.to_string(),
                stderr: String::new(),
            }),
        );
    }

    /// Makes any invocation whose arguments contain `arg` fail
    #[must_use]
    pub fn fail_on(mut self, arg: &str, code: i32, stderr: &str) -> Self {
        self.failing_args
            .push((arg.to_string(), failure(code, stderr)));
        self
    }

    #[must_use]
    pub fn fail_program(self, program: &str, code: i32, stderr: &str) -> Self {
        self.programs
            .lock()
            .unwrap()
            .insert(program.to_string(), Canned::Output(failure(code, stderr)));
        self
    }

    /// Makes `program` fail to start, as if it were not installed
    #[must_use]
    pub fn missing(self, program: &str) -> Self {
        self.programs
            .lock()
            .unwrap()
            .insert(program.to_string(), Canned::Missing);
        self
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|(p, _)| p).collect()
    }

    /// Calls other than the save tools
    pub fn mutations(&self) -> Vec<(String, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter(|(p, _)| !p.ends_with("-save"))
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));

        if let Some((_, output)) = self
            .failing_args
            .iter()
            .find(|(arg, _)| args.iter().any(|a| a == arg))
        {
            return Ok(output.clone());
        }

        match self.programs.lock().unwrap().get(program) {
            Some(Canned::Output(output)) => Ok(output.clone()),
            Some(Canned::Missing) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{program}: No such file or directory"),
            )),
            None => Ok(CommandOutput {
                exit_code: Some(0),
                ..CommandOutput::default()
            }),
        }
    }
}

/// The canonical SSH rule used throughout the tests
pub fn ssh_rule() -> Rule {
    Rule::new("100 allow ssh", Family::Ipv4, "filter", "INPUT")
        .with(Property::Proto, PropertyValue::Text("tcp".to_string()))
        .with(Property::Dport, PropertyValue::List(vec!["22".to_string()]))
        .with_action(Action::Accept)
}

/// A minimal dump with the given `-A` lines in the filter table
pub fn filter_dump(lines: &[&str]) -> String {
    let mut dump = String::from(
        "# Generated by iptables-save v1.8.9\n*filter\n:INPUT ACCEPT [0:0]\n:FORWARD ACCEPT [0:0]\n:OUTPUT ACCEPT [0:0]\n",
    );
    for line in lines {
        dump.push_str(line);
        dump.push('\n');
    }
    dump.push_str("COMMIT\n");
    dump
}
