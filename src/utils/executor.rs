//! Command execution abstraction for testability
//!
//! Capturers that shell out to dump and load tools take an executor, so tests
//! can substitute a mock that records calls and fakes the tool's effects.

use super::cancel::CancelToken;
use super::command::{CommandError, CommandOutput, CommandSpec};

/// Abstraction for command execution, enabling mocking in tests
pub trait CommandExecutor: Send + Sync {
    /// Run a command to completion, honouring its timeout and `cancel`
    fn run(&self, spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandOutput, CommandError>;

    /// Whether `program` can be found
    fn is_available(&self, program: &str) -> bool;
}

/// Default implementation using real subprocess calls
#[derive(Debug, Clone, Default)]
pub struct RealExecutor;

impl RealExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealExecutor {
    fn run(&self, spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandOutput, CommandError> {
        super::command::run_command(spec, cancel)
    }

    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// A mock executor for testing that records calls and returns configured responses
/// Available for use in external test crates
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Side effect run for a matching call, e.g. writing the dump file
    pub type Effect = Arc<dyn Fn(&CommandSpec) -> std::io::Result<()> + Send + Sync>;

    /// Response configuration for mock
    #[derive(Clone, Debug)]
    pub enum MockResponse {
        Success { stdout: String },
        Failure { stderr: String, exit_code: i32 },
        Timeout,
    }

    impl Default for MockResponse {
        fn default() -> Self {
            MockResponse::Success {
                stdout: String::new(),
            }
        }
    }

    /// Mock executor for testing
    #[derive(Clone, Default)]
    pub struct MockExecutor {
        calls: Arc<Mutex<Vec<CommandSpec>>>,
        responses: Arc<Mutex<HashMap<String, MockResponse>>>,
        effects: Arc<Mutex<HashMap<String, Effect>>>,
        missing: Arc<Mutex<Vec<String>>>,
    }

    impl MockExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Configure a response for a specific program
        pub fn expect(self, program: &str, response: MockResponse) -> Self {
            self.responses
                .lock()
                .unwrap()
                .insert(program.to_string(), response);
            self
        }

        /// Run `effect` whenever `program` is called successfully
        pub fn with_effect<F>(self, program: &str, effect: F) -> Self
        where
            F: Fn(&CommandSpec) -> std::io::Result<()> + Send + Sync + 'static,
        {
            self.effects
                .lock()
                .unwrap()
                .insert(program.to_string(), Arc::new(effect));
            self
        }

        /// Pretend `program` is not installed
        pub fn without_program(self, program: &str) -> Self {
            self.missing.lock().unwrap().push(program.to_string());
            self
        }

        /// Get all recorded calls
        pub fn get_calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        /// Check if a program was called
        pub fn was_called(&self, program: &str) -> bool {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.program == program)
        }

        /// Get number of calls to a specific program
        pub fn call_count(&self, program: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.program == program)
                .count()
        }
    }

    impl CommandExecutor for MockExecutor {
        fn run(&self, spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandOutput, CommandError> {
            self.calls.lock().unwrap().push(spec.clone());
            cancel.check()?;

            let response = self
                .responses
                .lock()
                .unwrap()
                .get(&spec.program)
                .cloned()
                .unwrap_or_default();

            match response {
                MockResponse::Success { stdout } => {
                    let effect = self.effects.lock().unwrap().get(&spec.program).cloned();
                    if let Some(effect) = effect {
                        effect(spec).map_err(|source| CommandError::Spawn {
                            program: spec.program.clone(),
                            source,
                        })?;
                    }
                    Ok(CommandOutput {
                        stdout: stdout.into_bytes(),
                        stderr: Vec::new(),
                    })
                }
                MockResponse::Failure { stderr, exit_code } => Err(CommandError::Failed {
                    program: spec.program.clone(),
                    code: Some(exit_code),
                    stderr,
                }),
                MockResponse::Timeout => Err(CommandError::TimedOut {
                    program: spec.program.clone(),
                    after: spec.timeout.unwrap_or(Duration::ZERO),
                }),
            }
        }

        fn is_available(&self, program: &str) -> bool {
            !self.missing.lock().unwrap().iter().any(|p| p == program)
        }
    }
}
