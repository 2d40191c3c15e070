use std::time::Duration;

use crate::PsValue;

/// Represents a single parameter for a command
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    Named { name: String, value: PsValue },
    Positional { value: PsValue },
    Switch { name: String, value: bool },
}

/// Represents a single PowerShell command in business logic terms
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineCommand {
    pub command_text: String,
    /// A literal shell line rather than a structured call.
    pub is_script: bool,
    pub parameters: Vec<Parameter>,
}

impl PipelineCommand {
    pub fn new_script(script: impl Into<String>) -> Self {
        Self {
            command_text: script.into(),
            is_script: true,
            parameters: Vec::new(),
        }
    }

    pub fn new_command(command: impl Into<String>) -> Self {
        Self {
            command_text: command.into(),
            is_script: false,
            parameters: Vec::new(),
        }
    }

    pub fn add_parameter(&mut self, params: Parameter) {
        self.parameters.push(params);
    }

    pub fn with_parameter(mut self, params: Parameter) -> Self {
        self.parameters.push(params);
        self
    }

    pub fn with_named(self, name: impl Into<String>, value: impl Into<PsValue>) -> Self {
        self.with_parameter(Parameter::Named {
            name: name.into(),
            value: value.into(),
        })
    }

    pub fn with_switch(self, name: impl Into<String>) -> Self {
        self.with_parameter(Parameter::Switch {
            name: name.into(),
            value: true,
        })
    }

    pub fn with_positional(self, value: impl Into<PsValue>) -> Self {
        self.with_parameter(Parameter::Positional {
            value: value.into(),
        })
    }
}

impl From<&str> for PipelineCommand {
    fn from(command: &str) -> Self {
        PipelineCommand::new_command(command)
    }
}

impl From<String> for PipelineCommand {
    fn from(command: String) -> Self {
        PipelineCommand::new_command(command)
    }
}

/// An ordered chain of commands submitted together. The output of stage `i`
/// feeds stage `i + 1`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSpec {
    pub commands: Vec<PipelineCommand>,
    pub timeout: Option<Duration>,
}

impl PipelineSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command(&mut self, command: PipelineCommand) {
        self.commands.push(command);
    }

    pub fn with_command(mut self, command: impl Into<PipelineCommand>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

impl From<PipelineCommand> for PipelineSpec {
    fn from(command: PipelineCommand) -> Self {
        PipelineSpec {
            commands: vec![command],
            timeout: None,
        }
    }
}

impl FromIterator<PipelineCommand> for PipelineSpec {
    fn from_iter<I: IntoIterator<Item = PipelineCommand>>(iter: I) -> Self {
        PipelineSpec {
            commands: iter.into_iter().collect(),
            timeout: None,
        }
    }
}
