//! Prompt parsing for the headless client.
//!
//! Lines starting with `.` are local commands, anything else is sent to the
//! server as a remote console command.
//!
//! # Example
//! ```rust
//! use voxlink::cli::Command;
//!
//! let cmd = Command::try_from("status").unwrap();
//! assert_eq!(cmd, Command::Rcon("status".to_string()));
//! ```
use std::io::{self, BufRead, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("no command provided")]
    Empty,

    #[error("end of input")]
    EndOfInput,

    #[error("prompt i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `.exit`: leave the session and quit.
    Exit,
    /// `.status`: print connection and local scene state.
    Status,
    /// `.scripts`: ask the server for its script list.
    Scripts,
    /// `.script <name> <source>`: upload a script.
    CreateScript { name: String, source: String },
    /// Any other line: run on the server's console.
    Rcon(String),
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        match line.trim() {
            "" => Err(CommandError::Empty),
            ".exit" => Ok(Command::Exit),
            ".status" => Ok(Command::Status),
            ".scripts" => Ok(Command::Scripts),
            s if s.starts_with(".script ") || s == ".script" => {
                let args = s.trim_start_matches(".script").trim_start();
                match args.split_once(char::is_whitespace) {
                    Some((name, source)) if !source.trim().is_empty() => Ok(Command::CreateScript {
                        name: name.to_string(),
                        source: source.trim().to_string(),
                    }),
                    _ => Err(CommandError::InvalidCommandArguments {
                        command: ".script".to_string(),
                        reason: "expected a name followed by the script source".to_string(),
                    }),
                }
            }
            s if s.starts_with('.') => Err(CommandError::UnrecognizedCommand(s.to_string())),
            s => Ok(Command::Rcon(s.to_string())),
        }
    }
}

/// Writes the prompt and parses the next line from `reader`.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CommandError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Err(CommandError::EndOfInput);
    }
    Command::try_from(s.as_str())
}
