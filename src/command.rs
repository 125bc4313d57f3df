use crate::resp::encode_command;
use std::fmt::Display;

/// An outbound command: the verb followed by its arguments, already
/// coerced to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<String>,
}

impl Command {
    pub fn new(verb: impl Display) -> Self {
        Command {
            args: vec![verb.to_string()],
        }
    }

    pub fn from_tokens<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        Command {
            args: tokens.into_iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn arg(mut self, arg: impl Display) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    /// The verb, as given. Empty for a command built from no tokens.
    pub fn verb(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }

    /// Case-insensitive verb check.
    pub fn is(&self, verb: &str) -> bool {
        self.verb().eq_ignore_ascii_case(verb)
    }

    pub fn tokens(&self) -> &[String] {
        &self.args
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_command(&self.args)
    }
}

impl From<&[&str]> for Command {
    fn from(tokens: &[&str]) -> Self {
        Command::from_tokens(tokens)
    }
}

impl<const N: usize> From<[&str; N]> for Command {
    fn from(tokens: [&str; N]) -> Self {
        Command::from_tokens(tokens)
    }
}

impl From<Vec<String>> for Command {
    fn from(args: Vec<String>) -> Self {
        Command { args }
    }
}
