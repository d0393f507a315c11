pub mod console;

use std::fmt;
use std::str::FromStr;

/// Operator command, one per console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Call(String),
    Accept,
    Reject,
    End,
    Status,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCommandError(pub String);

impl fmt::Display for ParseCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseCommandError {}

pub const HELP: &str = "commands: call <identity> | accept | reject | end | status | quit";

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let Some(word) = parts.next() else {
            return Err(ParseCommandError("empty command".into()));
        };
        let cmd = match word.to_ascii_lowercase().as_str() {
            "call" | "dial" => match parts.next() {
                Some(target) => Command::Call(target.to_owned()),
                None => return Err(ParseCommandError("call needs a target identity".into())),
            },
            "accept" | "answer" => Command::Accept,
            "reject" | "decline" => Command::Reject,
            "end" | "hangup" => Command::End,
            "status" => Command::Status,
            "quit" | "exit" => Command::Quit,
            other => return Err(ParseCommandError(format!("unknown command `{other}`"))),
        };
        if let Some(extra) = parts.next() {
            return Err(ParseCommandError(format!("unexpected argument `{extra}`")));
        }
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!("call user-2".parse(), Ok(Command::Call("user-2".into())));
        assert_eq!("  ACCEPT ".parse(), Ok(Command::Accept));
        assert_eq!("hangup".parse(), Ok(Command::End));
        assert_eq!("status".parse(), Ok(Command::Status));
        assert_eq!("exit".parse(), Ok(Command::Quit));
    }

    #[test]
    fn rejects_bad_input() {
        assert!("".parse::<Command>().is_err());
        assert!("call".parse::<Command>().is_err());
        assert!("end now".parse::<Command>().is_err());
        assert!("teleport".parse::<Command>().is_err());
    }
}
