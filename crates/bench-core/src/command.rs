use crate::error::CommandError;
use std::str::FromStr;

pub const HELP: &str = "\
commands:
  help          this text
  quit          stop the run
  stat          print a rate snapshot
  rate=<n>      change the global send rate (msgs/sec)
  rc=<n>        consumer messages per commit
  sc=<n>        producer messages per commit
  l             latency of every category, per thread
  al            aggregate latency only
  n             destination names with producer/consumer counts
  qt=<name>|*   remaining messages of incomplete destinations
  sess=<id>     acks and last acked sequence of a consumer session";

/// Console command understood by a running supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Quit,
    Stat,
    Rate(u64),
    ConsumerCommit(u32),
    ProducerCommit(u32),
    Latency,
    AggregateLatency,
    Names,
    /// `None` lists every incomplete destination
    Remaining(Option<String>),
    Session(String),
}

fn number<T: FromStr>(command: &str, value: &str) -> Result<T, CommandError> {
    value.trim().parse().map_err(|_| CommandError::InvalidNumber {
        command: command.to_string(),
        value: value.to_string(),
    })
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let (head, value) = match line.split_once('=') {
            Some((head, value)) => (head.trim(), Some(value.trim())),
            None => (line, None),
        };
        let value_of = |command: &str| match value {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(CommandError::MissingValue(command.to_string())),
        };
        match head.to_ascii_lowercase().as_str() {
            "help" | "h" | "?" => Ok(Command::Help),
            "quit" | "q" | "exit" => Ok(Command::Quit),
            "stat" | "s" => Ok(Command::Stat),
            "l" => Ok(Command::Latency),
            "al" => Ok(Command::AggregateLatency),
            "n" => Ok(Command::Names),
            "rate" => Ok(Command::Rate(number("rate", value_of("rate")?)?)),
            "rc" => Ok(Command::ConsumerCommit(number("rc", value_of("rc")?)?)),
            "sc" => Ok(Command::ProducerCommit(number("sc", value_of("sc")?)?)),
            "qt" => match value_of("qt")? {
                "*" => Ok(Command::Remaining(None)),
                name => Ok(Command::Remaining(Some(name.to_string()))),
            },
            "sess" => Ok(Command::Session(value_of("sess")?.to_string())),
            _ => Err(CommandError::Unknown(line.to_string())),
        }
    }
}
