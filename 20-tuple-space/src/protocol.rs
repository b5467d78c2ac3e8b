//! Command parsing for the interactive client shell.
//!
//! Turns lines like `put <a,1> 0 2 0` into [`ConsoleCommand`] values. The
//! optional trailing numbers are per-replica delays in seconds, forwarded to
//! the frontend as a fault-injection hook.

use anyhow::{Context, Result, anyhow, bail};

use crate::tuple::validate_tuple;

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Put { tuple: String, delays: Vec<u64> },
    Read { pattern: String, delays: Vec<u64> },
    Take { pattern: String, delays: Vec<u64> },
    State,
    Sleep { secs: u64 },
    Help,
    Exit,
}

pub const USAGE: &str = "Usage:
- put <element[,more_elements]> [<delayReplica1(seconds)> ... <delayReplicaN(seconds)>]
- read <pattern> [<delayReplica1(seconds)> ... <delayReplicaN(seconds)>]
- take <pattern> [<delayReplica1(seconds)> ... <delayReplicaN(seconds)>]
- getTupleSpacesState (alias: dump)
- sleep <delay (seconds)>
- help
- exit";

impl ConsoleCommand {
    /// Parses one line of shell input. Command names are case-insensitive.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((command, args)) = parts.split_first() else {
            bail!("empty command");
        };

        match command.to_lowercase().as_str() {
            "exit" => Ok(ConsoleCommand::Exit),
            "help" => Ok(ConsoleCommand::Help),
            "gettuplespacesstate" | "dump" => Ok(ConsoleCommand::State),
            "sleep" => match args {
                [secs] => Ok(ConsoleCommand::Sleep {
                    secs: secs
                        .parse()
                        .with_context(|| format!("sleep expects whole seconds, got {secs:?}"))?,
                }),
                _ => bail!("sleep requires exactly one argument: sleep <seconds>"),
            },
            "put" => {
                let (tuple, delays) = split_target("put", args)?;
                validate_tuple(&tuple)?;
                Ok(ConsoleCommand::Put { tuple, delays })
            }
            "read" => {
                let (pattern, delays) = split_target("read", args)?;
                Ok(ConsoleCommand::Read { pattern, delays })
            }
            "take" => {
                let (pattern, delays) = split_target("take", args)?;
                Ok(ConsoleCommand::Take { pattern, delays })
            }
            other => Err(anyhow!("unknown command {other:?}. Type help for usage")),
        }
    }
}

fn split_target(name: &str, args: &[&str]) -> Result<(String, Vec<u64>)> {
    let Some((target, delays)) = args.split_first() else {
        bail!("{name} requires a tuple or pattern argument");
    };
    let delays = delays
        .iter()
        .map(|delay| {
            delay
                .parse::<u64>()
                .with_context(|| format!("delays must be whole seconds, got {delay:?}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((target.to_string(), delays))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_commands() {
        assert!(matches!(ConsoleCommand::parse("exit"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("EXIT"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("Help"), Ok(ConsoleCommand::Help)));
        assert!(matches!(
            ConsoleCommand::parse("getTupleSpacesState"),
            Ok(ConsoleCommand::State)
        ));
        assert!(matches!(ConsoleCommand::parse("DUMP"), Ok(ConsoleCommand::State)));
    }

    #[test]
    fn test_put_with_and_without_delays() {
        assert_eq!(
            ConsoleCommand::parse("put <a,1>").unwrap(),
            ConsoleCommand::Put {
                tuple: "<a,1>".into(),
                delays: vec![]
            }
        );
        assert_eq!(
            ConsoleCommand::parse("PUT <a,1> 0 3 1").unwrap(),
            ConsoleCommand::Put {
                tuple: "<a,1>".into(),
                delays: vec![0, 3, 1]
            }
        );
    }

    #[test]
    fn test_read_and_take_keep_pattern_verbatim() {
        assert_eq!(
            ConsoleCommand::parse("read <a,.*>").unwrap(),
            ConsoleCommand::Read {
                pattern: "<a,.*>".into(),
                delays: vec![]
            }
        );
        assert_eq!(
            ConsoleCommand::parse("take <x,[0-9]+> 1 0 0").unwrap(),
            ConsoleCommand::Take {
                pattern: "<x,[0-9]+>".into(),
                delays: vec![1, 0, 0]
            }
        );
    }

    #[test]
    fn test_sleep() {
        assert_eq!(
            ConsoleCommand::parse("sleep 2").unwrap(),
            ConsoleCommand::Sleep { secs: 2 }
        );
        assert!(ConsoleCommand::parse("sleep").is_err());
        assert!(ConsoleCommand::parse("sleep soon").is_err());
        assert!(ConsoleCommand::parse("sleep 1 2").is_err());
    }

    #[test]
    fn test_invalid_commands() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("   ").is_err());
        assert!(ConsoleCommand::parse("INVALID").is_err());
        assert!(ConsoleCommand::parse("read").is_err()); // Missing pattern
        assert!(ConsoleCommand::parse("put a,1").is_err()); // Not a tuple
        assert!(ConsoleCommand::parse("put <a,1> x").is_err()); // Bad delay
    }
}
