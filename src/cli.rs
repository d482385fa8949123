//! Command-line parsing.
//!
//! Basic hand-rolled parsing; options may appear before or after the
//! command word.  `--` ends option parsing.

use std::path::PathBuf;

use crate::error::AppError;

pub const USAGE: &str = "\
Usage: koe-bot [OPTIONS] [COMMAND]

Commands:
  run                               Serve chat channels and retrain weekly (default)
  collect                           Snapshot the full history into the data directory
  learn [DIR]                       Fine-tune on DIR (default: data directory) and serve the result
  pretrain <FILE>... [--preamble <FILE>] [--force]
                                    Train the base model on large text files

Options:
  -h, --help                        Print help
  -f, --config <PATH>               Configuration file (default: config/default.toml)
  -v, -vv                           Increase logging verbosity";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Collect,
    Learn { dir: Option<PathBuf> },
    Pretrain { files: Vec<PathBuf>, preamble: Option<PathBuf>, force: bool },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub verbosity: u8,
    pub config_path: Option<PathBuf>,
    pub command: Command,
}

/// Parse arguments, program name excluded.
pub fn parse<I>(args: I) -> Result<CliArgs, AppError>
where
    I: IntoIterator<Item = String>,
{
    let mut verbosity = 0u8;
    let mut config_path = None;
    let mut preamble = None;
    let mut force = false;
    let mut help = false;
    let mut positional: Vec<String> = Vec::new();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--" => {
                positional.extend(iter.by_ref());
                break;
            }
            "-h" | "--help" => help = true,
            "-f" | "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| AppError::Usage("-f/--config requires a path argument".into()))?;
                config_path = Some(PathBuf::from(path));
            }
            "--preamble" => {
                let path = iter
                    .next()
                    .ok_or_else(|| AppError::Usage("--preamble requires a path argument".into()))?;
                preamble = Some(PathBuf::from(path));
            }
            "--force" => force = true,
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            a if a.starts_with('-') && a.len() > 1 => {
                return Err(AppError::Usage(format!("unknown option '{a}'")));
            }
            _ => positional.push(arg),
        }
    }

    if help {
        return Ok(CliArgs { verbosity, config_path, command: Command::Help });
    }

    let mut words = positional.into_iter();
    let command = {
        match words.next().as_deref() {
            None | Some("run") => Command::Run,
            Some("collect") => Command::Collect,
            Some("learn") => Command::Learn { dir: words.next().map(PathBuf::from) },
            Some("pretrain") => {
                let files: Vec<PathBuf> = words.by_ref().map(PathBuf::from).collect();
                if files.is_empty() {
                    return Err(AppError::Usage("pretrain needs at least one corpus file".into()));
                }
                Command::Pretrain { files, preamble: preamble.take(), force }
            }
            Some(other) => return Err(AppError::Usage(format!("unknown command '{other}'"))),
        }
    };

    if let Some(extra) = words.next() {
        return Err(AppError::Usage(format!("unexpected argument '{extra}'")));
    }
    if !matches!(command, Command::Pretrain { .. }) && (preamble.is_some() || force) {
        return Err(AppError::Usage("--preamble and --force only apply to pretrain".into()));
    }

    Ok(CliArgs { verbosity, config_path, command })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Result<CliArgs, AppError> {
        parse(line.split_whitespace().map(String::from))
    }

    #[test]
    fn defaults_to_run() {
        let cli = args("").unwrap();
        assert_eq!(cli.command, Command::Run);
        assert_eq!(cli.verbosity, 0);
        assert_eq!(cli.config_path, None);
    }

    #[test]
    fn options_anywhere() {
        let cli = args("learn -vv --config koe.toml corpus/").unwrap();
        assert_eq!(cli.command, Command::Learn { dir: Some(PathBuf::from("corpus/")) });
        assert_eq!(cli.verbosity, 2);
        assert_eq!(cli.config_path, Some(PathBuf::from("koe.toml")));
    }

    #[test]
    fn pretrain_collects_files_and_flags() {
        let cli = args("pretrain a.txt b.txt --preamble about.txt --force").unwrap();
        assert_eq!(
            cli.command,
            Command::Pretrain {
                files: vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")],
                preamble: Some(PathBuf::from("about.txt")),
                force: true,
            }
        );
    }

    #[test]
    fn usage_errors() {
        assert!(matches!(args("pretrain"), Err(AppError::Usage(_))));
        assert!(matches!(args("-f"), Err(AppError::Usage(_))));
        assert!(matches!(args("dance"), Err(AppError::Usage(_))));
        assert!(matches!(args("collect extra"), Err(AppError::Usage(_))));
        assert!(matches!(args("run --force"), Err(AppError::Usage(_))));
        assert!(matches!(args("--bogus"), Err(AppError::Usage(_))));
    }

    #[test]
    fn help_wins_over_command_words() {
        assert_eq!(args("learn -h").unwrap().command, Command::Help);
        assert_eq!(args("pretrain a.txt b.txt --force --help").unwrap().command, Command::Help);
        assert_eq!(args("-h collect extra").unwrap().command, Command::Help);
    }

    #[test]
    fn double_dash_stops_options() {
        let cli = args("learn -- -weird-dir").unwrap();
        assert_eq!(cli.command, Command::Learn { dir: Some(PathBuf::from("-weird-dir")) });
    }
}
