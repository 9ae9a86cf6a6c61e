//! ABOUTME: Command grammar for the interactive debugger loop
//! ABOUTME: Parses one newline-delimited adapter line into a typed Command

use crate::error::{DebugError, Result};
use std::str::FromStr;

/// Which keys a `props` expansion reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropsKind {
    /// Every key
    All,
    /// Skip integer keys `1..#t` (the array part)
    Named,
    /// Iterate integer keys `start..start+count-1`
    Indexed,
}

impl FromStr for PropsKind {
    type Err = DebugError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "named" => Ok(Self::Named),
            "indexed" => Ok(Self::Indexed),
            other => Err(DebugError::Command {
                message: format!("bad properties kind '{other}'"),
            }),
        }
    }
}

/// A `<file>:<line>` breakpoint locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakSpec {
    pub file: String,
    pub line: u32,
}

impl FromStr for BreakSpec {
    type Err = DebugError;

    fn from_str(s: &str) -> Result<Self> {
        // Split at the last ':' so drive-letter prefixes survive
        let (file, line) = s.rsplit_once(':').ok_or_else(|| DebugError::Command {
            message: format!("bad breakpoint location '{s}'"),
        })?;
        let line = line.parse::<u32>().map_err(|_| DebugError::Command {
            message: format!("bad breakpoint line '{line}'"),
        })?;
        if file.is_empty() {
            return Err(DebugError::Command {
                message: format!("bad breakpoint location '{s}'"),
            });
        }
        Ok(Self {
            file: file.to_string(),
            line,
        })
    }
}

/// One adapter command, as read from the input sink
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Quit,
    Continue,
    AutoContinue,
    Step,
    StepIn,
    StepOut,
    Stack,
    Frame(usize),
    Locals,
    Ups,
    Globals,
    Props {
        expression: String,
        kind: PropsKind,
        start: Option<i64>,
        count: Option<i64>,
    },
    Eval(String),
    Exec(String),
    BreakSet {
        spec: BreakSpec,
        condition: Option<String>,
    },
    BreakDelete(BreakSpec),
    BreakDisable(BreakSpec),
    BreakEnable(BreakSpec),
    BreakList,
    BreakClear,
    Threads,
    Thread(u64),
    Help,
}

impl Command {
    /// Parse one input line
    ///
    /// # Errors
    ///
    /// `DebugError::BadCommand` for an unknown verb,
    /// `DebugError::Command` for a known verb with malformed arguments.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let (verb, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((v, r)) => (v, r.trim_start()),
            None => (trimmed, ""),
        };

        match verb {
            "quit" => Self::expect_no_args(rest, Self::Quit),
            "cont" | "continue" => Self::expect_no_args(rest, Self::Continue),
            "autocont" | "autocontinue" => Self::expect_no_args(rest, Self::AutoContinue),
            "step" => Self::expect_no_args(rest, Self::Step),
            "stepin" => Self::expect_no_args(rest, Self::StepIn),
            "stepout" => Self::expect_no_args(rest, Self::StepOut),
            "stack" => Self::expect_no_args(rest, Self::Stack),
            "locals" => Self::expect_no_args(rest, Self::Locals),
            "ups" => Self::expect_no_args(rest, Self::Ups),
            "globals" => Self::expect_no_args(rest, Self::Globals),
            "threads" => Self::expect_no_args(rest, Self::Threads),
            "help" => Self::expect_no_args(rest, Self::Help),
            "frame" => {
                let n = rest.parse::<usize>().map_err(|_| DebugError::Command {
                    message: format!("bad frame index '{rest}'"),
                })?;
                if n == 0 {
                    return Err(DebugError::Command {
                        message: "frame indices are 1-based".to_string(),
                    });
                }
                Ok(Self::Frame(n))
            }
            "thread" => {
                let n = rest.parse::<u64>().map_err(|_| DebugError::Command {
                    message: format!("bad thread id '{rest}'"),
                })?;
                Ok(Self::Thread(n))
            }
            "eval" => {
                if rest.is_empty() {
                    return Err(DebugError::Command {
                        message: "eval requires an expression".to_string(),
                    });
                }
                Ok(Self::Eval(rest.to_string()))
            }
            "exec" => {
                if rest.is_empty() {
                    return Err(DebugError::Command {
                        message: "exec requires a statement".to_string(),
                    });
                }
                Ok(Self::Exec(rest.to_string()))
            }
            "props" => Self::parse_props(rest),
            "break" => Self::parse_break(rest),
            _ => Err(DebugError::BadCommand),
        }
    }

    fn expect_no_args(rest: &str, command: Self) -> Result<Self> {
        if rest.is_empty() {
            Ok(command)
        } else {
            Err(DebugError::Command {
                message: format!("unexpected argument '{rest}'"),
            })
        }
    }

    /// `props <expr> all|named|indexed [start [count]]`
    ///
    /// The expression may contain spaces, so the tail is parsed from the end:
    /// trailing integers first, then the kind keyword, then everything before
    /// the keyword is the expression.
    fn parse_props(rest: &str) -> Result<Self> {
        let mut tokens: Vec<&str> = rest.split_whitespace().collect();
        if tokens.len() < 2 {
            return Err(DebugError::Command {
                message: "props requires an expression and a kind".to_string(),
            });
        }

        let mut numbers: Vec<i64> = Vec::new();
        while numbers.len() < 2 {
            let Some(last) = tokens.last() else { break };
            let Ok(n) = last.parse::<i64>() else { break };
            numbers.push(n);
            tokens.pop();
        }
        numbers.reverse();

        let kind_token = tokens.pop().ok_or_else(|| DebugError::Command {
            message: "props requires a kind".to_string(),
        })?;
        let kind = kind_token.parse::<PropsKind>()?;

        if tokens.is_empty() {
            return Err(DebugError::Command {
                message: "props requires an expression".to_string(),
            });
        }
        let expression = tokens.join(" ");

        let mut numbers = numbers.into_iter();
        Ok(Self::Props {
            expression,
            kind,
            start: numbers.next(),
            count: numbers.next(),
        })
    }

    /// `break set|del|delete|dis|disable|en|enable|list|clear …`
    fn parse_break(rest: &str) -> Result<Self> {
        let (sub, tail) = match rest.split_once(char::is_whitespace) {
            Some((s, t)) => (s, t.trim_start()),
            None => (rest, ""),
        };

        match sub {
            "list" => Self::expect_no_args(tail, Self::BreakList),
            "clear" => Self::expect_no_args(tail, Self::BreakClear),
            "set" => {
                let (loc, condition) = match tail.split_once(char::is_whitespace) {
                    Some((l, c)) => (l, Some(c.trim().to_string())),
                    None => (tail, None),
                };
                let spec = loc.parse::<BreakSpec>()?;
                Ok(Self::BreakSet {
                    spec,
                    condition: condition.filter(|c| !c.is_empty()),
                })
            }
            "del" | "delete" => Ok(Self::BreakDelete(tail.parse()?)),
            "dis" | "disable" => Ok(Self::BreakDisable(tail.parse()?)),
            "en" | "enable" => Ok(Self::BreakEnable(tail.parse()?)),
            "" => Err(DebugError::Command {
                message: "break requires a subcommand".to_string(),
            }),
            other => Err(DebugError::Command {
                message: format!("bad break subcommand '{other}'"),
            }),
        }
    }
}

/// The usage table emitted by the `help` verb
#[must_use]
pub fn help_text() -> String {
    [
        "quit                                  exit debuggee",
        "cont|continue                         resume execution",
        "autocont|autocontinue                 resume, skip breakpoints on this line",
        "step                                  step over",
        "stepin                                step into",
        "stepout                               step out",
        "stack                                 show current thread frames",
        "frame n                               set active frame (1-based)",
        "locals|ups|globals                    list variables of the active frame",
        "props expr all|named|indexed [s [c]]  expand a table",
        "eval expr                             evaluate an expression",
        "exec stmt                             execute a statement",
        "break set file:n [condition]          add breakpoint",
        "break del|delete file:n               remove breakpoint",
        "break dis|disable file:n              disable breakpoint",
        "break en|enable file:n                enable breakpoint",
        "break list                            list breakpoints",
        "break clear                           remove all breakpoints",
        "threads                               list threads",
        "thread n                              set current thread",
        "help                                  this message",
    ]
    .join("\n")
}
