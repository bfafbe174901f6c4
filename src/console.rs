use crate::config::PidConfig;

/// A line typed by the operator on stdin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorCommand {
    /// `set <target> <kp> <ki> <kd>`
    SetPid(PidConfig),
    /// `reset`: zero the integral term
    ResetIntegral,
    /// `datalog`: download the meter's stored log
    Datalog,
    Quit,
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match cmd {
            "set" => PidConfig::parse(rest)
                .map(Self::SetPid)
                .map_err(|e| format!("usage: set <target> <kp> <ki> <kd> ({})", e)),
            "reset" => Ok(Self::ResetIntegral),
            "datalog" => Ok(Self::Datalog),
            "quit" | "exit" => Ok(Self::Quit),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command: {}", other)),
        }
    }
}
