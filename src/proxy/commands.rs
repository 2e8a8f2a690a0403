//! Commands the hosting process can issue to a running engine

use std::fmt;
use std::io::BufRead;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCommand {
    StartRecording,
    StopRecording,
    MockRequest,
    Shutdown,
}

impl ProxyCommand {
    /// Map an interactive key to a command
    pub fn from_key(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "r" => Some(ProxyCommand::StartRecording),
            "s" => Some(ProxyCommand::StopRecording),
            "w" => Some(ProxyCommand::MockRequest),
            "q" => Some(ProxyCommand::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyCommand::StartRecording => "start recording",
            ProxyCommand::StopRecording => "stop recording",
            ProxyCommand::MockRequest => "mock request",
            ProxyCommand::Shutdown => "shutdown",
        })
    }
}

pub const KEY_HELP: &str = "Hotkeys: r = record, s = stop recording, w = mock request, q = quit";

/// Read key lines from the terminal on a dedicated thread. Stdin reads block,
/// so they stay off the runtime; the thread ends at EOF or once the engine
/// stops listening.
pub fn spawn_terminal_reader(tx: mpsc::UnboundedSender<ProxyCommand>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Terminal input closed: {}", e);
                    break;
                }
            };
            match ProxyCommand::from_key(&line) {
                Some(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => debug!("Unknown key '{}'. {}", line.trim(), KEY_HELP),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_map_to_commands() {
        assert_eq!(ProxyCommand::from_key("r"), Some(ProxyCommand::StartRecording));
        assert_eq!(ProxyCommand::from_key(" S\n"), Some(ProxyCommand::StopRecording));
        assert_eq!(ProxyCommand::from_key("w"), Some(ProxyCommand::MockRequest));
        assert_eq!(ProxyCommand::from_key("q"), Some(ProxyCommand::Shutdown));
        assert_eq!(ProxyCommand::from_key("x"), None);
    }
}
