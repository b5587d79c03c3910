//! Console commands read from stdin.

use std::path::PathBuf;

use junction_net::{Multiaddr, PeerId};
use thiserror::Error;

pub const HELP: &str = "\
commands:
  <text>                    publish a chat message
  /dm <peer> <text>         send a direct message
  /file <path>              offer a file
  /connect <multiaddr>      dial a peer
  /disconnect <peer>        close connections to a peer
  /peers                    list open connections
  /help                     show this help
  /quit                     stop the node and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Chat(String),
    Direct { peer: PeerId, text: String },
    Offer(PathBuf),
    Connect(Multiaddr),
    Disconnect(PeerId),
    Peers,
    Help,
    Quit,
    Empty,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("unknown command: /{0} (try /help)")]
    UnknownCommand(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid peer id '{0}'")]
    InvalidPeer(String),

    #[error("invalid multiaddr '{0}'")]
    InvalidAddress(String),
}

/// Parse one console line.
pub fn parse_input(line: &str) -> Result<Input, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Input::Chat(line.to_string()));
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };

    match name {
        "dm" => {
            let (peer, text) = rest
                .split_once(char::is_whitespace)
                .ok_or(InputError::Usage("/dm <peer> <text>"))?;
            let text = text.trim();
            if text.is_empty() {
                return Err(InputError::Usage("/dm <peer> <text>"));
            }
            Ok(Input::Direct {
                peer: parse_peer(peer)?,
                text: text.to_string(),
            })
        }
        "file" => {
            if rest.is_empty() {
                return Err(InputError::Usage("/file <path>"));
            }
            Ok(Input::Offer(PathBuf::from(rest)))
        }
        "connect" => {
            if rest.is_empty() {
                return Err(InputError::Usage("/connect <multiaddr>"));
            }
            rest.parse()
                .map(Input::Connect)
                .map_err(|_| InputError::InvalidAddress(rest.to_string()))
        }
        "disconnect" => {
            if rest.is_empty() {
                return Err(InputError::Usage("/disconnect <peer>"));
            }
            Ok(Input::Disconnect(parse_peer(rest)?))
        }
        "peers" => Ok(Input::Peers),
        "help" => Ok(Input::Help),
        "quit" | "exit" => Ok(Input::Quit),
        other => Err(InputError::UnknownCommand(other.to_string())),
    }
}

fn parse_peer(s: &str) -> Result<PeerId, InputError> {
    s.parse().map_err(|_| InputError::InvalidPeer(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_chat() {
        assert_eq!(
            parse_input("  hello world "),
            Ok(Input::Chat("hello world".to_string()))
        );
        assert_eq!(parse_input("   "), Ok(Input::Empty));
    }

    #[test]
    fn test_dm() {
        let peer = PeerId::random();
        assert_eq!(
            parse_input(&format!("/dm {} hi there", peer)),
            Ok(Input::Direct {
                peer,
                text: "hi there".to_string()
            })
        );
        assert_eq!(
            parse_input(&format!("/dm {}", peer)),
            Err(InputError::Usage("/dm <peer> <text>"))
        );
        assert_eq!(
            parse_input("/dm nobody hi"),
            Err(InputError::InvalidPeer("nobody".to_string()))
        );
    }

    #[test]
    fn test_file_and_connect() {
        assert_eq!(
            parse_input("/file ./notes.txt"),
            Ok(Input::Offer(PathBuf::from("./notes.txt")))
        );
        assert_eq!(
            parse_input("/connect /ip4/127.0.0.1/tcp/4001"),
            Ok(Input::Connect("/ip4/127.0.0.1/tcp/4001".parse().unwrap()))
        );
        assert!(matches!(
            parse_input("/connect nowhere"),
            Err(InputError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse_input("/peers"), Ok(Input::Peers));
        assert_eq!(parse_input("/help"), Ok(Input::Help));
        assert_eq!(parse_input("/quit"), Ok(Input::Quit));
        assert_eq!(
            parse_input("/frobnicate"),
            Err(InputError::UnknownCommand("frobnicate".to_string()))
        );
    }
}
