//! Line-oriented front-end
//!
//! Reads drawing commands from stdin and prints remote canvas events as
//! they arrive. Stands in for a canvas UI: a command maps onto the same
//! node calls a pointer drag, clear button or palette click would make.

use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use scribble_net::{NodeEvent, PeerAddress, PeerNode};

/// Colours offered by the palette. Any name is accepted on the wire.
pub const PALETTE: &[&str] = &[
    "black", "grey", "brown4", "red", "blue", "orange", "yellow", "green", "purple",
];

const HELP: &str = "\
commands:
  draw X1 Y1 X2 Y2   draw a segment
  clear              clear every canvas
  color NAME         switch colour
  connect HOST:PORT  dial a peer
  peers              list known and connected peers
  help               show this text
  quit               leave the mesh";

/// One console command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Draw {
        from_x: f64,
        from_y: f64,
        to_x: f64,
        to_y: f64,
    },
    Clear,
    Color(String),
    Connect(PeerAddress),
    Peers,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}', try 'help'")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Err(CommandError::Empty);
        };
        let rest: Vec<&str> = words.collect();

        match (name.to_ascii_lowercase().as_str(), rest.as_slice()) {
            ("draw", [x1, y1, x2, y2]) => Ok(Command::Draw {
                from_x: parse_coord(x1)?,
                from_y: parse_coord(y1)?,
                to_x: parse_coord(x2)?,
                to_y: parse_coord(y2)?,
            }),
            ("draw", _) => Err(CommandError::Usage(DRAW_USAGE)),
            ("clear", []) => Ok(Command::Clear),
            ("color" | "colour", [color]) => Ok(Command::Color(color.to_string())),
            ("color" | "colour", _) => Err(CommandError::Usage("color NAME")),
            ("connect", [addr]) => addr
                .parse()
                .map(Command::Connect)
                .map_err(|_| CommandError::Usage("connect HOST:PORT")),
            ("connect", _) => Err(CommandError::Usage("connect HOST:PORT")),
            ("peers", []) => Ok(Command::Peers),
            ("help" | "?", _) => Ok(Command::Help),
            ("quit" | "exit", _) => Ok(Command::Quit),
            _ => Err(CommandError::Unknown(name.to_string())),
        }
    }
}

const DRAW_USAGE: &str = "draw X1 Y1 X2 Y2";

/// Coordinates must survive a JSON round trip, so NaN and infinities are out
fn parse_coord(s: &str) -> Result<f64, CommandError> {
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or(CommandError::Usage(DRAW_USAGE))
}

/// Printable form of a remote event
pub struct EventLine<'a>(pub &'a NodeEvent);

impl fmt::Display for EventLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            NodeEvent::Draw(s) => write!(
                f,
                "[draw] {}: ({}, {}) -> ({}, {})",
                s.author, s.from_x, s.from_y, s.to_x, s.to_y
            ),
            NodeEvent::Clear => write!(f, "[clear] canvas cleared"),
            NodeEvent::ColorChanged(color) => write!(f, "[color] {}", color),
            NodeEvent::PeerConnected(peer) => write!(f, "[peer] {} connected", peer),
            NodeEvent::PeerDisconnected(peer) => write!(f, "[peer] {} disconnected", peer),
            NodeEvent::DialFailed { addr, reason } => {
                write!(f, "[peer] could not reach {}: {}", addr, reason)
            }
        }
    }
}

/// Whether the console keeps reading after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Console session bound to a running node
pub struct Console {
    node: PeerNode,
    author: String,
    color: String,
}

impl Console {
    pub fn new(node: PeerNode, author: impl Into<String>) -> Self {
        Self {
            node,
            author: author.into(),
            color: PALETTE[0].to_string(),
        }
    }

    /// Run a command, returning the text to show the user
    pub async fn execute(&mut self, command: Command) -> (Flow, String) {
        let reply = match command {
            Command::Draw {
                from_x,
                from_y,
                to_x,
                to_y,
            } => self
                .node
                .on_local_drag(from_x, from_y, to_x, to_y, self.author.as_str())
                .await
                .map(|sent| format!("drew {} segment, sent to {} connection(s)", self.color, sent)),
            Command::Clear => self
                .node
                .on_local_clear()
                .await
                .map(|sent| format!("cleared, sent to {} connection(s)", sent)),
            Command::Color(color) => {
                self.color = color.clone();
                self.node
                    .on_local_color_change(color.as_str())
                    .await
                    .map(|sent| format!("colour is now {}, sent to {} connection(s)", color, sent))
            }
            Command::Connect(addr) => self
                .node
                .connect_to(addr.clone())
                .await
                .map(|id| format!("connected to {} ({})", addr, id)),
            Command::Peers => Ok(self.describe_peers().await),
            Command::Help => Ok(HELP.to_string()),
            Command::Quit => return (Flow::Quit, "bye".to_string()),
        };

        match reply {
            Ok(text) => (Flow::Continue, text),
            Err(e) => {
                warn!(error = %e, "Command failed");
                (Flow::Continue, format!("error: {}", e))
            }
        }
    }

    async fn describe_peers(&self) -> String {
        let connected = self.node.connected_peers().await;
        let known = self.node.known_peers().await;

        let mut text = format!("this node: {}", self.node.address());
        for peer in &known {
            let state = if connected.contains(peer) {
                "connected"
            } else {
                "known"
            };
            text.push_str(&format!("\n  {} ({})", peer, state));
        }
        if known.is_empty() {
            text.push_str("\n  no peers yet");
        }
        text
    }

    /// Read commands and print remote events until quit, EOF or Ctrl-C
    pub async fn run(mut self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        println!("listening as {} ({}), type 'help'", self.node.address(), self.author);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => match line.parse::<Command>() {
                            Ok(command) => {
                                let (flow, text) = self.execute(command).await;
                                println!("{}", text);
                                if flow == Flow::Quit {
                                    break;
                                }
                            }
                            Err(CommandError::Empty) => {}
                            Err(e) => println!("{}", e),
                        },
                        Ok(None) => {
                            info!("Input closed");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to read input");
                            break;
                        }
                    }
                }
                event = self.node.next_event() => {
                    match event {
                        Some(event) => {
                            if let NodeEvent::ColorChanged(color) = &event {
                                self.color = color.clone();
                            }
                            println!("{}", EventLine(&event));
                        }
                        None => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    pub async fn shutdown(&self) {
        self.node.shutdown().await;
    }
}
