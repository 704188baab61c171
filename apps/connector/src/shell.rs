//! 交互式 Shell
//!
//! 专用输入线程持有 rustyline 的 Editor（保留历史），行通过 channel 交给主线程执行。

use anyhow::{Result, anyhow, bail};
use bluebird_fleet::{FleetManager, SLOT_COUNT};
use crossbeam_channel::{Receiver, bounded, select};
use rustyline::Editor;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use std::thread;
use tracing::debug;

const HISTORY_FILE: &str = ".bluebird_history";

/// 解析后的 Shell 命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Scan,
    Stop,
    Connect(String),
    Disconnect(Target),
    Send { slot: char, data: Vec<u8> },
    Slots,
    Cancel,
    Help,
    Exit,
}

/// 按槽位字母或设备名指定目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Slot(char),
    Device(String),
}

impl Target {
    fn parse(arg: &str) -> Self {
        let mut chars = arg.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => Target::Slot(c.to_ascii_uppercase()),
            _ => Target::Device(arg.to_string()),
        }
    }
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = parts.split_first() else {
            bail!("empty command");
        };

        let command = match (verb, args) {
            ("scan", []) => Command::Scan,
            ("stop", []) => Command::Stop,
            ("connect", [name]) => Command::Connect(name.to_string()),
            ("disconnect", [target]) => Command::Disconnect(Target::parse(target)),
            ("send", [slot, rest @ ..]) if !rest.is_empty() => {
                let Target::Slot(slot) = Target::parse(slot) else {
                    bail!("send expects a slot letter, got '{}'", slot);
                };
                let data = hex::decode(rest.concat()).map_err(|e| anyhow!("invalid hex payload: {}", e))?;
                Command::Send { slot, data }
            },
            ("slots" | "status", []) => Command::Slots,
            ("cancel", []) => Command::Cancel,
            ("help", _) => Command::Help,
            ("exit" | "quit", _) => Command::Exit,
            ("scan" | "stop" | "connect" | "disconnect" | "send" | "slots" | "status" | "cancel", _) => {
                bail!("wrong arguments for '{}'", verb)
            },
            _ => bail!("unknown command '{}'", verb),
        };
        Ok(command)
    }
}

fn spawn_input() -> Receiver<String> {
    let (line_tx, line_rx) = bounded::<String>(10);

    thread::spawn(move || -> Result<()> {
        let mut rl = Editor::<(), DefaultHistory>::new()
            .map_err(|e| anyhow!("Failed to initialize readline: {}", e))?;
        rl.load_history(HISTORY_FILE).ok();

        loop {
            match rl.readline("bluebird> ") {
                Ok(line) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(line.clone());
                    let exit = matches!(line.as_str(), "exit" | "quit");
                    if line_tx.send(line).is_err() || exit {
                        break;
                    }
                },
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                    let _ = line_tx.send("exit".to_string());
                    break;
                },
                Err(err) => {
                    eprintln!("Error: {:?}", err);
                    break;
                },
            }
        }
        rl.save_history(HISTORY_FILE).ok();
        Ok(())
    });

    line_rx
}

pub struct Shell<'a> {
    fleet: &'a FleetManager,
}

impl<'a> Shell<'a> {
    pub fn new(fleet: &'a FleetManager) -> Self {
        Self { fleet }
    }

    /// 运行直到 `exit`、Ctrl+D 或 Ctrl+C
    pub fn run(&self, interrupts: Receiver<()>) -> Result<()> {
        println!("BlueBird Connector v{}", env!("CARGO_PKG_VERSION"));
        println!("Type 'help' for commands, 'exit' to quit");

        let lines = spawn_input();
        loop {
            select! {
                recv(lines) -> line => {
                    let Ok(line) = line else {
                        break;
                    };
                    match Command::parse(&line) {
                        Ok(Command::Exit) => break,
                        Ok(command) => {
                            if let Err(e) = self.execute(command) {
                                eprintln!("Error: {}", e);
                            }
                        },
                        Err(e) => eprintln!("Error: {} (try 'help')", e),
                    }
                },
                recv(interrupts) -> _ => {
                    debug!("interrupted");
                    break;
                },
            }
        }
        println!("Bye");
        Ok(())
    }

    fn execute(&self, command: Command) -> Result<()> {
        match command {
            Command::Scan => self.fleet.start_discovery(),
            Command::Stop => self.fleet.stop_discovery(),
            Command::Connect(name) => {
                let slot = self.fleet.connect(&name)?;
                println!("  connecting {} in slot {}", name, slot);
            },
            Command::Disconnect(Target::Slot(slot)) => self.fleet.disconnect_slot(slot)?,
            Command::Disconnect(Target::Device(name)) => self.fleet.disconnect(&name)?,
            Command::Send { slot, data } => self.fleet.send_command(slot, &data)?,
            Command::Slots => {
                if !self.fleet.has_communicator() {
                    println!("  (no bluetooth transport)");
                }
                for slot in self.fleet.slots() {
                    println!("  {}", slot);
                }
            },
            Command::Cancel => self.fleet.cancel_connection_request()?,
            Command::Help => print_help(),
            Command::Exit => {},
        }
        Ok(())
    }
}

fn print_help() {
    println!("Commands:");
    println!("  scan                      start scanning");
    println!("  stop                      stop scanning");
    println!("  connect <name>            connect a discovered robot");
    println!("  disconnect <slot|name>    disconnect a robot");
    println!("  send <slot> <hex>         send raw command bytes");
    println!("  slots                     show the {} slots", SLOT_COUNT);
    println!("  cancel                    cancel the pending connection");
    println!("  exit                      quit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("scan").unwrap(), Command::Scan);
        assert_eq!(Command::parse("  connect FN1234 ").unwrap(), Command::Connect("FN1234".into()));
        assert_eq!(Command::parse("disconnect b").unwrap(), Command::Disconnect(Target::Slot('B')));
        assert_eq!(
            Command::parse("disconnect BB0001").unwrap(),
            Command::Disconnect(Target::Device("BB0001".into()))
        );
        assert_eq!(Command::parse("quit").unwrap(), Command::Exit);
    }

    #[test]
    fn test_parse_send_joins_hex() {
        assert_eq!(
            Command::parse("send a 90 00ff").unwrap(),
            Command::Send {
                slot: 'A',
                data: vec![0x90, 0x00, 0xFF]
            }
        );
        assert!(Command::parse("send A 9").is_err());
        assert!(Command::parse("send FN1234 90").is_err());
        assert!(Command::parse("send A").is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("connect").is_err());
        assert!(Command::parse("fly away").is_err());
    }
}
