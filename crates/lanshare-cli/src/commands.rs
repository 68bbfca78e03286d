// SPDX-License-Identifier: AGPL-3.0
// LanShare CLI - Interactive commands
//
// One command per stdin line. Arguments are split on whitespace; double
// quotes keep names with spaces together.

use std::net::IpAddr;
use std::path::PathBuf;

pub const HELP: &str = "\
Local share:
  put <file>                     share a file at the top level
  mkdir <name>                   create a folder
  add <folder> <file>...         copy files into a folder
  toggle <folder>                flip a folder between Public and Private
  delete <name>                  delete a file, or a folder after asking
  tree                           show the shared tree
  mode [public|private]          show or change the device mode
  grant <address>                let a peer into Private folders
  revoke <address>               take that access away again
  access                         list granted addresses
  history                        show what was shared this session
  ip                             show this device's addresses

Peers:
  scan                           look for devices on the local network
  stop                           cancel a running scan
  peers                          list known devices
  add-peer <address>             add a device by hand
  probe <address>                check that a device answers
  ls <address>                   list a device's shared items
  get <address> <name> [dir]     download an item (default dir: ./Downloads)
  cancel                         cancel running downloads
  send <address> <file>          push a file to a device
  transfers                      show transfers being served

  help                           this text
  quit                           exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Put(PathBuf),
    Mkdir(String),
    Add { folder: String, files: Vec<PathBuf> },
    Toggle(String),
    Delete(String),
    Tree,
    Mode(Option<bool>),
    Grant(String),
    Revoke(String),
    Access,
    History,
    Ip,
    Scan,
    StopScan,
    Peers,
    AddPeer(IpAddr),
    Probe(IpAddr),
    Ls(IpAddr),
    Get {
        address: IpAddr,
        name: String,
        dest: Option<PathBuf>,
    },
    Cancel,
    Send { address: IpAddr, path: PathBuf },
    Transfers,
    Help,
    Quit,
}

impl Command {
    /// Parse one input line; `Ok(None)` for a blank line
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let args = split_args(line)?;
        let Some((verb, rest)) = args.split_first() else {
            return Ok(None);
        };

        let command = match (verb.as_str(), rest) {
            ("put", [file]) => Self::Put(PathBuf::from(file)),
            ("mkdir", [name]) => Self::Mkdir(name.clone()),
            ("add", [folder, files @ ..]) if !files.is_empty() => Self::Add {
                folder: folder.clone(),
                files: files.iter().map(PathBuf::from).collect(),
            },
            ("toggle", [name]) => Self::Toggle(name.clone()),
            ("delete" | "rm", [name]) => Self::Delete(name.clone()),
            ("tree", []) => Self::Tree,
            ("mode", []) => Self::Mode(None),
            ("mode", [mode]) => match mode.to_lowercase().as_str() {
                "public" => Self::Mode(Some(true)),
                "private" => Self::Mode(Some(false)),
                other => return Err(format!("Unknown mode '{}', use public or private", other)),
            },
            ("grant", [address]) => Self::Grant(address.clone()),
            ("revoke", [address]) => Self::Revoke(address.clone()),
            ("access", []) => Self::Access,
            ("history", []) => Self::History,
            ("ip", []) => Self::Ip,
            ("scan", []) => Self::Scan,
            ("stop", []) => Self::StopScan,
            ("peers", []) => Self::Peers,
            ("add-peer", [address]) => Self::AddPeer(parse_address(address)?),
            ("probe", [address]) => Self::Probe(parse_address(address)?),
            ("ls", [address]) => Self::Ls(parse_address(address)?),
            ("get", [address, name]) => Self::Get {
                address: parse_address(address)?,
                name: name.clone(),
                dest: None,
            },
            ("get", [address, name, dest]) => Self::Get {
                address: parse_address(address)?,
                name: name.clone(),
                dest: Some(PathBuf::from(dest)),
            },
            ("cancel", []) => Self::Cancel,
            ("send", [address, path]) => Self::Send {
                address: parse_address(address)?,
                path: PathBuf::from(path),
            },
            ("transfers", []) => Self::Transfers,
            ("help" | "?", _) => Self::Help,
            ("quit" | "exit", []) => Self::Quit,
            (verb, _) if is_known(verb) => {
                return Err(format!("Wrong arguments for '{}', see 'help'", verb));
            }
            (verb, _) => return Err(format!("Unknown command '{}', see 'help'", verb)),
        };

        Ok(Some(command))
    }
}

fn is_known(verb: &str) -> bool {
    const VERBS: &[&str] = &[
        "put", "mkdir", "add", "toggle", "delete", "rm", "tree", "mode", "grant", "revoke",
        "access", "history", "ip", "scan", "stop", "peers", "add-peer", "probe", "ls", "get",
        "cancel", "send", "transfers", "quit", "exit",
    ];
    VERBS.contains(&verb)
}

fn parse_address(text: &str) -> Result<IpAddr, String> {
    text.parse()
        .map_err(|_| format!("'{}' is not an IP address", text))
}

/// Split on whitespace, honouring double quotes
fn split_args(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if in_quotes {
        return Err("Unterminated quote".to_string());
    }
    if has_token {
        args.push(current);
    }
    Ok(args)
}

/// Read a yes/no answer; anything but yes declines
pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
