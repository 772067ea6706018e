use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// One `machine` (or `default`) block of a netrc file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetrcEntry {
    pub login: String,
    pub account: Option<String>,
    pub password: String,
}

/// Parsed netrc authentication database.
#[derive(Debug, Clone, Default)]
pub struct Netrc {
    machines: HashMap<String, NetrcEntry>,
    default: Option<NetrcEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Keyword,
    MachineName,
    Login,
    Password,
    Account,
    MacdefName,
}

enum Target {
    Machine(String),
    Default,
}

impl Netrc {
    /// Reads and parses the netrc file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read netrc file {}", path.display()))?;
        Ok(Self::parse(&text, path)?)
    }

    /// Parses netrc content; `origin` is only used in error messages.
    pub fn parse(text: &str, origin: &Path) -> std::result::Result<Self, Error> {
        let mut netrc = Netrc::default();
        let mut current: Option<(Target, NetrcEntry)> = None;
        let mut expect = Expect::Keyword;
        let mut in_macdef = false;

        let syntax = |line: usize, message: String| Error::Netrc {
            path: origin.to_path_buf(),
            line,
            message,
        };

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;

            // A macro body runs until the next blank line.
            if in_macdef {
                if raw.trim().is_empty() {
                    in_macdef = false;
                }
                continue;
            }

            for token in split_tokens(raw).map_err(|m| syntax(line_no, m))? {
                match expect {
                    Expect::Keyword => match token.as_str() {
                        "machine" => {
                            netrc.flush(current.take());
                            expect = Expect::MachineName;
                        }
                        "default" => {
                            netrc.flush(current.take());
                            current = Some((Target::Default, NetrcEntry::default()));
                        }
                        "login" | "user" => expect = Expect::Login,
                        "password" => expect = Expect::Password,
                        "account" => expect = Expect::Account,
                        "macdef" => expect = Expect::MacdefName,
                        other => {
                            return Err(syntax(line_no, format!("unexpected token '{}'", other)));
                        }
                    },
                    Expect::MachineName => {
                        current = Some((Target::Machine(token), NetrcEntry::default()));
                        expect = Expect::Keyword;
                    }
                    Expect::Login | Expect::Password | Expect::Account => {
                        let Some((_, entry)) = current.as_mut() else {
                            return Err(syntax(
                                line_no,
                                "credentials given outside of a machine block".to_string(),
                            ));
                        };
                        match expect {
                            Expect::Login => entry.login = token,
                            Expect::Password => entry.password = token,
                            _ => entry.account = Some(token),
                        }
                        expect = Expect::Keyword;
                    }
                    Expect::MacdefName => {
                        in_macdef = true;
                        expect = Expect::Keyword;
                        break;
                    }
                }
            }
        }

        match expect {
            Expect::Keyword | Expect::MacdefName => {}
            _ => {
                return Err(syntax(
                    text.lines().count(),
                    "unexpected end of file".to_string(),
                ));
            }
        }
        netrc.flush(current);
        Ok(netrc)
    }

    fn flush(&mut self, block: Option<(Target, NetrcEntry)>) {
        match block {
            Some((Target::Machine(name), entry)) => {
                self.machines.insert(name, entry);
            }
            Some((Target::Default, entry)) => self.default = Some(entry),
            None => {}
        }
    }

    /// Entry for exactly `host`, without the `default` fallback.
    pub fn machine(&self, host: &str) -> Option<&NetrcEntry> {
        self.machines.get(host)
    }

    pub fn default_entry(&self) -> Option<&NetrcEntry> {
        self.default.as_ref()
    }

    /// Entry for `host`, falling back to the `default` block.
    pub fn authenticators(&self, host: &str) -> Option<&NetrcEntry> {
        self.machine(host).or_else(|| self.default_entry())
    }
}

fn split_tokens(line: &str) -> std::result::Result<std::vec::IntoIter<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else { break };

        if first == '#' {
            break;
        }

        let mut token = String::new();
        if first == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            token.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => token.push(c),
                }
            }
            if !closed {
                return Err("unterminated quoted token".to_string());
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        token.push(escaped);
                    }
                } else {
                    token.push(c);
                }
            }
        }
        tokens.push(token);
    }

    Ok(tokens.into_iter())
}

/// Location of the netrc file.
///
/// Search order:
/// 1) the explicit `path`
/// 2) `NETRCFILE`
/// 3) `~/.netrc`
pub(crate) fn netrc_path(path: Option<&Path>) -> Option<PathBuf> {
    let p = match path {
        Some(p) => p.to_path_buf(),
        None => match std::env::var_os("NETRCFILE") {
            Some(p) => PathBuf::from(p),
            None => return dirs::home_dir().map(|home| home.join(".netrc")),
        },
    };
    Some(expand_tilde(&p))
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Netrc {
        Netrc::parse(text, Path::new("test.netrc")).unwrap()
    }

    #[test]
    fn machines_and_default() {
        let n = parse(
            "machine identity.dataspace.copernicus.eu login alice password s3cret\n\
             default login anon password guest\n",
        );
        let e = n.machine("identity.dataspace.copernicus.eu").unwrap();
        assert_eq!(e.login, "alice");
        assert_eq!(e.password, "s3cret");
        assert!(n.machine("example.com").is_none());
        assert_eq!(n.authenticators("example.com").unwrap().login, "anon");
    }

    #[test]
    fn multiline_blocks_comments_and_quotes() {
        let n = parse(
            "# CDSE\n\
             machine host.example\n\
             \x20 login \"bob smith\"\n\
             \x20 account acme # trailing comment\n\
             \x20 password \"p\\\"w d\"\n",
        );
        let e = n.machine("host.example").unwrap();
        assert_eq!(e.login, "bob smith");
        assert_eq!(e.account.as_deref(), Some("acme"));
        assert_eq!(e.password, "p\"w d");
    }

    #[test]
    fn macdef_body_is_skipped() {
        let n = parse(
            "macdef init\ncd /pub\nbin\n\nmachine a.example login u password p\n",
        );
        assert_eq!(n.machine("a.example").unwrap().login, "u");
    }

    #[test]
    fn later_machine_wins() {
        let n = parse("machine h login a password 1\nmachine h login b password 2\n");
        assert_eq!(n.machine("h").unwrap().login, "b");
    }

    #[test]
    fn syntax_errors_report_line() {
        let err = Netrc::parse("machine h\nbogus x\n", Path::new("n")).unwrap_err();
        match err {
            Error::Netrc { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(Netrc::parse("machine h login", Path::new("n")).is_err());
        assert!(Netrc::parse("login x", Path::new("n")).is_err());
        assert!(Netrc::parse("machine h login \"open", Path::new("n")).is_err());
    }

    #[test]
    fn explicit_path_is_used() {
        let p = netrc_path(Some(Path::new("/tmp/my.netrc"))).unwrap();
        assert_eq!(p, PathBuf::from("/tmp/my.netrc"));
    }
}
