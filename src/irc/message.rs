/// IRC message parsing and serialization.
///
/// Implements RFC 2812 message format with IRCv3 message tags:
///   [`@`tags SPACE] [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
///
/// Messages are terminated by CR-LF (`\r\n`) on the wire,
/// but parsing operates on the content without the terminator.
use std::fmt;

/// A single IRCv3 message tag: key plus optional (unescaped) value.
pub type Tag = (String, Option<String>);

/// A parsed IRC message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags, in wire order.
    pub tags: Vec<Tag>,
    /// Optional prefix (server name or `nick!user@host`).
    pub prefix: Option<String>,
    /// The command (e.g. `PRIVMSG`, `001`, `RELAYMSG`).
    pub command: String,
    /// Parameters. The last may have been a trailing param (with spaces).
    pub params: Vec<String>,
}

/// Errors that can occur during message parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
    #[error("tag section present but missing command")]
    MissingAfterTags,
}

impl Message {
    /// Shorthand for a tagless message.
    pub fn new(prefix: Option<String>, command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            tags: Vec::new(),
            prefix,
            command: command.into(),
            params,
        }
    }

    /// Parse a single IRC message from a line (without the trailing `\r\n`).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim_end_matches(['\r', '\n']);

        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        let (tags, input) = match input.strip_prefix('@') {
            Some(tagged) => match tagged.find(' ') {
                Some(idx) => (
                    parse_tags(&tagged[..idx]),
                    tagged[idx + 1..].trim_start_matches(' '),
                ),
                None => return Err(ParseError::MissingAfterTags),
            },
            None => (Vec::new(), input),
        };

        if input.is_empty() {
            return Err(ParseError::MissingAfterTags);
        }

        let (prefix, rest) = if let Some(stripped) = input.strip_prefix(':') {
            // Prefix runs until the first space.
            match stripped.find(' ') {
                Some(idx) => (
                    Some(stripped[..idx].to_owned()),
                    stripped[idx + 1..].trim_start_matches(' '),
                ),
                None => return Err(ParseError::MissingCommand),
            }
        } else {
            (None, input)
        };

        // Split into command and parameter portion.
        let (command, param_str) = match rest.find(' ') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();

        if let Some(mut remaining) = param_str {
            while !remaining.is_empty() {
                if let Some(trailing) = remaining.strip_prefix(':') {
                    // Trailing parameter: everything after the colon, including spaces.
                    params.push(trailing.to_owned());
                    break;
                }
                match remaining.find(' ') {
                    Some(idx) => {
                        params.push(remaining[..idx].to_owned());
                        remaining = remaining[idx + 1..].trim_start_matches(' ');
                    }
                    None => {
                        params.push(remaining.to_owned());
                        break;
                    }
                }
            }
        }

        Ok(Message {
            tags,
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// Look up a tag value. `Some(None)` means the tag is present without a value.
    pub fn tag(&self, key: &str) -> Option<Option<&str>> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref())
    }

    /// Builder-style tag attachment.
    pub fn with_tag(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.tags.push((key.into(), value));
        self
    }

    /// The nick portion of the prefix, if any.
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split(['!', '@']).next().unwrap_or(p))
    }

    /// Serialize to the IRC wire format (without trailing `\r\n`).
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if !self.tags.is_empty() {
            out.push('@');
            for (i, (key, value)) in self.tags.iter().enumerate() {
                if i > 0 {
                    out.push(';');
                }
                out.push_str(key);
                if let Some(value) = value {
                    out.push('=');
                    escape_tag_value(value, &mut out);
                }
            }
            out.push(' ');
        }

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if !self.params.is_empty() {
            let last_idx = self.params.len() - 1;
            for (i, param) in self.params.iter().enumerate() {
                out.push(' ');
                if i == last_idx {
                    // Always prefix the last parameter with `:`.
                    out.push(':');
                }
                out.push_str(param);
            }
        }

        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// Split the tag section (without the leading `@`) into key/value pairs.
fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(';')
        .filter(|t| !t.is_empty())
        .map(|t| match t.split_once('=') {
            Some((key, value)) if !value.is_empty() => {
                (key.to_owned(), Some(unescape_tag_value(value)))
            }
            Some((key, _)) => (key.to_owned(), None),
            None => (t.to_owned(), None),
        })
        .collect()
}

fn escape_tag_value(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            // A lone trailing backslash is dropped.
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Parsing basics ───────────────────────────────────────────

    #[test]
    fn parse_relaymsg_command() {
        let msg = Message::parse("RELAYMSG #chat alice/discord :hello there").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "RELAYMSG");
        assert_eq!(msg.params, vec!["#chat", "alice/discord", "hello there"]);
        assert!(msg.tags.is_empty());
    }

    #[test]
    fn parse_with_prefix() {
        let msg = Message::parse(":wings!user@host PRIVMSG #lagoon :hey friends").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("wings!user@host"));
        assert_eq!(msg.source_nick(), Some("wings"));
        assert_eq!(msg.params, vec!["#lagoon", "hey friends"]);
    }

    #[test]
    fn parse_encap_from_server() {
        let msg = Message::parse(":lon.lagun.co ENCAP * RELAYMSG #chat bob/irc ::)").unwrap();
        assert_eq!(msg.source_nick(), Some("lon.lagun.co"));
        assert_eq!(msg.command, "ENCAP");
        assert_eq!(msg.params, vec!["*", "RELAYMSG", "#chat", "bob/irc", ":)"]);
    }

    #[test]
    fn parse_collapses_repeated_spaces() {
        let msg = Message::parse("MODE  #lagoon  +o wings").unwrap();
        assert_eq!(msg.params, vec!["#lagoon", "+o", "wings"]);
    }

    #[test]
    fn parse_strips_crlf_and_bare_lf() {
        assert_eq!(Message::parse("PING :a\r\n").unwrap().params, vec!["a"]);
        assert_eq!(Message::parse("PING :b\n").unwrap().params, vec!["b"]);
    }

    #[test]
    fn parse_trailing_empty_string() {
        let msg = Message::parse("TOPIC #lagoon :").unwrap();
        assert_eq!(msg.params, vec!["#lagoon", ""]);
    }

    // ── Tags ─────────────────────────────────────────────────────

    #[test]
    fn parse_tags_with_and_without_values() {
        let msg =
            Message::parse("@relaymsg=wings;+draft/typing :a!b@c PRIVMSG #x :hi").unwrap();
        assert_eq!(msg.tag("relaymsg"), Some(Some("wings")));
        assert_eq!(msg.tag("+draft/typing"), Some(None));
        assert_eq!(msg.tag("missing"), None);
        assert_eq!(msg.prefix.as_deref(), Some("a!b@c"));
    }

    #[test]
    fn tag_values_are_unescaped() {
        let msg = Message::parse(r"@k=a\sb\:c\\d PING").unwrap();
        assert_eq!(msg.tag("k"), Some(Some(r"a b;c\d")));
    }

    #[test]
    fn tag_values_are_escaped_on_the_wire() {
        let msg = Message::new(None, "PING", vec![]).with_tag("k", Some("a b;c".into()));
        assert_eq!(msg.to_wire(), r"@k=a\sb\:c PING");
        assert_eq!(Message::parse(&msg.to_wire()).unwrap(), msg);
    }

    #[test]
    fn empty_tag_value_reads_as_absent() {
        let msg = Message::parse("@k= PING").unwrap();
        assert_eq!(msg.tag("k"), Some(None));
    }

    // ── Parse errors ─────────────────────────────────────────────

    #[test]
    fn parse_empty_input() {
        assert_eq!(Message::parse(""), Err(ParseError::Empty));
    }

    #[test]
    fn parse_prefix_only() {
        assert_eq!(Message::parse(":prefix_only"), Err(ParseError::MissingCommand));
    }

    #[test]
    fn parse_tags_only() {
        assert_eq!(Message::parse("@a=b"), Err(ParseError::MissingAfterTags));
    }

    // ── Serialization ────────────────────────────────────────────

    #[test]
    fn serialize_tagged_privmsg() {
        let msg = Message::new(
            Some("alice/discord!relay@lagoon.lagun.co".into()),
            "PRIVMSG",
            vec!["#chat".into(), "hello there".into()],
        )
        .with_tag("relaymsg", Some("wings".into()));
        assert_eq!(
            msg.to_wire(),
            "@relaymsg=wings :alice/discord!relay@lagoon.lagun.co PRIVMSG #chat :hello there"
        );
    }

    #[test]
    fn serialize_without_params() {
        assert_eq!(Message::new(None, "QUIT", vec![]).to_wire(), "QUIT");
    }
}
