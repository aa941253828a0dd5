//! File-list wire format the restore engine (`restore::mod`) emits and the
//! client-side restore download (`restoreclient::mod`) parses (§6
//! "File-list wire format").
//!
//! Each line names one directory-open, directory-close, or file entry:
//! `d"name" 0 0`, `d".." 0 0`, or `f"name" <size> <mtime>(k=v&k2=v2)`. The
//! parenthesized extras carry the sidecar metadata a restore client needs
//! before it asks for content: `orig_path`, `sha` (content hash), `thash`
//! (rolling/patch hash), `server_path` (`clientdl<N>`-relative),
//! `share_path`, and the `single_item` flag.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag};
use nom::character::complete::{char, digit1, space1};
use nom::combinator::{map, map_res, opt, value};
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileListError {
    #[error("malformed file-list entry: {0:?}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEntryKind {
    File,
    DirOpen,
    /// Closes the most recently opened directory; always serialized as the
    /// literal name `..` with size/mtime `0`.
    DirClose,
}

/// One line of a restore file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEntry {
    pub kind: WireEntryKind,
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub extra: BTreeMap<String, String>,
}

impl WireEntry {
    pub fn dir_open(name: impl Into<String>) -> Self {
        WireEntry {
            kind: WireEntryKind::DirOpen,
            name: name.into(),
            size: 0,
            mtime: 0,
            extra: BTreeMap::new(),
        }
    }

    pub fn dir_close() -> Self {
        WireEntry {
            kind: WireEntryKind::DirClose,
            name: "..".to_string(),
            size: 0,
            mtime: 0,
            extra: BTreeMap::new(),
        }
    }

    pub fn file(name: impl Into<String>, size: u64, mtime: i64) -> Self {
        WireEntry {
            kind: WireEntryKind::File,
            name: name.into(),
            size,
            mtime,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<String>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

/// Serialize one entry to its wire line (no trailing newline).
pub fn serialize(entry: &WireEntry) -> String {
    let tchar = match entry.kind {
        WireEntryKind::File => 'f',
        WireEntryKind::DirOpen | WireEntryKind::DirClose => 'd',
    };
    let mut line = format!(
        "{}\"{}\" {} {}",
        tchar,
        escape_name(&entry.name),
        entry.size,
        entry.mtime
    );
    if !entry.extra.is_empty() {
        let params: Vec<String> = entry
            .extra
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let _ = write!(line, "({})", params.join("&"));
    }
    line
}

fn quoted_name(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        map(
            opt(escaped_transform(
                is_not("\\\""),
                '\\',
                alt((value("\"", char('"')), value("\\", char('\\')))),
            )),
            |s: Option<String>| s.unwrap_or_default(),
        ),
        char('"'),
    )(input)
}

fn signed_i64(input: &str) -> IResult<&str, i64> {
    map_res(
        pair(opt(char('-')), digit1),
        |(sign, digits): (Option<char>, &str)| {
            let value: i64 = digits.parse().map_err(|_| ())?;
            Ok::<i64, ()>(if sign.is_some() { -value } else { value })
        },
    )(input)
}

fn extras(input: &str) -> IResult<&str, BTreeMap<String, String>> {
    map(
        opt(delimited(char('('), is_not(")"), char(')'))),
        |body: Option<&str>| {
            let mut map = BTreeMap::new();
            if let Some(body) = body {
                for pair in body.split('&') {
                    if pair.is_empty() {
                        continue;
                    }
                    if let Some((k, v)) = pair.split_once('=') {
                        map.insert(k.to_string(), v.to_string());
                    } else {
                        map.insert(pair.to_string(), String::new());
                    }
                }
            }
            map
        },
    )(input)
}

/// Parse one wire line into a [`WireEntry`].
pub fn parse(line: &str) -> Result<WireEntry, FileListError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let parsed = tuple((
        alt((char('f'), char('d'))),
        quoted_name,
        preceded(space1, signed_i64),
        preceded(space1, signed_i64),
        extras,
    ))(line);

    match parsed {
        Ok((remainder, (tchar, name, size, mtime, extra))) if remainder.is_empty() => {
            let kind = if tchar == 'f' {
                WireEntryKind::File
            } else if name == ".." {
                WireEntryKind::DirClose
            } else {
                WireEntryKind::DirOpen
            };
            Ok(WireEntry {
                kind,
                name,
                size: size.max(0) as u64,
                mtime,
                extra,
            })
        }
        _ => Err(FileListError::Malformed(line.to_string())),
    }
}
