//! Server-to-client ASCII control lines and the channel capability bitmask
//! (§6 "Server-to-client control messages", "Channel capability bits").

use bitflags::bitflags;
use nom::branch::alt;
use nom::bytes::complete::{is_not, tag, take_while1};
use nom::character::complete::{char, space0, space1};
use nom::combinator::{map, opt, rest, value};
use nom::sequence::{delimited, preceded};
use nom::IResult;
use thiserror::Error;

bitflags! {
    /// Observable channel capability bits (§6).
    #[derive(Default)]
    pub struct CapabilityBits: u32 {
        const DONT_ALLOW_STARTING_FILE_BACKUPS  = 0x0000_0001;
        const DONT_ALLOW_STARTING_IMAGE_BACKUPS = 0x0000_0002;
        const DONT_SHOW_SETTINGS                = 0x0000_0004;
        const DONT_ALLOW_PAUSE                  = 0x0000_0008;
        const ALLOW_TOKEN_AUTHENTICATION        = 0x0000_0010;
        const DONT_ALLOW_FILE_RESTORE           = 0x0000_0020;
        const DONT_ALLOW_COMPONENT_RESTORE      = 0x0000_0040;
        const STATUS_NO_COMPONENTS              = 0x0000_0080;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("malformed control line: {0:?}")]
    Malformed(String),
    #[error("unknown compression algorithm {0:?}")]
    UnknownCompression(String),
}

/// §4.4/§4.6 incremental-vs-full selector shared by `START BACKUP` and
/// `START IMAGE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Incremental,
    Full,
}

/// §6 `ENC?compress=<zlib|zstd>` algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressAlgo {
    Zlib,
    Zstd,
}

/// §6 "upgrade the pipe to authenticated AEAD and/or compression" params.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncParams {
    pub compress: Option<CompressAlgo>,
    pub compress_level: Option<i32>,
    pub keyadd: Option<Vec<u8>>,
}

/// One parsed server<->client control line (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    AddIdentity(String),
    GetChallenge,
    Signature(String),
    Enc(EncParams),
    StartBackup(BackupKind),
    StartImage(BackupKind),
    StartSc(String),
    StopSc(String),
    DidBackup,
    BackupFailed(String),
    PingRunning(String),
    DownloadFiles(String),
    DownloadImage(String),
    FileRestore(String),
    Ping,
    Pong,
    Capa(CapabilityBits),
}

/// Parse one ASCII control line (no trailing newline expected).
pub fn parse_line(line: &str) -> Result<ControlMessage, ProtoError> {
    let line = line.trim_end_matches(['\r', '\n']);
    match alt((
        parse_ping,
        parse_pong,
        parse_did_backup,
        parse_get_challenge,
        parse_add_identity,
        parse_signature,
        parse_enc,
        parse_start_backup,
        parse_start_image,
        parse_start_sc,
        parse_stop_sc,
        parse_backup_failed,
        parse_ping_running,
        parse_download_files,
        parse_download_image,
        parse_file_restore,
        parse_capa,
    ))(line)
    {
        Ok((_, msg)) => Ok(msg),
        Err(_) => Err(ProtoError::Malformed(line.to_string())),
    }
}

fn rest_of_line(input: &str) -> IResult<&str, String> {
    map(rest, |s: &str| s.to_string())(input)
}

fn quoted(input: &str) -> IResult<&str, String> {
    map(
        delimited(char('"'), is_not("\""), char('"')),
        |s: &str| s.to_string(),
    )(input)
}

fn parse_ping(input: &str) -> IResult<&str, ControlMessage> {
    value(ControlMessage::Ping, tag("PING"))(input)
}

fn parse_pong(input: &str) -> IResult<&str, ControlMessage> {
    value(ControlMessage::Pong, tag("PONG"))(input)
}

fn parse_did_backup(input: &str) -> IResult<&str, ControlMessage> {
    value(ControlMessage::DidBackup, tag("DID BACKUP"))(input)
}

fn parse_get_challenge(input: &str) -> IResult<&str, ControlMessage> {
    value(ControlMessage::GetChallenge, tag("GET CHALLENGE"))(input)
}

fn parse_add_identity(input: &str) -> IResult<&str, ControlMessage> {
    map(
        preceded(tag("ADD IDENTITY"), preceded(space1, rest_of_line)),
        ControlMessage::AddIdentity,
    )(input)
}

fn parse_signature(input: &str) -> IResult<&str, ControlMessage> {
    map(
        preceded(tag("SIGNATURE"), preceded(space1, rest_of_line)),
        ControlMessage::Signature,
    )(input)
}

fn parse_backup_failed(input: &str) -> IResult<&str, ControlMessage> {
    map(
        preceded(tag("BACKUP FAILED"), preceded(space0, rest_of_line)),
        ControlMessage::BackupFailed,
    )(input)
}

fn parse_ping_running(input: &str) -> IResult<&str, ControlMessage> {
    map(
        preceded(tag("2PING RUNNING"), preceded(space0, rest_of_line)),
        ControlMessage::PingRunning,
    )(input)
}

fn parse_download_files(input: &str) -> IResult<&str, ControlMessage> {
    map(
        preceded(tag("DOWNLOAD FILES"), preceded(space0, rest_of_line)),
        ControlMessage::DownloadFiles,
    )(input)
}

fn parse_download_image(input: &str) -> IResult<&str, ControlMessage> {
    map(
        preceded(tag("DOWNLOAD IMAGE"), preceded(space0, rest_of_line)),
        ControlMessage::DownloadImage,
    )(input)
}

fn parse_file_restore(input: &str) -> IResult<&str, ControlMessage> {
    map(
        preceded(tag("FILE RESTORE"), preceded(space0, rest_of_line)),
        ControlMessage::FileRestore,
    )(input)
}

fn parse_backup_kind(input: &str) -> IResult<&str, BackupKind> {
    alt((
        value(BackupKind::Incremental, tag("INCR")),
        value(BackupKind::Full, tag("FULL")),
    ))(input)
}

fn parse_start_backup(input: &str) -> IResult<&str, ControlMessage> {
    map(
        preceded(tag("START BACKUP"), preceded(space1, parse_backup_kind)),
        ControlMessage::StartBackup,
    )(input)
}

fn parse_start_image(input: &str) -> IResult<&str, ControlMessage> {
    map(
        preceded(tag("START IMAGE"), preceded(space1, parse_backup_kind)),
        ControlMessage::StartImage,
    )(input)
}

fn parse_start_sc(input: &str) -> IResult<&str, ControlMessage> {
    map(
        preceded(tag("START SC"), preceded(space1, quoted)),
        ControlMessage::StartSc,
    )(input)
}

fn parse_stop_sc(input: &str) -> IResult<&str, ControlMessage> {
    map(
        preceded(tag("STOP SC"), preceded(space1, quoted)),
        ControlMessage::StopSc,
    )(input)
}

fn parse_capa(input: &str) -> IResult<&str, ControlMessage> {
    map(
        preceded(tag("CAPA"), preceded(space1, take_while1(|c: char| c.is_ascii_hexdigit()))),
        |bits: &str| {
            let value = u32::from_str_radix(bits, 16).unwrap_or(0);
            ControlMessage::Capa(CapabilityBits::from_bits_truncate(value))
        },
    )(input)
}

/// §6 `ENC?compress=<zlib|zstd>&compress_level=<int>[&keyadd=<b64>]` —
/// parsed as an ordinary query string via `url::form_urlencoded`.
fn parse_enc(input: &str) -> IResult<&str, ControlMessage> {
    let (remainder, _) = tag("ENC")(input)?;
    let (remainder, query) = opt(preceded(char('?'), rest))(remainder)?;
    let mut params = EncParams::default();
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "compress" => {
                    params.compress = match value.as_ref() {
                        "zlib" => Some(CompressAlgo::Zlib),
                        "zstd" => Some(CompressAlgo::Zstd),
                        _ => None,
                    };
                }
                "compress_level" => params.compress_level = value.parse().ok(),
                "keyadd" => params.keyadd = base64::decode(value.as_ref()).ok(),
                _ => {}
            }
        }
    }
    Ok((remainder, ControlMessage::Enc(params)))
}

/// Serialize a [`ControlMessage`] back to its wire form (round-trip with
/// [`parse_line`]).
pub fn to_line(msg: &ControlMessage) -> String {
    match msg {
        ControlMessage::AddIdentity(id) => format!("ADD IDENTITY {}", id),
        ControlMessage::GetChallenge => "GET CHALLENGE".to_string(),
        ControlMessage::Signature(sig) => format!("SIGNATURE {}", sig),
        ControlMessage::Enc(params) => {
            let mut pairs: Vec<(&str, String)> = Vec::new();
            if let Some(algo) = params.compress {
                pairs.push((
                    "compress",
                    match algo {
                        CompressAlgo::Zlib => "zlib".to_string(),
                        CompressAlgo::Zstd => "zstd".to_string(),
                    },
                ));
            }
            if let Some(level) = params.compress_level {
                pairs.push(("compress_level", level.to_string()));
            }
            if let Some(key) = &params.keyadd {
                pairs.push(("keyadd", base64::encode(key)));
            }
            if pairs.is_empty() {
                "ENC".to_string()
            } else {
                let query: String = pairs
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join("&");
                format!("ENC?{}", query)
            }
        }
        ControlMessage::StartBackup(kind) => format!("START BACKUP {}", kind_str(*kind)),
        ControlMessage::StartImage(kind) => format!("START IMAGE {}", kind_str(*kind)),
        ControlMessage::StartSc(letter) => format!("START SC \"{}\"", letter),
        ControlMessage::StopSc(letter) => format!("STOP SC \"{}\"", letter),
        ControlMessage::DidBackup => "DID BACKUP".to_string(),
        ControlMessage::BackupFailed(reason) => format!("BACKUP FAILED {}", reason),
        ControlMessage::PingRunning(details) => format!("2PING RUNNING {}", details),
        ControlMessage::DownloadFiles(args) => format!("DOWNLOAD FILES {}", args),
        ControlMessage::DownloadImage(args) => format!("DOWNLOAD IMAGE {}", args),
        ControlMessage::FileRestore(args) => format!("FILE RESTORE {}", args),
        ControlMessage::Ping => "PING".to_string(),
        ControlMessage::Pong => "PONG".to_string(),
        ControlMessage::Capa(bits) => format!("CAPA {:x}", bits.bits()),
    }
}

fn kind_str(kind: BackupKind) -> &'static str {
    match kind {
        BackupKind::Incremental => "INCR",
        BackupKind::Full => "FULL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_pong_roundtrip() {
        assert_eq!(parse_line("PING").unwrap(), ControlMessage::Ping);
        assert_eq!(parse_line("PONG").unwrap(), ControlMessage::Pong);
    }

    #[test]
    fn start_backup_roundtrips() {
        let msg = ControlMessage::StartBackup(BackupKind::Incremental);
        let line = to_line(&msg);
        assert_eq!(line, "START BACKUP INCR");
        assert_eq!(parse_line(&line).unwrap(), msg);
    }

    #[test]
    fn start_sc_parses_quoted_letter() {
        assert_eq!(
            parse_line("START SC \"C\"").unwrap(),
            ControlMessage::StartSc("C".to_string())
        );
    }

    #[test]
    fn enc_parses_query_params() {
        let msg = parse_line("ENC?compress=zstd&compress_level=5").unwrap();
        assert_eq!(
            msg,
            ControlMessage::Enc(EncParams {
                compress: Some(CompressAlgo::Zstd),
                compress_level: Some(5),
                keyadd: None,
            })
        );
    }

    #[test]
    fn enc_roundtrips_keyadd() {
        let msg = ControlMessage::Enc(EncParams {
            compress: Some(CompressAlgo::Zlib),
            compress_level: Some(3),
            keyadd: Some(vec![1, 2, 3, 4]),
        });
        let line = to_line(&msg);
        assert_eq!(parse_line(&line).unwrap(), msg);
    }

    #[test]
    fn capa_roundtrips_bits() {
        let bits = CapabilityBits::DONT_ALLOW_PAUSE | CapabilityBits::ALLOW_TOKEN_AUTHENTICATION;
        let msg = ControlMessage::Capa(bits);
        let line = to_line(&msg);
        assert_eq!(parse_line(&line).unwrap(), msg);
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(parse_line("NOT A REAL COMMAND").is_err());
    }
}
