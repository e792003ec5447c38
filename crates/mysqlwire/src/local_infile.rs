//! `LOAD DATA LOCAL INFILE` support.
//!
//! The server answers such a query with a `0xFB` packet naming a file. The
//! client either streams the file as packets followed by an empty packet, or
//! refuses by sending the empty packet at once. Either way the server then
//! replies with OK or ERR, which ends the command.
//!
//! # Security
//!
//! A malicious server can ask for any file, so requests are checked against
//! the configured [`LocalInfilePolicy`] before anything is opened.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::config::LocalInfilePolicy;
use crate::exchange::{Exchange, Step};
use crate::protocol::{OkPacket, PacketType, parse_err, parse_ok, unexpected};
use mysqlwire_core::{Error, Result, UsageErrorKind};

/// Size of each packet of file content.
pub const CHUNK_SIZE: usize = 64 * 1024;

fn refused(message: String) -> Error {
    Error::usage(UsageErrorKind::InvalidArgument, message)
}

/// Resolve a server-requested file name against the policy.
///
/// With [`LocalInfilePolicy::InPath`] the file must be a regular file, must
/// not be a symlink, must not contain `..`, and must resolve to a location
/// below the base directory. Relative names are taken relative to the base.
pub fn resolve_path(policy: &LocalInfilePolicy, requested: &str) -> Result<PathBuf> {
    if requested.is_empty() {
        return Err(refused("server requested an empty file name".into()));
    }
    let path = Path::new(requested);
    match policy {
        LocalInfilePolicy::Disabled => Err(refused(
            "LOAD DATA LOCAL INFILE is disabled by the client".into(),
        )),
        LocalInfilePolicy::Anywhere => Ok(path.to_path_buf()),
        LocalInfilePolicy::InPath(base) => {
            if path.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(refused(format!("'{requested}' contains a parent directory")));
            }
            let base = base.canonicalize().map_err(|e| {
                refused(format!("local infile directory '{}': {e}", base.display()))
            })?;
            let candidate = if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            };
            let metadata = std::fs::symlink_metadata(&candidate)
                .map_err(|e| refused(format!("'{requested}': {e}")))?;
            if metadata.file_type().is_symlink() {
                return Err(refused(format!("'{requested}' is a symbolic link")));
            }
            if !metadata.is_file() {
                return Err(refused(format!("'{requested}' is not a regular file")));
            }
            let resolved = candidate
                .canonicalize()
                .map_err(|e| refused(format!("'{requested}': {e}")))?;
            if !resolved.starts_with(&base) {
                return Err(refused(format!(
                    "'{requested}' is outside of '{}'",
                    base.display()
                )));
            }
            Ok(resolved)
        }
    }
}

enum State {
    Start,
    Streaming(File),
    AwaitReply,
    Done,
}

/// Answers one local infile request.
pub struct LocalInfileSender {
    state: State,
    filename: String,
    /// Why the request was refused, or why streaming stopped early
    failure: Option<Error>,
    refused: bool,
    sent_bytes: u64,
}

impl std::fmt::Debug for LocalInfileSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalInfileSender")
            .field("filename", &self.filename)
            .field("sent_bytes", &self.sent_bytes)
            .finish_non_exhaustive()
    }
}

impl LocalInfileSender {
    /// Check the request and open the file. Nothing is read yet, and a refused
    /// request never touches the file.
    pub fn new(policy: &LocalInfilePolicy, filename: &str) -> Self {
        let opened = resolve_path(policy, filename).and_then(|path| {
            File::open(&path).map_err(|e| refused(format!("cannot open '{filename}': {e}")))
        });
        let (state, failure) = match opened {
            Ok(file) => (State::Streaming(file), None),
            Err(e) => {
                warn!(file = %filename, error = %e, "Refusing local infile request");
                (State::Start, Some(e))
            }
        };
        Self {
            state,
            filename: filename.to_string(),
            refused: failure.is_some(),
            failure,
            sent_bytes: 0,
        }
    }

    /// Whether the request was refused before reading.
    pub fn is_refused(&self) -> bool {
        self.refused
    }

    fn next_chunk(&mut self, mut file: File) -> Step<OkPacket> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        match file.read(&mut chunk) {
            Ok(0) => {
                debug!(file = %self.filename, bytes = self.sent_bytes, "Local infile sent");
                self.state = State::AwaitReply;
                Step::Send(Vec::new())
            }
            Ok(n) => {
                chunk.truncate(n);
                self.sent_bytes += n as u64;
                self.state = State::Streaming(file);
                Step::Send(chunk)
            }
            Err(e) => {
                // the empty packet still has to go out to keep the exchange in step
                warn!(file = %self.filename, error = %e, "Local infile read failed");
                self.failure = Some(Error::data(format!(
                    "failed reading '{}': {e}",
                    self.filename
                )));
                self.state = State::AwaitReply;
                Step::Send(Vec::new())
            }
        }
    }
}

impl Exchange for LocalInfileSender {
    type Output = OkPacket;

    fn resume(&mut self, packet: Option<Vec<u8>>) -> Result<Step<OkPacket>> {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Start => {
                self.state = State::AwaitReply;
                Ok(Step::Send(Vec::new()))
            }
            State::Streaming(file) => Ok(self.next_chunk(file)),
            State::AwaitReply => {
                let Some(payload) = packet else {
                    self.state = State::AwaitReply;
                    return Ok(Step::Receive);
                };
                match PacketType::of(&payload) {
                    PacketType::Error => Err(parse_err(&payload)?.into_error()),
                    PacketType::Ok => match self.failure.take() {
                        Some(err) if !self.refused => Err(err),
                        _ => Ok(Step::Done(parse_ok(&payload)?)),
                    },
                    _ => Err(unexpected("awaiting the local infile reply", &payload)),
                }
            }
            State::Done => Err(Error::protocol("local infile exchange already finished")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{err_payload, ok_payload};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mysqlwire-infile-{}-{}",
            name,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn drive(sender: &mut LocalInfileSender, reply: Vec<u8>) -> (Vec<Vec<u8>>, Result<OkPacket>) {
        let mut sent = Vec::new();
        let mut reply = Some(reply);
        let mut input = None;
        loop {
            match sender.resume(input.take()) {
                Ok(Step::Send(p)) => sent.push(p),
                Ok(Step::Receive) => input = reply.take(),
                Ok(Step::Done(ok)) => return (sent, Ok(ok)),
                Ok(Step::StartTls) => panic!("unexpected TLS"),
                Err(e) => return (sent, Err(e)),
            }
        }
    }

    #[test]
    fn test_disabled_policy_sends_empty_packet() {
        let mut sender = LocalInfileSender::new(&LocalInfilePolicy::Disabled, "/etc/passwd");
        assert!(sender.is_refused());
        let (sent, result) = drive(
            &mut sender,
            err_payload(1148, "42000", "The used command is not allowed"),
        );
        assert_eq!(sent, vec![Vec::<u8>::new()]);
        assert_eq!(result.unwrap_err().server_code(), Some(1148));
    }

    #[test]
    fn test_streams_file_in_chunks() {
        let dir = scratch_dir("stream");
        let path = dir.join("data.csv");
        let content: Vec<u8> = (0..CHUNK_SIZE + 10).map(|i| b'a' + (i % 26) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let mut sender = LocalInfileSender::new(
            &LocalInfilePolicy::InPath(dir.clone()),
            path.to_str().unwrap(),
        );
        assert!(!sender.is_refused());
        let (sent, result) = drive(&mut sender, ok_payload(2, 0, 2, 0));
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].len(), CHUNK_SIZE);
        assert_eq!(sent[1].len(), 10);
        assert!(sent[2].is_empty());
        assert_eq!(sent.concat(), content);
        assert_eq!(result.unwrap().affected_rows, 2);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_in_path_policy_rules() {
        let dir = scratch_dir("policy");
        std::fs::write(dir.join("ok.txt"), b"1\n").unwrap();
        let policy = LocalInfilePolicy::InPath(dir.clone());

        assert!(resolve_path(&policy, "ok.txt").is_ok());
        assert!(resolve_path(&policy, dir.join("ok.txt").to_str().unwrap()).is_ok());
        assert!(resolve_path(&policy, "../ok.txt").is_err());
        assert!(resolve_path(&policy, "missing.txt").is_err());
        assert!(resolve_path(&policy, "").is_err());
        // a directory is not a regular file
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        assert!(resolve_path(&policy, "sub").is_err());

        let outside = std::env::temp_dir().join(format!("mysqlwire-outside-{}", std::process::id()));
        std::fs::write(&outside, b"secret").unwrap();
        assert!(resolve_path(&policy, outside.to_str().unwrap()).is_err());

        #[cfg(unix)]
        {
            let link = dir.join("link.txt");
            std::os::unix::fs::symlink(dir.join("ok.txt"), &link).ok();
            assert!(resolve_path(&policy, "link.txt").is_err());
        }

        std::fs::remove_file(outside).ok();
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_anywhere_policy() {
        let policy = LocalInfilePolicy::Anywhere;
        assert_eq!(
            resolve_path(&policy, "/tmp/x.csv").unwrap(),
            PathBuf::from("/tmp/x.csv")
        );
        // a missing file is refused with the empty packet
        let mut sender = LocalInfileSender::new(&policy, "/nonexistent/mysqlwire.csv");
        assert!(sender.is_refused());
        let (sent, result) = drive(&mut sender, err_payload(2, "HY000", "File not found"));
        assert_eq!(sent, vec![Vec::<u8>::new()]);
        assert!(matches!(result, Err(Error::Server(_))));
    }
}
