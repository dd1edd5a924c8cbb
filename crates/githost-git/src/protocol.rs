//! Git smart HTTP protocol implementation.
//!
//! Implements the git smart HTTP protocol for fetch and push operations.
//! See: https://git-scm.com/docs/http-protocol
//!
//! One [`ProtocolEngine`] serves one HTTP request. It moves through
//! [`SessionState`] in order and refuses out-of-order calls. Every request
//! section is parsed before the first response byte is written, so a
//! malformed request produces an error and no output.

use crate::config::ProtocolConfig;
use crate::negotiate::{Acknowledgement, NegotiationSession, NegotiationState};
use crate::pack::{PackDecoder, PackEncoder, PackLimits};
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::sideband::{write_band, Band, SidebandWriter};
use crate::walk::ReachabilityWalker;
use crate::{GitError, Result};
use githost_storage::{
    validate_ref_name, HashAlgorithm, Object, ObjectId, ObjectType, RefUpdate, Repository,
    StorageError,
};
use std::collections::BTreeSet;
use std::fmt;
use std::io::{BufRead, Write};
use tokio_util::sync::CancellationToken;

/// Agent string sent in every capability list.
pub const AGENT: &str = concat!("agent=githost/", env!("CARGO_PKG_VERSION"));

/// The two smart HTTP services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Fetch and clone.
    UploadPack,
    /// Push.
    ReceivePack,
}

impl Service {
    /// Wire name, e.g. `git-upload-pack`.
    pub fn name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Parses a wire name as found in `?service=` or the request path.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    /// Capabilities advertised on the first ref line.
    pub fn capabilities(self, algorithm: HashAlgorithm) -> String {
        let base = match self {
            Self::UploadPack => "side-band-64k ofs-delta no-progress",
            Self::ReceivePack => "report-status delete-refs side-band-64k quiet ofs-delta",
        };
        let mut caps = format!("{} {}", base, AGENT);
        if algorithm == HashAlgorithm::Sha256 {
            caps.push_str(" object-format=sha256");
        }
        caps
    }

    /// Content type of the `info/refs` response.
    pub fn advertisement_content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-advertisement",
            Self::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    /// Content type of the service POST response.
    pub fn result_content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-result",
            Self::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of one protocol session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// About to write the ref advertisement.
    AdvertisingRefs,
    /// Waiting for the client's request body.
    AwaitingRequest,
    /// Reading push commands and the pack.
    ReceivingPack,
    /// Reading wants and haves.
    Negotiating,
    /// Writing the response.
    Responding,
    /// Finished normally.
    Done,
    /// Aborted.
    Failed(String),
}

impl SessionState {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

/// A ref update command from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Old object ID (zeros for create).
    pub old_id: ObjectId,
    /// New object ID (zeros for delete).
    pub new_id: ObjectId,
    /// Reference name as sent, e.g. `refs/heads/main`.
    pub ref_name: String,
}

impl Command {
    /// Parses `<old> <new> <refname>`.
    pub fn parse(line: &str, algorithm: HashAlgorithm) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(GitError::protocol(format!("malformed command {:?}", line)));
        };
        let parse = |hex: &str| {
            ObjectId::from_hex_with(hex, algorithm)
                .map_err(|e| GitError::protocol(format!("bad object id {:?}: {}", hex, e)))
        };
        if name.is_empty() {
            return Err(GitError::protocol("command without ref name"));
        }
        Ok(Self {
            old_id: parse(old)?,
            new_id: parse(new)?,
            ref_name: name.to_string(),
        })
    }

    /// Checks if this is a create command.
    pub fn is_create(&self) -> bool {
        self.old_id.is_null()
    }

    /// Checks if this is a delete command.
    pub fn is_delete(&self) -> bool {
        self.new_id.is_null()
    }

    fn expected_old(&self) -> Option<ObjectId> {
        (!self.old_id.is_null()).then_some(self.old_id)
    }
}

/// Per-ref outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefStatus {
    /// The ref was updated.
    Ok,
    /// The ref was left alone, with the reason sent to the client.
    Rejected(String),
}

impl RefStatus {
    fn rejected(reason: &str) -> Self {
        Self::Rejected(reason.to_string())
    }
}

/// The report-status of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    /// `None` for `unpack ok`, otherwise the error text.
    pub unpack_error: Option<String>,
    /// One entry per command, in request order.
    pub statuses: Vec<(Command, RefStatus)>,
    /// Objects written from the pack.
    pub objects_received: usize,
}

impl ReceiveReport {
    /// True when the pack unpacked and every ref was updated.
    pub fn is_success(&self) -> bool {
        self.unpack_error.is_none() && self.statuses.iter().all(|(_, s)| *s == RefStatus::Ok)
    }

    /// The report as pkt-lines, flush included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = PktLineWriter::new(Vec::new());
        match &self.unpack_error {
            None => writer.write_line("unpack ok")?,
            Some(err) => writer.write_line(&format!("unpack {}", err))?,
        }
        for (cmd, status) in &self.statuses {
            match status {
                RefStatus::Ok => writer.write_line(&format!("ok {}", cmd.ref_name))?,
                RefStatus::Rejected(reason) => {
                    writer.write_line(&format!("ng {} {}", cmd.ref_name, reason))?
                }
            }
        }
        writer.flush_pkt()?;
        Ok(writer.into_inner())
    }
}

/// What an upload-pack request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    /// Acknowledgements sent, in order.
    pub acknowledgements: Vec<Acknowledgement>,
    /// Objects in the pack, or `None` when no pack was sent.
    pub objects_sent: Option<usize>,
}

/// The smart HTTP state machine for one request against one repository.
pub struct ProtocolEngine<'a> {
    repo: &'a Repository,
    service: Service,
    state: SessionState,
    limits: PackLimits,
    unpack_limit: usize,
    cancel: CancellationToken,
}

impl<'a> ProtocolEngine<'a> {
    /// An engine that starts by advertising refs (`GET info/refs`).
    pub fn new(repo: &'a Repository, service: Service) -> Self {
        let defaults = ProtocolConfig::default();
        Self {
            repo,
            service,
            state: SessionState::AdvertisingRefs,
            limits: defaults.pack_limits(),
            unpack_limit: defaults.unpack_limit,
            cancel: CancellationToken::new(),
        }
    }

    /// An engine for a stateless service POST, which skips the
    /// advertisement.
    pub fn for_request(repo: &'a Repository, service: Service) -> Self {
        Self {
            state: SessionState::AwaitingRequest,
            ..Self::new(repo, service)
        }
    }

    /// Applies limits from configuration.
    pub fn with_config(mut self, config: &ProtocolConfig) -> Self {
        self.limits = config.pack_limits();
        self.unpack_limit = config.unpack_limit;
        self
    }

    /// Checked before any ref is touched.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The service this engine speaks.
    pub fn service(&self) -> Service {
        self.service
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        use SessionState::*;
        let allowed = match (&self.state, &next) {
            (AdvertisingRefs, AwaitingRequest) => true,
            (AwaitingRequest, ReceivingPack) => self.service == Service::ReceivePack,
            (AwaitingRequest, Negotiating) => self.service == Service::UploadPack,
            (ReceivingPack | Negotiating, Responding) => true,
            (Responding, Done) => true,
            (current, Failed(_)) => !current.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(GitError::protocol(format!(
                "{} cannot go from {:?} to {:?}",
                self.service, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, err: GitError) -> GitError {
        tracing::warn!(repo = %self.repo.key, service = %self.service, error = %err, "session failed");
        if !self.state.is_terminal() {
            self.state = SessionState::Failed(err.to_string());
        }
        err
    }

    /// Writes the ref advertisement for `GET info/refs?service=...`.
    pub fn advertise<W: Write>(&mut self, out: W) -> Result<()> {
        if self.state != SessionState::AdvertisingRefs {
            return Err(GitError::protocol(format!(
                "cannot advertise refs in state {:?}",
                self.state
            )));
        }
        match self.write_advertisement(out) {
            Ok(()) => self.transition(SessionState::AwaitingRequest),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn write_advertisement<W: Write>(&self, out: W) -> Result<()> {
        let algorithm = self.repo.algorithm();
        let refs = self.repo.refs.list()?;
        let head = match self.repo.refs.resolve_head() {
            Ok(id) => Some(id),
            Err(StorageError::RefNotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let mut lines: Vec<(ObjectId, String)> = Vec::with_capacity(refs.len() + 1);
        if let Some(id) = head {
            lines.push((id, "HEAD".to_string()));
        }
        for (name, id) in &refs {
            lines.push((*id, name.full_name()));
            if self.service == Service::UploadPack {
                if let Some(peeled) = self.peel(*id)? {
                    lines.push((peeled, format!("{}^{{}}", name.full_name())));
                }
            }
        }

        let caps = self.service.capabilities(algorithm);
        let mut writer = PktLineWriter::new(out);
        writer.write_line(&format!("# service={}", self.service.name()))?;
        writer.flush_pkt()?;
        match lines.split_first() {
            Some(((id, name), rest)) => {
                writer.write_data(format!("{} {}\0{}\n", id, name, caps).as_bytes())?;
                for (id, name) in rest {
                    writer.write_line(&format!("{} {}", id, name))?;
                }
            }
            None => {
                let null = algorithm.null_id();
                writer.write_data(format!("{} capabilities^{{}}\0{}\n", null, caps).as_bytes())?;
            }
        }
        writer.flush_pkt()?;
        writer.flush()?;

        tracing::debug!(repo = %self.repo.key, service = %self.service, refs = lines.len(), "advertised refs");
        Ok(())
    }

    /// The non-tag object an annotated tag finally points at.
    fn peel(&self, id: ObjectId) -> Result<Option<ObjectId>> {
        if self.repo.objects.object_type(&id)? != ObjectType::Tag {
            return Ok(None);
        }
        let mut current = id;
        while let Object::Tag(tag) = self.repo.objects.read(&current)? {
            current = tag.target;
        }
        Ok(Some(current))
    }

    /// Serves `POST git-receive-pack`: commands, pack, ref updates, report.
    pub fn receive_pack<R: BufRead, W: Write>(&mut self, input: R, out: W) -> Result<ReceiveReport> {
        self.transition(SessionState::ReceivingPack)?;
        match self.run_receive(input, out) {
            Ok(report) => {
                self.transition(SessionState::Done)?;
                Ok(report)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn run_receive<R: BufRead, W: Write>(&mut self, input: R, mut out: W) -> Result<ReceiveReport> {
        let repo = self.repo;
        let algorithm = repo.algorithm();
        let mut reader = PktLineReader::new(input);
        let mut commands = Vec::new();
        let mut client_caps = BTreeSet::new();

        loop {
            match reader.read()? {
                Some(PktLine::Flush) => break,
                Some(PktLine::Data(data)) => {
                    let (line, caps) = match data.iter().position(|b| *b == 0) {
                        Some(nul) => (&data[..nul], Some(&data[nul + 1..])),
                        None => (&data[..], None),
                    };
                    let line = std::str::from_utf8(line)
                        .map_err(|_| GitError::protocol("command is not utf-8"))?
                        .trim_end_matches('\n');
                    if commands.is_empty() {
                        if let Some(caps) = caps {
                            client_caps = String::from_utf8_lossy(caps)
                                .split_whitespace()
                                .map(String::from)
                                .collect();
                        }
                    }
                    commands.push(Command::parse(line, algorithm)?);
                }
                Some(other) => {
                    return Err(GitError::protocol(format!(
                        "unexpected {:?} in command list",
                        other
                    )))
                }
                None => return Err(GitError::protocol("request ended before command flush")),
            }
        }

        let mut input = reader.into_inner();
        if commands.is_empty() {
            self.transition(SessionState::Responding)?;
            return Ok(ReceiveReport {
                unpack_error: None,
                statuses: Vec::new(),
                objects_received: 0,
            });
        }

        let unpack_limit = self.unpack_limit;
        let unpacked = PackDecoder::new(&repo.objects, self.limits)
            .decode(&mut input)
            .and_then(|decoded| {
                if decoded.objects.len() >= unpack_limit {
                    repo.objects.write_pack(&decoded.objects)?;
                }
                Ok(decoded.objects.len())
            });

        let mut statuses: Vec<Option<RefStatus>> = vec![None; commands.len()];
        let mut unpack_error = None;
        let mut objects_received = 0;

        match unpacked {
            Ok(count) => objects_received = count,
            Err(e) if e.is_protocol_error() => return Err(e),
            Err(e) => {
                tracing::warn!(repo = %self.repo.key, error = %e, "unpack failed");
                unpack_error = Some(e.to_string());
                statuses.fill(Some(RefStatus::rejected("unpacker error")));
            }
        }

        if unpack_error.is_none() {
            match self.validate_tips(&commands, &mut statuses) {
                Ok(incomplete) => unpack_error = incomplete,
                Err(e) if e.is_protocol_error() => return Err(e),
                Err(e) => {
                    tracing::warn!(repo = %repo.key, error = %e, "push validation failed");
                    unpack_error = Some(e.to_string());
                    statuses.fill(Some(RefStatus::rejected("unpacker error")));
                }
            }
            if unpack_error.is_some() {
                for status in statuses.iter_mut().filter(|s| s.is_none()) {
                    *status = Some(RefStatus::rejected("unpacker error"));
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }

        let mut results = Vec::with_capacity(commands.len());
        for (status, cmd) in statuses.into_iter().zip(commands) {
            let status = match status {
                Some(status) => status,
                None => self.apply(&cmd),
            };
            if let RefStatus::Rejected(reason) = &status {
                tracing::warn!(repo = %self.repo.key, refname = %cmd.ref_name, reason = %reason, "ref rejected");
            }
            results.push((cmd, status));
        }

        let report = ReceiveReport {
            unpack_error: unpack_error.map(|e| format!("error: {}", e.replace('\n', " "))),
            statuses: results,
            objects_received,
        };

        self.transition(SessionState::Responding)?;
        let encoded = report.encode()?;
        if client_caps.contains("side-band-64k") {
            write_band(&mut out, Band::Data, &encoded)?;
            out.write_all(&PktLine::Flush.encode())?;
        } else {
            out.write_all(&encoded)?;
        }
        out.flush()?;

        tracing::info!(
            repo = %self.repo.key,
            commands = report.statuses.len(),
            objects = report.objects_received,
            success = report.is_success(),
            "push completed"
        );
        Ok(report)
    }

    /// Checks names and object graphs before any ref moves. Returns the
    /// unpack error to report when some pushed tip cannot reach all of its
    /// objects, an absent tip included.
    fn validate_tips(&self, commands: &[Command], statuses: &mut [Option<RefStatus>]) -> Result<Option<String>> {
        let repo = self.repo;
        let tips: Vec<ObjectId> = repo.refs.list()?.into_values().collect();
        let walker = ReachabilityWalker::new(&repo.objects);
        let mut incomplete = None;

        for (status, cmd) in statuses.iter_mut().zip(commands) {
            if !is_valid_ref_name(&cmd.ref_name) {
                *status = Some(RefStatus::rejected("invalid ref name"));
                continue;
            }
            if cmd.is_delete() {
                continue;
            }
            let missing = walker.missing_descendants_bounded(cmd.new_id, &tips)?;
            if !missing.is_empty() {
                let err = GitError::IncompleteObjectGraph {
                    tip: cmd.new_id,
                    missing: missing.into_iter().collect(),
                };
                tracing::warn!(repo = %repo.key, refname = %cmd.ref_name, error = %err, "rejecting push");
                incomplete.get_or_insert_with(|| err.to_string());
                *status = Some(RefStatus::rejected("missing necessary objects"));
            }
        }
        Ok(incomplete)
    }

    /// Performs one ref update.
    fn apply(&self, cmd: &Command) -> RefStatus {
        let refs = &self.repo.refs;
        let result = if cmd.is_delete() {
            refs.delete(&cmd.ref_name, cmd.expected_old())
        } else {
            refs.compare_and_swap(&cmd.ref_name, cmd.expected_old(), cmd.new_id)
        };
        match result {
            Ok(RefUpdate::Applied { .. }) => RefStatus::Ok,
            Ok(RefUpdate::Conflict { .. }) => RefStatus::rejected("failed to lock"),
            Err(StorageError::InvalidRefName { .. }) => RefStatus::rejected("invalid ref name"),
            Err(StorageError::ObjectNotFound(_)) => RefStatus::rejected("missing object"),
            Err(e) => {
                tracing::warn!(repo = %self.repo.key, refname = %cmd.ref_name, error = %e, "ref update failed");
                RefStatus::rejected("failed to lock")
            }
        }
    }

    /// Serves `POST git-upload-pack`: negotiation, then the pack once the
    /// client says `done`.
    pub fn upload_pack<R: BufRead, W: Write>(&mut self, input: R, out: W) -> Result<UploadSummary> {
        self.transition(SessionState::Negotiating)?;
        match self.run_upload(input, out) {
            Ok(summary) => {
                self.transition(SessionState::Done)?;
                Ok(summary)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn run_upload<R: BufRead, W: Write>(&mut self, input: R, mut out: W) -> Result<UploadSummary> {
        let repo = self.repo;
        let store = &repo.objects;
        let mut reader = PktLineReader::new(input);
        let mut session = NegotiationSession::new(self.repo.algorithm());
        let mut acknowledgements = Vec::new();
        let mut saw_input = false;

        while let Some(pkt) = reader.read()? {
            saw_input = true;
            if let Some(ack) = session.advance(&pkt, store)? {
                acknowledgements.push(ack);
            }
            if session.is_done() {
                break;
            }
        }
        if !saw_input || session.state() == NegotiationState::Wants {
            return Err(GitError::protocol("request ended inside the want list"));
        }

        let objects = if session.is_done() && !session.wants().is_empty() {
            let set = ReachabilityWalker::new(store).reachable_excluding(session.wants(), session.common())?;
            Some(set)
        } else {
            None
        };

        if self.cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }

        self.transition(SessionState::Responding)?;
        {
            let mut writer = PktLineWriter::new(&mut out);
            for ack in &acknowledgements {
                writer.write_line(&ack.line())?;
            }
        }

        let objects_sent = match objects {
            Some(set) => {
                let encoder = PackEncoder::new(store);
                if session.has_capability("side-band-64k") {
                    let (sideband, _) = encoder.encode(&set, SidebandWriter::new(&mut out))?;
                    sideband.finish()?;
                } else {
                    encoder.encode(&set, &mut out)?;
                }
                Some(set.len())
            }
            None => None,
        };
        out.flush()?;

        tracing::info!(
            repo = %repo.key,
            wants = session.wants().len(),
            common = session.common().len(),
            objects = objects_sent.unwrap_or(0),
            "fetch completed"
        );
        Ok(UploadSummary {
            acknowledgements,
            objects_sent,
        })
    }
}

/// Pushed names must be full `refs/...` names that pass git's rules.
fn is_valid_ref_name(name: &str) -> bool {
    name.strip_prefix("refs/")
        .is_some_and(|relative| validate_ref_name(relative).is_ok())
}

/// Advertises references to a client (for fetch/clone or push).
pub fn advertise_refs<W: Write>(writer: W, repo: &Repository, service: Service) -> Result<()> {
    ProtocolEngine::new(repo, service).advertise(writer)
}

/// Handles git-upload-pack (fetch/clone) with default limits.
pub fn upload_pack<R: BufRead, W: Write>(reader: R, writer: W, repo: &Repository) -> Result<UploadSummary> {
    ProtocolEngine::for_request(repo, Service::UploadPack).upload_pack(reader, writer)
}

/// Handles git-receive-pack (push) with default limits.
pub fn receive_pack<R: BufRead, W: Write>(reader: R, writer: W, repo: &Repository) -> Result<ReceiveReport> {
    ProtocolEngine::for_request(repo, Service::ReceivePack).receive_pack(reader, writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use githost_storage::{GitObject, StorageConfig};
    use std::io::Cursor;
    use tempfile::TempDir;

    const SIG: &str = "Alice <alice@example.com> 1700000000 +0000";

    fn repo_with(algorithm: HashAlgorithm) -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            hash_algorithm: algorithm,
            fsync: false,
            ..StorageConfig::default()
        };
        let repo = Repository::init(dir.path().join("repo.git"), "alice/repo", &config).unwrap();
        (dir, repo)
    }

    fn repo() -> (TempDir, Repository) {
        repo_with(HashAlgorithm::Sha1)
    }

    fn pkt(s: &str) -> Vec<u8> {
        PktLine::from_string(s).encode()
    }

    fn first_commit(repo: &Repository) -> ObjectId {
        let tree = repo.objects.put(ObjectType::Tree, Vec::<u8>::new()).unwrap();
        repo.commit(&tree, "initial\n", SIG, SIG).unwrap()
    }

    #[test]
    fn test_empty_repo_advertisement() {
        let (_dir, repo) = repo();
        let mut out = Vec::new();
        advertise_refs(&mut out, &repo, Service::ReceivePack).unwrap();

        let mut expected = pkt("# service=git-receive-pack\n");
        expected.extend_from_slice(b"0000");
        expected.extend(pkt(&format!(
            "{} capabilities^{{}}\0{}\n",
            "0".repeat(40),
            Service::ReceivePack.capabilities(HashAlgorithm::Sha1)
        )));
        expected.extend_from_slice(b"0000");
        assert_eq!(out, expected);
    }

    #[test]
    fn test_advertisement_lists_head_first() {
        let (_dir, repo) = repo();
        let c1 = first_commit(&repo);
        repo.refs.compare_and_swap("tags/v1", None, c1).unwrap();

        let mut out = Vec::new();
        advertise_refs(&mut out, &repo, Service::UploadPack).unwrap();

        let mut reader = PktLineReader::new(Cursor::new(out));
        assert_eq!(reader.read_until_flush().unwrap().len(), 1);
        let lines = reader.read_until_flush().unwrap();
        assert_eq!(lines.len(), 3);
        let first = lines[0].data().unwrap();
        assert!(first.starts_with(format!("{} HEAD\0", c1).as_bytes()));
        assert!(first.ends_with(format!("no-progress {}\n", AGENT).as_bytes()));
        assert_eq!(lines[1].as_str().unwrap(), format!("{} refs/heads/main", c1));
        assert_eq!(lines[2].as_str().unwrap(), format!("{} refs/tags/v1", c1));
    }

    #[test]
    fn test_annotated_tags_are_peeled_for_fetch() {
        let (_dir, repo) = repo();
        let c1 = first_commit(&repo);
        let body = format!("object {}\ntype commit\ntag v1\ntagger {}\n\nrelease\n", c1, SIG);
        let tag = repo.objects.put(ObjectType::Tag, body.into_bytes()).unwrap();
        repo.refs.compare_and_swap("tags/v1", None, tag).unwrap();

        let mut out = Vec::new();
        advertise_refs(&mut out, &repo, Service::UploadPack).unwrap();
        let text = String::from_utf8_lossy(&out).to_string();
        assert!(text.contains(&format!("{} refs/tags/v1\n", tag)));
        assert!(text.contains(&format!("{} refs/tags/v1^{{}}\n", c1)));

        let mut out = Vec::new();
        advertise_refs(&mut out, &repo, Service::ReceivePack).unwrap();
        assert!(!String::from_utf8_lossy(&out).contains("^{}\n"));
    }

    #[test]
    fn test_advertisement_is_deterministic() {
        let (_dir, repo) = repo();
        let c1 = first_commit(&repo);
        for name in ["heads/zeta", "heads/alpha", "tags/v2"] {
            repo.refs.compare_and_swap(name, None, c1).unwrap();
        }

        let mut a = Vec::new();
        let mut b = Vec::new();
        advertise_refs(&mut a, &repo, Service::UploadPack).unwrap();
        advertise_refs(&mut b, &repo, Service::UploadPack).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sha256_capability() {
        let caps = Service::UploadPack.capabilities(HashAlgorithm::Sha256);
        assert!(caps.ends_with("object-format=sha256"));
        assert!(!Service::ReceivePack
            .capabilities(HashAlgorithm::Sha1)
            .contains("object-format"));
    }

    #[test]
    fn test_service_names() {
        assert_eq!(Service::from_name("git-upload-pack"), Some(Service::UploadPack));
        assert_eq!(Service::from_name("git-receive-pack"), Some(Service::ReceivePack));
        assert_eq!(Service::from_name("git-archive"), None);
        assert_eq!(
            Service::ReceivePack.result_content_type(),
            "application/x-git-receive-pack-result"
        );
    }

    #[test]
    fn test_illegal_transitions() {
        let (_dir, repo) = repo();
        let mut engine = ProtocolEngine::new(&repo, Service::UploadPack);
        assert!(engine
            .upload_pack(Cursor::new(Vec::new()), Vec::new())
            .unwrap_err()
            .is_protocol_error());

        let mut engine = ProtocolEngine::for_request(&repo, Service::UploadPack);
        assert!(engine.advertise(Vec::new()).is_err());
        assert!(engine
            .receive_pack(Cursor::new(Vec::new()), Vec::new())
            .unwrap_err()
            .is_protocol_error());
        assert_eq!(engine.state(), &SessionState::AwaitingRequest);
    }

    #[test]
    fn test_advertise_then_await_request() {
        let (_dir, repo) = repo();
        let mut engine = ProtocolEngine::new(&repo, Service::ReceivePack);
        engine.advertise(Vec::new()).unwrap();
        assert_eq!(engine.state(), &SessionState::AwaitingRequest);
        assert!(engine.advertise(Vec::new()).is_err());
    }

    #[test]
    fn test_command_parse() {
        let old = "0".repeat(40);
        let new = "1".repeat(40);
        let cmd = Command::parse(&format!("{} {} refs/heads/main", old, new), HashAlgorithm::Sha1).unwrap();
        assert!(cmd.is_create());
        assert!(!cmd.is_delete());
        assert_eq!(cmd.ref_name, "refs/heads/main");
        assert_eq!(cmd.expected_old(), None);

        assert!(Command::parse("garbage", HashAlgorithm::Sha1).is_err());
        assert!(Command::parse(&format!("{} {} ", old, new), HashAlgorithm::Sha1).is_err());
        assert!(Command::parse(&format!("{} {} refs/heads/x", old, new), HashAlgorithm::Sha256).is_err());
    }

    #[test]
    fn test_receive_malformed_length_writes_nothing() {
        let (_dir, repo) = repo();
        let mut out = Vec::new();
        let mut engine = ProtocolEngine::for_request(&repo, Service::ReceivePack);
        let err = engine.receive_pack(Cursor::new(b"xxzz".to_vec()), &mut out).unwrap_err();
        assert!(err.is_protocol_error());
        assert!(out.is_empty());
        assert!(matches!(engine.state(), SessionState::Failed(_)));
    }

    #[test]
    fn test_receive_rejects_invalid_ref_name() {
        let (_dir, repo) = repo();
        let c1 = first_commit(&repo);
        let mut body = pkt(&format!("{} {} refs/heads/bad..name\0report-status\n", "0".repeat(40), c1));
        body.extend_from_slice(b"0000");

        let mut out = Vec::new();
        let report = receive_pack(Cursor::new(body), &mut out, &repo).unwrap();
        assert_eq!(report.unpack_error, None);
        assert_eq!(report.statuses[0].1, RefStatus::rejected("invalid ref name"));
        assert!(String::from_utf8_lossy(&out).contains("ng refs/heads/bad..name invalid ref name\n"));
    }

    #[test]
    fn test_receive_delete_only_push() {
        let (_dir, repo) = repo();
        let c1 = first_commit(&repo);
        repo.refs.compare_and_swap("heads/topic", None, c1).unwrap();

        let mut body = pkt(&format!("{} {} refs/heads/topic\0report-status delete-refs\n", c1, "0".repeat(40)));
        body.extend_from_slice(b"0000");

        let mut out = Vec::new();
        let report = receive_pack(Cursor::new(body), &mut out, &repo).unwrap();
        assert!(report.is_success());
        assert!(repo.refs.get("heads/topic").is_err());
    }

    #[test]
    fn test_receive_stale_old_is_failed_to_lock() {
        let (_dir, repo) = repo();
        let c1 = first_commit(&repo);
        let tree = repo.objects.put(ObjectType::Tree, Vec::<u8>::new()).unwrap();
        let c2 = repo.objects.put_object(&GitObject::commit(&tree, &[c1], SIG, SIG, "second\n")).unwrap();

        let mut body = pkt(&format!("{} {} refs/heads/main\n", "0".repeat(40), c2));
        body.extend_from_slice(b"0000");
        let report = receive_pack(Cursor::new(body), Vec::new(), &repo).unwrap();
        assert_eq!(report.statuses[0].1, RefStatus::rejected("failed to lock"));
        assert_eq!(repo.refs.get("heads/main").unwrap(), c1);
    }

    #[test]
    fn test_receive_absent_tip_blocks_every_ref() {
        let (_dir, repo) = repo();
        let c1 = first_commit(&repo);
        let ghost = ObjectId::from_bytes([0x42; 20]);
        let zero = "0".repeat(40);
        let mut body = pkt(&format!("{} {} refs/heads/topic\0report-status\n", zero, c1));
        body.extend(pkt(&format!("{} {} refs/heads/other\n", zero, ghost)));
        body.extend_from_slice(b"0000");

        let mut out = Vec::new();
        let report = receive_pack(Cursor::new(body), &mut out, &repo).unwrap();
        assert!(report.unpack_error.as_deref().is_some_and(|e| e.starts_with("error: ")));
        assert_eq!(report.statuses[0].1, RefStatus::rejected("unpacker error"));
        assert_eq!(report.statuses[1].1, RefStatus::rejected("missing necessary objects"));
        assert!(String::from_utf8_lossy(&out).contains("unpack error: "));
        assert!(repo.refs.get("heads/topic").is_err());
        assert!(repo.refs.get("heads/other").is_err());
    }

    #[test]
    fn test_cancelled_before_ref_update() {
        let (_dir, repo) = repo();
        let tree = repo.objects.put(ObjectType::Tree, Vec::<u8>::new()).unwrap();
        let c1 = repo.objects.put_object(&GitObject::commit(&tree, &[], SIG, SIG, "c\n")).unwrap();
        let mut body = pkt(&format!("{} {} refs/heads/main\n", "0".repeat(40), c1));
        body.extend_from_slice(b"0000");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        let mut engine = ProtocolEngine::for_request(&repo, Service::ReceivePack).with_cancellation(cancel);
        assert!(matches!(
            engine.receive_pack(Cursor::new(body), &mut out),
            Err(GitError::Cancelled)
        ));
        assert!(out.is_empty());
        assert!(repo.refs.get("heads/main").is_err());
    }

    #[test]
    fn test_upload_stateless_round_sends_only_acks() {
        let (_dir, repo) = repo();
        let c1 = first_commit(&repo);
        let mut body = pkt(&format!("want {} side-band-64k\n", c1));
        body.extend_from_slice(b"0000");
        body.extend(pkt(&format!("have {}\n", ObjectId::from_bytes([3; 20]))));
        body.extend_from_slice(b"0000");

        let mut out = Vec::new();
        let summary = upload_pack(Cursor::new(body), &mut out, &repo).unwrap();
        assert_eq!(summary.objects_sent, None);
        assert_eq!(out, pkt("NAK\n"));
    }

    #[test]
    fn test_upload_unknown_want_writes_nothing() {
        let (_dir, repo) = repo();
        let mut body = pkt(&format!("want {}\n", ObjectId::from_bytes([8; 20])));
        body.extend_from_slice(b"0000");
        body.extend(pkt("done\n"));

        let mut out = Vec::new();
        let err = upload_pack(Cursor::new(body), &mut out, &repo).unwrap_err();
        assert!(matches!(err, GitError::UnknownWant(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_upload_empty_body_is_protocol_error() {
        let (_dir, repo) = repo();
        let err = upload_pack(Cursor::new(Vec::new()), Vec::new(), &repo).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_upload_nothing_wanted() {
        let (_dir, repo) = repo();
        let mut out = Vec::new();
        let summary = upload_pack(Cursor::new(b"0000".to_vec()), &mut out, &repo).unwrap();
        assert_eq!(summary.objects_sent, None);
        assert!(out.is_empty());
    }

    #[test]
    fn test_report_encoding() {
        let cmd = Command {
            old_id: HashAlgorithm::Sha1.null_id(),
            new_id: ObjectId::from_bytes([1; 20]),
            ref_name: "refs/heads/main".to_string(),
        };
        let report = ReceiveReport {
            unpack_error: None,
            statuses: vec![(cmd.clone(), RefStatus::Ok)],
            objects_received: 1,
        };
        assert_eq!(report.encode().unwrap(), b"000eunpack ok\n0017ok refs/heads/main\n0000");

        let report = ReceiveReport {
            unpack_error: Some("error: boom".to_string()),
            statuses: vec![(cmd, RefStatus::rejected("unpacker error"))],
            objects_received: 0,
        };
        let encoded = report.encode().unwrap();
        assert!(encoded.starts_with(b"0017unpack error: boom\n"));
        assert!(!report.is_success());
    }
}
