//! Bootloader session.
//!
//! A [`BootloaderSession`] owns one transport and walks the chip through the
//! programming sequence:
//!
//! ```text
//! Idle -> Detecting -> Detected -> Erasing -> Detected
//!                         |
//!                         +-> Writing -> Done
//!                         +-> Verifying -> Done
//!                         +-> Resetting -> Done (application running)
//!
//! any error -> Failed(reason)
//! ```
//!
//! `Failed` is terminal. The transport is closed when the session is closed or
//! dropped.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ch55xflash::{BootloaderSession, SessionConfig, UsbTransport};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = std::fs::read("firmware.bin")?;
//!
//!     let transport = UsbTransport::open()?;
//!     let mut session = BootloaderSession::new(transport, SessionConfig::default());
//!
//!     let identity = session.detect()?;
//!     println!("Found {} (bootloader {})", identity.model, identity.bootloader_version);
//!
//!     session.erase()?;
//!     session.write(&image, |done, total| println!("{done}/{total}"))?;
//!     session.verify(&image, |_, _| {})?;
//!     session.start_app()?;
//!     session.close()?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::planner::{self, ChunkPlan};
use crate::protocol::checksum::Bootkey;
use crate::protocol::frame::{Command, KEY_SEED_LEN, PACKET_SIZE, Reply, decode, encode, hex};
use crate::protocol::version::{ChunkKind, ProtocolVersion};
use crate::target::chip::{ChipIdentity, FlashLayout};
use crate::transport::Transport;

/// Default seed sent with `IspKey`.
pub const DEFAULT_KEY_SEED: [u8; KEY_SEED_LEN] = [0u8; KEY_SEED_LEN];

/// Timeouts and key material for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Reply timeout for the detect handshake.
    pub detect_timeout: Duration,
    /// Reply timeout for each write or verify chunk.
    pub write_timeout: Duration,
    /// Reply timeout for erase commands.
    pub erase_timeout: Duration,
    /// How long to wait for a reply to the exit command.
    pub reset_timeout: Duration,
    /// Seed the V2 bootkey is derived from.
    pub key_seed: [u8; KEY_SEED_LEN],
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            detect_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            erase_timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_millis(500),
            key_seed: DEFAULT_KEY_SEED,
        }
    }
}

impl SessionConfig {
    /// Set the detect timeout.
    #[must_use]
    pub fn with_detect_timeout(mut self, timeout: Duration) -> Self {
        self.detect_timeout = timeout;
        self
    }

    /// Set the per-chunk timeout.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the erase timeout.
    #[must_use]
    pub fn with_erase_timeout(mut self, timeout: Duration) -> Self {
        self.erase_timeout = timeout;
        self
    }

    /// Set the exit reply timeout.
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the bootkey seed.
    #[must_use]
    pub fn with_key_seed(mut self, seed: [u8; KEY_SEED_LEN]) -> Self {
        self.key_seed = seed;
        self
    }
}

/// Why a session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Detect handshake failed.
    NoDevice,
    /// Chip, bootloader or transport combination is not supported.
    UnsupportedBootloader,
    /// Erase was refused.
    EraseRejected,
    /// Write chunk at this offset failed.
    WriteAt(u32),
    /// Verify chunk at this offset did not match.
    VerifyMismatchAt(u32),
    /// The link itself failed.
    Transport,
    /// Interrupted by the embedding application.
    Interrupted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevice => write!(f, "no device"),
            Self::UnsupportedBootloader => write!(f, "unsupported bootloader"),
            Self::EraseRejected => write!(f, "erase rejected"),
            Self::WriteAt(offset) => write!(f, "write failed at {offset:#06x}"),
            Self::VerifyMismatchAt(offset) => write!(f, "verify mismatch at {offset:#06x}"),
            Self::Transport => write!(f, "transport error"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, nothing sent yet.
    Idle,
    /// Detect handshake in progress.
    Detecting,
    /// Chip identified and ready.
    Detected,
    /// Erase in progress.
    Erasing,
    /// Writing the image.
    Writing {
        /// Image bytes acknowledged so far.
        done: usize,
        /// Image length.
        total: usize,
    },
    /// Verifying the image.
    Verifying {
        /// Image bytes confirmed so far.
        done: usize,
        /// Image length.
        total: usize,
    },
    /// Exit command sent, waiting for the chip to leave the bootloader.
    Resetting,
    /// Terminal failure.
    Failed(FailureReason),
    /// Last operation completed.
    Done,
}

impl SessionState {
    /// Whether no further operation can run from this state.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Detecting => write!(f, "detecting"),
            Self::Detected => write!(f, "detected"),
            Self::Erasing => write!(f, "erasing"),
            Self::Writing { done, total } => write!(f, "writing ({done}/{total} bytes)"),
            Self::Verifying { done, total } => write!(f, "verifying ({done}/{total} bytes)"),
            Self::Resetting => write!(f, "resetting"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Interrupt predicate polled between chunks.
type InterruptChecker = Box<dyn Fn() -> bool>;

/// Programming session over one transport.
///
/// Generic over the transport type `T`, so tests and embedding applications can
/// supply their own links.
pub struct BootloaderSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    state: SessionState,
    identity: Option<ChipIdentity>,
    key: Option<Bootkey>,
    app_started: bool,
    closed: bool,
    interrupted: InterruptChecker,
}

impl<T: Transport> BootloaderSession<T> {
    /// Create a session on an open transport.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Idle,
            identity: None,
            key: None,
            app_started: false,
            closed: false,
            interrupted: Box::new(crate::is_interrupted_requested),
        }
    }

    /// Use `checker` instead of the global interrupt checker.
    #[must_use]
    pub fn with_interrupt_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn() -> bool + 'static,
    {
        self.interrupted = Box::new(checker);
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identity of the detected chip.
    pub fn identity(&self) -> Option<&ChipIdentity> {
        self.identity.as_ref()
    }

    /// Flash layout of the detected chip.
    pub fn layout(&self) -> Option<FlashLayout> {
        self.identity
            .as_ref()
            .map(ChipIdentity::layout)
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get a reference to the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Close the session and its transport.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.transport.close()
    }

    /// Run the detect handshake.
    ///
    /// Sends the 2.x identify first. A bare 2-byte answer means a 1.x
    /// bootloader, which is then identified with the 1.x command set. On 2.x
    /// bootloaders the bootkey is negotiated as part of detection.
    pub fn detect(&mut self) -> Result<ChipIdentity> {
        if self.state != SessionState::Idle {
            return Err(self.invalid_state("detect"));
        }

        self.state = SessionState::Detecting;
        debug!("Probing bootloader on {}", self.transport.name());

        match self.run_detect() {
            Ok(identity) => {
                info!(
                    "Detected {} (chip id {:#04x}), bootloader {} using protocol {}",
                    identity.model, identity.chip_id, identity.bootloader_version, identity.protocol
                );
                self.identity = Some(identity);
                self.state = SessionState::Detected;
                Ok(identity)
            },
            Err(err) => {
                let (reason, err) = classify_detect_error(err);
                Err(self.fail(reason, err))
            },
        }
    }

    fn run_detect(&mut self) -> Result<ChipIdentity> {
        let timeout = self.config.detect_timeout;
        let raw = self.round_trip(&Command::Identify, ProtocolVersion::V2, timeout)?;

        if raw.len() == 2 {
            debug!("2.x identify answered with 2 bytes, assuming a 1.x bootloader");
            return self.detect_v1();
        }

        let Reply::Identity { chip_id, family } =
            decode(&raw, &Command::Identify, ProtocolVersion::V2)?
        else {
            return Err(Error::MalformedResponse("identify reply".into()));
        };
        debug!("Chip id {chip_id:#04x}, family {family:02x?}");
        self.detect_v2(chip_id)
    }

    fn detect_v1(&mut self) -> Result<ChipIdentity> {
        let timeout = self.config.detect_timeout;
        let Reply::Identity { chip_id, .. } =
            self.transact(&Command::Identify, ProtocolVersion::V1, timeout)?
        else {
            return Err(Error::MalformedResponse("identify reply".into()));
        };
        let Reply::Config { version, .. } =
            self.transact(&Command::ReadConfig, ProtocolVersion::V1, timeout)?
        else {
            return Err(Error::MalformedResponse("config reply".into()));
        };

        let identity = ChipIdentity::new(chip_id, version)?;
        self.check_protocol(&identity, ProtocolVersion::V1)?;
        Ok(identity)
    }

    fn detect_v2(&mut self, chip_id: u8) -> Result<ChipIdentity> {
        let timeout = self.config.detect_timeout;
        let Reply::Config { version, seed_sum } =
            self.transact(&Command::ReadConfig, ProtocolVersion::V2, timeout)?
        else {
            return Err(Error::MalformedResponse("config reply".into()));
        };

        let identity = ChipIdentity::new(chip_id, version)?;
        self.check_protocol(&identity, ProtocolVersion::V2)?;

        let seed = self.config.key_seed;
        let key = Bootkey::derive(&seed, seed_sum.unwrap_or(0), chip_id)
            .ok_or_else(|| Error::Unsupported("bootkey seed too short".into()))?;
        let Reply::KeyAccepted { checksum } = self.transact(
            &Command::IspKey {
                seed: seed.to_vec(),
            },
            ProtocolVersion::V2,
            timeout,
        )?
        else {
            return Err(Error::MalformedResponse("isp-key reply".into()));
        };
        if checksum != key.checksum() {
            return Err(Error::ChecksumMismatch {
                expected: key.checksum(),
                actual: checksum,
            });
        }
        trace!("Bootkey accepted, checksum {checksum:#04x}");

        // The bootloader expects the config to be read again once keyed
        let Reply::Config { .. } =
            self.transact(&Command::ReadConfig, ProtocolVersion::V2, timeout)?
        else {
            return Err(Error::MalformedResponse("config reply".into()));
        };

        self.key = Some(key);
        Ok(identity)
    }

    /// Reject identities whose protocol does not match the dialect that was
    /// spoken, or that cannot run over the open transport.
    fn check_protocol(&self, identity: &ChipIdentity, spoken: ProtocolVersion) -> Result<()> {
        if identity.protocol != spoken {
            return Err(Error::UnsupportedBootloader(format!(
                "{} answered the {spoken} handshake",
                identity.bootloader_version
            )));
        }
        let kind = self.transport.kind();
        if !identity
            .protocol
            .supports(kind)
        {
            return Err(Error::UnsupportedTransport {
                version: identity
                    .bootloader_version
                    .to_string(),
                transport: kind.to_string(),
            });
        }
        Ok(())
    }

    /// Erase the code flash.
    pub fn erase(&mut self) -> Result<()> {
        let (identity, layout) = self.require_ready("erase")?;
        self.state = SessionState::Erasing;
        info!("Erasing {} bytes of code flash", layout.total_size);

        let result = match identity.protocol {
            ProtocolVersion::V2 => self.erase_v2(&layout),
            ProtocolVersion::V1 => self.erase_v1(&layout),
        };

        match result {
            Ok(()) => {
                self.state = SessionState::Detected;
                debug!("Erase complete");
                Ok(())
            },
            Err(Error::Interrupted) => Err(self.fail(FailureReason::Interrupted, Error::Interrupted)),
            Err(err) if err.is_transport() => Err(self.fail(FailureReason::Transport, err)),
            Err(err @ Error::EraseRejected(_)) => Err(self.fail(FailureReason::EraseRejected, err)),
            Err(err) => Err(self.fail(
                FailureReason::EraseRejected,
                Error::EraseRejected(err.to_string()),
            )),
        }
    }

    fn erase_v2(&mut self, layout: &FlashLayout) -> Result<()> {
        let timeout = self.config.erase_timeout;
        let reply = self.transact(
            &Command::Erase {
                units: layout.erase_units,
            },
            ProtocolVersion::V2,
            timeout,
        )?;
        if !reply.is_ack(ProtocolVersion::V2) {
            return Err(Error::EraseRejected(status_detail(&reply)));
        }
        Ok(())
    }

    fn erase_v1(&mut self, layout: &FlashLayout) -> Result<()> {
        let timeout = self.config.erase_timeout;

        // The unlock reply carries no meaningful status
        self.round_trip(&Command::Erase { units: 0 }, ProtocolVersion::V1, timeout)?;

        for block in 0..layout.erase_blocks() {
            if (self.interrupted)() {
                return Err(Error::Interrupted);
            }
            let block = u8::try_from(block)
                .map_err(|_| Error::Unsupported(format!("erase block {block} out of range")))?;
            let reply = self.transact(&Command::EraseBlock { block }, ProtocolVersion::V1, timeout)?;
            if !reply.is_ack(ProtocolVersion::V1) {
                return Err(Error::EraseRejected(format!(
                    "block {block}: {}",
                    status_detail(&reply)
                )));
            }
        }
        Ok(())
    }

    /// Program `image` starting at offset 0.
    ///
    /// The flash must have been erased first. `progress` is called with the
    /// number of image bytes acknowledged so far and the image length.
    pub fn write<F>(&mut self, image: &[u8], progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        self.transfer(ChunkKind::Write, image, progress)
    }

    /// Compare flash contents against `image`.
    ///
    /// `progress` is called with the number of image bytes confirmed so far and
    /// the image length.
    pub fn verify<F>(&mut self, image: &[u8], progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        self.transfer(ChunkKind::Verify, image, progress)
    }

    fn transfer<F>(&mut self, kind: ChunkKind, image: &[u8], mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let operation = match kind {
            ChunkKind::Write => "write",
            ChunkKind::Verify => "verify",
        };
        let (identity, layout) = self.require_ready(operation)?;
        let plan = planner::plan(image, &layout, kind)?;
        let protocol = identity.protocol;
        let total = plan.image_len();

        info!(
            "Starting {operation} of {total} bytes in {} chunks",
            plan.chunk_count()
        );
        self.state = progress_state(kind, 0, total);
        progress(0, total);

        self.run_transfer(kind, plan, protocol, &mut progress)?;

        self.state = SessionState::Done;
        info!("{operation} complete");
        Ok(())
    }

    fn run_transfer<F>(
        &mut self,
        kind: ChunkKind,
        plan: ChunkPlan<'_>,
        protocol: ProtocolVersion,
        progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let total = plan.image_len();
        let timeout = self.config.write_timeout;

        for chunk in plan {
            if (self.interrupted)() {
                warn!("Interrupted at offset {:#06x}", chunk.offset);
                return Err(self.fail(FailureReason::Interrupted, Error::Interrupted));
            }

            let data = match self.key {
                Some(key) if protocol.scrambles_payload() => key.scramble(&chunk.payload),
                _ => chunk.payload.clone(),
            };
            // Low byte of the remaining image length; ignored by the chip
            #[allow(clippy::cast_possible_truncation)]
            let pad = (total - chunk.offset as usize) as u8;
            let offset = chunk.offset;
            let cmd = match kind {
                ChunkKind::Write => Command::Write { offset, pad, data },
                ChunkKind::Verify => Command::Verify { offset, pad, data },
            };

            match self.transact(&cmd, protocol, timeout) {
                Ok(reply) if reply.is_ack(protocol) => {},
                Ok(reply) => {
                    let detail = status_detail(&reply);
                    return Err(self.fail_chunk(kind, offset, detail));
                },
                Err(err) if err.is_transport() => {
                    return Err(self.fail(FailureReason::Transport, err));
                },
                Err(err) => {
                    let detail = err.to_string();
                    return Err(self.fail_chunk(kind, offset, detail));
                },
            }

            let done = chunk.offset as usize + chunk.image_len;
            self.state = progress_state(kind, done, total);
            progress(done, total);
        }
        Ok(())
    }

    /// Leave the bootloader and start the application.
    ///
    /// The chip resets without answering. Once the exit frame is out, a
    /// timeout or any link error while waiting for the reply counts as
    /// success.
    pub fn start_app(&mut self) -> Result<()> {
        let (identity, _) = self.require_ready("start application")?;
        self.state = SessionState::Resetting;

        let bytes = encode(&Command::Exit, identity.protocol)?;
        trace!("tx exit: {}", hex(&bytes));
        if let Err(err) = self.transport.send(&bytes) {
            return Err(self.fail(FailureReason::Transport, err));
        }

        match self
            .transport
            .receive(PACKET_SIZE, self.config.reset_timeout)
        {
            Ok(raw) => debug!("Exit answered with {}", hex(&raw)),
            Err(Error::Timeout(_)) => debug!("No reply to exit, chip is resetting"),
            Err(err) if err.is_transport() => {
                debug!("Link dropped after exit ({err}), chip is resetting");
            },
            Err(err) => warn!("Ignoring garbled reply to exit: {err}"),
        }

        self.app_started = true;
        self.state = SessionState::Done;
        info!("Application started");
        Ok(())
    }

    /// Send one command and return the raw reply.
    fn round_trip(
        &mut self,
        cmd: &Command,
        version: ProtocolVersion,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let bytes = encode(cmd, version)?;
        trace!("tx {}: {}", cmd.name(), hex(&bytes));
        self.transport.send(&bytes)?;
        let raw = self.transport.receive(PACKET_SIZE, timeout)?;
        trace!("rx {}: {}", cmd.name(), hex(&raw));
        Ok(raw)
    }

    /// Send one command and decode its reply.
    fn transact(
        &mut self,
        cmd: &Command,
        version: ProtocolVersion,
        timeout: Duration,
    ) -> Result<Reply> {
        let raw = self.round_trip(cmd, version, timeout)?;
        decode(&raw, cmd, version)
    }

    fn require_ready(&self, operation: &'static str) -> Result<(ChipIdentity, FlashLayout)> {
        match (self.state, self.identity) {
            (SessionState::Detected | SessionState::Done, Some(identity)) if !self.app_started => {
                Ok((identity, identity.layout()))
            },
            _ => Err(self.invalid_state(operation)),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> Error {
        let state = if self.app_started {
            "done (application running)".to_string()
        } else {
            self.state.to_string()
        };
        Error::InvalidState { operation, state }
    }

    fn fail(&mut self, reason: FailureReason, err: Error) -> Error {
        debug!("Session failed ({reason}): {err}");
        self.state = SessionState::Failed(reason);
        err
    }

    fn fail_chunk(&mut self, kind: ChunkKind, offset: u32, detail: String) -> Error {
        match kind {
            ChunkKind::Write => self.fail(
                FailureReason::WriteAt(offset),
                Error::WriteAt { offset, detail },
            ),
            ChunkKind::Verify => self.fail(
                FailureReason::VerifyMismatchAt(offset),
                Error::VerifyMismatchAt { offset, detail },
            ),
        }
    }
}

impl<T: Transport> Drop for BootloaderSession<T> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.transport.close() {
                debug!("Closing transport failed: {e}");
            }
        }
    }
}

fn progress_state(kind: ChunkKind, done: usize, total: usize) -> SessionState {
    match kind {
        ChunkKind::Write => SessionState::Writing { done, total },
        ChunkKind::Verify => SessionState::Verifying { done, total },
    }
}

fn status_detail(reply: &Reply) -> String {
    match reply.status() {
        Some(status) => format!("status {status:#04x}"),
        None => format!("unexpected reply {reply:?}"),
    }
}

fn classify_detect_error(err: Error) -> (FailureReason, Error) {
    match err {
        Error::UnsupportedBootloader(_)
        | Error::UnsupportedChip(_)
        | Error::UnsupportedTransport { .. } => (FailureReason::UnsupportedBootloader, err),
        Error::Interrupted => (FailureReason::Interrupted, err),
        err if err.is_transport() => (FailureReason::Transport, err),
        err @ (Error::Timeout(_)
        | Error::MalformedResponse(_)
        | Error::UnexpectedOpcode { .. }) => {
            (FailureReason::NoDevice, Error::NoDevice(err.to_string()))
        },
        err => (FailureReason::NoDevice, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::chip::{BootloaderVersion, ChipModel};
    use crate::transport::TransportKind;
    use crate::transport::mock::SimulatedChip;

    fn session(chip: SimulatedChip) -> BootloaderSession<SimulatedChip> {
        BootloaderSession::new(chip, SessionConfig::default()).with_interrupt_checker(|| false)
    }

    fn detected(chip: SimulatedChip) -> BootloaderSession<SimulatedChip> {
        let mut session = session(chip);
        session.detect().unwrap();
        session
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 + 5) as u8).collect()
    }

    #[test]
    fn test_detect_v2_ch558() {
        let chip = SimulatedChip::v2(0x58, BootloaderVersion::new(2, 3, 1));
        let mut session = session(chip);

        let identity = session.detect().unwrap();
        assert_eq!(identity.model, ChipModel::Ch558);
        assert_eq!(identity.bootloader_version, BootloaderVersion::new(2, 3, 1));
        assert_eq!(identity.protocol, ProtocolVersion::V2);
        assert_eq!(session.state(), SessionState::Detected);
        assert_eq!(session.layout().unwrap().total_size, 40 * 1024);

        let chip = session.transport();
        assert_eq!(chip.count("identify"), 1);
        // Config is read again after the key exchange
        assert_eq!(chip.count("read-config"), 2);
        assert_eq!(chip.count("isp-key"), 1);
        assert!(matches!(chip.commands[3], Command::ReadConfig));
        assert!(chip.key.is_some());
    }

    #[test]
    fn test_detect_v1_ch552() {
        let chip = SimulatedChip::v1(0x52, BootloaderVersion::new(1, 1, 0));
        let mut session = session(chip);

        let identity = session.detect().unwrap();
        assert_eq!(identity.model, ChipModel::Ch552);
        assert_eq!(identity.protocol, ProtocolVersion::V1);
        // V2 identify, then V1 identify and config
        assert_eq!(session.transport().sent.len(), 3);
        assert_eq!(session.transport().sent[0][0], 0xA1);
        assert_eq!(session.transport().sent[1][0], 0xA2);
        assert_eq!(session.transport().sent[2], vec![0xBB, 0x00]);
    }

    #[test]
    fn test_detect_without_device() {
        let mut chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 4, 0));
        chip.silent = true;
        let mut session = session(chip);

        assert!(matches!(session.detect(), Err(Error::NoDevice(_))));
        assert_eq!(session.state(), SessionState::Failed(FailureReason::NoDevice));
        assert!(matches!(
            session.erase(),
            Err(Error::InvalidState { operation: "erase", .. })
        ));
    }

    #[test]
    fn test_detect_rejects_old_v2_bootloader() {
        let chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 2, 0));
        let mut session = session(chip);
        assert!(matches!(
            session.detect(),
            Err(Error::UnsupportedBootloader(_))
        ));
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureReason::UnsupportedBootloader)
        );
    }

    #[test]
    fn test_detect_rejects_unknown_chip() {
        let chip = SimulatedChip::v2(0x42, BootloaderVersion::new(2, 3, 1));
        let mut session = session(chip);
        assert!(matches!(session.detect(), Err(Error::UnsupportedChip(0x42))));
    }

    #[test]
    fn test_v1_over_serial_is_rejected() {
        let chip = SimulatedChip::v1(0x52, BootloaderVersion::new(1, 1, 0)).over_serial();
        let mut session = session(chip);
        assert!(matches!(
            session.detect(),
            Err(Error::UnsupportedTransport { .. })
        ));
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureReason::UnsupportedBootloader)
        );
    }

    #[test]
    fn test_v2_over_serial_is_accepted() {
        let chip = SimulatedChip::v2(0x54, BootloaderVersion::new(2, 5, 0)).over_serial();
        let session = detected(chip);
        assert_eq!(session.transport().kind(), TransportKind::Serial);
    }

    #[test]
    fn test_key_checksum_mismatch_fails_detect() {
        let mut chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        chip.key_checksum_skew = 1;
        let mut session = session(chip);
        assert!(matches!(
            session.detect(),
            Err(Error::ChecksumMismatch { .. })
        ));
        assert_eq!(session.state(), SessionState::Failed(FailureReason::NoDevice));
    }

    #[test]
    fn test_detect_twice_is_invalid() {
        let mut session = detected(SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1)));
        assert!(matches!(
            session.detect(),
            Err(Error::InvalidState { operation: "detect", .. })
        ));
        assert_eq!(session.state(), SessionState::Detected);
    }

    #[test]
    fn test_operations_before_detect_are_invalid() {
        let mut session = session(SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1)));
        assert!(matches!(session.erase(), Err(Error::InvalidState { .. })));
        assert!(matches!(
            session.write(&[1, 2, 3], |_, _| {}),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(session.start_app(), Err(Error::InvalidState { .. })));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.transport().sent.is_empty());
    }

    #[test]
    fn test_v2_erase_write_verify_start() {
        let chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        let mut session = detected(chip);
        let img = image(1003);

        session.erase().unwrap();
        assert_eq!(session.state(), SessionState::Detected);

        let mut calls = Vec::new();
        session
            .write(&img, |done, total| calls.push((done, total)))
            .unwrap();
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(calls.first(), Some(&(0, 1003)));
        assert_eq!(calls.last(), Some(&(1003, 1003)));
        assert!(calls.windows(2).all(|w| w[0].0 < w[1].0));

        let chip = session.transport();
        assert_eq!(chip.count("write"), 18);
        assert_eq!(&chip.flash[..1003], img.as_slice());
        // 51 trailing bytes go out as a 56-byte block
        let Some(Command::Write { offset, data, .. }) = chip.commands.last() else {
            panic!("no write command recorded");
        };
        assert_eq!(*offset, 952);
        assert_eq!(data.len(), 56);
        assert_eq!(&chip.flash[1003..1008], &[0xFF; 5]);

        session.verify(&img, |_, _| {}).unwrap();
        assert_eq!(session.state(), SessionState::Done);

        session.start_app().unwrap();
        assert_eq!(session.state(), SessionState::Done);
        assert!(matches!(
            session.write(&img, |_, _| {}),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_v2_payload_is_scrambled_on_the_wire() {
        let chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        let mut session = detected(chip);
        let img = vec![0x00; 8];
        session.write(&img, |_, _| {}).unwrap();

        let chip = session.transport();
        let key = chip.key.unwrap();
        let Some(Command::Write { data, .. }) = chip.commands.last() else {
            panic!("no write command recorded");
        };
        assert_eq!(data.as_slice(), key.bytes());
    }

    #[test]
    fn test_v1_write_1024_bytes_in_18_chunks() {
        let chip = SimulatedChip::v1(0x52, BootloaderVersion::new(1, 1, 0));
        let mut session = detected(chip);
        let img = image(1024);

        session.erase().unwrap();
        assert_eq!(session.transport().count("erase-block"), 16);

        session.write(&img, |_, _| {}).unwrap();
        let chip = session.transport();
        assert_eq!(chip.count("write"), 18);
        let offsets: Vec<u32> = chip
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::Write { offset, data, .. } => {
                    assert!(data.len() <= 60);
                    Some(*offset)
                },
                _ => None,
            })
            .collect();
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(&chip.flash[..1024], img.as_slice());
        // 1024 = 17 * 60 + 4, sent unpadded
        let Some(Command::Write { offset, data, .. }) = chip.commands.last() else {
            panic!("no write command recorded");
        };
        assert_eq!(*offset, 1020);
        assert_eq!(data.as_slice(), &img[1020..]);

        session.verify(&img, |_, _| {}).unwrap();
    }

    #[test]
    fn test_timeout_on_fifth_chunk_stops_write() {
        let mut chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        chip.silent_on_write = Some(4);
        let mut session = detected(chip);
        let img = image(56 * 10);

        let err = session.write(&img, |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::WriteAt { offset: 224, .. }));
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureReason::WriteAt(224))
        );
        // Chunks 6 to 10 are never sent
        assert_eq!(session.transport().count("write"), 5);
        assert!(matches!(
            session.verify(&img, |_, _| {}),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_nak_reports_chunk_offset() {
        let mut chip = SimulatedChip::v1(0x51, BootloaderVersion::new(1, 1, 0));
        chip.nak_on_write = Some(2);
        let mut session = detected(chip);

        let err = session.write(&image(300), |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::WriteAt { offset: 120, .. }));
    }

    #[test]
    fn test_verify_mismatch_reports_offset() {
        let chip = SimulatedChip::v2(0x54, BootloaderVersion::new(2, 3, 1));
        let mut session = detected(chip);
        let img = image(512);
        session.erase().unwrap();
        session.write(&img, |_, _| {}).unwrap();

        let mut other = img.clone();
        other[200] ^= 0xFF;
        let err = session.verify(&other, |_, _| {}).unwrap_err();
        // Byte 200 lives in the chunk starting at 3 * 56
        assert!(matches!(err, Error::VerifyMismatchAt { offset: 168, .. }));
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureReason::VerifyMismatchAt(168))
        );
    }

    #[test]
    fn test_v1_verify_mismatch_reports_offset() {
        let chip = SimulatedChip::v1(0x52, BootloaderVersion::new(1, 1, 0));
        let mut session = detected(chip);
        let img = image(400);
        session.erase().unwrap();
        session.write(&img, |_, _| {}).unwrap();

        let mut other = img.clone();
        other[250] ^= 0x01;
        let err = session.verify(&other, |_, _| {}).unwrap_err();
        // Byte 250 lives in the chunk starting at 4 * 60
        assert!(matches!(err, Error::VerifyMismatchAt { offset: 240, .. }));
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureReason::VerifyMismatchAt(240))
        );
        assert_eq!(session.transport().count("verify"), 5);
    }

    #[test]
    fn test_v1_erase_block_rejected() {
        let mut chip = SimulatedChip::v1(0x54, BootloaderVersion::new(1, 1, 0));
        chip.erase_status = 0x01;
        let mut session = detected(chip);

        assert!(matches!(session.erase(), Err(Error::EraseRejected(_))));
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureReason::EraseRejected)
        );
        // Unlock, then the first block is refused
        assert_eq!(session.transport().count("erase"), 1);
        assert_eq!(session.transport().count("erase-block"), 1);
    }

    #[test]
    fn test_each_command_waits_with_its_own_timeout() {
        let config = SessionConfig::default()
            .with_detect_timeout(Duration::from_millis(110))
            .with_write_timeout(Duration::from_millis(220))
            .with_erase_timeout(Duration::from_millis(3300))
            .with_reset_timeout(Duration::from_millis(44));
        let detect = config.detect_timeout;
        let write = config.write_timeout;
        let erase = config.erase_timeout;
        let reset = config.reset_timeout;

        let chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        let mut session =
            BootloaderSession::new(chip, config.clone()).with_interrupt_checker(|| false);
        let img = image(200);
        session.detect().unwrap();
        session.erase().unwrap();
        session.write(&img, |_, _| {}).unwrap();
        session.verify(&img, |_, _| {}).unwrap();
        session.start_app().unwrap();

        let chip = session.transport();
        for name in ["identify", "read-config", "isp-key"] {
            assert_eq!(chip.timeouts_for(name), vec![detect], "{name}");
        }
        assert_eq!(chip.timeouts_for("erase"), vec![erase]);
        assert_eq!(chip.timeouts_for("write"), vec![write]);
        assert_eq!(chip.timeouts_for("verify"), vec![write]);
        assert_eq!(chip.timeouts_for("exit"), vec![reset]);

        let chip = SimulatedChip::v1(0x51, BootloaderVersion::new(1, 1, 0));
        let mut session = BootloaderSession::new(chip, config).with_interrupt_checker(|| false);
        session.detect().unwrap();
        session.erase().unwrap();
        session.write(&img, |_, _| {}).unwrap();

        let chip = session.transport();
        for name in ["identify-v2", "identify", "read-config"] {
            assert_eq!(chip.timeouts_for(name), vec![detect], "{name}");
        }
        assert_eq!(chip.timeouts_for("erase"), vec![erase]);
        assert_eq!(chip.timeouts_for("erase-block"), vec![erase]);
        assert_eq!(chip.timeouts_for("write"), vec![write]);
    }

    #[test]
    fn test_erase_rejected() {
        let mut chip = SimulatedChip::v2(0x59, BootloaderVersion::new(2, 4, 0));
        chip.erase_status = 0x01;
        let mut session = detected(chip);

        assert!(matches!(session.erase(), Err(Error::EraseRejected(_))));
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureReason::EraseRejected)
        );
        let Some(Command::Erase { units }) = session.transport().commands.last() else {
            panic!("no erase command recorded");
        };
        assert_eq!(*units, 0x1D);
    }

    #[test]
    fn test_image_too_large_keeps_state() {
        let chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        let mut session = detected(chip);
        let sent = session.transport().sent.len();

        let err = session
            .write(&image(16 * 1024 + 1), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::ImageTooLarge { .. }));
        assert_eq!(session.state(), SessionState::Detected);
        assert_eq!(session.transport().sent.len(), sent);
    }

    #[test]
    fn test_start_app_timeout_is_success() {
        let chip = SimulatedChip::v1(0x52, BootloaderVersion::new(1, 1, 0));
        let mut session = detected(chip);
        session.start_app().unwrap();
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(session.transport().sent.last().unwrap(), &vec![0xA5, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_start_app_with_reply_is_success() {
        let mut chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        chip.reply_to_exit = true;
        let mut session = detected(chip);
        session.start_app().unwrap();
        assert_eq!(session.state(), SessionState::Done);
    }

    #[test]
    fn test_start_app_link_error_after_exit_is_success() {
        let mut chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        chip.break_link_on_exit = true;
        let mut session = detected(chip);

        session.start_app().unwrap();
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(session.transport().sent.last().unwrap(), &vec![0xA2, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_start_app_send_failure_is_transport_failure() {
        let mut chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        // identify, config, key, config; the exit frame never leaves
        chip.disconnect_after = Some(4);
        let mut session = detected(chip);

        assert!(matches!(session.start_app(), Err(Error::Disconnected)));
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureReason::Transport)
        );
    }

    #[test]
    fn test_disconnect_mid_write_is_transport_failure() {
        let mut chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        // identify, config, key, config, then two chunks
        chip.disconnect_after = Some(6);
        let mut session = detected(chip);

        let err = session.write(&image(560), |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::Disconnected));
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureReason::Transport)
        );
    }

    #[test]
    fn test_interrupt_between_chunks() {
        use std::cell::Cell;
        use std::rc::Rc;

        let calls = Rc::new(Cell::new(0usize));
        let counter = Rc::clone(&calls);
        let chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        let mut session = BootloaderSession::new(chip, SessionConfig::default())
            .with_interrupt_checker(move || {
                counter.set(counter.get() + 1);
                counter.get() > 3
            });
        session.detect().unwrap();

        let err = session.write(&image(560), |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert_eq!(session.transport().count("write"), 3);
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureReason::Interrupted)
        );
    }

    #[test]
    fn test_drop_closes_transport() {
        let chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        let closed = chip.close_flag();
        {
            let _session = session(chip);
        }
        assert!(closed.get());

        let chip = SimulatedChip::v2(0x52, BootloaderVersion::new(2, 3, 1));
        let closed = chip.close_flag();
        session(chip).close().unwrap();
        assert!(closed.get());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Idle.to_string(), "idle");
        assert_eq!(
            SessionState::Writing {
                done: 56,
                total: 100
            }
            .to_string(),
            "writing (56/100 bytes)"
        );
        assert_eq!(
            SessionState::Failed(FailureReason::WriteAt(0x38)).to_string(),
            "failed: write failed at 0x0038"
        );
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::default()
            .with_detect_timeout(Duration::from_millis(200))
            .with_write_timeout(Duration::from_millis(300))
            .with_erase_timeout(Duration::from_secs(9))
            .with_reset_timeout(Duration::from_millis(50))
            .with_key_seed([0x5A; KEY_SEED_LEN]);
        assert_eq!(config.detect_timeout, Duration::from_millis(200));
        assert_eq!(config.write_timeout, Duration::from_millis(300));
        assert_eq!(config.erase_timeout, Duration::from_secs(9));
        assert_eq!(config.reset_timeout, Duration::from_millis(50));
        assert_eq!(config.key_seed, [0x5A; KEY_SEED_LEN]);
    }
}
