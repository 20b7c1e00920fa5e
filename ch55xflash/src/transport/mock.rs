//! Simulated CH55x bootloader used by unit tests.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::protocol::checksum::{Bootkey, sum8};
use crate::protocol::frame::{Command, opcode};
use crate::protocol::version::{ProtocolVersion, TransportKind};
use crate::target::chip::{BootloaderVersion, ChipModel, ERASE_BLOCK_SIZE, ERASED_FILL};
use crate::transport::Transport;

/// Bootloader simulation answering real frames.
pub(crate) struct SimulatedChip {
    pub protocol: ProtocolVersion,
    pub kind: TransportKind,
    pub chip_id: u8,
    pub version: BootloaderVersion,
    pub unique_id: [u8; 4],
    pub flash: Vec<u8>,
    pub key: Option<Bootkey>,
    /// Every frame received, verbatim.
    pub sent: Vec<Vec<u8>>,
    /// Parsed commands (the 2.x identify sent to a V1 chip is not a V1 command and is skipped).
    pub commands: Vec<Command>,
    /// Reply timeout the host waited with, per command name.
    pub timeouts: Vec<(&'static str, Duration)>,
    pending: Option<Vec<u8>>,
    last_sent: &'static str,
    /// No reply to anything.
    pub silent: bool,
    /// Write command index that gets no reply.
    pub silent_on_write: Option<usize>,
    /// Write command index answered with a failure status.
    pub nak_on_write: Option<usize>,
    /// Status returned for erase commands.
    pub erase_status: u8,
    /// Added to the bootkey checksum reported after `IspKey`.
    pub key_checksum_skew: u8,
    /// Answer the exit command instead of resetting silently.
    pub reply_to_exit: bool,
    /// Leave the bus after this many frames.
    pub disconnect_after: Option<usize>,
    /// Tear down the endpoint instead of answering the exit command.
    pub break_link_on_exit: bool,
    writes: usize,
    closed: Rc<Cell<bool>>,
}

impl SimulatedChip {
    fn new(protocol: ProtocolVersion, chip_id: u8, version: BootloaderVersion) -> Self {
        // Whole flash array, bootloader area included
        let size = ChipModel::from_id(chip_id).map_or(16, |m| m.erase_block_count()) * ERASE_BLOCK_SIZE;
        Self {
            protocol,
            kind: TransportKind::Usb,
            chip_id,
            version,
            unique_id: [0x12, 0x34, 0x56, 0x78],
            flash: vec![0x00; size],
            key: None,
            sent: Vec::new(),
            commands: Vec::new(),
            timeouts: Vec::new(),
            pending: None,
            last_sent: "",
            silent: false,
            silent_on_write: None,
            nak_on_write: None,
            erase_status: 0x00,
            key_checksum_skew: 0,
            reply_to_exit: false,
            disconnect_after: None,
            break_link_on_exit: false,
            writes: 0,
            closed: Rc::new(Cell::new(false)),
        }
    }

    /// A chip running a 2.31+ bootloader.
    pub fn v2(chip_id: u8, version: BootloaderVersion) -> Self {
        Self::new(ProtocolVersion::V2, chip_id, version)
    }

    /// A chip running a 1.x bootloader.
    pub fn v1(chip_id: u8, version: BootloaderVersion) -> Self {
        Self::new(ProtocolVersion::V1, chip_id, version)
    }

    /// Report the link as a serial port.
    pub fn over_serial(mut self) -> Self {
        self.kind = TransportKind::Serial;
        self
    }

    /// Flag set once the transport has been closed.
    pub fn close_flag(&self) -> Rc<Cell<bool>> {
        Rc::clone(&self.closed)
    }

    /// Distinct timeouts used while waiting for replies to `name`.
    pub fn timeouts_for(&self, name: &str) -> Vec<Duration> {
        let mut found: Vec<Duration> = self
            .timeouts
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, t)| *t)
            .collect();
        found.dedup();
        found
    }

    /// Commands of the given name, in order.
    pub fn count(&self, name: &str) -> usize {
        self.commands
            .iter()
            .filter(|c| c.name() == name)
            .count()
    }

    fn respond(&mut self, raw: &[u8]) -> Option<Vec<u8>> {
        // A 1.x bootloader answers the 2.x identify with a bare 2-byte reply
        if self.protocol == ProtocolVersion::V1 && raw.first() == Some(&opcode::v2::IDENTIFY) {
            self.last_sent = "identify-v2";
            return (!self.silent).then(|| vec![self.chip_id, 0x11]);
        }

        let Ok(cmd) = Command::parse(raw, self.protocol) else {
            self.last_sent = "unknown";
            return None;
        };
        self.last_sent = cmd.name();
        self.commands.push(cmd.clone());
        if self.silent {
            return None;
        }
        match self.protocol {
            ProtocolVersion::V1 => self.respond_v1(&cmd),
            ProtocolVersion::V2 => self.respond_v2(&cmd),
        }
    }

    fn respond_v1(&mut self, cmd: &Command) -> Option<Vec<u8>> {
        match cmd {
            Command::Identify => Some(vec![self.chip_id, 0x11]),
            Command::ReadConfig => Some(vec![(self.version.major << 4) | self.version.minor, 0x00]),
            Command::Erase { .. } => Some(vec![0x00, 0x00]),
            Command::EraseBlock { block } => {
                if self.erase_status == 0 {
                    let start = usize::from(*block) * ERASE_BLOCK_SIZE;
                    let end = (start + ERASE_BLOCK_SIZE).min(self.flash.len());
                    self.flash[start..end].fill(ERASED_FILL);
                }
                Some(vec![self.erase_status, 0x00])
            },
            Command::Write { offset, data, .. } => {
                let status = self.program(*offset, data)?;
                Some(vec![status, 0x00])
            },
            Command::Verify { offset, data, .. } => Some(vec![self.compare(*offset, data), 0x00]),
            Command::Exit => self
                .reply_to_exit
                .then(|| vec![0x00, 0x00]),
            Command::IspKey { .. } => None,
        }
    }

    fn respond_v2(&mut self, cmd: &Command) -> Option<Vec<u8>> {
        use opcode::v2;

        match cmd {
            Command::Identify => Some(reply_v2(v2::IDENTIFY, &[self.chip_id, 0x11])),
            Command::ReadConfig => {
                let mut data = vec![0u8; 26];
                data[0] = 0x1F;
                data[15..18].copy_from_slice(&[
                    self.version.major,
                    self.version.minor,
                    self.version.patch,
                ]);
                data[18..22].copy_from_slice(&self.unique_id);
                Some(reply_v2(v2::READ_CONFIG, &data))
            },
            Command::IspKey { seed } => {
                let key = Bootkey::derive(seed, sum8(&self.unique_id), self.chip_id)?;
                self.key = Some(key);
                let checksum = key
                    .checksum()
                    .wrapping_add(self.key_checksum_skew);
                Some(reply_v2(v2::ISP_KEY, &[checksum, 0x00]))
            },
            Command::Erase { .. } => {
                if self.erase_status == 0 {
                    self.flash.fill(ERASED_FILL);
                }
                Some(reply_v2(v2::ERASE, &[self.erase_status, 0x00]))
            },
            Command::Write { offset, data, .. } => {
                let plain = self.descramble(data);
                let status = self.program(*offset, &plain)?;
                Some(reply_v2(v2::WRITE, &[status, 0x00]))
            },
            Command::Verify { offset, data, .. } => {
                let plain = self.descramble(data);
                let status = self.compare(*offset, &plain);
                Some(reply_v2(v2::VERIFY, &[status, 0x00]))
            },
            Command::Exit => self
                .reply_to_exit
                .then(|| reply_v2(v2::EXIT, &[0x00, 0x00])),
            Command::EraseBlock { .. } => None,
        }
    }

    fn descramble(&self, data: &[u8]) -> Vec<u8> {
        self.key
            .map_or_else(|| data.to_vec(), |key| key.scramble(data))
    }

    /// Program flash; `None` means the chip stays silent.
    fn program(&mut self, offset: u32, data: &[u8]) -> Option<u8> {
        let index = self.writes;
        self.writes += 1;
        if self.silent_on_write == Some(index) {
            return None;
        }
        if self.nak_on_write == Some(index) {
            return Some(0x01);
        }
        let start = offset as usize;
        let end = (start + data.len()).min(self.flash.len());
        self.flash[start..end].copy_from_slice(&data[..end - start]);
        Some(0x00)
    }

    fn compare(&self, offset: u32, data: &[u8]) -> u8 {
        let start = offset as usize;
        match self.flash.get(start..start + data.len()) {
            Some(flash) if flash == data => 0x00,
            _ => 0x01,
        }
    }
}

fn reply_v2(op: u8, data: &[u8]) -> Vec<u8> {
    let mut reply = vec![op, 0x00, 0x00, 0x00];
    LittleEndian::write_u16(&mut reply[2..4], data.len() as u16);
    reply.extend_from_slice(data);
    reply
}

impl Transport for SimulatedChip {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn name(&self) -> &str {
        "simulated"
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed.get() {
            return Err(Error::Disconnected);
        }
        if self
            .disconnect_after
            .is_some_and(|n| self.sent.len() >= n)
        {
            return Err(Error::Disconnected);
        }
        self.sent.push(data.to_vec());
        self.pending = self.respond(data);
        Ok(())
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        if self.closed.get() {
            return Err(Error::Disconnected);
        }
        self.timeouts.push((self.last_sent, timeout));
        if self.break_link_on_exit && self.last_sent == "exit" {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "endpoint gone",
            )));
        }
        match self.pending.take() {
            Some(mut reply) => {
                reply.truncate(max_len);
                Ok(reply)
            },
            None => Err(Error::Timeout("simulated chip did not answer".into())),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closed.set(true);
        Ok(())
    }
}
