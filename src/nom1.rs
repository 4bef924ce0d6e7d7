//! NOM-1 (C9): the in-band command protocol carried in every UDP datagram.
//!
//! Every datagram begins with a 2-byte header (version/reserved, command/sequence) followed by
//! an opaque command body. Grounded in the manual-shift `Serialize`-style of `frame::serial`
//! (`fn read(data: &[u8]) -> Option<Self>` / `fn write(&self) -> Box<[u8]>`), since this is
//! exactly the kind of small fixed-layout header that module already specializes in.

/// The only NOM-1 version this crate speaks.
pub const VERSION: u8 = 1;

/// A NOM-1 command code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Reject: body carries an ASCII reason string.
    Rotfl,
    /// Outgoing connect attempt: body carries the ASCII address we're trying to reach.
    Ohai,
    /// Reply to OHAI: body echoes the OHAI address.
    OhaiOk,
    /// Liveness heartbeat; empty body.
    Hugz,
    /// Reply to HUGZ; empty body.
    HugzOk,
    /// Application payload, single frame.
    Nom,
}

impl Command {
    fn code(self) -> u8 {
        match self {
            Command::Rotfl => 0,
            Command::Ohai => 1,
            Command::OhaiOk => 2,
            Command::Hugz => 3,
            Command::HugzOk => 4,
            Command::Nom => 5,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Command::Rotfl),
            1 => Some(Command::Ohai),
            2 => Some(Command::OhaiOk),
            3 => Some(Command::Hugz),
            4 => Some(Command::HugzOk),
            5 => Some(Command::Nom),
            _ => None,
        }
    }
}

/// The reason a datagram was rejected by [`Frame::read`], for the reactor to log and count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer than the 2-byte header's worth of bytes were present.
    Truncated,
    /// The header's version nibble did not match [`VERSION`].
    VersionMismatch(u8),
    /// The header's command nibble was 6 or greater.
    UnknownCommand(u8),
}

/// A decoded NOM-1 datagram: header fields plus the opaque command body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// The per-peering request/reply sequence counter, 4 bits wide (0..=15).
    pub sequence: u8,
    pub command: Command,
    pub body: Vec<u8>,
}

impl Frame {
    /// Builds a frame. `sequence` is masked to 4 bits, matching the wire layout.
    pub fn new(command: Command, sequence: u8, body: Vec<u8>) -> Self {
        Self { sequence: sequence & 0x0F, command, body }
    }

    /// Parses a NOM-1 datagram.
    ///
    /// Returns the specific rejection reason on failure so the caller can log and bump the
    /// appropriate counter per `§7`'s `ProtocolError` handling, rather than collapsing every
    /// failure into `None`.
    pub fn read(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 2 {
            return Err(DecodeError::Truncated);
        }

        let version = data[0] >> 4;
        if version != VERSION {
            return Err(DecodeError::VersionMismatch(version));
        }

        let command_code = data[1] >> 4;
        let sequence = data[1] & 0x0F;

        let command = Command::from_code(command_code).ok_or(DecodeError::UnknownCommand(command_code))?;

        Ok(Self { sequence, command, body: data[2..].to_vec() })
    }

    /// Serializes this frame to its wire form.
    pub fn write(&self) -> Box<[u8]> {
        let mut out = Vec::with_capacity(2 + self.body.len());
        out.push((VERSION << 4) & 0xF0);
        out.push(((self.command.code() << 4) & 0xF0) | (self.sequence & 0x0F));
        out.extend_from_slice(&self.body);
        out.into_boxed_slice()
    }
}
