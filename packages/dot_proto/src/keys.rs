//! Key-code layout and command constants.
//!
//! A key code is 64 bits wide:
//!
//! ```text
//! bits 61..64  type        (0 = symbol, 1 = command)
//! bits 48..61  command block
//! bits 32..48  command argument
//! bits  0..32  modifier flags
//! ```
//!
//! Flags sit in the low word so that "a command with any flags" is one
//! contiguous range, and a whole command block is one contiguous range too.

/// A key code as carried by `Key` packets and key-range requests.
pub type KeyCode = u64;

pub const KEY_FLAGS_MASK: KeyCode = 0x0000_0000_FFFF_FFFF;
pub const KEY_ARG_SHIFT: u32 = 32;
pub const KEY_ARG_MASK: KeyCode = 0xFFFF << KEY_ARG_SHIFT;
pub const KEY_BLOCK_SHIFT: u32 = 48;
pub const KEY_BLOCK_MASK: KeyCode = 0x1FFF << KEY_BLOCK_SHIFT;
pub const KEY_TYPE_MASK: KeyCode = 0xE000_0000_0000_0000;
pub const KEY_TYPE_SYM: KeyCode = 0;
pub const KEY_TYPE_CMD: KeyCode = 0x2000_0000_0000_0000;

/// Unicode symbols are tagged with this bit inside the value word.
pub const KEY_SYM_UNICODE: KeyCode = 0x0100_0000 << KEY_ARG_SHIFT;

/// Basic command arguments (block [`blk::BASIC`]).
pub mod cmd {
    pub const NOOP: u16 = 0x00;
    pub const LNUP: u16 = 0x01;
    pub const LNDN: u16 = 0x02;
    pub const FWINLT: u16 = 0x03;
    pub const FWINRT: u16 = 0x04;
    pub const TOP: u16 = 0x05;
    pub const BOT: u16 = 0x06;
    pub const HOME: u16 = 0x07;
    pub const HELP: u16 = 0x08;
    pub const RESTARTBRL: u16 = 0x30;
    pub const RESTARTSPEECH: u16 = 0x31;
    pub const RESTARTSCREEN: u16 = 0x32;
    pub const OFFLINE: u16 = 0x33;
}

/// Command blocks. Block arguments carry a cell offset, dot pattern, or
/// pass-through scan code depending on the block.
pub mod blk {
    pub const BASIC: u16 = 0x00;
    pub const ROUTE: u16 = 0x01;
    pub const PASSDOTS: u16 = 0x02;
    pub const PASSCHAR: u16 = 0x03;
    pub const CONTEXT: u16 = 0x10;
    pub const ALERT: u16 = 0x11;
    pub const PASSXT: u16 = 0x12;
    pub const PASSAT: u16 = 0x13;
    pub const PASSPS2: u16 = 0x14;
}

/// An inclusive range of key codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyRange {
    pub first: KeyCode,
    pub last: KeyCode,
}

impl KeyRange {
    pub const FULL: KeyRange = KeyRange {
        first: 0,
        last: KeyCode::MAX,
    };

    pub const fn new(first: KeyCode, last: KeyCode) -> Self {
        Self { first, last }
    }

    pub const fn single(code: KeyCode) -> Self {
        Self::new(code, code)
    }

    pub const fn contains(&self, code: KeyCode) -> bool {
        self.first <= code && code <= self.last
    }

    pub const fn is_valid(&self) -> bool {
        self.first <= self.last
    }
}

/// Build a command key code with no flags.
pub const fn command(block: u16, arg: u16) -> KeyCode {
    KEY_TYPE_CMD
        | (((block as KeyCode) << KEY_BLOCK_SHIFT) & KEY_BLOCK_MASK)
        | ((arg as KeyCode) << KEY_ARG_SHIFT)
}

/// Build a Unicode symbol key code.
pub const fn symbol(ch: char) -> KeyCode {
    KEY_TYPE_SYM | KEY_SYM_UNICODE | ((ch as KeyCode) << KEY_ARG_SHIFT)
}

pub const fn key_type(code: KeyCode) -> KeyCode {
    code & KEY_TYPE_MASK
}

pub const fn is_command(code: KeyCode) -> bool {
    key_type(code) == KEY_TYPE_CMD
}

pub const fn command_block(code: KeyCode) -> u16 {
    ((code & KEY_BLOCK_MASK) >> KEY_BLOCK_SHIFT) as u16
}

pub const fn command_arg(code: KeyCode) -> u16 {
    ((code & KEY_ARG_MASK) >> KEY_ARG_SHIFT) as u16
}

pub const fn flags(code: KeyCode) -> u32 {
    (code & KEY_FLAGS_MASK) as u32
}

/// Every code of one command, whatever its flags.
pub const fn command_range(block: u16, arg: u16) -> KeyRange {
    let base = command(block, arg);
    KeyRange::new(base, base | KEY_FLAGS_MASK)
}

/// Every code in a command block.
pub const fn block_range(block: u16) -> KeyRange {
    let base = command(block, 0);
    KeyRange::new(base, base | KEY_ARG_MASK | KEY_FLAGS_MASK)
}

/// Commands the owning application keeps for itself. Command-mode clients
/// never receive these unless they explicitly accept them.
pub const RESERVED_COMMANDS: [KeyRange; 10] = [
    command_range(blk::BASIC, cmd::NOOP),
    command_range(blk::BASIC, cmd::OFFLINE),
    command_range(blk::BASIC, cmd::RESTARTBRL),
    command_range(blk::BASIC, cmd::RESTARTSPEECH),
    command_range(blk::BASIC, cmd::RESTARTSCREEN),
    block_range(blk::CONTEXT),
    block_range(blk::ALERT),
    block_range(blk::PASSXT),
    block_range(blk::PASSAT),
    block_range(blk::PASSPS2),
];

/// Signal broadcast when the device goes away.
pub const OFFLINE: KeyCode = command(blk::BASIC, cmd::OFFLINE);

/// Signal broadcast when the device comes back.
pub const ONLINE: KeyCode = command(blk::BASIC, cmd::NOOP);
