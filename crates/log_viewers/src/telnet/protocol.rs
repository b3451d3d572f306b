//! Telnet NVT bytes (RFC 854/855/858/1091) and the ANSI escapes this crate
//! emits.

use logging::LogLevel;

// Commands
pub const SE: u8 = 240;
pub const NOP: u8 = 241;
pub const SB: u8 = 250;
pub const WILL: u8 = 251;
pub const WONT: u8 = 252;
pub const DO: u8 = 253;
pub const DONT: u8 = 254;
pub const IAC: u8 = 255;

// Options
pub const OPTION_ECHO: u8 = 1; // RFC 857
pub const OPTION_SUPPRESS_GO_AHEAD: u8 = 3; // RFC 858
pub const OPTION_TERMINAL_TYPE: u8 = 24; // RFC 1091

// Terminal-type subnegotiation qualifiers (RFC 1091)
pub const TERMINAL_TYPE_IS: u8 = 0;
pub const TERMINAL_TYPE_SEND: u8 = 1;

// Control codes
pub const BEL: u8 = 0x07;
pub const BS: u8 = 0x08;
pub const HT: u8 = 0x09;
pub const LF: u8 = 0x0A;
pub const CR: u8 = 0x0D;
pub const ESC: u8 = 0x1B;
pub const DEL: u8 = 0x7F;

/// Sent immediately after accept: we echo, both sides suppress go-ahead,
/// and the peer is asked for its terminal type.
pub const NEGOTIATION_BLOCK: &[u8] = &[
    IAC,
    WILL,
    OPTION_ECHO,
    IAC,
    WILL,
    OPTION_SUPPRESS_GO_AHEAD,
    IAC,
    DO,
    OPTION_SUPPRESS_GO_AHEAD,
    IAC,
    DO,
    OPTION_TERMINAL_TYPE,
];

/// `IAC SB TerminalType SEND IAC SE`: asks the peer to name its terminal.
pub const TERMINAL_TYPE_REQUEST: &[u8] = &[
    IAC,
    SB,
    OPTION_TERMINAL_TYPE,
    TERMINAL_TYPE_SEND,
    IAC,
    SE,
];

/// Carriage return plus erase-to-end-of-line, used to suppress the prompt
/// while a log line is streamed.
pub const ERASE_LINE: &[u8] = b"\r\x1b[K";

/// ANSI save-cursor, emitted once a terminal type is known.
pub const SAVE_CURSOR: &[u8] = b"\x1b[s";

pub const SGR_RESET: &[u8] = b"\x1b[0m";

/// Terminal names (prefix match, case-insensitive) treated as
/// color-capable.
pub const COLOR_TERMINAL_PREFIXES: &[&str] = &["xterm", "ansi", "linux", "screen", "rxvt", "vt100"];

/// SGR prefix keyed to record severity; `None` leaves the default
/// foreground.
pub fn sgr_prefix(level: LogLevel) -> Option<&'static [u8]> {
    match level {
        LogLevel::Debug => Some(b"\x1b[36m"),
        LogLevel::Verbose => Some(b"\x1b[34m"),
        LogLevel::Info => None,
        LogLevel::Warning => Some(b"\x1b[33m"),
        LogLevel::Error => Some(b"\x1b[31m"),
        LogLevel::Exception => Some(b"\x1b[35m"),
        LogLevel::Abort => Some(b"\x1b[1;31m"),
    }
}

pub fn is_color_terminal(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    COLOR_TERMINAL_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}
