use std::collections::VecDeque;

use logging::LogLevel;

use crate::{
    consts,
    telnet::protocol::{
        self,
        BEL,
        BS,
        CR,
        DEL,
        DO,
        DONT,
        ESC,
        HT,
        IAC,
        LF,
        SB,
        SE,
        WILL,
        WONT,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    Normal,
    /// After `IAC`.
    Command,
    /// After `IAC WILL/WONT/DO/DONT`, holding the verb.
    OptionNegotiation(u8),
    /// Inside `IAC SB ... IAC SE`.
    Subnegotiation,
    /// `IAC` seen inside a subnegotiation.
    SubnegotiationCommand,
    /// After a bare `ESC`.
    EscapePending,
    /// After `ESC [`, accumulating parameter bytes.
    CsiAccumulate,
}

/// Result of feeding raw peer bytes through the session state machine.
#[derive(Default)]
pub struct FeedOutcome {
    /// Bytes to write back to the peer (echo, negotiation replies, redraws).
    pub output: Vec<u8>,
    /// Lines committed with carriage return, in arrival order.
    pub lines: Vec<String>,
    /// Set when the peer sent an unrecoverably malformed sequence; the
    /// session should be closed.
    pub malformed: bool,
}

/// Per-peer Telnet state: the rolling NVT parser, the line editor with its
/// history, and what option negotiation has taught us about the terminal.
///
/// The session is a pure bytes-in/bytes-out machine; socket I/O lives in
/// the sink.
pub struct TelnetSession {
    state: ParseState,
    line_buffer: Vec<u8>,
    history: VecDeque<String>,
    history_cursor: usize,
    max_history_size: usize,
    terminal_type: Option<String>,
    color_terminal: bool,
    terminal_type_requested: bool,
    prompt: String,
    tab_placeholder: String,
    pending: Vec<u8>,
}

impl TelnetSession {
    pub fn new(prompt: String, tab_placeholder: String, max_history_size: usize) -> Self {
        Self {
            state: ParseState::Normal,
            line_buffer: Vec::new(),
            history: VecDeque::new(),
            history_cursor: 0,
            max_history_size,
            terminal_type: None,
            color_terminal: false,
            terminal_type_requested: false,
            prompt,
            tab_placeholder,
            pending: Vec::new(),
        }
    }

    pub fn terminal_type(&self) -> Option<&str> {
        self.terminal_type.as_deref()
    }

    pub fn is_color_terminal(&self) -> bool {
        self.color_terminal
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn line_buffer(&self) -> &[u8] {
        &self.line_buffer
    }

    /// Runs the parser over freshly received bytes.
    pub fn feed(&mut self, input: &[u8]) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();
        for &byte in input {
            self.feed_byte(byte, &mut outcome);
            if outcome.malformed {
                break;
            }
        }
        outcome
    }

    fn feed_byte(&mut self, byte: u8, outcome: &mut FeedOutcome) {
        match self.state {
            ParseState::Normal => self.process_normal(byte, outcome),
            ParseState::Command => self.process_command(byte),
            ParseState::OptionNegotiation(verb) => {
                self.process_option(verb, byte, outcome);
                self.state = ParseState::Normal;
            },
            ParseState::Subnegotiation => {
                if byte == IAC {
                    self.state = ParseState::SubnegotiationCommand;
                } else {
                    self.push_pending(byte, outcome);
                }
            },
            ParseState::SubnegotiationCommand => match byte {
                SE => {
                    self.dispatch_subnegotiation(outcome);
                    self.state = ParseState::Normal;
                },
                IAC => {
                    // Escaped 0xFF data byte.
                    self.push_pending(IAC, outcome);
                    self.state = ParseState::Subnegotiation;
                },
                _ => self.state = ParseState::Subnegotiation,
            },
            ParseState::EscapePending => {
                if byte == b'[' {
                    self.pending.clear();
                    self.state = ParseState::CsiAccumulate;
                } else {
                    outcome.output.push(BEL);
                    self.state = ParseState::Normal;
                }
            },
            ParseState::CsiAccumulate => {
                if (0x40..=0x7E).contains(&byte) {
                    self.dispatch_ansi_sequence(byte, outcome);
                    self.pending.clear();
                    self.state = ParseState::Normal;
                } else {
                    self.push_pending(byte, outcome);
                }
            },
        }
    }

    fn process_normal(&mut self, byte: u8, outcome: &mut FeedOutcome) {
        match byte {
            IAC => self.state = ParseState::Command,
            ESC => self.state = ParseState::EscapePending,
            CR => self.process_carriage_return(outcome),
            // CR LF arrives as one carriage return.
            LF => {},
            DEL | BS => self.process_delete(outcome),
            HT => self.process_tab(outcome),
            0x20..=0x7E => self.process_printable(byte, outcome),
            // Other control and non-ASCII bytes are ignored.
            _ => {},
        }
    }

    fn process_command(&mut self, byte: u8) {
        match byte {
            WILL | WONT | DO | DONT => self.state = ParseState::OptionNegotiation(byte),
            SB => {
                self.pending.clear();
                self.state = ParseState::Subnegotiation;
            },
            // Escaped 0xFF is not ASCII; drop it like any non-ASCII byte.
            // NOP, AYT and friends are no-ops here.
            _ => self.state = ParseState::Normal,
        }
    }

    /// Option policy: accept what the negotiation block announced, ask a
    /// terminal-type-capable peer to name its terminal, refuse everything
    /// else.
    fn process_option(&mut self, verb: u8, option: u8, outcome: &mut FeedOutcome) {
        match verb {
            WILL => match option {
                protocol::OPTION_TERMINAL_TYPE => {
                    if !self.terminal_type_requested {
                        self.terminal_type_requested = true;
                        outcome
                            .output
                            .extend_from_slice(protocol::TERMINAL_TYPE_REQUEST);
                    }
                },
                protocol::OPTION_ECHO | protocol::OPTION_SUPPRESS_GO_AHEAD => {},
                _ => outcome.output.extend_from_slice(&[IAC, DONT, option]),
            },
            DO => match option {
                protocol::OPTION_ECHO | protocol::OPTION_SUPPRESS_GO_AHEAD => {},
                _ => outcome.output.extend_from_slice(&[IAC, WONT, option]),
            },
            _ => {},
        }
    }

    fn dispatch_subnegotiation(&mut self, outcome: &mut FeedOutcome) {
        let pending = std::mem::take(&mut self.pending);
        if pending.len() >= 2
            && pending[0] == protocol::OPTION_TERMINAL_TYPE
            && pending[1] == protocol::TERMINAL_TYPE_IS
        {
            let name = String::from_utf8_lossy(&pending[2..]).trim().to_owned();
            if !name.is_empty() {
                self.color_terminal = protocol::is_color_terminal(&name);
                self.terminal_type = Some(name);
                // The terminal is now known: save the cursor and draw the
                // prompt.
                outcome.output.extend_from_slice(protocol::SAVE_CURSOR);
                self.redraw_line(&mut outcome.output);
            }
        }
    }

    fn dispatch_ansi_sequence(&mut self, final_byte: u8, outcome: &mut FeedOutcome) {
        match final_byte {
            b'A' => self.process_cursor_up(outcome),
            b'B' => self.process_cursor_down(outcome),
            // Cursor forward/back and everything else: beep.
            _ => outcome.output.push(BEL),
        }
    }

    /// Older history entry, if any.
    fn process_cursor_up(&mut self, outcome: &mut FeedOutcome) {
        if self.history.is_empty() || self.history_cursor == 0 {
            outcome.output.push(BEL);
            return;
        }
        self.history_cursor -= 1;
        self.line_buffer = self.history[self.history_cursor].clone().into_bytes();
        self.redraw_line(&mut outcome.output);
    }

    /// Newer history entry; at the newest, clears back to an empty line.
    fn process_cursor_down(&mut self, outcome: &mut FeedOutcome) {
        if self.history_cursor >= self.history.len() {
            outcome.output.push(BEL);
            return;
        }
        self.history_cursor += 1;
        self.line_buffer = if self.history_cursor == self.history.len() {
            Vec::new()
        } else {
            self.history[self.history_cursor].clone().into_bytes()
        };
        self.redraw_line(&mut outcome.output);
    }

    fn process_delete(&mut self, outcome: &mut FeedOutcome) {
        if self.line_buffer.pop().is_some() {
            outcome.output.extend_from_slice(&[BS, b' ', BS]);
        }
    }

    fn process_tab(&mut self, outcome: &mut FeedOutcome) {
        self.line_buffer
            .extend_from_slice(self.tab_placeholder.as_bytes());
        outcome
            .output
            .extend_from_slice(self.tab_placeholder.as_bytes());
    }

    fn process_printable(&mut self, byte: u8, outcome: &mut FeedOutcome) {
        self.line_buffer.push(byte);
        outcome.output.push(byte);
    }

    fn process_carriage_return(&mut self, outcome: &mut FeedOutcome) {
        let line = String::from_utf8_lossy(&std::mem::take(&mut self.line_buffer)).into_owned();
        if self.max_history_size > 0
            && !line.is_empty()
            && self.history.back() != Some(&line)
        {
            self.history.push_back(line.clone());
            while self.history.len() > self.max_history_size {
                self.history.pop_front();
            }
        }
        self.history_cursor = self.history.len();
        outcome.output.extend_from_slice(b"\r\n");
        outcome.lines.push(line);
    }

    fn push_pending(&mut self, byte: u8, outcome: &mut FeedOutcome) {
        if self.pending.len() >= consts::MAX_PENDING_TELNET_BYTES {
            outcome.malformed = true;
            return;
        }
        self.pending.push(byte);
    }

    fn redraw_line(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(protocol::ERASE_LINE);
        output.extend_from_slice(self.prompt.as_bytes());
        output.extend_from_slice(&self.line_buffer);
    }

    /// Renders one formatted log line for this peer: suppresses the prompt
    /// (when one is displayed or a line is being edited), writes the
    /// possibly colorized record, then restores the prompt and the edit in
    /// progress.
    pub fn compose_record(&self, line: &str, level: LogLevel, colorize: bool) -> Vec<u8> {
        let mut out = Vec::new();
        let suppress = !self.prompt.is_empty() || !self.line_buffer.is_empty();
        if suppress {
            out.extend_from_slice(protocol::ERASE_LINE);
        }
        let text = sanitize_for_terminal(line.strip_suffix('\n').unwrap_or(line));
        match protocol::sgr_prefix(level) {
            Some(prefix) if colorize && self.color_terminal => {
                out.extend_from_slice(prefix);
                out.extend_from_slice(&text);
                out.extend_from_slice(protocol::SGR_RESET);
            },
            _ => out.extend_from_slice(&text),
        }
        out.extend_from_slice(b"\r\n");
        if suppress {
            out.extend_from_slice(self.prompt.as_bytes());
            out.extend_from_slice(&self.line_buffer);
        }
        out
    }
}

/// Lossy-ASCII terminal encoding: newlines become `\r\n`, non-ASCII bytes
/// become `?`.
pub fn sanitize_for_terminal(text: &str) -> Vec<u8> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = Vec::with_capacity(normalized.len());
    for c in normalized.chars() {
        match c {
            '\n' => out.extend_from_slice(b"\r\n"),
            c if c.is_ascii() => out.push(c as u8),
            _ => out.push(b'?'),
        }
    }
    out
}

/// Splits a command line into command and arguments, honoring single and
/// double quotes: a quoted span preserves whitespace and ends at the
/// matching quote. Backslashes are not interpreted.
pub fn parse_command_line(line: &str) -> Vec<String> {
    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    for c in line.chars() {
        match quote {
            Some(open) => {
                if c == open {
                    quote = None;
                } else {
                    current.push(c);
                }
            },
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    in_word = true;
                } else if c.is_whitespace() {
                    if in_word {
                        arguments.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                } else {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if in_word {
        arguments.push(current);
    }
    arguments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TelnetSession {
        TelnetSession::new("> ".to_owned(), "\t".to_owned(), 100)
    }

    #[test]
    fn test_echoes_printable_input() {
        let mut s = session();
        let outcome = s.feed(b"hi");
        assert_eq!(outcome.output, b"hi");
        assert_eq!(s.line_buffer(), b"hi");
        assert!(outcome.lines.is_empty());
    }

    #[test]
    fn test_carriage_return_commits_line() {
        let mut s = session();
        let outcome = s.feed(b"status\r");
        assert_eq!(outcome.lines, vec!["status".to_owned()]);
        assert!(s.line_buffer().is_empty());
        assert!(outcome.output.ends_with(b"\r\n"));
    }

    #[test]
    fn test_crlf_is_one_commit() {
        let mut s = session();
        let outcome = s.feed(b"a\r\nb\r\n");
        assert_eq!(outcome.lines, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn test_cursor_left_beeps_and_appends_at_end() {
        // Cursor left/right is a beep, so the final character lands at the
        // end of the line.
        let mut s = session();
        let outcome = s.feed(b"hi\x1b[D\x1b[Dx\r");
        assert_eq!(outcome.lines, vec!["hix".to_owned()]);
        let beeps = outcome.output.iter().filter(|&&b| b == BEL).count();
        assert_eq!(beeps, 2);
    }

    #[test]
    fn test_delete_erases_last_byte() {
        let mut s = session();
        let outcome = s.feed(b"ab\x7f");
        assert_eq!(s.line_buffer(), b"a");
        assert!(outcome.output.ends_with(&[BS, b' ', BS]));
        // Deleting on an empty line is silent.
        let mut s = session();
        let outcome = s.feed(b"\x7f");
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn test_backspace_works_like_delete() {
        let mut s = session();
        s.feed(b"ab\x08");
        assert_eq!(s.line_buffer(), b"a");
    }

    #[test]
    fn test_tab_inserts_placeholder() {
        let mut s = TelnetSession::new("> ".to_owned(), "    ".to_owned(), 100);
        let outcome = s.feed(b"a\t");
        assert_eq!(s.line_buffer(), b"a    ");
        assert_eq!(outcome.output, b"a    ");
    }

    #[test]
    fn test_non_ascii_and_control_bytes_ignored() {
        let mut s = session();
        s.feed(&[0x00, 0x01, 0x80, 0xFE, b'a', 0x05]);
        assert_eq!(s.line_buffer(), b"a");
        for &byte in s.line_buffer() {
            assert!((0x20..=0x7E).contains(&byte));
        }
    }

    #[test]
    fn test_history_navigation() {
        let mut s = session();
        s.feed(b"one\rtwo\r");

        let up = s.feed(b"\x1b[A");
        assert_eq!(s.line_buffer(), b"two");
        assert!(up.output.starts_with(b"\r\x1b[K> two".as_slice()));

        s.feed(b"\x1b[A");
        assert_eq!(s.line_buffer(), b"one");

        // At the oldest entry another up beeps.
        let outcome = s.feed(b"\x1b[A");
        assert_eq!(outcome.output, vec![BEL]);

        s.feed(b"\x1b[B");
        assert_eq!(s.line_buffer(), b"two");

        // Newest-plus-one clears the line.
        s.feed(b"\x1b[B");
        assert!(s.line_buffer().is_empty());

        // Already past the newest entry: beep.
        let outcome = s.feed(b"\x1b[B");
        assert_eq!(outcome.output, vec![BEL]);
    }

    #[test]
    fn test_history_skips_duplicates_and_empty_lines() {
        let mut s = session();
        s.feed(b"one\r\rone\r");
        s.feed(b"\x1b[A");
        assert_eq!(s.line_buffer(), b"one");
        let outcome = s.feed(b"\x1b[A");
        assert_eq!(outcome.output, vec![BEL]);
    }

    #[test]
    fn test_history_size_bounds() {
        let mut s = TelnetSession::new("> ".to_owned(), "\t".to_owned(), 2);
        s.feed(b"one\rtwo\rthree\r");
        s.feed(b"\x1b[A");
        assert_eq!(s.line_buffer(), b"three");
        s.feed(b"\x1b[A");
        assert_eq!(s.line_buffer(), b"two");
        let outcome = s.feed(b"\x1b[A");
        assert_eq!(outcome.output, vec![BEL]);
    }

    #[test]
    fn test_history_disabled() {
        let mut s = TelnetSession::new("> ".to_owned(), "\t".to_owned(), 0);
        s.feed(b"one\r");
        let outcome = s.feed(b"\x1b[A");
        assert_eq!(outcome.output, vec![BEL]);
        assert!(s.line_buffer().is_empty());
    }

    #[test]
    fn test_terminal_type_negotiation() {
        let mut s = session();
        let outcome = s.feed(&[IAC, WILL, protocol::OPTION_TERMINAL_TYPE]);
        assert_eq!(outcome.output, protocol::TERMINAL_TYPE_REQUEST);

        let mut subnegotiation = vec![IAC, SB, protocol::OPTION_TERMINAL_TYPE, 0];
        subnegotiation.extend_from_slice(b"xterm-256color");
        subnegotiation.extend_from_slice(&[IAC, SE]);
        let outcome = s.feed(&subnegotiation);
        assert_eq!(s.terminal_type(), Some("xterm-256color"));
        assert!(s.is_color_terminal());
        // Cursor saved and prompt drawn once the terminal is known.
        let mut expected = protocol::SAVE_CURSOR.to_vec();
        expected.extend_from_slice(protocol::ERASE_LINE);
        expected.extend_from_slice(b"> ");
        assert_eq!(outcome.output, expected);
    }

    #[test]
    fn test_monochrome_terminal_type() {
        let mut s = session();
        s.feed(&[IAC, WILL, protocol::OPTION_TERMINAL_TYPE]);
        let mut subnegotiation = vec![IAC, SB, protocol::OPTION_TERMINAL_TYPE, 0];
        subnegotiation.extend_from_slice(b"dumb");
        subnegotiation.extend_from_slice(&[IAC, SE]);
        s.feed(&subnegotiation);
        assert_eq!(s.terminal_type(), Some("dumb"));
        assert!(!s.is_color_terminal());
    }

    #[test]
    fn test_unwanted_options_refused() {
        let mut s = session();
        let outcome = s.feed(&[IAC, WILL, 34]);
        assert_eq!(outcome.output, vec![IAC, DONT, 34]);
        let outcome = s.feed(&[IAC, DO, 5]);
        assert_eq!(outcome.output, vec![IAC, WONT, 5]);
        // Confirmations of what we announced draw no reply.
        let outcome = s.feed(&[IAC, DO, protocol::OPTION_ECHO]);
        assert!(outcome.output.is_empty());
        let outcome = s.feed(&[IAC, WONT, 34]);
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn test_runaway_subnegotiation_is_malformed() {
        let mut s = session();
        let mut input = vec![IAC, SB];
        input.extend(std::iter::repeat_n(b'x', 400));
        let outcome = s.feed(&input);
        assert!(outcome.malformed);
    }

    #[test]
    fn test_unknown_escape_sequence_beeps() {
        let mut s = session();
        let outcome = s.feed(b"\x1bZ");
        assert_eq!(outcome.output, vec![BEL]);
        let outcome = s.feed(b"\x1b[5~");
        assert_eq!(outcome.output, vec![BEL]);
    }

    #[test]
    fn test_compose_record_preserves_edit() {
        let mut s = session();
        s.feed(b"ab");
        let bytes = s.compose_record("hello\n", LogLevel::Info, false);
        assert_eq!(bytes, b"\r\x1b[Khello\r\n> ab".to_vec());
    }

    #[test]
    fn test_compose_record_colorizes_for_color_terminals() {
        let mut s = session();
        s.feed(&[IAC, WILL, protocol::OPTION_TERMINAL_TYPE]);
        let mut subnegotiation = vec![IAC, SB, protocol::OPTION_TERMINAL_TYPE, 0];
        subnegotiation.extend_from_slice(b"xterm");
        subnegotiation.extend_from_slice(&[IAC, SE]);
        s.feed(&subnegotiation);

        let bytes = s.compose_record("oops\n", LogLevel::Error, true);
        let expected = b"\r\x1b[K\x1b[31moops\x1b[0m\r\n> ".to_vec();
        assert_eq!(bytes, expected);

        // Info stays on the default foreground.
        let bytes = s.compose_record("fine\n", LogLevel::Info, true);
        assert_eq!(bytes, b"\r\x1b[Kfine\r\n> ".to_vec());
    }

    #[test]
    fn test_compose_record_without_prompt_or_edit() {
        let s = TelnetSession::new(String::new(), "\t".to_owned(), 0);
        let bytes = s.compose_record("plain\n", LogLevel::Info, false);
        assert_eq!(bytes, b"plain\r\n".to_vec());
    }

    #[test]
    fn test_sanitize_for_terminal() {
        assert_eq!(sanitize_for_terminal("a\nb"), b"a\r\nb".to_vec());
        assert_eq!(sanitize_for_terminal("a\r\nb"), b"a\r\nb".to_vec());
        assert_eq!(sanitize_for_terminal("caf\u{e9}"), b"caf?".to_vec());
    }

    #[test]
    fn test_parse_command_line() {
        assert_eq!(
            parse_command_line("stop server 1"),
            vec!["stop", "server", "1"]
        );
        assert_eq!(
            parse_command_line("say 'hello world'"),
            vec!["say", "hello world"]
        );
        assert_eq!(
            parse_command_line("say \"it's fine\""),
            vec!["say", "it's fine"]
        );
        assert_eq!(parse_command_line("  padded   out  "), vec!["padded", "out"]);
        assert_eq!(parse_command_line("mix'ed quo'ting"), vec!["mixed quoting"]);
        assert_eq!(parse_command_line(""), Vec::<String>::new());
        assert_eq!(parse_command_line("empty ''"), vec!["empty", ""]);
    }
}
