//! TELNET option negotiation for the login dialogue.
//!
//! The filter consumes raw socket bytes and emits the cleaned stream,
//! buffering any protocol replies for the caller to flush. Window-size
//! reports (NAWS) and AYT probes surface as events; every byte consumed as
//! negotiation is folded into a FNV-1a fingerprint that later identifies
//! the client software to the backend.

const IAC: u8 = 255; // Interpret As Command
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250; // Subnegotiation begin
const AYT: u8 = 246; // Are You There
const SE: u8 = 240; // Subnegotiation end

const ECHO: u8 = 1;
const SGA: u8 = 3; // Suppress Go-Ahead (interactive mode)
const TTYPE: u8 = 24; // Terminal type
const NAWS: u8 = 31; // Negotiate About Window Size
const LINEMODE: u8 = 34; // We want this OFF for char-at-a-time

pub const FNV1_32_INIT: u32 = 0x811c_9dc5;
const FNV_32_PRIME: u32 = 0x0100_0193;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Opt(u8),
    SbOpt,
    Sb,
    SbIac,
}

pub struct TelnetFilter {
    state: State,
    sb_opt: u8,
    sb_buf: Vec<u8>,
    replies: Vec<u8>,
    naws: Option<(u16, u16)>,
    ayt: bool,
    client_code: u32,
    fingerprint: bool,
}

impl Default for TelnetFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self {
            state: State::Data,
            sb_opt: 0,
            sb_buf: Vec::with_capacity(16),
            replies: Vec::new(),
            naws: None,
            ayt: false,
            client_code: FNV1_32_INIT,
            fingerprint: true,
        }
    }

    /// Queue the opening bundle: character mode, server echo, window size.
    pub fn queue_init_commands(&mut self) {
        self.reply3(IAC, DONT, LINEMODE);
        self.reply3(IAC, DO, SGA);
        self.reply3(IAC, WILL, SGA);
        self.reply3(IAC, WILL, ECHO);
        self.reply3(IAC, DO, NAWS);
    }

    /// Strip negotiation out of `input`, appending plain data to `clean`.
    pub fn feed(&mut self, input: &[u8], clean: &mut Vec<u8>) {
        for &b in input {
            match self.state {
                State::Data => {
                    if b == IAC {
                        self.hash(b);
                        self.state = State::Iac;
                    } else {
                        clean.push(b);
                    }
                }
                State::Iac => {
                    self.hash(b);
                    match b {
                        IAC => {
                            // escaped 0xFF in the data stream
                            clean.push(IAC);
                            self.state = State::Data;
                        }
                        DO | DONT | WILL | WONT => self.state = State::Opt(b),
                        SB => self.state = State::SbOpt,
                        AYT => {
                            self.ayt = true;
                            self.state = State::Data;
                        }
                        _ => self.state = State::Data,
                    }
                }
                State::Opt(cmd) => {
                    self.hash(b);
                    self.negotiate(cmd, b);
                    self.state = State::Data;
                }
                State::SbOpt => {
                    self.hash(b);
                    self.sb_opt = b;
                    self.sb_buf.clear();
                    self.state = State::Sb;
                }
                State::Sb => {
                    self.hash(b);
                    if b == IAC {
                        self.state = State::SbIac;
                    } else {
                        self.sb_buf.push(b);
                    }
                }
                State::SbIac => {
                    self.hash(b);
                    match b {
                        SE => {
                            self.finish_subnegotiation();
                            self.state = State::Data;
                        }
                        IAC => {
                            self.sb_buf.push(IAC);
                            self.state = State::Sb;
                        }
                        _ => self.state = State::Sb,
                    }
                }
            }
        }
    }

    fn negotiate(&mut self, cmd: u8, opt: u8) {
        match cmd {
            DO => match opt {
                ECHO => self.reply3(IAC, WILL, ECHO),
                SGA => self.reply3(IAC, WILL, SGA),
                LINEMODE => self.reply3(IAC, WONT, LINEMODE),
                NAWS => {} // a client asking us to report size is nonsense
                _ => self.reply3(IAC, WONT, opt),
            },
            DONT => match opt {
                ECHO | SGA | LINEMODE => self.reply3(IAC, WONT, opt),
                _ => {}
            },
            WILL => match opt {
                ECHO => self.reply3(IAC, DO, ECHO),
                SGA => self.reply3(IAC, DO, SGA),
                LINEMODE => self.reply3(IAC, DONT, LINEMODE),
                NAWS => self.reply3(IAC, DO, NAWS),
                TTYPE => self.reply3(IAC, DO, TTYPE),
                _ => self.reply3(IAC, DONT, opt),
            },
            _ => {} // WONT: nothing to revoke
        }
    }

    fn finish_subnegotiation(&mut self) {
        if self.sb_opt == NAWS && self.sb_buf.len() >= 4 {
            let cols = u16::from_be_bytes([self.sb_buf[0], self.sb_buf[1]]);
            let rows = u16::from_be_bytes([self.sb_buf[2], self.sb_buf[3]]);
            self.naws = Some((cols, rows));
        }
        self.sb_buf.clear();
    }

    fn reply3(&mut self, a: u8, b: u8, c: u8) {
        self.replies.extend_from_slice(&[a, b, c]);
    }

    fn hash(&mut self, b: u8) {
        if self.fingerprint {
            self.client_code = (self.client_code ^ u32::from(b)).wrapping_mul(FNV_32_PRIME);
        }
    }

    /// Drain the buffered protocol replies, if any.
    pub fn take_replies(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.replies)
    }

    /// Latest window size report, as (cols, rows).
    pub fn take_naws(&mut self) -> Option<(u16, u16)> {
        self.naws.take()
    }

    pub fn take_ayt(&mut self) -> bool {
        std::mem::take(&mut self.ayt)
    }

    pub fn client_code(&self) -> u32 {
        self.client_code
    }

    /// Freeze the fingerprint; called once the dialogue reaches the
    /// password prompt so typed secrets never touch the hash.
    pub fn stop_fingerprint(&mut self) {
        self.fingerprint = false;
    }
}
