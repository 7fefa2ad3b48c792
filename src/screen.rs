//! Fixed ANSI output for the login dialogue: cursor motion, the prompt set,
//! and text-screen banners with their tiny `ESC *` expansion language.

use crate::config::Settings;
use crate::login::ID_BOX;
use bytes::BytesMut;
use chrono::{DateTime, Local};
use std::path::Path;

pub const ANSI_RESET: &str = "\x1b[0m";
pub const ANSI_REVERSE: &str = "\x1b[7m";

const LOGIN_PROMPT_ROW: u16 = 21;
const PASSWD_PROMPT_ROW: u16 = 22;
const BOTTOM_ROW: u16 = 24;

const PASSWD_PROMPT_MSG: &str = "\x1b[0mPassword: ";
const PASSWD_CHECK_MSG: &str = "\x1b[0mChecking user id and password...";
const AUTH_SUCCESS_MSG: &str = "\x1b[0mPassword accepted, entering the system...\r\n";
const FREEAUTH_SUCCESS_MSG: &str = "\x1b[0mEntering the system...\r\n";
const AUTH_FAIL_MSG: &str = "\x1b[0mIncorrect user id or password.";
const USERID_EMPTY_MSG: &str = "\x1b[0mPlease try again.";
const SERVICE_FAIL_MSG: &str =
    "\x1b[0;1;31m Sorry, part of the system is under maintenance. Please try again later. \x1b[0m";
const OVERLOAD_CPU_MSG: &str = "\x1b[0m The system is overloaded. Please come back later... ";
const OVERLOAD_USER_MSG: &str = "\x1b[0m Too many users online. Please come back later... ";
const REJECT_FREE_UID_MSG: &str = "\x1b[0m Sorry, this account or service has reached its limit. ";

pub fn bell(out: &mut BytesMut) {
    out.extend_from_slice(b"\x07");
}

/// Visual destructive backspace.
pub fn backspace(out: &mut BytesMut) {
    out.extend_from_slice(b"\x08 \x08");
}

pub fn clrtoeol(out: &mut BytesMut) {
    out.extend_from_slice(b"\x1b[K");
}

pub fn clear(out: &mut BytesMut) {
    out.extend_from_slice(b"\x1b[H\x1b[2J");
}

pub fn move_yx(out: &mut BytesMut, row: u16, col: u16) {
    out.extend_from_slice(format!("\x1b[{row};{col}H").as_bytes());
}

/// Short banner written unbuffered the moment a connection is accepted.
pub fn inscreen(settings: &Settings) -> String {
    format!("{ANSI_RESET}\r\n[{}] login gateway\r\n", settings.bbs_name)
}

/// The userid prompt line, ending in reverse video so the input box shows.
pub fn userid_prompt_msg(settings: &Settings) -> String {
    let mut msg = format!("{ANSI_RESET}Please enter user id");
    if let Some(guest) = &settings.guest_id {
        msg.push_str(&format!(", or '{guest}' to look around"));
    }
    if let Some(new) = &settings.regnew_id {
        msg.push_str(&format!(", or '{new}' to register"));
    }
    msg.push_str(": ");
    msg.push_str(ANSI_REVERSE);
    msg
}

/// Draw the id box with the typed prefix and park the cursor at `icurr`.
pub fn userid_prompt(out: &mut BytesMut, prompt_msg: &str, uid: &str, icurr: usize) {
    move_yx(out, LOGIN_PROMPT_ROW, 1);
    clrtoeol(out);
    out.extend_from_slice(prompt_msg.as_bytes());

    let mut boxed = [b' '; ID_BOX];
    let shown = uid.len().min(ID_BOX);
    boxed[..shown].copy_from_slice(&uid.as_bytes()[..shown]);
    out.extend_from_slice(&boxed);
    for _ in 0..ID_BOX.saturating_sub(icurr) {
        out.extend_from_slice(b"\x08");
    }
}

/// Close the reverse-video box once the id is submitted.
pub fn userid_prompt_end(out: &mut BytesMut) {
    out.extend_from_slice(ANSI_RESET.as_bytes());
}

pub fn passwd_prompt(out: &mut BytesMut) {
    move_yx(out, PASSWD_PROMPT_ROW, 1);
    clrtoeol(out);
    out.extend_from_slice(PASSWD_PROMPT_MSG.as_bytes());
}

pub fn check_passwd(out: &mut BytesMut) {
    move_yx(out, PASSWD_PROMPT_ROW, 1);
    clrtoeol(out);
    out.extend_from_slice(PASSWD_CHECK_MSG.as_bytes());
}

pub fn auth_success(out: &mut BytesMut, free: bool) {
    move_yx(out, PASSWD_PROMPT_ROW, 1);
    clrtoeol(out);
    let msg = if free { FREEAUTH_SUCCESS_MSG } else { AUTH_SUCCESS_MSG };
    out.extend_from_slice(msg.as_bytes());
}

pub fn auth_fail(out: &mut BytesMut) {
    move_yx(out, PASSWD_PROMPT_ROW, 1);
    clrtoeol(out);
    out.extend_from_slice(AUTH_FAIL_MSG.as_bytes());
}

pub fn empty_userid_warn(out: &mut BytesMut) {
    move_yx(out, PASSWD_PROMPT_ROW, 1);
    clrtoeol(out);
    out.extend_from_slice(USERID_EMPTY_MSG.as_bytes());
}

pub fn service_failure(out: &mut BytesMut) {
    move_yx(out, PASSWD_PROMPT_ROW, 1);
    clrtoeol(out);
    move_yx(out, BOTTOM_ROW, 1);
    clrtoeol(out);
    out.extend_from_slice(SERVICE_FAIL_MSG.as_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadKind {
    Cpu,
    Users,
}

/// Drawn right after the accept banner, so a line break is enough.
pub fn overload(out: &mut BytesMut, kind: OverloadKind) {
    out.extend_from_slice(b"\r\n");
    let msg = match kind {
        OverloadKind::Cpu => OVERLOAD_CPU_MSG,
        OverloadKind::Users => OVERLOAD_USER_MSG,
    };
    out.extend_from_slice(msg.as_bytes());
}

pub fn reject_free_userid(out: &mut BytesMut, freeid: &str, guest: Option<&str>) {
    move_yx(out, PASSWD_PROMPT_ROW, 1);
    clrtoeol(out);
    move_yx(out, BOTTOM_ROW, 1);
    clrtoeol(out);
    if let Some(g) = guest
        && freeid.eq_ignore_ascii_case(g)
    {
        out.extend_from_slice(
            format!("{ANSI_RESET} Sorry, too many {g} users are online right now. ").as_bytes(),
        );
        return;
    }
    out.extend_from_slice(REJECT_FREE_UID_MSG.as_bytes());
}

/// Clear the display and paint a banner, expanding its `ESC *` escapes.
pub fn text_screen(out: &mut BytesMut, scr: Option<&str>, online: usize) {
    clear(out);
    let Some(scr) = scr else { return };
    if scr.is_empty() {
        return;
    }
    let expanded = expand_star_escapes(scr, online, Local::now());
    out.extend_from_slice(expanded.as_bytes());
}

/// The one-probe diagnostic answered to a TELNET AYT.
pub fn ayt_reply(retries: u32, opened_fd: usize, ackq: Option<(usize, usize)>) -> String {
    match ackq {
        Some((size, reuse)) => format!("  (#{retries})fd:{opened_fd},ack:{size}(-{reuse})  \r\n"),
        None => format!("  (#{retries})fd:{opened_fd}  \r\n"),
    }
}

/// Expand `ESC *t` to the local date and `ESC *u` to the online-user count.
/// Every other escape passes through untouched.
pub fn expand_star_escapes(scr: &str, online: usize, now: DateTime<Local>) -> String {
    let bytes = scr.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x1b && i + 2 < bytes.len() && bytes[i + 1] == b'*' {
            match bytes[i + 2] {
                b't' => {
                    result.extend_from_slice(now.format("%m/%d/%Y %H:%M:%S %a").to_string().as_bytes());
                    i += 3;
                    continue;
                }
                b'u' => {
                    result.extend_from_slice(online.to_string().as_bytes());
                    i += 3;
                    continue;
                }
                _ => {}
            }
        }
        result.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&result).into_owned()
}

/// Read a text screen from disk, truncated to `max_lines`, with every line
/// ending normalised to CRLF for the wire. Returns `None` when the file is
/// missing or empty.
pub fn load_text_screen(path: &Path, max_lines: usize) -> Option<String> {
    let raw = std::fs::read(path).ok()?;
    if raw.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(&raw);
    let mut screen = String::with_capacity(text.len() + max_lines * 2);
    for line in text.lines().take(max_lines) {
        screen.push_str(line.trim_end_matches('\r'));
        screen.push_str("\r\n");
    }
    Some(screen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    #[test]
    fn star_escapes_expand() {
        let now = Local.with_ymd_and_hms(2026, 3, 14, 15, 9, 2).unwrap();
        let s = expand_star_escapes("today \x1b*t, \x1b*u online", 42, now);
        assert_eq!(s, "today 03/14/2026 15:09:02 Sat, 42 online");
    }

    #[test]
    fn other_escapes_pass_through() {
        let now = Local::now();
        let s = expand_star_escapes("\x1b[1;33mhi\x1b[0m", 1, now);
        assert_eq!(s, "\x1b[1;33mhi\x1b[0m");
        // trailing, incomplete star escape stays literal
        let s = expand_star_escapes("x\x1b*", 1, now);
        assert_eq!(s, "x\x1b*");
    }

    #[test]
    fn banner_loading_truncates_and_normalises() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "one\r\ntwo\nthree\n").unwrap();
        let s = load_text_screen(f.path(), 2).unwrap();
        assert_eq!(s, "one\r\ntwo\r\n");

        let s = load_text_screen(f.path(), 24).unwrap();
        assert_eq!(s, "one\r\ntwo\r\nthree\r\n");
    }

    #[test]
    fn missing_or_empty_banner_is_none() {
        assert!(load_text_screen(Path::new("/nonexistent/banner"), 24).is_none());
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(load_text_screen(f.path(), 24).is_none());
    }

    #[test]
    fn userid_prompt_positions_the_cursor_with_backspaces() {
        let mut out = BytesMut::new();
        userid_prompt(&mut out, "id: ", "al", 2);
        let s = out.freeze();
        // box of ID_BOX columns, then ID_BOX - icurr backspaces
        let backs = s.iter().rev().take_while(|&&b| b == 0x08).count();
        assert_eq!(backs, ID_BOX - 2);
        assert!(s.windows(2).any(|w| w == b"al"));
    }

    #[test]
    fn move_yx_format() {
        let mut out = BytesMut::new();
        move_yx(&mut out, 24, 1);
        assert_eq!(&out[..], b"\x1b[24;1H");
    }

    #[test]
    fn ayt_reply_modes() {
        assert_eq!(ayt_reply(2, 7, None), "  (#2)fd:7  \r\n");
        assert_eq!(ayt_reply(0, 3, Some((5, 1))), "  (#0)fd:3,ack:5(-1)  \r\n");
    }
}
