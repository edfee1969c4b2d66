//! Control-protocol framing and command parsing (spec.md §4.7): pure
//! functions over `&str`, so the wire format is testable without a real
//! socket. [`control`] wires these to an actual `UnixListener`.

use isol_core::error::ControlError;

/// One parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Quit,
    Terminate,
    /// `cpu == None` means "any free cpu" (the wire `-1`).
    NewTask { cpu: Option<i64>, pid: u32, tid: u32 },
    TaskIsolFail,
    TaskIsolFinish,
}

/// Parse one already-dejoined line (continuations resolved, `\r`
/// stripped) into a [`Request`]. Unknown verbs or malformed argument
/// lists surface as `ControlError::InvalidCommand` /
/// `ControlError::MalformedLine` so the caller can format a `5xx` line.
pub fn parse_request(line: &str) -> Result<Request, ControlError> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(' ') {
        Some((v, r)) => (v, r.trim()),
        None => (line, ""),
    };

    match verb {
        "quit" => Ok(Request::Quit),
        "terminate" => Ok(Request::Terminate),
        "taskisolfail" => Ok(Request::TaskIsolFail),
        "taskisolfinish" => Ok(Request::TaskIsolFinish),
        "newtask" => parse_newtask_args(rest),
        "" => Err(ControlError::MalformedLine),
        _ => Err(ControlError::InvalidCommand),
    }
}

fn parse_newtask_args(rest: &str) -> Result<Request, ControlError> {
    let (cpu_str, pidtid) = rest.split_once(',').ok_or(ControlError::MalformedLine)?;
    let cpu_raw: i64 = cpu_str.trim().parse().map_err(|_| ControlError::MalformedLine)?;
    let cpu = if cpu_raw < 0 { None } else { Some(cpu_raw) };

    let (pid_str, tid_str) = pidtid.split_once('/').ok_or(ControlError::MalformedLine)?;
    let pid: u32 = pid_str.trim().parse().map_err(|_| ControlError::MalformedLine)?;
    let tid: u32 = tid_str.trim().parse().map_err(|_| ControlError::MalformedLine)?;

    Ok(Request::NewTask { cpu, pid, tid })
}

/// Join raw bytes read off the wire into logical lines: `\n`-terminated,
/// `\r\n` accepted, and a trailing `\` on a line collapses it with the
/// next (spec.md §4.7's framing rule). Returns the logical lines found
/// so far plus any leftover unterminated bytes to prepend next call.
pub fn split_framed_lines(buf: &str) -> (Vec<String>, String) {
    let mut lines = Vec::new();
    let mut pending = String::new();
    let mut rest = buf;

    loop {
        let Some(pos) = rest.find('\n') else {
            pending.push_str(rest);
            break;
        };
        let raw = &rest[..pos];
        rest = &rest[pos + 1..];
        let raw = raw.strip_suffix('\r').unwrap_or(raw);

        if let Some(cont) = raw.strip_suffix('\\') {
            pending.push_str(cont);
            continue;
        }

        pending.push_str(raw);
        lines.push(std::mem::take(&mut pending));
    }

    (lines, pending)
}

/// One line of an FTP-style response: `NNN` + separator (`-` for a
/// continuation line, ` ` for the final line of a multi-line reply) +
/// free text.
pub fn format_response_line(code: u16, text: &str, is_final: bool) -> String {
    let sep = if is_final { ' ' } else { '-' };
    format!("{:03}{}{}\n", code, sep, text)
}

/// Render a (possibly multi-line) response, the last element carrying
/// the shared response code (spec.md §4.7: "multi-line responses share
/// the code of their final line").
pub fn format_response(code: u16, lines: &[&str]) -> String {
    let mut out = String::new();
    for (i, text) in lines.iter().enumerate() {
        out.push_str(&format_response_line(code, text, i == lines.len() - 1));
    }
    out
}

/// Attach state for one connected client session (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    Thread,
    Process,
}

impl AttachMode {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            AttachMode::Thread => "THREAD",
            AttachMode::Process => "PROCESS",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientSession {
    pub attached_worker: Option<usize>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quit_terminate() {
        assert_eq!(parse_request("quit"), Ok(Request::Quit));
        assert_eq!(parse_request("terminate"), Ok(Request::Terminate));
    }

    #[test]
    fn test_parse_newtask_any_cpu() {
        let r = parse_request("newtask -1,1234/5678").unwrap();
        assert_eq!(r, Request::NewTask { cpu: None, pid: 1234, tid: 5678 });
    }

    #[test]
    fn test_parse_newtask_specific_cpu() {
        let r = parse_request("newtask 3,1/2").unwrap();
        assert_eq!(r, Request::NewTask { cpu: Some(3), pid: 1, tid: 2 });
    }

    #[test]
    fn test_parse_unknown_command() {
        assert_eq!(parse_request("frobnicate"), Err(ControlError::InvalidCommand));
    }

    #[test]
    fn test_parse_newtask_malformed() {
        assert_eq!(parse_request("newtask garbage"), Err(ControlError::MalformedLine));
    }

    #[test]
    fn test_split_framed_lines_basic() {
        let (lines, pending) = split_framed_lines("quit\nnewtask -1,1/2\n");
        assert_eq!(lines, vec!["quit", "newtask -1,1/2"]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_split_framed_lines_crlf() {
        let (lines, _) = split_framed_lines("quit\r\n");
        assert_eq!(lines, vec!["quit"]);
    }

    #[test]
    fn test_split_framed_lines_continuation() {
        let (lines, _) = split_framed_lines("newtask -1,\\\n1/2\n");
        assert_eq!(lines, vec!["newtask -1,1/2"]);
    }

    #[test]
    fn test_split_framed_lines_partial_leftover() {
        let (lines, pending) = split_framed_lines("quit\nnewt");
        assert_eq!(lines, vec!["quit"]);
        assert_eq!(pending, "newt");
    }

    #[test]
    fn test_format_single_line_response() {
        assert_eq!(format_response(220, &["Ready"]), "220 Ready\n");
    }

    #[test]
    fn test_format_multiline_response_shares_final_code() {
        let s = format_response(200, &["MODE=THREAD,INDEX=1", "CPU=1", "OK"]);
        assert_eq!(s, "200-MODE=THREAD,INDEX=1\n200-CPU=1\n200 OK\n");
    }
}
