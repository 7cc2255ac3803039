//! Kernel filter construction.
//!
//! Only segments whose payload starts with an HTTP method or a status line
//! are worth capturing. The filter reads the first four payload bytes
//! after the TCP header (`tcp[12:1] & 0xf0` is the data offset in 32-bit
//! words, shifted right by two to get bytes) and compares them against
//! each prefix.

use pcap::{Capture, Linktype};

use crate::error::{Error, Result};
use crate::protocol::LinkType;

/// Four-byte payload prefixes that mark the start of an HTTP/1 message.
pub const HTTP_PREFIXES: [&[u8; 4]; 10] = [
    b"GET ", b"POST", b"PUT ", b"DELE", b"HEAD", b"OPTI", b"PATC", b"TRAC", b"CONN", b"HTTP",
];

/// One classic BPF instruction, laid out like the kernel's `sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterInstruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

/// Build the default capture filter text.
pub fn http_filter_expression() -> String {
    HTTP_PREFIXES
        .iter()
        .map(|prefix| {
            format!(
                "tcp[((tcp[12:1] & 0xf0) >> 2):4] = 0x{:08X}",
                u32::from_be_bytes(**prefix)
            )
        })
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Compile `expr` for `link_type` into raw instructions.
///
/// libpcap does the compiling on a dead handle; the program is then
/// exported instruction by instruction so it can be attached to a socket
/// the capture library does not own.
pub fn compile_filter(expr: &str, link_type: LinkType, snaplen: u32) -> Result<Vec<FilterInstruction>> {
    let compile_err = |reason: String| Error::FilterCompile {
        filter: expr.to_string(),
        reason,
    };

    let dead = Capture::dead(Linktype(link_type.dlt()))
        .map_err(|e| compile_err(e.to_string()))?;
    let program = dead
        .compile(expr, true)
        .map_err(|e| compile_err(e.to_string()))?;

    let instructions = program
        .get_instructions()
        .iter()
        .map(|ins| parse_instruction(&ins.to_string()))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| compile_err("unreadable instruction in compiled program".to_string()))?;

    if instructions.is_empty() {
        return Err(compile_err("empty program".to_string()));
    }
    tracing::debug!(
        filter = expr,
        snaplen,
        instructions = instructions.len(),
        "Compiled capture filter"
    );
    Ok(instructions)
}

/// Parse libpcap's `"code jt jf k"` rendering of an instruction.
fn parse_instruction(text: &str) -> Option<FilterInstruction> {
    let mut parts = text.split_whitespace();
    let code = parts.next()?.parse().ok()?;
    let jt = parts.next()?.parse().ok()?;
    let jf = parts.next()?.parse().ok()?;
    let k = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(FilterInstruction { code, jt, jf, k })
}
