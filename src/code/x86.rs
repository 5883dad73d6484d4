//! Disassembly listings for the 32-bit code injected into the executable

use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};

/// Bitness of the target executable
pub const BITNESS: u32 = 32;

/// Disassembles `code` as if it were located at `ip`, one formatted line per instruction.
///
/// Undecodable bytes show up as `(bad)` rather than stopping the listing.
pub fn listing(code: &[u8], ip: u64) -> Vec<String> {
    let mut decoder = Decoder::with_ip(BITNESS, code, ip, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    let mut text = String::new();

    let mut lines = Vec::new();
    for instruction in &mut decoder {
        text.clear();
        formatter.format(&instruction, &mut text);
        lines.push(format!("{:08x}  {}", instruction.ip(), text));
    }
    lines
}

/// Disassembles `code` written at file `offset`, headed by a line saying the addresses are file
/// offsets.
///
/// Relative branch targets in the listing are file offsets too, not addresses in the loaded image.
pub fn file_listing(code: &[u8], offset: u64) -> Vec<String> {
    let mut lines = vec![format!("; {:#x} byte(s) at file offset {:#x}", code.len(), offset)];
    lines.extend(listing(code, offset));
    lines
}
