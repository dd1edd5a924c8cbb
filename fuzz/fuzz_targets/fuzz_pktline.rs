//! Fuzz target for pkt-line parsing.
//!
//! Tests that the pkt-line reader handles arbitrary input without panicking
//! and that every data packet it accepts fits the wire limit.

#![no_main]

use githost_git::{PktLine, PktLineReader, MAX_PKT_DATA};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut reader = PktLineReader::new(Cursor::new(data));

    // Every packet consumes at least 4 bytes, so this always terminates.
    while let Ok(Some(pkt)) = reader.read() {
        if let PktLine::Data(payload) = pkt {
            assert!(payload.len() <= MAX_PKT_DATA);
        }
    }
});
