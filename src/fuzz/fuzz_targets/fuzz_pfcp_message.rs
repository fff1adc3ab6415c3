//! PFCP Message Fuzzer
//!
//! Feeds arbitrary datagrams to the PFCP parser. Parsing must never panic,
//! and anything that parses must encode again.
//!
//! Run with: cargo +nightly fuzz run fuzz_pfcp_message

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use mob5g_pfcp::message::{build_message, parse_message};

fuzz_target!(|data: &[u8]| {
    let mut buf = Bytes::copy_from_slice(data);
    if let Ok((header, message)) = parse_message(&mut buf) {
        assert_eq!(header.message_type, message.message_type());
        build_message(&message, header.sequence_number).expect("parsed message re-encodes");
    }
});
